pub mod pcf8574; // Pcf8574
