use crate::bus::{BusError, RegisterAddress};
use crate::lock::{DEFAULT_LOCK_DIR, DEFAULT_LOCK_TIMEOUT, MAX_LOCK_TIMEOUT};
use crate::output::{ChannelSettings, StatePolicy};
use crate::state::ChannelId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Display;
use std::io::Read;
use std::time::Duration;

// PCF8574 (0x20-0x27) and PCF8574A (0x38-0x3f)
pub const SUPPORTED_ADDRESSES: [u8; 16] = [
    0x20, 0x21, 0x22, 0x23, 0x24, 0x25, 0x26, 0x27,
    0x38, 0x39, 0x3a, 0x3b, 0x3c, 0x3d, 0x3e, 0x3f,
];

#[derive(Debug, PartialEq)]
pub enum ConfigError {
    SerializeError(String),
    InvalidEntry(String),
    MissingEntry(String),
    DuplicateEntry(String)
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&match self {
            ConfigError::SerializeError(msg) => format!("serialize/parse error: {}", msg),
            ConfigError::InvalidEntry(msg) => format!("invalid config entry: {}", msg),
            ConfigError::MissingEntry(msg) => format!("missing config entry: {}", msg),
            ConfigError::DuplicateEntry(msg) => format!("duplicate config entry: {}", msg)
        })
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct ConfigSectionBus {
    pub bus_ids: Vec<u8>
}

impl Default for ConfigSectionBus {
    fn default() -> Self {
        // bus 1 is the header I2C bus on most single board computers
        Self { bus_ids: vec![1] }
    }
}

impl ConfigSectionBus {
    #[cfg(test)]
    pub fn new(bus_ids: Vec<u8>) -> Self {
        Self { bus_ids }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for bus_id in &self.bus_ids {
            if !seen.insert(bus_id) {
                return Err(ConfigError::DuplicateEntry(format!("I2C bus {} is listed more than once", bus_id)));
            }
        }

        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct ConfigSectionState {
    pub state_dir: String,
    pub lock_dir: String,
    pub lock_timeout_secs: u64
}

impl Default for ConfigSectionState {
    fn default() -> Self {
        Self {
            state_dir: DEFAULT_LOCK_DIR.to_string(),
            lock_dir: DEFAULT_LOCK_DIR.to_string(),
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT.as_secs()
        }
    }
}

impl ConfigSectionState {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.state_dir.trim().is_empty() {
            return Err(ConfigError::InvalidEntry("state directory cannot be empty".to_string()));
        }

        if self.lock_dir.trim().is_empty() {
            return Err(ConfigError::InvalidEntry("lock directory cannot be empty".to_string()));
        }

        if self.lock_timeout_secs == 0 {
            return Err(ConfigError::InvalidEntry("lock timeout must be greater than zero".to_string()));
        }

        if self.lock_timeout_secs > MAX_LOCK_TIMEOUT.as_secs() {
            return Err(ConfigError::InvalidEntry(format!(
                "lock timeout of {} seconds is too long, the maximum is {}",
                self.lock_timeout_secs,
                MAX_LOCK_TIMEOUT.as_secs()
            )));
        }

        Ok(())
    }
}

fn default_on_level() -> bool {
    true
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OutputConfig {
    pub name: String,
    pub bus_id: u8,
    pub address: u8,
    #[serde(default)]
    pub channel: Option<u8>,
    #[serde(default = "default_on_level")]
    pub on_level: bool,
    #[serde(default)]
    pub startup: StatePolicy,
    #[serde(default)]
    pub shutdown: StatePolicy
}

impl OutputConfig {
    pub fn new(name: &str, bus_id: u8, address: u8, channel: Option<u8>) -> Self {
        Self {
            name: name.to_string(),
            bus_id,
            address,
            channel,
            on_level: default_on_level(),
            startup: StatePolicy::Unchanged,
            shutdown: StatePolicy::Unchanged
        }
    }

    pub fn register_address(&self) -> Result<RegisterAddress, BusError> {
        RegisterAddress::new(self.bus_id, self.address)
    }

    pub fn channel_settings(&self, lock_timeout: Duration) -> ChannelSettings {
        ChannelSettings {
            channel: self.channel.and_then(ChannelId::new),
            on_level: self.on_level,
            startup: self.startup,
            shutdown: self.shutdown,
            lock_timeout
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::InvalidEntry("invalid output config: name cannot be empty".to_string()));
        }

        if !SUPPORTED_ADDRESSES.contains(&self.address) {
            return Err(ConfigError::InvalidEntry(format!(
                "invalid output config: {} uses address {:#04x}, supported addresses are {}",
                self.name,
                self.address,
                SUPPORTED_ADDRESSES.map(|x| format!("{:#04x}", x)).join(", ")
            )));
        }

        if let Some(channel) = self.channel {
            if ChannelId::new(channel).is_none() {
                return Err(ConfigError::InvalidEntry(format!(
                    "invalid output config: {} uses channel {}, channels are numbered 0 to 7",
                    self.name, channel
                )));
            }
        }

        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
#[serde(default)]
pub struct ConfigSectionOutputs {
    pub outputs: Vec<OutputConfig>
}

impl ConfigSectionOutputs {
    #[cfg(test)]
    pub fn new(outputs: Vec<OutputConfig>) -> Self {
        Self { outputs }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen_names = HashSet::new();
        let mut seen_pins = HashSet::new();

        for output in &self.outputs {
            output.validate()?;

            if !seen_names.insert(&output.name) {
                return Err(ConfigError::DuplicateEntry(format!("output {} is defined more than once", output.name)));
            }

            if let Some(channel) = output.channel {
                if !seen_pins.insert((output.bus_id, output.address, channel)) {
                    return Err(ConfigError::DuplicateEntry(format!(
                        "output {} drives bus {} address {:#04x} channel {}, which is already used by another output",
                        output.name, output.bus_id, output.address, channel
                    )));
                }
            }
        }

        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
#[serde(default)]
pub struct Configuration {
    pub bus_section: ConfigSectionBus,
    pub state_section: ConfigSectionState,
    pub output_section: ConfigSectionOutputs
}

impl Configuration {
    #[cfg(test)]
    pub fn new(bus_section: ConfigSectionBus, state_section: ConfigSectionState, output_section: ConfigSectionOutputs) -> Self {
        Self { bus_section, state_section, output_section }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bus_section.validate()?;
        self.state_section.validate()?;
        self.output_section.validate()?;

        for output in &self.output_section.outputs {
            if !self.bus_section.bus_ids.contains(&output.bus_id) {
                return Err(ConfigError::MissingEntry(format!(
                    "output {} uses I2C bus {} which is not listed in the bus section",
                    output.name, output.bus_id
                )));
            }
        }

        Ok(())
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Configuration, ConfigError> {
        let config: Configuration = match serde_json::from_reader(reader) {
            Ok(c) => c,
            Err(e) => {
                return Err(ConfigError::SerializeError(
                    format!("failed to deserialize config file: {}", e)
                ));
            }
        };

        config.validate()?;
        Ok(config)
    }

    #[cfg(test)]
    pub fn from_str(json_str: &str) -> Result<Configuration, ConfigError> {
        Self::from_reader(json_str.as_bytes())
    }

    pub fn to_str(&self, pretty: bool) -> Result<String, ConfigError> {
        let result = if pretty {
            serde_json::to_string_pretty(self)
        } else {
            serde_json::to_string(self)
        };

        result.map_err(|e| ConfigError::SerializeError(format!("failed to serialize config: {}", e)))
    }
}
