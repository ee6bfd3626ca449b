mod bus;
mod config;
mod device;
mod drivers;
mod lock;
mod output;
mod state;

use bus::i2c_sysfs::SysfsI2CBusController;
use config::Configuration;
use device::{DeviceServer, DeviceServerBuilder};
use log::{error, info, warn, LevelFilter};
use output::OutputState;
use simple_logger::SimpleLogger;
use std::{env, error::Error, fs, path::Path, str::FromStr, sync::mpsc};
use strum::EnumString;

const DEFAULT_CONFIG_PATH: &str = "/etc/nvos/expander.json";

#[derive(Debug, PartialEq, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
enum Command {
    Run,
    Set,
    Status,
}

fn load_config(path: &Path) -> Result<Configuration, Box<dyn Error>> {
    if !path.exists() {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let default_config = Configuration::default().to_str(true).map_err(|e| e.to_string())?;
        fs::write(path, default_config)?;
        return Err(format!(
            "config file {:?} was missing, a default config was written; add outputs to it and restart",
            path
        )
        .into());
    }

    let file = fs::File::open(path)?;
    let config = Configuration::from_reader(file).map_err(|e| e.to_string())?;
    Ok(config)
}

fn run(server: DeviceServer) -> Result<(), Box<dyn Error>> {
    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;

    serve(server, rx)
}

// a shutdown requested during startup stays queued until start() returns
fn serve(mut server: DeviceServer, shutdown: mpsc::Receiver<()>) -> Result<(), Box<dyn Error>> {
    if let Err(e) = server.start() {
        warn!("Some outputs failed to start: {}", e);
    }

    info!("Server running!");
    shutdown.recv()?;
    info!("Shutting down");

    if let Err(e) = server.stop() {
        error!("Some outputs failed to stop cleanly: {}", e);
        return Err(e.to_string().into());
    }

    Ok(())
}

fn set(mut server: DeviceServer, args: &[String]) -> Result<(), Box<dyn Error>> {
    let (name, state) = match args {
        [name, state] => (name, state),
        _ => return Err("usage: set <output> <on|off>".into()),
    };

    let state = OutputState::from_str(state)
        .map_err(|_| format!("unrecognized state: {}", state))?;
    server.set_state(name, state).map_err(|e| e.to_string())?;
    println!("{}: {:?}", name, server.is_on(name).map_err(|e| e.to_string())?);
    Ok(())
}

fn status(server: &DeviceServer) {
    for name in server.output_names() {
        match server.status(&name) {
            Ok(status) => {
                println!("{} ({} channel {:?})", status.name, status.address, status.channel);
                println!("  committed: {:?}", status.is_on);
                match status.committed {
                    Ok(port) if port.is_unknown() => println!("  record:    never written"),
                    Ok(port) => println!("  record:    {}", port),
                    Err(e) => println!("  record:    {}", e),
                }
                match status.register {
                    Ok(bits) => println!("  register:  {:?}", bits),
                    Err(e) => println!("  register:  {}", e),
                }
            }
            Err(e) => println!("{}: {}", name, e),
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    SimpleLogger::new().with_level(LevelFilter::Info).env().init()?;

    let args: Vec<String> = env::args().skip(1).collect();
    let (config_path, rest) = match args.first() {
        Some(first) if Command::from_str(first).is_err() => (first.clone(), &args[1..]),
        _ => (DEFAULT_CONFIG_PATH.to_string(), &args[..]),
    };

    let (command, command_args) = match rest.split_first() {
        Some((command, command_args)) => (
            Command::from_str(command).map_err(|_| format!("unknown command: {}", command))?,
            command_args,
        ),
        None => (Command::Run, rest),
    };

    info!("Loading config from {}", config_path);
    let config = load_config(Path::new(&config_path))?;

    info!("Building device server");
    let bus = SysfsI2CBusController::from_config(&config.bus_section)
        .map_err(|e| format!("failed to initialize I2C: {}", e))?;
    let server = DeviceServerBuilder::from_config(&config)
        .with_bus(bus)
        .build()
        .map_err(|e| e.to_string())?;

    match command {
        Command::Run => run(server),
        Command::Set => set(server, command_args),
        Command::Status => {
            status(&server);
            Ok(())
        }
    }
}
