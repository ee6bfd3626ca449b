use crate::bus::{BusController, BusError, RegisterAddress, RegisterBus};
use crate::config::{Configuration, OutputConfig};
use crate::drivers::pcf8574::{Pcf8574, PORT_WIDTH};
use crate::lock::{LockRegistry, DEFAULT_LOCK_DIR, DEFAULT_LOCK_TIMEOUT};
use crate::output::{ChannelController, OutputError, OutputState};
use crate::state::{FileStateStore, PortState, StateError, StateStore};
use log::{error, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, PartialEq)]
pub enum DeviceError {
    NotFound(String),
    MissingController,
    DuplicateDevice(String),
    HardwareError(String),
    InvalidOperation(String),
    InvalidConfig(String),
    Output(String, OutputError),
    PolicyFailed(Vec<(String, OutputError)>),
}

impl Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&match self {
            DeviceError::NotFound(name) => format!("output \"{}\" is not registered", name),
            DeviceError::MissingController => "no bus controller was provided".to_string(),
            DeviceError::DuplicateDevice(name) => format!("output \"{}\" is already registered", name),
            DeviceError::HardwareError(desc) => format!("a hardware error has occurred: {}", desc),
            DeviceError::InvalidOperation(desc) => format!("invalid operation: {}", desc),
            DeviceError::InvalidConfig(desc) => format!("invalid config: {}", desc),
            DeviceError::Output(name, err) => format!("output \"{}\" failed: {}", name, err),
            DeviceError::PolicyFailed(failures) => format!(
                "{} output(s) failed to apply their state policy: {}",
                failures.len(),
                failures
                    .iter()
                    .map(|(name, err)| format!("{} ({})", name, err))
                    .collect::<Vec<String>>()
                    .join(", ")
            ),
        })
    }
}

#[derive(Debug)]
pub struct OutputStatus {
    pub name: String,
    pub address: RegisterAddress,
    pub channel: Option<usize>,
    pub is_on: Option<bool>,
    pub committed: Result<PortState, StateError>,
    pub register: Result<[bool; PORT_WIDTH], BusError>,
}

pub struct DeviceServer {
    bus_controller: Box<dyn BusController>,
    locks: Arc<LockRegistry>,
    store: Arc<dyn StateStore>,
    buses: HashMap<RegisterAddress, Arc<dyn RegisterBus>>,
    outputs: BTreeMap<String, ChannelController>,
    lock_timeout: Duration,
    is_running: bool,
}

pub struct DeviceServerBuilder {
    bus_controller: Option<Box<dyn BusController>>,
    locks: Option<Arc<LockRegistry>>,
    store: Option<Arc<dyn StateStore>>,
    lock_timeout: Duration,
    outputs: Vec<OutputConfig>,
}

impl DeviceServerBuilder {
    pub fn configure() -> Self {
        DeviceServerBuilder {
            bus_controller: None,
            locks: None,
            store: None,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            outputs: Vec::new(),
        }
    }

    pub fn from_config(config: &Configuration) -> Self {
        let state = &config.state_section;
        let mut builder = Self::configure()
            .with_locks(Arc::new(LockRegistry::new(&state.lock_dir)))
            .with_store(Arc::new(FileStateStore::new(&state.state_dir)))
            .with_lock_timeout(state.lock_timeout());

        for output in &config.output_section.outputs {
            builder = builder.add_output(output.clone());
        }

        builder
    }

    pub fn with_bus<T: BusController + 'static>(mut self, bus: T) -> Self {
        self.bus_controller = Some(Box::new(bus));
        self
    }

    pub fn with_locks(mut self, locks: Arc<LockRegistry>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn add_output(mut self, output: OutputConfig) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn build(self) -> Result<DeviceServer, DeviceError> {
        let bus_controller = match self.bus_controller {
            Some(bus) => bus,
            None => return Err(DeviceError::MissingController),
        };

        let locks = self
            .locks
            .unwrap_or_else(|| Arc::new(LockRegistry::new(DEFAULT_LOCK_DIR)));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(FileStateStore::new(DEFAULT_LOCK_DIR)));

        let mut server = DeviceServer::new(bus_controller, locks, store, self.lock_timeout);
        for output in &self.outputs {
            server.register_output(output)?;
        }

        Ok(server)
    }
}

impl DeviceServer {
    pub fn new(
        bus_controller: Box<dyn BusController>,
        locks: Arc<LockRegistry>,
        store: Arc<dyn StateStore>,
        lock_timeout: Duration,
    ) -> Self {
        DeviceServer {
            bus_controller,
            locks,
            store,
            buses: HashMap::new(),
            outputs: BTreeMap::new(),
            lock_timeout,
            is_running: false,
        }
    }

    pub fn register_output(&mut self, config: &OutputConfig) -> Result<(), DeviceError> {
        config
            .validate()
            .map_err(|e| DeviceError::InvalidConfig(e.to_string()))?;

        if self.outputs.contains_key(&config.name) {
            return Err(DeviceError::DuplicateDevice(config.name.clone()));
        }

        let address = config
            .register_address()
            .map_err(|e| DeviceError::InvalidConfig(e.to_string()))?;

        let bus = match self.buses.get(&address) {
            Some(bus) => bus.clone(),
            None => {
                let bus = self
                    .bus_controller
                    .open_device(&address)
                    .map_err(|e| DeviceError::HardwareError(e.to_string()))?;
                self.buses.insert(address, bus.clone());
                bus
            }
        };

        if config.channel.is_none() {
            warn!("Output {} has no channel selected, it cannot be switched", config.name);
        }

        let controller = ChannelController::initialize(
            Pcf8574::new(bus, address),
            config.channel_settings(self.lock_timeout),
            self.store.clone(),
            &self.locks,
        );

        info!("Registered output {} on {} via {}", config.name, address, self.bus_controller.name());
        self.outputs.insert(config.name.clone(), controller);
        Ok(())
    }

    #[cfg(test)]
    pub fn remove_output(&mut self, name: &str) -> Result<(), DeviceError> {
        match self.outputs.remove(name) {
            Some(_) => Ok(()),
            None => Err(DeviceError::NotFound(name.to_string())),
        }
    }

    pub fn start(&mut self) -> Result<(), DeviceError> {
        if self.is_running {
            return Err(DeviceError::InvalidOperation(
                "start requested but outputs are already running".to_string(),
            ));
        }

        self.is_running = true;
        self.apply_policies(|controller| controller.apply_startup_policy())
    }

    pub fn stop(&mut self) -> Result<(), DeviceError> {
        if !self.is_running {
            return Err(DeviceError::InvalidOperation(
                "stop requested but outputs aren't running".to_string(),
            ));
        }

        self.is_running = false;
        self.apply_policies(|controller| controller.apply_shutdown_policy())
    }

    fn apply_policies<F>(&mut self, mut apply: F) -> Result<(), DeviceError>
    where
        F: FnMut(&mut ChannelController) -> Result<(), OutputError>,
    {
        let mut failures = Vec::new();
        for (name, controller) in self.outputs.iter_mut() {
            if let Err(e) = apply(controller) {
                error!("State change error on {}: {}", name, e);
                failures.push((name.clone(), e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DeviceError::PolicyFailed(failures))
        }
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.is_running
    }

    pub fn set_state(&mut self, name: &str, state: OutputState) -> Result<(), DeviceError> {
        let controller = match self.outputs.get_mut(name) {
            Some(controller) => controller,
            None => return Err(DeviceError::NotFound(name.to_string())),
        };

        controller
            .set_state(state)
            .map_err(|e| DeviceError::Output(name.to_string(), e))
    }

    pub fn is_on(&self, name: &str) -> Result<Option<bool>, DeviceError> {
        match self.outputs.get(name) {
            Some(controller) => Ok(controller.is_on()),
            None => Err(DeviceError::NotFound(name.to_string())),
        }
    }

    pub fn status(&self, name: &str) -> Result<OutputStatus, DeviceError> {
        let controller = match self.outputs.get(name) {
            Some(controller) => controller,
            None => return Err(DeviceError::NotFound(name.to_string())),
        };

        let address = *controller.address();
        Ok(OutputStatus {
            name: name.to_string(),
            address,
            channel: controller.channel().map(|c| c.index()),
            is_on: controller.is_on(),
            committed: self.store.load(&address),
            register: controller.driver().read_port(),
        })
    }

    pub fn output_names(&self) -> Vec<String> {
        self.outputs.keys().cloned().collect()
    }

    #[cfg(test)]
    pub fn has_output(&self, name: &str) -> bool {
        self.outputs.contains_key(name)
    }
}
