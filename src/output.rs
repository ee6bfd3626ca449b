use crate::{
    bus::{BusError, RegisterAddress},
    drivers::pcf8574::Pcf8574,
    lock::{DeviceLock, LockError, LockRegistry, DEFAULT_LOCK_TIMEOUT},
    state::{ChannelId, StateError, StateStore},
};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::{fmt::Display, sync::Arc, time::Duration};
use strum::{Display as StrumDisplay, EnumString};

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumString, StrumDisplay)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum OutputState {
    On,
    Off,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatePolicy {
    ForceOn,
    ForceOff,
    #[default]
    Unchanged,
}

#[derive(Debug, PartialEq, Clone)]
pub enum OutputError {
    NotConfigured(String),
    LockTimeout(String),
    Lock(String),
    Bus(BusError),
    StateIo(String),
    CorruptState(String),
}

impl Display for OutputError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&match self {
            OutputError::NotConfigured(msg) => format!("output is not configured: {}", msg),
            OutputError::LockTimeout(msg) => format!("device is busy: {}", msg),
            OutputError::Lock(msg) => format!("failed to lock device: {}", msg),
            OutputError::Bus(err) => format!("bus error: {}", err),
            OutputError::StateIo(msg) => format!("failed to access channel states: {}", msg),
            OutputError::CorruptState(msg) => format!("channel states are unusable: {}", msg),
        })
    }
}

fn map_lock_err(err: LockError) -> OutputError {
    match err {
        LockError::Timeout(..) => OutputError::LockTimeout(err.to_string()),
        LockError::Io(_) => OutputError::Lock(err.to_string()),
    }
}

fn map_state_err(err: StateError) -> OutputError {
    match err {
        StateError::Io(_) => OutputError::StateIo(err.to_string()),
        StateError::Corrupt(_) => OutputError::CorruptState(err.to_string()),
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChannelSettings {
    pub channel: Option<ChannelId>,
    // relay boards are often active low
    pub on_level: bool,
    pub startup: StatePolicy,
    pub shutdown: StatePolicy,
    pub lock_timeout: Duration,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            channel: None,
            on_level: true,
            startup: StatePolicy::Unchanged,
            shutdown: StatePolicy::Unchanged,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

pub struct ChannelController {
    driver: Pcf8574,
    settings: ChannelSettings,
    store: Arc<dyn StateStore>,
    lock: Arc<DeviceLock>,
    output_state: Option<bool>,
}

impl ChannelController {
    pub fn initialize(
        driver: Pcf8574,
        settings: ChannelSettings,
        store: Arc<dyn StateStore>,
        locks: &LockRegistry,
    ) -> Self {
        let lock = locks.get(driver.address());
        Self {
            driver,
            settings,
            store,
            lock,
            output_state: None,
        }
    }

    pub fn address(&self) -> &RegisterAddress {
        self.driver.address()
    }

    pub fn channel(&self) -> Option<ChannelId> {
        self.settings.channel
    }

    pub fn driver(&self) -> &Pcf8574 {
        &self.driver
    }

    pub fn is_setup(&self) -> bool {
        self.settings.channel.is_some()
    }

    pub fn is_on(&self) -> Option<bool> {
        if !self.is_setup() {
            return None;
        }

        self.output_state
    }

    pub fn set_state(&mut self, state: OutputState) -> Result<(), OutputError> {
        let channel = match self.settings.channel {
            Some(channel) => channel,
            None => {
                return Err(OutputError::NotConfigured(format!(
                    "no channel selected for {}",
                    self.driver
                )))
            }
        };

        let level = match state {
            OutputState::On => self.settings.on_level,
            OutputState::Off => !self.settings.on_level,
        };

        let address = *self.driver.address();
        let guard = self.lock.acquire(self.settings.lock_timeout).map_err(map_lock_err)?;

        let mut port = self.store.load(&address).map_err(map_state_err)?;
        debug!("Read states: {}: {}", address, port);

        port.set(channel, level);
        let port = port.resolved();
        debug!("Write states: {}: {}", address, port);

        self.driver.write_port(port.to_bits()).map_err(OutputError::Bus)?;
        self.store.save(&address, &port).map_err(map_state_err)?;
        drop(guard);

        self.output_state = Some(state == OutputState::On);
        info!("{} {} switched {}", address, channel, state);
        Ok(())
    }

    pub fn apply_startup_policy(&mut self) -> Result<(), OutputError> {
        self.apply_policy(self.settings.startup)
    }

    pub fn apply_shutdown_policy(&mut self) -> Result<(), OutputError> {
        self.apply_policy(self.settings.shutdown)
    }

    fn apply_policy(&mut self, policy: StatePolicy) -> Result<(), OutputError> {
        match policy {
            StatePolicy::ForceOn => self.set_state(OutputState::On),
            StatePolicy::ForceOff => self.set_state(OutputState::Off),
            StatePolicy::Unchanged => Ok(()),
        }
    }
}
