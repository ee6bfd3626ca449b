use crate::bus::RegisterAddress;
use crate::drivers::pcf8574::PORT_WIDTH;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::{
    fmt::Display,
    fs::{self, File},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

pub const STATE_RECORD_VERSION: u32 = 1;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, PartialEq, Clone)]
pub enum StateError {
    Io(String),
    Corrupt(String),
}

impl Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&match self {
            StateError::Io(msg) => format!("state storage I/O error: {}", msg),
            StateError::Corrupt(msg) => format!("state record is corrupt: {}", msg),
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelState {
    #[default]
    #[serde(rename = "Unknown")]
    Unknown,
    #[serde(rename = "true")]
    High,
    #[serde(rename = "false")]
    Low,
}

impl ChannelState {
    pub fn from_level(level: bool) -> Self {
        if level {
            ChannelState::High
        } else {
            ChannelState::Low
        }
    }

    pub fn level(self) -> Option<bool> {
        match self {
            ChannelState::Unknown => None,
            ChannelState::High => Some(true),
            ChannelState::Low => Some(false),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u8);

impl ChannelId {
    pub fn new(index: u8) -> Option<Self> {
        if (index as usize) < PORT_WIDTH {
            Some(ChannelId(index))
        } else {
            None
        }
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }

    #[cfg(test)]
    pub fn all() -> impl Iterator<Item = ChannelId> {
        (0..PORT_WIDTH as u8).map(ChannelId)
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "P{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PortState {
    channels: [ChannelState; PORT_WIDTH],
}

impl PortState {
    pub fn new(channels: [ChannelState; PORT_WIDTH]) -> Self {
        PortState { channels }
    }

    #[cfg(test)]
    pub fn get(&self, channel: ChannelId) -> ChannelState {
        self.channels[channel.index()]
    }

    pub fn set(&mut self, channel: ChannelId, level: bool) {
        self.channels[channel.index()] = ChannelState::from_level(level);
    }

    #[cfg(test)]
    pub fn channels(&self) -> &[ChannelState; PORT_WIDTH] {
        &self.channels
    }

    // channels nobody has commanded yet are driven low
    pub fn to_bits(&self) -> [bool; PORT_WIDTH] {
        self.channels.map(|state| state.level().unwrap_or(false))
    }

    pub fn resolved(&self) -> PortState {
        PortState::new(self.to_bits().map(ChannelState::from_level))
    }

    pub fn is_unknown(&self) -> bool {
        self.channels.iter().all(|state| *state == ChannelState::Unknown)
    }
}

impl Display for PortState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tokens: Vec<&str> = self
            .channels
            .iter()
            .map(|state| match state {
                ChannelState::Unknown => "Unknown",
                ChannelState::High => "true",
                ChannelState::Low => "false",
            })
            .collect();
        write!(f, "[{}]", tokens.join(", "))
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct StateRecord {
    version: u32,
    channels: Vec<ChannelState>,
}

pub fn encode(state: &PortState) -> Result<String, StateError> {
    let record = StateRecord {
        version: STATE_RECORD_VERSION,
        channels: state.channels.to_vec(),
    };

    serde_json::to_string(&record)
        .map_err(|e| StateError::Corrupt(format!("failed to serialize state record: {}", e)))
}

pub fn decode(data: &str) -> Result<PortState, StateError> {
    let record: StateRecord = serde_json::from_str(data)
        .map_err(|e| StateError::Corrupt(format!("failed to deserialize state record: {}", e)))?;

    if record.version != STATE_RECORD_VERSION {
        return Err(StateError::Corrupt(format!(
            "unsupported record version {}, expected {}",
            record.version, STATE_RECORD_VERSION
        )));
    }

    let channels: [ChannelState; PORT_WIDTH] = match record.channels.try_into() {
        Ok(channels) => channels,
        Err(channels) => {
            return Err(StateError::Corrupt(format!(
                "record contains {} channel entries, expected {}",
                channels.len(),
                PORT_WIDTH
            )));
        }
    };

    Ok(PortState::new(channels))
}

pub trait StateStore: Send + Sync {
    fn load(&self, address: &RegisterAddress) -> Result<PortState, StateError>;

    /// Replaces the saved state. A concurrent `load` sees either the old
    /// record or the new one, never a partial write.
    fn save(&self, address: &RegisterAddress, state: &PortState) -> Result<(), StateError>;
}

pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        FileStateStore {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, address: &RegisterAddress) -> PathBuf {
        self.dir.join(format!("{}.states", address.resource_name()))
    }

    fn temp_path_for(&self, address: &RegisterAddress) -> PathBuf {
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.dir.join(format!(
            ".{}.states.{}.{}.tmp",
            address.resource_name(),
            std::process::id(),
            n
        ))
    }

    fn write_temp(path: &Path, data: &str) -> Result<(), std::io::Error> {
        let mut file = File::create(path)?;
        file.write_all(data.as_bytes())?;
        file.sync_all()
    }
}

impl StateStore for FileStateStore {
    fn load(&self, address: &RegisterAddress) -> Result<PortState, StateError> {
        let path = self.path_for(address);
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No state record at {:?}, all channels unknown", path);
                return Ok(PortState::default());
            }
            Err(e) => {
                return Err(StateError::Io(format!("failed to read {:?}: {}", path, e)));
            }
        };

        decode(&data).map_err(|e| match e {
            StateError::Corrupt(msg) => StateError::Corrupt(format!("{:?}: {}", path, msg)),
            other => other,
        })
    }

    fn save(&self, address: &RegisterAddress, state: &PortState) -> Result<(), StateError> {
        let data = encode(state)?;
        fs::create_dir_all(&self.dir)
            .map_err(|e| StateError::Io(format!("failed to create {:?}: {}", self.dir, e)))?;

        let path = self.path_for(address);
        let temp_path = self.temp_path_for(address);
        if let Err(e) = Self::write_temp(&temp_path, &data) {
            let _ = fs::remove_file(&temp_path);
            return Err(StateError::Io(format!("failed to write {:?}: {}", temp_path, e)));
        }

        if let Err(e) = fs::rename(&temp_path, &path) {
            let _ = fs::remove_file(&temp_path);
            return Err(StateError::Io(format!("failed to replace {:?}: {}", path, e)));
        }

        // make the rename itself durable
        match File::open(&self.dir) {
            Ok(dir) => {
                if let Err(e) = dir.sync_all() {
                    warn!("Failed to sync state directory {:?}: {}", self.dir, e);
                }
            }
            Err(e) => warn!("Failed to open state directory {:?} for sync: {}", self.dir, e),
        }

        Ok(())
    }
}
