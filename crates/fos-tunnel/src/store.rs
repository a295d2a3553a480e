//! Tunnel State Store
//!
//! Persists the last tunnel that reached `Connected`, its UDP capability
//! and the current status, so the service can resume after a restart.

use crate::descriptor::TunnelDescriptor;
use crate::state::TunnelStatus;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Persistent key-value store for tunnel state
pub trait TunnelStateStore: Send + Sync {
    /// Remember `descriptor` as the last successful tunnel
    fn save(&self, descriptor: &TunnelDescriptor) -> Result<(), StoreError>;

    /// Last successful tunnel, if any
    fn load(&self) -> Result<Option<TunnelDescriptor>, StoreError>;

    fn set_status(&self, status: TunnelStatus) -> Result<(), StoreError>;

    fn status(&self) -> TunnelStatus;

    fn is_udp_supported(&self) -> bool;

    fn set_udp_supported(&self, supported: bool) -> Result<(), StoreError>;
}

/// On-disk layout
///
/// The tunnel is kept as raw JSON so a malformed entry can be reported on
/// load instead of making the whole file unreadable.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedState {
    #[serde(default)]
    tunnel: Option<Value>,
    #[serde(default = "default_status")]
    status: TunnelStatus,
    #[serde(default)]
    udp_supported: bool,
}

fn default_status() -> TunnelStatus {
    TunnelStatus::Disconnected
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            tunnel: None,
            status: default_status(),
            udp_supported: false,
        }
    }
}

impl PersistedState {
    fn descriptor(&self) -> Result<Option<TunnelDescriptor>, StoreError> {
        match &self.tunnel {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| StoreError::Malformed(e.to_string())),
        }
    }

    fn set_descriptor(&mut self, descriptor: &TunnelDescriptor) -> Result<(), StoreError> {
        let value =
            serde_json::to_value(descriptor).map_err(|e| StoreError::Malformed(e.to_string()))?;
        self.tunnel = Some(value);
        Ok(())
    }
}

/// Store backed by a JSON file, rewritten atomically on every change
pub struct JsonFileStore {
    path: PathBuf,
    state: Mutex<PersistedState>,
}

impl JsonFileStore {
    /// Open the store at `path`; a missing file starts empty
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let state = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("Ignoring unreadable tunnel state {}: {}", path.display(), e);
                PersistedState::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PersistedState::default(),
            Err(e) => return Err(StoreError::Io(e.to_string())),
        };

        debug!("Opened tunnel state at {}", path.display());
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn update<F>(&self, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut PersistedState) -> Result<(), StoreError>,
    {
        let mut state = self.state.lock().map_err(|_| StoreError::Poisoned)?;
        let mut next = state.clone();
        f(&mut next)?;
        self.write(&next)?;
        *state = next;
        Ok(())
    }

    fn write(&self, state: &PersistedState) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(state)
            .map_err(|e| StoreError::Malformed(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
            }
        }

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, content).map_err(|e| StoreError::Io(e.to_string()))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| StoreError::Io(e.to_string()))
    }

    fn read<T>(&self, f: impl FnOnce(&PersistedState) -> T) -> Option<T> {
        self.state.lock().ok().map(|state| f(&state))
    }
}

impl TunnelStateStore for JsonFileStore {
    fn save(&self, descriptor: &TunnelDescriptor) -> Result<(), StoreError> {
        self.update(|state| state.set_descriptor(descriptor))
    }

    fn load(&self) -> Result<Option<TunnelDescriptor>, StoreError> {
        self.read(PersistedState::descriptor)
            .unwrap_or(Err(StoreError::Poisoned))
    }

    fn set_status(&self, status: TunnelStatus) -> Result<(), StoreError> {
        self.update(|state| {
            state.status = status;
            Ok(())
        })
    }

    fn status(&self) -> TunnelStatus {
        self.read(|state| state.status).unwrap_or(TunnelStatus::Disconnected)
    }

    fn is_udp_supported(&self) -> bool {
        self.read(|state| state.udp_supported).unwrap_or(false)
    }

    fn set_udp_supported(&self, supported: bool) -> Result<(), StoreError> {
        self.update(|state| {
            state.udp_supported = supported;
            Ok(())
        })
    }
}

/// Volatile store for embedding and tests
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<PersistedState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with an arbitrary raw tunnel entry
    pub fn with_raw_tunnel(value: Value) -> Self {
        let store = Self::new();
        if let Ok(mut state) = store.state.lock() {
            state.tunnel = Some(value);
        }
        store
    }
}

impl TunnelStateStore for MemoryStore {
    fn save(&self, descriptor: &TunnelDescriptor) -> Result<(), StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .set_descriptor(descriptor)
    }

    fn load(&self) -> Result<Option<TunnelDescriptor>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Poisoned)?.descriptor()
    }

    fn set_status(&self, status: TunnelStatus) -> Result<(), StoreError> {
        self.state.lock().map_err(|_| StoreError::Poisoned)?.status = status;
        Ok(())
    }

    fn status(&self) -> TunnelStatus {
        self.state
            .lock()
            .map(|state| state.status)
            .unwrap_or(TunnelStatus::Disconnected)
    }

    fn is_udp_supported(&self) -> bool {
        self.state
            .lock()
            .map(|state| state.udp_supported)
            .unwrap_or(false)
    }

    fn set_udp_supported(&self, supported: bool) -> Result<(), StoreError> {
        self.state.lock().map_err(|_| StoreError::Poisoned)?.udp_supported = supported;
        Ok(())
    }
}

/// Store errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Malformed tunnel state: {0}")]
    Malformed(String),

    #[error("Store lock poisoned")]
    Poisoned,
}
