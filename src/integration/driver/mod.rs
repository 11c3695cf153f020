use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub mod memory;

pub use memory::MemoryBackend;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendEngine {
    Memory,
}

impl BackendEngine {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "memory" => Some(Self::Memory),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
        }
    }
}

// Where a handler wants to connect. `address` names the queue manager or namespace;
// `properties` carries everything else the family parsed from the URL and context.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackendTarget {
    pub address: String,
    pub properties: BTreeMap<String, String>,
}

impl BackendTarget {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: &str, value: impl Into<String>) -> Self {
        self.properties.insert(key.to_owned(), value.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendMessage {
    pub id: String,
    pub body: Vec<u8>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum DriverError {
    ConnectionRefused { address: String, reason: String },
    ConnectionBroken { address: String },
    Closed,
    UnknownDestination { destination: String },
}

impl DriverError {
    // A broken connection cannot serve further requests; the owning worker must retire.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConnectionBroken { .. })
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionRefused { address, reason } => {
                write!(f, "connection to {address} refused: {reason}")
            }
            Self::ConnectionBroken { address } => {
                write!(f, "connection to {address} is broken")
            }
            Self::Closed => write!(f, "connection is closed"),
            Self::UnknownDestination { destination } => {
                write!(f, "destination {destination} does not exist")
            }
        }
    }
}

impl std::error::Error for DriverError {}

pub trait BackendDriver: Send + Sync {
    fn connect(&self, target: &BackendTarget) -> Result<Box<dyn BackendConnection>, DriverError>;
}

pub trait BackendConnection: Send {
    // Makes sure `destination` exists so that later puts are retained for it.
    fn declare(&mut self, destination: &str) -> Result<(), DriverError>;
    fn put(&mut self, destination: &str, body: Vec<u8>) -> Result<String, DriverError>;
    fn get(
        &mut self,
        destination: &str,
        wait: Duration,
    ) -> Result<Option<BackendMessage>, DriverError>;
    fn close(&mut self) -> Result<(), DriverError>;
}

#[derive(Clone)]
pub struct BackendDrivers {
    pub queue_manager: Arc<dyn BackendDriver>,
    pub service_bus: Arc<dyn BackendDriver>,
}

impl BackendDrivers {
    pub fn for_engine(engine: BackendEngine) -> Self {
        match engine {
            BackendEngine::Memory => Self::memory(MemoryBackend::new()),
        }
    }

    pub fn memory(backend: MemoryBackend) -> Self {
        let shared: Arc<dyn BackendDriver> = Arc::new(backend);
        Self {
            queue_manager: Arc::clone(&shared),
            service_bus: shared,
        }
    }
}

impl fmt::Debug for BackendDrivers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendDrivers")
            .field("queue_manager", &"<dyn BackendDriver>")
            .field("service_bus", &"<dyn BackendDriver>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{BackendEngine, DriverError};

    #[test]
    fn only_memory_engine_is_supported() {
        assert_eq!(BackendEngine::parse("memory"), Some(BackendEngine::Memory));
        assert_eq!(BackendEngine::parse("pymqi"), None);
        assert_eq!(BackendEngine::Memory.as_str(), "memory");
    }

    #[test]
    fn only_broken_connections_are_fatal() {
        assert!(DriverError::ConnectionBroken {
            address: "QM1".to_owned()
        }
        .is_fatal());
        assert!(!DriverError::Closed.is_fatal());
    }
}
