use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Receives the raw payload of every message on an attached input.
pub type MessageHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Receives port connect and disconnect events.
pub type PortEventHandler = Arc<dyn Fn(&PortEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortKind {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    Connected,
    Disconnected,
}

/// Platform-owned port as seen through a [`MidiAccess`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDescriptor {
    pub id: String,
    pub name: String,
    pub manufacturer: String,
    pub kind: PortKind,
    pub state: PortState,
}

impl PortDescriptor {
    pub fn input(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(id, name, PortKind::Input)
    }

    pub fn output(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(id, name, PortKind::Output)
    }

    fn new(id: impl Into<String>, name: impl Into<String>, kind: PortKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            manufacturer: String::new(),
            kind,
            state: PortState::Connected,
        }
    }

    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = manufacturer.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortEvent {
    pub port: PortDescriptor,
}

impl PortEvent {
    pub fn state(&self) -> PortState {
        self.port.state
    }
}

/// Capability returned by every attach call. Detaching twice is a no-op.
pub trait Detach: Send {
    fn detach(&mut self);
}

/// Platform access to MIDI.
#[async_trait]
pub trait MidiBackend: Send + Sync {
    /// Whether the platform exposes MIDI at all.
    fn is_supported(&self) -> bool;

    async fn request_access(&self, sysex: bool) -> Result<Box<dyn MidiAccess>>;
}

/// A granted MIDI session. Port lists are read live on every call.
pub trait MidiAccess: Send {
    fn inputs(&self) -> Vec<PortDescriptor>;

    fn outputs(&self) -> Vec<PortDescriptor>;

    fn open_input(&mut self, id: &str, handler: MessageHandler) -> Result<Box<dyn Detach>>;

    fn open_output(&mut self, id: &str) -> Result<Box<dyn OutputConnection>>;

    /// Registers a hot-plug listener.
    fn watch(&mut self, handler: PortEventHandler) -> Result<Box<dyn Detach>>;
}

pub trait OutputConnection: Send {
    fn is_open(&self) -> bool;

    /// `timestamp` is in milliseconds on the backend's clock; `None` sends
    /// immediately.
    fn send(&mut self, bytes: &[u8], timestamp: Option<f64>) -> Result<()>;
}
