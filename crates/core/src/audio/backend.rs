use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{AudioConfig, Result};

/// Capture device as reported by a backend.
///
/// Backends may leave `label` empty when the platform withholds device names
/// (typically before permission is granted).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDeviceInfo {
    pub id: String,
    pub label: String,
}

impl AudioDeviceInfo {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }
}

/// Device constraint passed to [`CaptureBackend::open`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureRequest {
    pub device_id: Option<String>,
    /// When `false` the device id is only a preference and the backend may
    /// fall back to its default input.
    pub exact: bool,
}

impl CaptureRequest {
    pub fn ideal(device_id: Option<&str>) -> Self {
        Self {
            device_id: device_id.map(str::to_owned),
            exact: false,
        }
    }

    pub fn exact(device_id: impl Into<String>) -> Self {
        Self {
            device_id: Some(device_id.into()),
            exact: true,
        }
    }
}

/// Run state of a capture session's audio clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockState {
    Running,
    Suspended,
    Closed,
}

/// Platform access to audio capture devices.
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    async fn request_permission(&self) -> Result<()>;

    /// Lists audio input devices only.
    async fn enumerate_devices(&self) -> Result<Vec<AudioDeviceInfo>>;

    /// Acquires a capture stream with an attached analysis node configured
    /// from `config`.
    async fn open(
        &self,
        request: &CaptureRequest,
        config: &AudioConfig,
    ) -> Result<Box<dyn CaptureSession>>;
}

/// A live capture stream plus its spectral analysis node.
#[async_trait]
pub trait CaptureSession: Send {
    fn sample_rate(&self) -> f32;

    /// Pushes analysis settings onto the live node.
    fn configure(&mut self, config: &AudioConfig) -> Result<()>;

    fn frequency_bytes(&mut self, out: &mut [u8]) -> Result<()>;

    fn time_domain_bytes(&mut self, out: &mut [u8]);

    fn clock_state(&self) -> ClockState;

    async fn resume(&mut self) -> Result<()>;

    /// Id of the device the platform actually granted, which may differ
    /// from the requested one.
    fn granted_device_id(&self) -> Option<String>;

    /// Disconnects the analysis graph and stops every stream track.
    fn disconnect(&mut self);

    async fn close(&mut self) -> Result<()>;
}
