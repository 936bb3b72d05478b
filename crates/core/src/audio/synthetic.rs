use std::f32::consts::TAU;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::channel::oneshot;

use super::{AudioDeviceInfo, CaptureBackend, CaptureRequest, CaptureSession, ClockState};
use crate::{AudioConfig, LiveSignalError, Result, SpectralAnalyser};

#[derive(Debug, Clone, Copy)]
struct Tone {
    frequency: f32,
    amplitude: f32,
}

#[derive(Default)]
struct SyntheticState {
    devices: Vec<AudioDeviceInfo>,
    deny_permission: bool,
    fail_enumeration: bool,
    fail_open: bool,
    start_suspended: bool,
    gate: Option<oneshot::Receiver<()>>,
    resume_gate: Option<oneshot::Receiver<()>>,
    frame: u64,
    sessions_opened: usize,
    open_sessions: usize,
}

/// Deterministic capture device that renders a mix of sine tones.
///
/// Each session renders one block of `fft_size` samples per device frame:
/// the first read of a session renders frame zero and later blocks arrive
/// only after [`advance`](Self::advance). Reads within a frame see the same
/// audio.
///
/// Used by the demo binary when no hardware backend is compiled in, and by
/// tests to inject permission, stream and enumeration failures. Clones share
/// state, so a test can keep a handle after moving one into a source.
#[derive(Clone)]
pub struct SyntheticCapture {
    sample_rate: f32,
    tones: Vec<Tone>,
    state: Arc<Mutex<SyntheticState>>,
}

impl SyntheticCapture {
    pub fn new() -> Self {
        Self {
            sample_rate: 48_000.0,
            tones: Vec::new(),
            state: Arc::new(Mutex::new(SyntheticState::default())),
        }
    }

    pub fn with_sample_rate(mut self, sample_rate: f32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_device(self, id: &str, label: &str) -> Self {
        self.edit(|state| state.devices.push(AudioDeviceInfo::new(id, label)));
        self
    }

    /// Adds a sine tone to the rendered mix.
    pub fn with_tone(mut self, frequency: f32, amplitude: f32) -> Self {
        self.tones.push(Tone {
            frequency,
            amplitude,
        });
        self
    }

    pub fn deny_permission(self) -> Self {
        self.edit(|state| state.deny_permission = true);
        self
    }

    pub fn fail_enumeration(self) -> Self {
        self.edit(|state| state.fail_enumeration = true);
        self
    }

    pub fn fail_open(self) -> Self {
        self.edit(|state| state.fail_open = true);
        self
    }

    /// Sessions start with a suspended clock and must be resumed.
    pub fn start_suspended(self) -> Self {
        self.edit(|state| state.start_suspended = true);
        self
    }

    /// The next `open` waits until `gate` resolves (or its sender drops).
    pub fn gate_open(self, gate: oneshot::Receiver<()>) -> Self {
        self.edit(|state| state.gate = Some(gate));
        self
    }

    /// The next `resume` of any session waits until `gate` resolves.
    pub fn gate_resume(self, gate: oneshot::Receiver<()>) -> Self {
        self.edit(|state| state.resume_gate = Some(gate));
        self
    }

    /// Moves the device clock on by one block.
    pub fn advance(&self) {
        self.edit(|state| state.frame += 1);
    }

    /// Sessions opened over the lifetime of this device.
    pub fn sessions_opened(&self) -> usize {
        self.state.lock().map(|s| s.sessions_opened).unwrap_or(0)
    }

    /// Sessions opened and not yet closed.
    pub fn open_sessions(&self) -> usize {
        self.state.lock().map(|s| s.open_sessions).unwrap_or(0)
    }

    fn edit(&self, apply: impl FnOnce(&mut SyntheticState)) {
        if let Ok(mut state) = self.state.lock() {
            apply(&mut state);
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, SyntheticState>> {
        self.state
            .lock()
            .map_err(|_| LiveSignalError::Poisoned("synthetic capture state"))
    }
}

impl Default for SyntheticCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SyntheticCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyntheticCapture")
            .field("sample_rate", &self.sample_rate)
            .field("tones", &self.tones)
            .finish()
    }
}

#[async_trait]
impl CaptureBackend for SyntheticCapture {
    async fn request_permission(&self) -> Result<()> {
        if self.lock()?.deny_permission {
            return Err(LiveSignalError::PermissionDenied(
                "microphone access refused".into(),
            ));
        }
        Ok(())
    }

    async fn enumerate_devices(&self) -> Result<Vec<AudioDeviceInfo>> {
        let state = self.lock()?;
        if state.fail_enumeration {
            return Err(LiveSignalError::Enumeration(
                "device list unavailable".into(),
            ));
        }
        Ok(state.devices.clone())
    }

    async fn open(
        &self,
        request: &CaptureRequest,
        config: &AudioConfig,
    ) -> Result<Box<dyn CaptureSession>> {
        self.request_permission().await?;

        let gate = self.lock()?.gate.take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }

        let (device_id, suspended) = {
            let mut state = self.lock()?;
            if state.fail_open {
                return Err(LiveSignalError::StreamAcquisition(
                    "capture stream refused".into(),
                ));
            }

            let requested = request
                .device_id
                .as_deref()
                .and_then(|id| state.devices.iter().find(|d| d.id == id));
            let device = match (requested, request.exact) {
                (Some(device), _) => device.id.clone(),
                (None, true) => {
                    return Err(LiveSignalError::DeviceNotFound(
                        request.device_id.clone().unwrap_or_default(),
                    ))
                }
                (None, false) => state
                    .devices
                    .first()
                    .map(|d| d.id.clone())
                    .unwrap_or_else(|| "synthetic-default".to_string()),
            };

            state.sessions_opened += 1;
            state.open_sessions += 1;
            (device, state.start_suspended)
        };

        Ok(Box::new(SyntheticSession {
            device_id,
            analyser: SpectralAnalyser::new(self.sample_rate, config),
            tones: self.tones.clone(),
            cursor: 0,
            rendered: None,
            clock: if suspended {
                ClockState::Suspended
            } else {
                ClockState::Running
            },
            tracks_live: true,
            state: self.state.clone(),
        }))
    }
}

struct SyntheticSession {
    device_id: String,
    analyser: SpectralAnalyser,
    tones: Vec<Tone>,
    cursor: u64,
    rendered: Option<u64>,
    clock: ClockState,
    tracks_live: bool,
    state: Arc<Mutex<SyntheticState>>,
}

impl SyntheticSession {
    fn render_block(&mut self) {
        let len = self.analyser.config().fft_size;
        let sample_rate = self.analyser.sample_rate();
        let block: Vec<f32> = (0..len as u64)
            .map(|offset| {
                let t = (self.cursor + offset) as f64 / sample_rate as f64;
                self.tones
                    .iter()
                    .map(|tone| {
                        let phase = (t * tone.frequency as f64).fract() as f32;
                        tone.amplitude * (TAU * phase).sin()
                    })
                    .sum()
            })
            .collect();
        self.cursor += len as u64;
        self.analyser.push_samples(&block);
    }
}

#[async_trait]
impl CaptureSession for SyntheticSession {
    fn sample_rate(&self) -> f32 {
        self.analyser.sample_rate()
    }

    fn configure(&mut self, config: &AudioConfig) -> Result<()> {
        self.analyser.configure(config)
    }

    fn frequency_bytes(&mut self, out: &mut [u8]) -> Result<()> {
        let frame = self.state.lock().map(|state| state.frame).unwrap_or(0);
        if self.clock == ClockState::Running && self.tracks_live && self.rendered != Some(frame)
        {
            self.render_block();
            self.rendered = Some(frame);
        }
        self.analyser.frequency_bytes(out)
    }

    fn time_domain_bytes(&mut self, out: &mut [u8]) {
        self.analyser.time_domain_bytes(out);
    }

    fn clock_state(&self) -> ClockState {
        self.clock
    }

    async fn resume(&mut self) -> Result<()> {
        let gate = self
            .state
            .lock()
            .ok()
            .and_then(|mut state| state.resume_gate.take());
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        match self.clock {
            ClockState::Closed => Err(LiveSignalError::msg("audio clock already closed")),
            _ => {
                self.clock = ClockState::Running;
                Ok(())
            }
        }
    }

    fn granted_device_id(&self) -> Option<String> {
        Some(self.device_id.clone())
    }

    fn disconnect(&mut self) {
        self.tracks_live = false;
    }

    async fn close(&mut self) -> Result<()> {
        if self.clock != ClockState::Closed {
            self.clock = ClockState::Closed;
            if let Ok(mut state) = self.state.lock() {
                state.open_sessions = state.open_sessions.saturating_sub(1);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn exact_request_for_unknown_device_fails() {
        let capture = SyntheticCapture::new().with_device("a", "A");
        let result = block_on(capture.open(&CaptureRequest::exact("zzz"), &AudioConfig::default()));
        assert!(matches!(result, Err(LiveSignalError::DeviceNotFound(_))));
        assert_eq!(capture.open_sessions(), 0);
    }

    #[test]
    fn close_is_counted_once() {
        let capture = SyntheticCapture::new().with_device("a", "A");
        let mut session =
            block_on(capture.open(&CaptureRequest::ideal(None), &AudioConfig::default())).unwrap();
        assert_eq!(capture.open_sessions(), 1);

        block_on(session.close()).unwrap();
        block_on(session.close()).unwrap();
        assert_eq!(capture.open_sessions(), 0);
        assert!(block_on(session.resume()).is_err());
    }
}
