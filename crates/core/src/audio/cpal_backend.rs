use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use futures::channel::oneshot;
use tracing::{debug, warn};

use super::{AudioDeviceInfo, CaptureBackend, CaptureRequest, CaptureSession, ClockState};
use crate::{AudioConfig, LiveSignalError, Result, SpectralAnalyser};

/// Microphone capture through the default cpal host.
///
/// cpal streams are not `Send` on every platform, so each session owns a
/// dedicated thread that builds, plays and finally drops the stream. The
/// stream callback downmixes to mono and feeds a shared [`SpectralAnalyser`].
#[derive(Debug, Default, Clone)]
pub struct CpalCapture;

impl CpalCapture {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CaptureBackend for CpalCapture {
    async fn request_permission(&self) -> Result<()> {
        // Desktop hosts prompt (if at all) when the first stream is opened.
        Ok(())
    }

    async fn enumerate_devices(&self) -> Result<Vec<AudioDeviceInfo>> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|err| LiveSignalError::Enumeration(err.to_string()))?;

        Ok(devices
            .map(|device| {
                let name = device.name().unwrap_or_default();
                AudioDeviceInfo::new(name.clone(), name)
            })
            .collect())
    }

    async fn open(
        &self,
        request: &CaptureRequest,
        config: &AudioConfig,
    ) -> Result<Box<dyn CaptureSession>> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = mpsc::channel();
        let request = request.clone();
        let config = config.clone();

        let worker = thread::Builder::new()
            .name("livesignal-capture".to_string())
            .spawn(move || run_capture(request, config, ready_tx, stop_rx))
            .map_err(|err| LiveSignalError::StreamAcquisition(err.to_string()))?;

        let ready = ready_rx.await.map_err(|_| {
            LiveSignalError::StreamAcquisition("capture thread exited before starting".into())
        })??;

        Ok(Box::new(CpalSession {
            analyser: ready.analyser,
            sample_rate: ready.sample_rate,
            device_id: ready.device_id,
            clock: ClockState::Running,
            stop: Some(stop_tx),
            worker: Some(worker),
        }))
    }
}

struct Ready {
    analyser: Arc<Mutex<SpectralAnalyser>>,
    sample_rate: f32,
    device_id: String,
}

fn run_capture(
    request: CaptureRequest,
    config: AudioConfig,
    ready: oneshot::Sender<Result<Ready>>,
    stop: mpsc::Receiver<()>,
) {
    let started = start_stream(&request, &config);
    let stream = match started {
        Ok((stream, info)) => {
            if ready.send(Ok(info)).is_err() {
                return;
            }
            stream
        }
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };

    // Blocks until the session is disconnected or dropped.
    let _ = stop.recv();
    drop(stream);
    debug!("capture stream released");
}

fn start_stream(request: &CaptureRequest, config: &AudioConfig) -> Result<(cpal::Stream, Ready)> {
    let host = cpal::default_host();
    let device = select_device(&host, request)?;
    let device_id = device.name().unwrap_or_default();

    let supported = device
        .default_input_config()
        .map_err(|err| LiveSignalError::StreamAcquisition(err.to_string()))?;
    let sample_rate = supported.sample_rate().0 as f32;
    let channels = supported.channels() as usize;
    let stream_config: cpal::StreamConfig = supported.config();

    let analyser = Arc::new(Mutex::new(SpectralAnalyser::new(sample_rate, config)));
    let stream = match supported.sample_format() {
        cpal::SampleFormat::F32 => {
            build_stream::<f32>(&device, &stream_config, channels, analyser.clone())
        }
        cpal::SampleFormat::I16 => {
            build_stream::<i16>(&device, &stream_config, channels, analyser.clone())
        }
        cpal::SampleFormat::U16 => {
            build_stream::<u16>(&device, &stream_config, channels, analyser.clone())
        }
        other => Err(LiveSignalError::StreamAcquisition(format!(
            "unsupported sample format {other:?}"
        ))),
    }?;

    stream
        .play()
        .map_err(|err| LiveSignalError::StreamAcquisition(err.to_string()))?;

    Ok((
        stream,
        Ready {
            analyser,
            sample_rate,
            device_id,
        },
    ))
}

fn select_device(host: &cpal::Host, request: &CaptureRequest) -> Result<cpal::Device> {
    if let Some(wanted) = request.device_id.as_deref() {
        let found = host
            .input_devices()
            .map_err(|err| LiveSignalError::Enumeration(err.to_string()))?
            .find(|device| device.name().map(|name| name == wanted).unwrap_or(false));
        match found {
            Some(device) => return Ok(device),
            None if request.exact => return Err(LiveSignalError::DeviceNotFound(wanted.to_string())),
            None => debug!(wanted, "requested input missing, using default"),
        }
    }

    host.default_input_device()
        .ok_or_else(|| LiveSignalError::DeviceNotFound("no default input device".into()))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channels: usize,
    analyser: Arc<Mutex<SpectralAnalyser>>,
) -> Result<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = channels.max(1);
    let mut mono = Vec::new();
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                mono.clear();
                mono.extend(data.chunks(channels).map(|frame| {
                    frame.iter().map(|s| f32::from_sample(*s)).sum::<f32>() / channels as f32
                }));
                if let Ok(mut analyser) = analyser.lock() {
                    analyser.push_samples(&mono);
                }
            },
            |err| warn!(error = %err, "capture stream error"),
            None,
        )
        .map_err(|err| LiveSignalError::StreamAcquisition(err.to_string()))
}

struct CpalSession {
    analyser: Arc<Mutex<SpectralAnalyser>>,
    sample_rate: f32,
    device_id: String,
    clock: ClockState,
    stop: Option<mpsc::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl CpalSession {
    fn analyser(&self) -> Result<std::sync::MutexGuard<'_, SpectralAnalyser>> {
        self.analyser
            .lock()
            .map_err(|_| LiveSignalError::Poisoned("capture analyser"))
    }
}

#[async_trait]
impl CaptureSession for CpalSession {
    fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    fn configure(&mut self, config: &AudioConfig) -> Result<()> {
        self.analyser()?.configure(config)
    }

    fn frequency_bytes(&mut self, out: &mut [u8]) -> Result<()> {
        self.analyser()?.frequency_bytes(out)
    }

    fn time_domain_bytes(&mut self, out: &mut [u8]) {
        if let Ok(analyser) = self.analyser() {
            analyser.time_domain_bytes(out);
        }
    }

    fn clock_state(&self) -> ClockState {
        self.clock
    }

    async fn resume(&mut self) -> Result<()> {
        if self.clock == ClockState::Closed {
            return Err(LiveSignalError::msg("capture session already closed"));
        }
        self.clock = ClockState::Running;
        Ok(())
    }

    fn granted_device_id(&self) -> Option<String> {
        Some(self.device_id.clone())
    }

    fn disconnect(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("capture thread panicked");
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.disconnect();
        self.clock = ClockState::Closed;
        Ok(())
    }
}

impl Drop for CpalSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}
