mod backend;
#[cfg(feature = "cpal")]
mod cpal_backend;
mod synthetic;

pub use backend::{AudioDeviceInfo, CaptureBackend, CaptureRequest, CaptureSession, ClockState};
#[cfg(feature = "cpal")]
pub use cpal_backend::CpalCapture;
pub use synthetic::SyntheticCapture;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    AudioConfig, AudioConfigPatch, AudioSnapshot, FrequencyRanges, LiveSignalError, Observers,
    Result, SpectrumAnalyzer,
};

/// Length of the device-id prefix used for synthesised labels.
const LABEL_PREFIX_LEN: usize = 8;

/// Lifecycle of the audio subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioState {
    Idle,
    Initializing,
    Active,
    Error,
}

/// Outward callbacks raised by [`AudioSource`].
#[derive(Debug, Default)]
pub struct AudioObservers {
    pub state_changed: Observers<AudioState>,
    pub data_updated: Observers<Arc<AudioSnapshot>>,
    pub error: Observers<LiveSignalError>,
}

struct AudioInner {
    state: AudioState,
    config: AudioConfig,
    ranges: FrequencyRanges,
    session: Option<Box<dyn CaptureSession>>,
    device_id: Option<String>,
    devices: Vec<AudioDeviceInfo>,
    looping: bool,
    frequency: Vec<u8>,
    time_domain: Vec<u8>,
}

impl AudioInner {
    fn new(config: AudioConfig) -> Self {
        Self {
            state: AudioState::Idle,
            config,
            ranges: FrequencyRanges::default(),
            session: None,
            device_id: None,
            devices: Vec::new(),
            looping: false,
            frequency: Vec::new(),
            time_domain: Vec::new(),
        }
    }

    fn resize_buffers(&mut self) {
        let bins = self.config.bin_count();
        self.frequency = vec![0; bins];
        self.time_domain = vec![128; bins];
    }
}

/// Owns the capture device lifecycle and produces one [`AudioSnapshot`] per
/// frame.
///
/// Every method takes `&self`; negotiation futures never hold the internal
/// lock across an `.await`, so [`stop`](Self::stop) may run while an
/// [`initialize`](Self::initialize) is still pending. An initialize that
/// finds it was superseded releases whatever it acquired and reports
/// failure without touching the torn-down state.
pub struct AudioSource<B> {
    backend: B,
    inner: Mutex<AudioInner>,
    snapshot: ArcSwap<AudioSnapshot>,
    generation: AtomicU64,
    observers: AudioObservers,
}

impl<B: CaptureBackend> AudioSource<B> {
    /// Creates an idle source with the default analysis settings.
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, AudioConfig::default())
    }

    /// Creates an idle source with `config`.
    pub fn with_config(backend: B, config: AudioConfig) -> Self {
        Self {
            backend,
            inner: Mutex::new(AudioInner::new(config)),
            snapshot: ArcSwap::from_pointee(AudioSnapshot::empty()),
            generation: AtomicU64::new(0),
            observers: AudioObservers::default(),
        }
    }

    /// Returns the capture backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Returns the observer lists for subscription.
    pub fn observers(&self) -> &AudioObservers {
        &self.observers
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> AudioState {
        self.lock().map(|inner| inner.state).unwrap_or(AudioState::Error)
    }

    /// Whether a capture session is live.
    pub fn is_active(&self) -> bool {
        self.state() == AudioState::Active
    }

    /// Whether the per-frame update loop is currently scheduled.
    pub fn is_looping(&self) -> bool {
        self.lock().map(|inner| inner.looping).unwrap_or(false)
    }

    /// Returns a copy of the live analysis settings.
    pub fn config(&self) -> AudioConfig {
        self.lock()
            .map(|inner| inner.config.clone())
            .unwrap_or_default()
    }

    /// Band bin ranges for the current sample rate and FFT size.
    pub fn frequency_ranges(&self) -> FrequencyRanges {
        self.lock().map(|inner| inner.ranges).unwrap_or_default()
    }

    /// Device id granted by the platform for the current session.
    pub fn device_id(&self) -> Option<String> {
        self.lock().ok().and_then(|inner| inner.device_id.clone())
    }

    /// Result of the most recent [`enumerate_devices`](Self::enumerate_devices).
    pub fn devices(&self) -> Vec<AudioDeviceInfo> {
        self.lock()
            .map(|inner| inner.devices.clone())
            .unwrap_or_default()
    }

    /// Latest complete snapshot. Never partially updated.
    pub fn data(&self) -> Arc<AudioSnapshot> {
        self.snapshot.load_full()
    }

    /// Requests capture permission and lists input devices. Failures are
    /// reported to the error observer and yield an empty list; the source
    /// state is left unchanged.
    pub async fn enumerate_devices(&self) -> Vec<AudioDeviceInfo> {
        let result: Result<Vec<AudioDeviceInfo>> = async {
            self.backend.request_permission().await?;
            self.backend.enumerate_devices().await
        }
        .await;

        match result {
            Ok(devices) => {
                let devices: Vec<AudioDeviceInfo> = devices.into_iter().map(labelled).collect();
                debug!(count = devices.len(), "enumerated audio inputs");
                if let Ok(mut inner) = self.lock() {
                    inner.devices = devices.clone();
                }
                devices
            }
            Err(err) => {
                warn!(error = %err, "audio device enumeration failed");
                self.observers.error.notify(&err);
                Vec::new()
            }
        }
    }

    /// Opens a capture session, preferring `device_id` when given, and starts
    /// the per-frame loop. An already running session is stopped first.
    pub async fn initialize(&self, device_id: Option<&str>) -> bool {
        if matches!(self.state(), AudioState::Active | AudioState::Initializing) {
            self.stop().await;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.transition(AudioState::Initializing);

        match self.negotiate(device_id, generation).await {
            Ok(()) => true,
            Err(LiveSignalError::Abandoned) => {
                debug!("audio initialization abandoned after stop");
                false
            }
            Err(err) => {
                self.fail(generation, err);
                false
            }
        }
    }

    /// Stops the current session and initializes `device_id`, keeping the
    /// configured analysis settings.
    pub async fn change_device(&self, device_id: &str) -> bool {
        self.stop().await;
        self.initialize(Some(device_id)).await
    }

    /// Pulls the current buffers from the device and replaces the snapshot.
    /// Does nothing unless the source is active.
    pub fn update(&self) {
        let snapshot = {
            let Ok(mut guard) = self.inner.lock() else {
                return;
            };
            let inner = &mut *guard;
            if inner.state != AudioState::Active || !inner.looping {
                return;
            }
            let Some(session) = inner.session.as_mut() else {
                return;
            };
            if let Err(err) = session.frequency_bytes(&mut inner.frequency) {
                warn!(error = %err, "failed to read frequency data");
                return;
            }
            session.time_domain_bytes(&mut inner.time_domain);
            Arc::new(SpectrumAnalyzer::analyze(
                &inner.frequency,
                &inner.time_domain,
                &inner.ranges,
            ))
        };

        self.snapshot.store(snapshot.clone());
        self.observers.data_updated.notify(&snapshot);
    }

    /// Resumes a suspended audio clock without rebuilding the session.
    ///
    /// The session is out of the source while the platform resumes it;
    /// settings changed in that window are applied when it is put back.
    pub async fn resume(&self) -> bool {
        let generation = self.generation.load(Ordering::SeqCst);
        let taken = match self.lock() {
            Ok(mut inner) => inner
                .session
                .take()
                .map(|session| (session, inner.config.clone())),
            Err(_) => None,
        };
        let Some((mut session, applied)) = taken else {
            return false;
        };

        let result = session.resume().await;
        let orphan = match self.lock() {
            Ok(mut guard) if self.is_current(generation) => {
                let inner = &mut *guard;
                if inner.config != applied {
                    if let Err(err) = session.configure(&inner.config) {
                        warn!(error = %err, "failed to apply analysis settings after resume");
                    }
                    inner.ranges =
                        FrequencyRanges::compute(session.sample_rate(), inner.config.bin_count());
                }
                inner.session = Some(session);
                None
            }
            _ => Some(session),
        };
        if let Some(session) = orphan {
            release(session).await;
            return false;
        }

        match result {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "failed to resume audio clock");
                self.observers.error.notify(&err);
                false
            }
        }
    }

    /// Tears the session down and returns to `Idle`. Safe to call at any
    /// time, including before the first initialize.
    pub async fn stop(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);

        let (session, changed) = match self.lock() {
            Ok(mut inner) => {
                inner.looping = false;
                inner.device_id = None;
                let changed = inner.state != AudioState::Idle;
                inner.state = AudioState::Idle;
                (inner.session.take(), changed)
            }
            Err(_) => (None, false),
        };

        self.snapshot.store(Arc::new(AudioSnapshot::empty()));
        if let Some(session) = session {
            release(session).await;
        }
        if changed {
            info!("audio source stopped");
            self.observers.state_changed.notify(&AudioState::Idle);
        }
    }

    /// Merges `patch` into the configuration. While active the new values
    /// are pushed onto the live node; band ranges are recomputed only when
    /// the FFT size changed.
    pub fn set_config(&self, patch: &AudioConfigPatch) -> Result<()> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;

        let next = inner.config.merged(patch);
        next.validate()?;
        let fft_changed = next.fft_size != inner.config.fft_size;

        if inner.state == AudioState::Active {
            if let Some(session) = inner.session.as_mut() {
                session.configure(&next)?;
                if fft_changed {
                    inner.ranges = FrequencyRanges::compute(session.sample_rate(), next.bin_count());
                }
            }
        }

        inner.config = next;
        if fft_changed {
            inner.resize_buffers();
            debug!(fft_size = inner.config.fft_size, "fft size changed");
        }
        Ok(())
    }

    async fn negotiate(&self, device_id: Option<&str>, generation: u64) -> Result<()> {
        let config = self.config();
        let request = CaptureRequest::ideal(device_id);
        let mut session = self.backend.open(&request, &config).await?;

        if let Err(err) = self.prepare(session.as_mut(), generation).await {
            release(session).await;
            return Err(err);
        }

        let latest = self.config();
        if let Err(err) = session.configure(&latest) {
            release(session).await;
            return Err(err);
        }

        let granted = session
            .granted_device_id()
            .or_else(|| device_id.map(str::to_owned));

        let orphan = {
            let mut guard = self.lock()?;
            if self.is_current(generation) {
                let inner = &mut *guard;
                if inner.config != latest {
                    if let Err(err) = session.configure(&inner.config) {
                        warn!(error = %err, "failed to apply updated analysis settings");
                    }
                }
                inner.ranges =
                    FrequencyRanges::compute(session.sample_rate(), inner.config.bin_count());
                inner.resize_buffers();
                inner.session = Some(session);
                inner.device_id = granted.clone();
                inner.state = AudioState::Active;
                inner.looping = true;
                None
            } else {
                Some(session)
            }
        };

        if let Some(session) = orphan {
            release(session).await;
            return Err(LiveSignalError::Abandoned);
        }

        info!(device = granted.as_deref().unwrap_or("default"), "audio source active");
        self.observers.state_changed.notify(&AudioState::Active);
        Ok(())
    }

    async fn prepare(&self, session: &mut dyn CaptureSession, generation: u64) -> Result<()> {
        if !self.is_current(generation) {
            return Err(LiveSignalError::Abandoned);
        }
        if session.clock_state() == ClockState::Suspended {
            session.resume().await?;
            if !self.is_current(generation) {
                return Err(LiveSignalError::Abandoned);
            }
        }
        Ok(())
    }

    fn fail(&self, generation: u64, err: LiveSignalError) {
        if !self.is_current(generation) {
            debug!(error = %err, "ignoring failure of superseded initialization");
            return;
        }

        if let Ok(mut inner) = self.lock() {
            inner.state = AudioState::Error;
            inner.looping = false;
            inner.session = None;
            inner.device_id = None;
        }
        self.snapshot.store(Arc::new(AudioSnapshot::empty()));

        warn!(error = %err, "audio initialization failed");
        self.observers.error.notify(&err);
        self.observers.state_changed.notify(&AudioState::Error);
    }

    fn transition(&self, state: AudioState) {
        if let Ok(mut inner) = self.lock() {
            inner.state = state;
        }
        self.observers.state_changed.notify(&state);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn lock(&self) -> Result<MutexGuard<'_, AudioInner>> {
        self.inner
            .lock()
            .map_err(|_| LiveSignalError::Poisoned("audio source state"))
    }
}

impl<B> std::fmt::Debug for AudioSource<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioSource")
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .finish()
    }
}

async fn release(mut session: Box<dyn CaptureSession>) {
    session.disconnect();
    if let Err(err) = session.close().await {
        warn!(error = %err, "failed to close capture session");
    }
}

fn labelled(device: AudioDeviceInfo) -> AudioDeviceInfo {
    if !device.label.trim().is_empty() {
        return device;
    }
    let prefix: String = device.id.chars().take(LABEL_PREFIX_LEN).collect();
    AudioDeviceInfo {
        label: format!("Microphone {prefix}"),
        id: device.id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Band, ErrorKind};
    use futures::channel::oneshot;
    use futures::executor::block_on;
    use std::sync::atomic::AtomicUsize;

    fn tone_source() -> AudioSource<SyntheticCapture> {
        AudioSource::new(
            SyntheticCapture::new()
                .with_device("mic-one", "Desk Mic")
                .with_tone(100.0, 0.8),
        )
    }

    #[test]
    fn idle_source_reports_empty_snapshot() {
        let audio = tone_source();
        audio.update();

        let data = audio.data();
        assert!(data.is_empty());
        assert_eq!(data.level, 0.0);
        assert_eq!(audio.state(), AudioState::Idle);
        assert!(!audio.is_looping());
    }

    #[test]
    fn initialize_update_stop_round_trip() {
        let audio = tone_source();
        assert!(block_on(audio.initialize(None)));
        assert_eq!(audio.state(), AudioState::Active);
        assert!(audio.is_looping());
        assert_eq!(audio.device_id().as_deref(), Some("mic-one"));

        for _ in 0..5 {
            audio.update();
        }
        let data = audio.data();
        assert_eq!(data.bin_count(), 1024);
        assert_eq!(data.waveform.len(), 1024);
        assert!(data.level > 0.0);
        assert!(data.band(Band::Bass) > data.band(Band::Brilliance));

        block_on(audio.stop());
        assert_eq!(audio.state(), AudioState::Idle);
        assert_eq!(*audio.data(), AudioSnapshot::empty());
        assert_eq!(audio.device_id(), None);
        assert_eq!(audio.backend().open_sessions(), 0);
    }

    #[test]
    fn stop_without_initialize_is_harmless() {
        let audio = tone_source();
        block_on(audio.stop());
        block_on(audio.stop());
        assert_eq!(audio.state(), AudioState::Idle);
    }

    #[test]
    fn reinitialize_releases_previous_session() {
        let audio = tone_source();
        assert!(block_on(audio.initialize(None)));
        assert!(block_on(audio.initialize(None)));
        assert_eq!(audio.backend().sessions_opened(), 2);
        assert_eq!(audio.backend().open_sessions(), 1);
    }

    #[test]
    fn unknown_device_is_a_soft_preference() {
        let audio = tone_source();
        assert!(block_on(audio.initialize(Some("does-not-exist"))));
        assert_eq!(audio.device_id().as_deref(), Some("mic-one"));
    }

    #[test]
    fn permission_denial_moves_to_error() {
        let audio = AudioSource::new(SyntheticCapture::new().deny_permission());
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let _token = audio.observers().error.subscribe(move |err: &LiveSignalError| {
            sink.lock().unwrap().push(err.kind());
        });

        assert!(!block_on(audio.initialize(None)));
        assert_eq!(audio.state(), AudioState::Error);
        assert!(!audio.is_looping());
        assert!(audio.data().is_empty());
        assert_eq!(*errors.lock().unwrap(), vec![ErrorKind::PermissionDenied]);
    }

    #[test]
    fn stream_failure_moves_to_error() {
        let audio = AudioSource::new(SyntheticCapture::new().fail_open());
        assert!(!block_on(audio.initialize(None)));
        assert_eq!(audio.state(), AudioState::Error);
    }

    #[test]
    fn enumeration_failure_returns_empty_without_state_change() {
        let audio = AudioSource::new(SyntheticCapture::new().fail_enumeration());
        let errors = Arc::new(AtomicUsize::new(0));
        let sink = errors.clone();
        let _token = audio.observers().error.subscribe(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        });

        assert!(block_on(audio.enumerate_devices()).is_empty());
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(audio.state(), AudioState::Idle);
    }

    #[test]
    fn enumeration_synthesises_missing_labels() {
        let audio = AudioSource::new(
            SyntheticCapture::new()
                .with_device("0123456789abcdef", "")
                .with_device("usb", "USB Interface"),
        );
        let devices = block_on(audio.enumerate_devices());

        assert_eq!(devices[0].label, "Microphone 01234567");
        assert_eq!(devices[1].label, "USB Interface");
        assert_eq!(audio.devices(), devices);
    }

    #[test]
    fn suspended_clock_is_resumed_on_initialize() {
        let audio = AudioSource::new(
            SyntheticCapture::new()
                .with_device("mic", "Mic")
                .start_suspended(),
        );
        assert!(block_on(audio.initialize(None)));
        assert!(block_on(audio.resume()));
        assert_eq!(audio.state(), AudioState::Active);
    }

    #[test]
    fn resume_without_session_fails() {
        let audio = tone_source();
        assert!(!block_on(audio.resume()));
    }

    #[test]
    fn stop_during_initialize_abandons_the_session() {
        let (release_gate, gate) = oneshot::channel();
        let audio = AudioSource::new(
            SyntheticCapture::new()
                .with_device("mic", "Mic")
                .gate_open(gate),
        );

        let (initialized, ()) = block_on(async {
            futures::join!(audio.initialize(None), async {
                audio.stop().await;
                let _ = release_gate.send(());
            })
        });

        assert!(!initialized);
        assert_eq!(audio.state(), AudioState::Idle);
        assert!(!audio.is_looping());
        assert_eq!(audio.backend().open_sessions(), 0);
    }

    #[test]
    fn change_device_keeps_config() {
        let audio = AudioSource::new(
            SyntheticCapture::new()
                .with_device("a", "A")
                .with_device("b", "B"),
        );
        audio.set_config(&AudioConfigPatch::fft_size(512)).unwrap();
        assert!(block_on(audio.initialize(Some("a"))));
        assert!(block_on(audio.change_device("b")));

        assert_eq!(audio.device_id().as_deref(), Some("b"));
        assert_eq!(audio.config().fft_size, 512);
        audio.update();
        assert_eq!(audio.data().bin_count(), 256);
    }

    #[test]
    fn live_fft_change_recomputes_ranges() {
        let audio = tone_source();
        assert!(block_on(audio.initialize(None)));
        let before = audio.frequency_ranges();

        audio.set_config(&AudioConfigPatch::smoothing(0.8)).unwrap();
        assert_eq!(audio.frequency_ranges(), before);

        audio.set_config(&AudioConfigPatch::fft_size(4096)).unwrap();
        assert_ne!(audio.frequency_ranges(), before);
        audio.update();
        assert_eq!(audio.data().bin_count(), 2048);

        assert!(audio.set_config(&AudioConfigPatch::fft_size(3000)).is_err());
        assert_eq!(audio.config().fft_size, 4096);
    }

    #[test]
    fn repeated_update_within_a_frame_is_stable() {
        let audio = tone_source();
        assert!(block_on(audio.initialize(None)));

        audio.update();
        let first = audio.data();
        audio.update();
        let second = audio.data();
        assert_eq!(*first, *second);

        audio.backend().advance();
        audio.update();
        assert_ne!(*audio.data(), *first);
    }

    #[test]
    fn config_changed_during_resume_reaches_the_session() {
        let (release_gate, gate) = oneshot::channel();
        // 15 kHz sits at bin 640 of a 2048-point FFT and bin 1280 of 4096.
        let audio = AudioSource::new(
            SyntheticCapture::new()
                .with_device("mic", "Mic")
                .with_tone(15_000.0, 0.8),
        );
        assert!(block_on(audio.initialize(None)));
        let _ = audio.backend().clone().gate_resume(gate);

        let (resumed, ()) = block_on(async {
            futures::join!(audio.resume(), async {
                audio.set_config(&AudioConfigPatch::fft_size(4096)).unwrap();
                let _ = release_gate.send(());
            })
        });

        assert!(resumed);
        assert_eq!(
            audio.frequency_ranges(),
            FrequencyRanges::compute(48_000.0, 2048)
        );
        audio.update();
        let data = audio.data();
        assert_eq!(data.bin_count(), 2048);
        let peak = data
            .raw
            .iter()
            .enumerate()
            .max_by_key(|(_, &value)| value)
            .map(|(index, _)| index)
            .unwrap();
        assert!((1275..=1285).contains(&peak), "peak at {peak}");
    }

    #[test]
    fn update_notifies_data_observers() {
        let audio = tone_source();
        let frames = Arc::new(AtomicUsize::new(0));
        let sink = frames.clone();
        let _token = audio.observers().data_updated.subscribe(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        });

        audio.update();
        assert_eq!(frames.load(Ordering::SeqCst), 0);

        assert!(block_on(audio.initialize(None)));
        audio.update();
        audio.update();
        assert_eq!(frames.load(Ordering::SeqCst), 2);
    }
}
