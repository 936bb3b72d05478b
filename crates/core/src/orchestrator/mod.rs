use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    AppConfig, AudioSnapshot, AudioSource, AudioState, CaptureBackend, LiveSignalError,
    MidiBackend, MidiSnapshot, MidiSource, MidiState, Observers, Result,
};

/// Per-subsystem outcome of [`Orchestrator::initialize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializeReport {
    pub audio: bool,
    pub midi: bool,
}

/// Pollable summary for hosts and renderers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub audio: AudioState,
    pub midi: MidiState,
    pub audio_device: Option<String>,
    pub pattern_index: usize,
    pub total_patterns: usize,
    pub ready: bool,
}

#[derive(Debug, Default)]
pub struct OrchestratorObservers {
    pub pattern_changed: Observers<usize>,
}

#[derive(Debug, Clone, Copy)]
struct Patterns {
    index: usize,
    total: usize,
}

/// Runs one audio and one MIDI source side by side.
///
/// The two subsystems share nothing: each is initialised, fails and stops on
/// its own, and only audio decides readiness.
pub struct Orchestrator<A, M> {
    audio: AudioSource<A>,
    midi: MidiSource<M>,
    sysex_enabled: bool,
    patterns: Mutex<Patterns>,
    observers: OrchestratorObservers,
}

impl<A: CaptureBackend, M: MidiBackend> Orchestrator<A, M> {
    /// Creates an orchestrator with default settings.
    pub fn new(audio: A, midi: M) -> Self {
        Self::with_config(audio, midi, &AppConfig::default())
    }

    /// Creates an orchestrator seeded from `config`.
    pub fn with_config(audio: A, midi: M, config: &AppConfig) -> Self {
        Self {
            audio: AudioSource::with_config(audio, config.audio.clone()),
            midi: MidiSource::with_config(midi, &config.midi),
            sysex_enabled: config.midi.sysex_enabled,
            patterns: Mutex::new(Patterns {
                index: 0,
                total: clamp_total(config.patterns.total_patterns),
            }),
            observers: OrchestratorObservers::default(),
        }
    }

    /// Returns the audio subsystem.
    pub fn audio(&self) -> &AudioSource<A> {
        &self.audio
    }

    /// Returns the MIDI subsystem.
    pub fn midi(&self) -> &MidiSource<M> {
        &self.midi
    }

    pub fn observers(&self) -> &OrchestratorObservers {
        &self.observers
    }

    /// Starts both subsystems concurrently. Neither outcome affects the
    /// other.
    pub async fn initialize(&self, audio_device: Option<&str>) -> InitializeReport {
        let (audio, midi) = futures::join!(
            self.audio.initialize(audio_device),
            self.midi.initialize(self.sysex_enabled)
        );
        info!(audio, midi, "input engine initialized");
        InitializeReport { audio, midi }
    }

    /// Stops both subsystems. Idempotent.
    pub async fn destroy(&self) {
        futures::join!(self.audio.stop(), async { self.midi.stop() });
        debug!("input engine destroyed");
    }

    /// Audio readiness only; MIDI is best effort.
    pub fn is_ready(&self) -> bool {
        self.audio.is_active()
    }

    /// Per-frame hook for the host.
    pub fn update_audio(&self) {
        self.audio.update();
    }

    /// Latest audio snapshot.
    pub fn audio_data(&self) -> Arc<AudioSnapshot> {
        self.audio.data()
    }

    /// Latest MIDI snapshot.
    pub fn midi_data(&self) -> Arc<MidiSnapshot> {
        self.midi.data()
    }

    /// Returns the current pattern index.
    pub fn pattern_index(&self) -> usize {
        self.lock().map(|p| p.index).unwrap_or(0)
    }

    /// Returns the declared pattern count.
    pub fn total_patterns(&self) -> usize {
        self.lock().map(|p| p.total).unwrap_or(1)
    }

    /// Sets the pattern count (at least 1) and pulls the current index back
    /// into range.
    pub fn set_total_patterns(&self, total: i64) {
        let changed = {
            let Ok(mut patterns) = self.lock() else {
                return;
            };
            patterns.total = clamp_total(total);
            let index = patterns.index.min(patterns.total - 1);
            let changed = index != patterns.index;
            patterns.index = index;
            changed.then_some(index)
        };
        if let Some(index) = changed {
            self.observers.pattern_changed.notify(&index);
        }
    }

    /// Clamps `index` into `[0, total - 1]` and returns the result. Observers
    /// hear about it only when the index actually moved.
    pub fn set_pattern_index(&self, index: i64) -> usize {
        let (index, changed) = {
            let Ok(mut patterns) = self.lock() else {
                return 0;
            };
            let last = i64::try_from(patterns.total - 1).unwrap_or(i64::MAX);
            let clamped = usize::try_from(index.clamp(0, last)).unwrap_or(0);
            let changed = clamped != patterns.index;
            patterns.index = clamped;
            (clamped, changed)
        };
        if changed {
            debug!(index, "pattern changed");
            self.observers.pattern_changed.notify(&index);
        }
        index
    }

    /// Returns a summary of both subsystems and the pattern position.
    pub fn status(&self) -> Status {
        let patterns = self
            .lock()
            .map(|p| *p)
            .unwrap_or(Patterns { index: 0, total: 1 });
        Status {
            audio: self.audio.state(),
            midi: self.midi.state(),
            audio_device: self.audio.device_id(),
            pattern_index: patterns.index,
            total_patterns: patterns.total,
            ready: self.is_ready(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Patterns>> {
        self.patterns
            .lock()
            .map_err(|_| LiveSignalError::Poisoned("pattern state"))
    }
}

impl<A, M> std::fmt::Debug for Orchestrator<A, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("audio", &self.audio)
            .field("midi", &self.midi)
            .finish()
    }
}

fn clamp_total(total: i64) -> usize {
    usize::try_from(total.max(1)).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SyntheticCapture, VirtualMidi};
    use futures::executor::block_on;

    fn engine() -> Orchestrator<SyntheticCapture, VirtualMidi> {
        Orchestrator::new(
            SyntheticCapture::new()
                .with_device("mic", "Mic")
                .with_tone(440.0, 0.5),
            VirtualMidi::new().with_input("pads", "Pads"),
        )
    }

    fn pattern_log(
        engine: &Orchestrator<SyntheticCapture, VirtualMidi>,
    ) -> (Arc<Mutex<Vec<usize>>>, crate::Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let token = engine
            .observers()
            .pattern_changed
            .subscribe(move |index| sink.lock().unwrap().push(*index));
        (seen, token)
    }

    #[test]
    fn initializes_both_subsystems() {
        let engine = engine();
        let report = block_on(engine.initialize(None));
        assert_eq!(report, InitializeReport { audio: true, midi: true });
        assert!(engine.is_ready());

        engine.update_audio();
        assert!(engine.audio_data().level > 0.0);
        engine.midi().backend().send_from("pads", &[0xB0, 1, 127]);
        assert_eq!(engine.midi_data().cc_value(0, 1), 1.0);
    }

    #[test]
    fn audio_failure_does_not_block_midi() {
        let engine = Orchestrator::new(
            SyntheticCapture::new().deny_permission(),
            VirtualMidi::new().with_input("pads", "Pads"),
        );
        let report = block_on(engine.initialize(None));

        assert_eq!(report, InitializeReport { audio: false, midi: true });
        assert!(!engine.is_ready());
        assert_eq!(engine.status().audio, AudioState::Error);
        assert_eq!(engine.status().midi, MidiState::Active);
    }

    #[test]
    fn missing_midi_keeps_audio_ready() {
        let engine = Orchestrator::new(
            SyntheticCapture::new().with_device("mic", "Mic"),
            VirtualMidi::new().unsupported(),
        );
        let report = block_on(engine.initialize(Some("mic")));

        assert_eq!(report, InitializeReport { audio: true, midi: false });
        assert!(engine.is_ready());
        assert_eq!(engine.midi().state(), MidiState::Unsupported);
    }

    #[test]
    fn destroy_is_idempotent() {
        let engine = engine();
        block_on(engine.destroy());

        block_on(engine.initialize(None));
        engine.update_audio();
        block_on(engine.destroy());
        block_on(engine.destroy());

        assert_eq!(engine.audio().state(), AudioState::Idle);
        assert_eq!(engine.midi().state(), MidiState::Idle);
        assert!(engine.audio_data().is_empty());
        assert_eq!(*engine.midi_data(), MidiSnapshot::empty());
        assert!(!engine.is_ready());
    }

    #[test]
    fn pattern_index_is_always_clamped() {
        let engine = engine();
        engine.set_total_patterns(5);

        for input in [i64::MIN, -100, -1, 0, 2, 4, 5, 99, i64::MAX] {
            let index = engine.set_pattern_index(input);
            assert!(index <= 4, "{input} -> {index}");
            assert_eq!(index, engine.pattern_index());
        }
        assert_eq!(engine.set_pattern_index(-3), 0);
        assert_eq!(engine.set_pattern_index(17), 4);
    }

    #[test]
    fn pattern_observer_fires_only_on_change() {
        let engine = engine();
        engine.set_total_patterns(4);
        let (seen, _token) = pattern_log(&engine);

        engine.set_pattern_index(0);
        engine.set_pattern_index(-7);
        engine.set_pattern_index(2);
        engine.set_pattern_index(2);
        engine.set_pattern_index(50);
        engine.set_pattern_index(3);

        assert_eq!(*seen.lock().unwrap(), vec![2, 3]);
    }

    #[test]
    fn total_patterns_has_a_floor_of_one() {
        let engine = engine();
        engine.set_total_patterns(0);
        assert_eq!(engine.total_patterns(), 1);
        engine.set_total_patterns(-5);
        assert_eq!(engine.total_patterns(), 1);
        assert_eq!(engine.set_pattern_index(3), 0);
    }

    #[test]
    fn shrinking_total_reclamps_index() {
        let engine = engine();
        engine.set_total_patterns(8);
        engine.set_pattern_index(6);
        let (seen, _token) = pattern_log(&engine);

        engine.set_total_patterns(3);
        assert_eq!(engine.pattern_index(), 2);
        engine.set_total_patterns(10);
        assert_eq!(engine.pattern_index(), 2);
        assert_eq!(*seen.lock().unwrap(), vec![2]);
    }

    #[test]
    fn status_reflects_both_sources() {
        let engine = engine();
        block_on(engine.initialize(None));
        engine.set_total_patterns(3);
        engine.set_pattern_index(1);

        let status = engine.status();
        assert_eq!(status.audio_device.as_deref(), Some("mic"));
        assert_eq!(status.pattern_index, 1);
        assert_eq!(status.total_patterns, 3);
        assert!(status.ready);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["audio"], "active");
        assert_eq!(json["midi"], "active");
        assert_eq!(json["patternIndex"], 1);
    }

    #[test]
    fn config_seeds_patterns_and_midi_routing() {
        let mut config = AppConfig::default();
        config.patterns.total_patterns = 6;
        config.midi.sysex_enabled = true;
        config.midi.channel_filter = crate::ChannelFilter::Off;

        let engine = Orchestrator::with_config(
            SyntheticCapture::new(),
            VirtualMidi::new().with_input("pads", "Pads"),
            &config,
        );
        assert_eq!(engine.total_patterns(), 6);
        assert_eq!(engine.midi().channel_filter(), crate::ChannelFilter::Off);

        block_on(engine.initialize(None));
        assert_eq!(engine.midi().backend().access_requests(), vec![true]);
    }
}
