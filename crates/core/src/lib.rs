//! Live audio and MIDI acquisition for visual hosts.
//!
//! The crate turns a microphone stream and a MIDI control surface into two
//! snapshots a renderer can poll once per frame: [`AudioSnapshot`] (spectrum,
//! waveform, seven band energies, overall level) and [`MidiSnapshot`] (last
//! value per `channel:cc`, last program, clock ticks). Device access sits
//! behind the [`CaptureBackend`] and [`MidiBackend`] traits; in-memory
//! backends are always available and hardware backends are enabled with the
//! `cpal` and `midir` features.

pub mod analysis;
pub mod audio;
pub mod config;
pub mod error;
pub mod midi;
pub mod observer;
pub mod orchestrator;

pub use analysis::{
    AudioSnapshot, Band, BandEnergies, FrequencyRanges, SpectralAnalyser, SpectrumAnalyzer,
};
#[cfg(feature = "cpal")]
pub use audio::CpalCapture;
pub use audio::{
    AudioDeviceInfo, AudioObservers, AudioSource, AudioState, CaptureBackend, CaptureRequest,
    CaptureSession, ClockState, SyntheticCapture,
};
pub use config::{AppConfig, AudioConfig, AudioConfigPatch, MidiConfig, PatternConfig};
pub use error::{ErrorKind, LiveSignalError, Result};
#[cfg(feature = "midir")]
pub use midi::MidirBackend;
pub use midi::{
    CcAssignment, CcEvent, CcKey, CcMapping, ChannelFilter, ClockPolicy, LearnState,
    MidiBackend, MidiDeviceRecord, MidiLearnEngine, MidiMessage, MidiObservers, MidiSnapshot,
    MidiSource, MidiState, ParameterChange, VirtualMidi,
};
pub use observer::{Observers, Subscription};
pub use orchestrator::{InitializeReport, Orchestrator, OrchestratorObservers, Status};
