use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::executor::block_on;
use livesignal_core::{
    AppConfig, AudioSnapshot, Band, CaptureBackend, CcEvent, LiveSignalError, MidiBackend,
    MidiSnapshot, Orchestrator,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

fn main() -> livesignal_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices { json } => run_devices(json),
        Commands::Monitor {
            frames,
            fps,
            device,
            config,
            json,
        } => {
            if !(fps.is_finite() && fps > 0.0) {
                return Err(LiveSignalError::InvalidInput("fps must be positive"));
            }
            let options = MonitorOptions {
                frames,
                frame_interval: Duration::from_secs_f64(1.0 / fps),
                device,
                json,
            };
            run_monitor(config.as_deref(), &options)
        }
    }
}

#[cfg(feature = "hardware")]
mod backends {
    use livesignal_core::{CpalCapture, MidirBackend, Orchestrator};

    pub type Audio = CpalCapture;
    pub type Midi = MidirBackend;

    pub fn create() -> (Audio, Midi) {
        (CpalCapture::new(), MidirBackend::new())
    }

    pub fn on_frame(_engine: &Orchestrator<Audio, Midi>, _frame: u64) {}
}

#[cfg(not(feature = "hardware"))]
mod backends {
    use livesignal_core::{Orchestrator, SyntheticCapture, VirtualMidi};

    pub type Audio = SyntheticCapture;
    pub type Midi = VirtualMidi;

    const PADS: &str = "virtual-pads";

    pub fn create() -> (Audio, Midi) {
        let audio = SyntheticCapture::new()
            .with_device("synthetic-mic", "Synthetic Microphone")
            .with_device("synthetic-line", "")
            .with_tone(55.0, 0.6)
            .with_tone(880.0, 0.2)
            .with_tone(7_000.0, 0.05);
        let midi = VirtualMidi::new()
            .with_input(PADS, "Virtual Pads")
            .with_output("virtual-synth", "Virtual Synth");
        (audio, midi)
    }

    /// Advances the test tones, sweeps a modulation wheel and ticks the
    /// clock so the monitor has something to show.
    pub fn on_frame(engine: &Orchestrator<Audio, Midi>, frame: u64) {
        if frame > 0 {
            engine.audio().backend().advance();
        }
        let platform = engine.midi().backend();
        platform.send_from(PADS, &[0xB0, 1, (frame % 128) as u8]);
        platform.send_from(PADS, &[0xF8]);
        if frame % 60 == 0 {
            platform.send_from(PADS, &[0xC0, ((frame / 60) % 128) as u8]);
        }
    }
}

fn run_devices(json: bool) -> livesignal_core::Result<()> {
    let (audio, midi) = backends::create();
    let engine = Orchestrator::new(audio, midi);

    let inputs = block_on(engine.audio().enumerate_devices());
    let midi_ready = block_on(engine.midi().initialize(false));
    let ports = engine.midi().devices();
    engine.midi().stop();

    if !midi_ready {
        tracing::warn!(state = ?engine.midi().state(), "midi devices unavailable");
    }

    if json {
        let listing = serde_json::json!({ "audio": inputs, "midi": ports });
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    println!("audio inputs:");
    for device in &inputs {
        println!("  {:<32} {}", device.id, device.label);
    }
    println!("midi ports:");
    for port in &ports {
        println!("  {:<32} {:?} {}", port.id, port.kind, port.name);
    }
    Ok(())
}

struct MonitorOptions {
    frames: u64,
    frame_interval: Duration,
    device: Option<String>,
    json: bool,
}

#[derive(Serialize)]
struct FrameReport<'a> {
    frame: u64,
    level: f32,
    bands: Vec<(Band, f32)>,
    midi: &'a MidiSnapshot,
}

fn run_monitor(config: Option<&Path>, options: &MonitorOptions) -> livesignal_core::Result<()> {
    let config = match config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::live_defaults(),
    };
    let (audio, midi) = backends::create();
    let engine = Orchestrator::with_config(audio, midi, &config);
    monitor(&engine, options, backends::on_frame)
}

fn monitor<A, M>(
    engine: &Orchestrator<A, M>,
    options: &MonitorOptions,
    on_frame: fn(&Orchestrator<A, M>, u64),
) -> livesignal_core::Result<()>
where
    A: CaptureBackend,
    M: MidiBackend,
{
    let _cc = engine.midi().observers().cc_changed.subscribe(|event: &CcEvent| {
        tracing::info!(channel = event.channel, cc = event.cc_number, value = event.value, "cc");
    });
    let _program = engine
        .midi()
        .observers()
        .program_changed
        .subscribe(|program| tracing::info!(program, "program change"));
    let _errors = engine
        .audio()
        .observers()
        .error
        .subscribe(|err| tracing::error!(error = %err, "audio error"));

    let report = block_on(engine.initialize(options.device.as_deref()));
    tracing::info!(audio = report.audio, midi = report.midi, "monitor starting");
    if !engine.is_ready() {
        tracing::warn!("audio is not active; frames will be empty");
    }

    for frame in 0..options.frames {
        on_frame(engine, frame);
        engine.update_audio();

        let audio = engine.audio_data();
        let midi = engine.midi_data();
        if options.json {
            println!("{}", serde_json::to_string(&frame_report(frame, &audio, &midi))?);
        } else {
            tracing::info!(
                frame,
                level = audio.level,
                bass = audio.band(Band::Bass),
                mid = audio.band(Band::Mid),
                treble = audio.band(Band::Treble),
                clock = midi.clock,
                "frame"
            );
        }
        std::thread::sleep(options.frame_interval);
    }

    block_on(engine.destroy());
    tracing::info!(status = ?engine.status(), "monitor finished");
    Ok(())
}

fn frame_report<'a>(frame: u64, audio: &AudioSnapshot, midi: &'a MidiSnapshot) -> FrameReport<'a> {
    FrameReport {
        frame,
        level: audio.level,
        bands: Band::ALL.iter().map(|band| (*band, audio.band(*band))).collect(),
        midi,
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Live audio and MIDI input engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List audio inputs and MIDI ports.
    Devices {
        /// Print the listing as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Run the engine and report every frame.
    Monitor {
        /// Number of frames to run before shutting down.
        #[arg(long, default_value_t = 120)]
        frames: u64,
        /// Frame rate of the polling loop.
        #[arg(long, default_value_t = 30.0)]
        fps: f64,
        /// Preferred audio input id.
        #[arg(short, long)]
        device: Option<String>,
        /// JSON configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Emit one JSON object per frame on stdout.
        #[arg(long)]
        json: bool,
    },
}
