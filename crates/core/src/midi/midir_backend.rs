use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use async_trait::async_trait;
use midir::{Ignore, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use tracing::{debug, trace, warn};

use super::{
    Detach, MessageHandler, MidiAccess, MidiBackend, OutputConnection, PortDescriptor, PortEvent,
    PortEventHandler, PortKind, PortState,
};
use crate::{LiveSignalError, Result};

const CLIENT_NAME: &str = "livesignal";
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Hardware MIDI through midir.
///
/// Ports are identified by their platform name. midir has no hot-plug
/// notifications, so [`MidiAccess::watch`] runs a thread that polls the
/// port set and reports differences.
#[derive(Debug, Clone, Default)]
pub struct MidirBackend;

impl MidirBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MidiBackend for MidirBackend {
    fn is_supported(&self) -> bool {
        MidiInput::new(CLIENT_NAME).is_ok()
    }

    async fn request_access(&self, sysex: bool) -> Result<Box<dyn MidiAccess>> {
        // Open both directions so an unusable platform fails here.
        MidiInput::new(CLIENT_NAME)?;
        MidiOutput::new(CLIENT_NAME)?;
        Ok(Box::new(MidirAccess { sysex }))
    }
}

struct MidirAccess {
    sysex: bool,
}

fn list_ports(kind: PortKind) -> Vec<PortDescriptor> {
    let names: Vec<String> = match kind {
        PortKind::Input => match MidiInput::new(CLIENT_NAME) {
            Ok(client) => client
                .ports()
                .iter()
                .filter_map(|port| client.port_name(port).ok())
                .collect(),
            Err(err) => {
                warn!(error = %err, "failed to list MIDI inputs");
                Vec::new()
            }
        },
        PortKind::Output => match MidiOutput::new(CLIENT_NAME) {
            Ok(client) => client
                .ports()
                .iter()
                .filter_map(|port| client.port_name(port).ok())
                .collect(),
            Err(err) => {
                warn!(error = %err, "failed to list MIDI outputs");
                Vec::new()
            }
        },
    };

    names
        .into_iter()
        .map(|name| match kind {
            PortKind::Input => PortDescriptor::input(name.clone(), name),
            PortKind::Output => PortDescriptor::output(name.clone(), name),
        })
        .collect()
}

impl MidiAccess for MidirAccess {
    fn inputs(&self) -> Vec<PortDescriptor> {
        list_ports(PortKind::Input)
    }

    fn outputs(&self) -> Vec<PortDescriptor> {
        list_ports(PortKind::Output)
    }

    fn open_input(&mut self, id: &str, handler: MessageHandler) -> Result<Box<dyn Detach>> {
        let mut client = MidiInput::new(CLIENT_NAME)?;
        client.ignore(if self.sysex {
            Ignore::None
        } else {
            Ignore::Sysex
        });

        let port = client
            .ports()
            .into_iter()
            .find(|port| client.port_name(port).map(|n| n == id).unwrap_or(false))
            .ok_or_else(|| LiveSignalError::DeviceNotFound(id.to_string()))?;

        let connection = client.connect(
            &port,
            "livesignal-input",
            move |_stamp, message, _| handler(message),
            (),
        )?;
        debug!(port = id, "midi input connected");

        Ok(Box::new(MidirInput {
            connection: Some(connection),
        }))
    }

    fn open_output(&mut self, id: &str) -> Result<Box<dyn OutputConnection>> {
        let client = MidiOutput::new(CLIENT_NAME)?;
        let port = client
            .ports()
            .into_iter()
            .find(|port| client.port_name(port).map(|n| n == id).unwrap_or(false))
            .ok_or_else(|| LiveSignalError::DeviceNotFound(id.to_string()))?;

        let connection = client.connect(&port, "livesignal-output")?;
        debug!(port = id, "midi output connected");

        Ok(Box::new(MidirOutput {
            connection: Some(connection),
        }))
    }

    fn watch(&mut self, handler: PortEventHandler) -> Result<Box<dyn Detach>> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let worker = thread::Builder::new()
            .name("livesignal-midi-watch".to_string())
            .spawn(move || poll_ports(handler, stop_rx))?;

        Ok(Box::new(PortWatcher {
            stop: Some(stop_tx),
            worker: Some(worker),
        }))
    }
}

fn port_set() -> HashMap<(PortKind, String), PortDescriptor> {
    list_ports(PortKind::Input)
        .into_iter()
        .chain(list_ports(PortKind::Output))
        .map(|port| ((port.kind, port.id.clone()), port))
        .collect()
}

fn poll_ports(handler: PortEventHandler, stop: mpsc::Receiver<()>) {
    let mut known = port_set();

    loop {
        match stop.recv_timeout(POLL_INTERVAL) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }

        let current = port_set();
        for (key, port) in &current {
            if !known.contains_key(key) {
                handler(&PortEvent { port: port.clone() });
            }
        }
        for (key, port) in &known {
            if !current.contains_key(key) {
                let mut port = port.clone();
                port.state = PortState::Disconnected;
                handler(&PortEvent { port });
            }
        }
        known = current;
    }
    trace!("midi port watcher exited");
}

struct PortWatcher {
    stop: Option<mpsc::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl Detach for PortWatcher {
    fn detach(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("midi port watcher panicked");
            }
        }
    }
}

impl Drop for PortWatcher {
    fn drop(&mut self) {
        self.detach();
    }
}

struct MidirInput {
    connection: Option<MidiInputConnection<()>>,
}

impl Detach for MidirInput {
    fn detach(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
    }
}

struct MidirOutput {
    connection: Option<MidiOutputConnection>,
}

impl OutputConnection for MidirOutput {
    fn is_open(&self) -> bool {
        self.connection.is_some()
    }

    fn send(&mut self, bytes: &[u8], timestamp: Option<f64>) -> Result<()> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| LiveSignalError::msg("midi output is closed"))?;
        if timestamp.is_some() {
            trace!("midir sends immediately; timestamp ignored");
        }
        connection.send(bytes)?;
        Ok(())
    }
}
