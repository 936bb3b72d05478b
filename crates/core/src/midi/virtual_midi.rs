use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::channel::oneshot;

use super::{
    Detach, MessageHandler, MidiAccess, MidiBackend, OutputConnection, PortDescriptor, PortEvent,
    PortEventHandler, PortKind, PortState,
};
use crate::{LiveSignalError, Result};

/// Message captured by a [`VirtualMidi`] output.
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub port_id: String,
    pub bytes: Vec<u8>,
    pub timestamp: Option<f64>,
}

#[derive(Default)]
struct VirtualState {
    unsupported: bool,
    deny_access: bool,
    ports: Vec<PortDescriptor>,
    listeners: HashMap<u64, (String, MessageHandler)>,
    watchers: HashMap<u64, PortEventHandler>,
    closed_outputs: HashSet<String>,
    sent: Vec<SentMessage>,
    access_requests: Vec<bool>,
    gate: Option<oneshot::Receiver<()>>,
    next_id: u64,
}

impl VirtualState {
    fn port(&self, id: &str, kind: PortKind) -> Option<&PortDescriptor> {
        self.ports.iter().find(|p| p.id == id && p.kind == kind)
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory MIDI platform.
///
/// Ports can be plugged and unplugged at runtime and messages injected on
/// any input. Handlers are always invoked after the internal lock has been
/// released, so they may call straight back into the access object.
#[derive(Clone, Default)]
pub struct VirtualMidi {
    state: Arc<Mutex<VirtualState>>,
}

impl VirtualMidi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(self, id: &str, name: &str) -> Self {
        self.edit(|state| state.ports.push(PortDescriptor::input(id, name)));
        self
    }

    pub fn with_output(self, id: &str, name: &str) -> Self {
        self.edit(|state| state.ports.push(PortDescriptor::output(id, name)));
        self
    }

    /// The platform reports no MIDI capability.
    pub fn unsupported(self) -> Self {
        self.edit(|state| state.unsupported = true);
        self
    }

    pub fn deny_access(self) -> Self {
        self.edit(|state| state.deny_access = true);
        self
    }

    /// The next access request waits until `gate` resolves (or its sender
    /// drops).
    pub fn gate_access(self, gate: oneshot::Receiver<()>) -> Self {
        self.edit(|state| state.gate = Some(gate));
        self
    }

    /// Lifts an earlier [`deny_access`](Self::deny_access).
    pub fn allow_access(&self) {
        self.edit(|state| state.deny_access = false);
    }

    pub fn plug_input(&self, id: &str, name: &str) {
        self.plug(PortDescriptor::input(id, name));
    }

    pub fn plug_output(&self, id: &str, name: &str) {
        self.plug(PortDescriptor::output(id, name));
    }

    /// Removes every port with `id` and reports each as disconnected.
    pub fn unplug(&self, id: &str) {
        let (removed, watchers) = {
            let Ok(mut state) = self.lock() else {
                return;
            };
            let (removed, kept): (Vec<_>, Vec<_>) =
                state.ports.drain(..).partition(|port| port.id == id);
            state.ports = kept;
            state.listeners.retain(|_, (port, _)| port != id);
            (removed, state.watchers.values().cloned().collect::<Vec<_>>())
        };

        for mut port in removed {
            port.state = PortState::Disconnected;
            let event = PortEvent { port };
            for watcher in &watchers {
                watcher(&event);
            }
        }
    }

    /// Delivers `bytes` to every listener attached to input `id`.
    pub fn send_from(&self, id: &str, bytes: &[u8]) {
        let handlers: Vec<MessageHandler> = match self.lock() {
            Ok(state) => state
                .listeners
                .values()
                .filter(|(port, _)| port == id)
                .map(|(_, handler)| handler.clone())
                .collect(),
            Err(_) => return,
        };
        for handler in handlers {
            handler(bytes);
        }
    }

    /// Marks an output as closed without unplugging it.
    pub fn close_output(&self, id: &str) {
        self.edit(|state| {
            state.closed_outputs.insert(id.to_string());
        });
    }

    /// Every message sent to any output, in order.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.lock().map(|s| s.sent.clone()).unwrap_or_default()
    }

    pub fn listener_count(&self) -> usize {
        self.lock().map(|s| s.listeners.len()).unwrap_or(0)
    }

    pub fn watcher_count(&self) -> usize {
        self.lock().map(|s| s.watchers.len()).unwrap_or(0)
    }

    /// The sysex flag of every access request, in order.
    pub fn access_requests(&self) -> Vec<bool> {
        self.lock()
            .map(|s| s.access_requests.clone())
            .unwrap_or_default()
    }

    fn plug(&self, port: PortDescriptor) {
        let watchers: Vec<PortEventHandler> = match self.lock() {
            Ok(mut state) => {
                state.closed_outputs.remove(&port.id);
                state.ports.push(port.clone());
                state.watchers.values().cloned().collect()
            }
            Err(_) => return,
        };
        let event = PortEvent { port };
        for watcher in watchers {
            watcher(&event);
        }
    }

    fn edit(&self, apply: impl FnOnce(&mut VirtualState)) {
        if let Ok(mut state) = self.state.lock() {
            apply(&mut state);
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, VirtualState>> {
        lock(&self.state)
    }
}

impl std::fmt::Debug for VirtualMidi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualMidi")
            .field("listeners", &self.listener_count())
            .field("watchers", &self.watcher_count())
            .finish()
    }
}

fn lock(state: &Mutex<VirtualState>) -> Result<MutexGuard<'_, VirtualState>> {
    state
        .lock()
        .map_err(|_| LiveSignalError::Poisoned("virtual midi state"))
}

#[async_trait]
impl MidiBackend for VirtualMidi {
    fn is_supported(&self) -> bool {
        self.lock().map(|s| !s.unsupported).unwrap_or(false)
    }

    async fn request_access(&self, sysex: bool) -> Result<Box<dyn MidiAccess>> {
        let gate = {
            let mut state = self.lock()?;
            state.access_requests.push(sysex);
            state.gate.take()
        };
        if let Some(gate) = gate {
            let _ = gate.await;
        }

        let state = self.lock()?;
        if state.unsupported {
            return Err(LiveSignalError::UnsupportedPlatform("MIDI".into()));
        }
        if state.deny_access {
            return Err(LiveSignalError::PermissionDenied("MIDI access refused".into()));
        }
        Ok(Box::new(VirtualAccess {
            state: self.state.clone(),
        }))
    }
}

struct VirtualAccess {
    state: Arc<Mutex<VirtualState>>,
}

impl VirtualAccess {
    fn ports(&self, kind: PortKind) -> Vec<PortDescriptor> {
        lock(&self.state)
            .map(|state| {
                state
                    .ports
                    .iter()
                    .filter(|port| port.kind == kind)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl MidiAccess for VirtualAccess {
    fn inputs(&self) -> Vec<PortDescriptor> {
        self.ports(PortKind::Input)
    }

    fn outputs(&self) -> Vec<PortDescriptor> {
        self.ports(PortKind::Output)
    }

    fn open_input(&mut self, id: &str, handler: MessageHandler) -> Result<Box<dyn Detach>> {
        let mut state = lock(&self.state)?;
        if state.port(id, PortKind::Input).is_none() {
            return Err(LiveSignalError::DeviceNotFound(id.to_string()));
        }
        let key = state.next_id();
        state.listeners.insert(key, (id.to_string(), handler));
        Ok(Box::new(VirtualAttachment {
            state: self.state.clone(),
            key,
            kind: Attachment::Listener,
            attached: true,
        }))
    }

    fn open_output(&mut self, id: &str) -> Result<Box<dyn OutputConnection>> {
        let state = lock(&self.state)?;
        if state.port(id, PortKind::Output).is_none() {
            return Err(LiveSignalError::DeviceNotFound(id.to_string()));
        }
        Ok(Box::new(VirtualOutput {
            state: self.state.clone(),
            port_id: id.to_string(),
        }))
    }

    fn watch(&mut self, handler: PortEventHandler) -> Result<Box<dyn Detach>> {
        let mut state = lock(&self.state)?;
        let key = state.next_id();
        state.watchers.insert(key, handler);
        Ok(Box::new(VirtualAttachment {
            state: self.state.clone(),
            key,
            kind: Attachment::Watcher,
            attached: true,
        }))
    }
}

enum Attachment {
    Listener,
    Watcher,
}

struct VirtualAttachment {
    state: Arc<Mutex<VirtualState>>,
    key: u64,
    kind: Attachment,
    attached: bool,
}

impl Detach for VirtualAttachment {
    fn detach(&mut self) {
        if !std::mem::take(&mut self.attached) {
            return;
        }
        if let Ok(mut state) = lock(&self.state) {
            match self.kind {
                Attachment::Listener => {
                    state.listeners.remove(&self.key);
                }
                Attachment::Watcher => {
                    state.watchers.remove(&self.key);
                }
            }
        }
    }
}

impl Drop for VirtualAttachment {
    fn drop(&mut self) {
        self.detach();
    }
}

struct VirtualOutput {
    state: Arc<Mutex<VirtualState>>,
    port_id: String,
}

impl OutputConnection for VirtualOutput {
    fn is_open(&self) -> bool {
        lock(&self.state)
            .map(|state| {
                state.port(&self.port_id, PortKind::Output).is_some()
                    && !state.closed_outputs.contains(&self.port_id)
            })
            .unwrap_or(false)
    }

    fn send(&mut self, bytes: &[u8], timestamp: Option<f64>) -> Result<()> {
        let mut state = lock(&self.state)?;
        if state.port(&self.port_id, PortKind::Output).is_none() {
            return Err(LiveSignalError::DeviceNotFound(self.port_id.clone()));
        }
        state.sent.push(SentMessage {
            port_id: self.port_id.clone(),
            bytes: bytes.to_vec(),
            timestamp,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn detached_listeners_stop_receiving() {
        let midi = VirtualMidi::new().with_input("in", "Pads");
        let mut access = block_on(midi.request_access(false)).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let sink = hits.clone();
        let mut listener = access
            .open_input(
                "in",
                Arc::new(move |_: &[u8]| {
                    sink.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        midi.send_from("in", &[0xB0, 1, 2]);
        listener.detach();
        listener.detach();
        midi.send_from("in", &[0xB0, 1, 2]);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(midi.listener_count(), 0);
    }

    #[test]
    fn unknown_ports_are_rejected() {
        let midi = VirtualMidi::new().with_output("out", "Synth");
        let mut access = block_on(midi.request_access(true)).unwrap();
        assert!(access.open_input("out", Arc::new(|_: &[u8]| {})).is_err());
        assert!(access.open_output("nope").is_err());
        assert_eq!(midi.access_requests(), vec![true]);
    }
}
