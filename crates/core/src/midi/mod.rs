//! MIDI device lifecycle, channel-filtered CC routing and learn mode.

mod backend;
mod filter;
mod learn;
mod message;
#[cfg(feature = "midir")]
mod midir_backend;
mod virtual_midi;

pub use backend::{
    Detach, MessageHandler, MidiAccess, MidiBackend, OutputConnection, PortDescriptor, PortEvent,
    PortEventHandler, PortKind, PortState,
};
pub use filter::{ChannelFilter, ClockPolicy};
pub use learn::{CcAssignment, CcKey, LearnState, MidiLearnEngine, ParameterRange};
pub use message::MidiMessage;
#[cfg(feature = "midir")]
pub use midir_backend::MidirBackend;
pub use virtual_midi::{SentMessage, VirtualMidi};

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::{ErrorKind, LiveSignalError, MidiConfig, Observers, Result};
use message::TIMING_CLOCK;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MidiState {
    Idle,
    Requesting,
    Active,
    /// The platform has no MIDI. Terminal.
    Unsupported,
    Error,
}

/// A port as reported to observers, rebuilt from the live port set on every
/// query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MidiDeviceRecord {
    pub id: String,
    pub name: String,
    pub manufacturer: String,
    pub state: PortState,
    #[serde(rename = "type")]
    pub kind: PortKind,
}

impl From<PortDescriptor> for MidiDeviceRecord {
    fn from(port: PortDescriptor) -> Self {
        Self {
            id: port.id,
            name: port.name,
            manufacturer: port.manufacturer,
            state: port.state,
            kind: port.kind,
        }
    }
}

/// Decoded MIDI state, replaced as a whole on every change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MidiSnapshot {
    /// Last normalised value per `channel:cc`.
    pub cc: BTreeMap<CcKey, f32>,
    pub program_change: Option<u8>,
    /// Timing Clock messages since the source was (re)initialised.
    pub clock: u64,
}

impl MidiSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn cc_value(&self, channel: u8, cc_number: u8) -> f32 {
        self.cc
            .get(&CcKey::new(channel, cc_number))
            .copied()
            .unwrap_or(0.0)
    }
}

/// Static scale-to-range binding for one control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CcMapping {
    pub channel: u8,
    pub cc_number: u8,
    pub parameter_path: String,
    pub min: f32,
    pub max: f32,
    pub current_value: f32,
}

impl CcMapping {
    pub fn new(
        channel: u8,
        cc_number: u8,
        parameter_path: impl Into<String>,
        min: f32,
        max: f32,
    ) -> Self {
        Self {
            channel,
            cc_number,
            parameter_path: parameter_path.into(),
            min,
            max,
            current_value: min,
        }
    }

    pub fn key(&self) -> CcKey {
        CcKey::new(self.channel, self.cc_number)
    }
}

/// A routed Control Change. `value` is already scaled to the target range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CcEvent {
    pub channel: u8,
    pub cc_number: u8,
    pub raw: u8,
    pub value: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterChange {
    pub parameter: String,
    pub value: f32,
}

/// Outward callbacks raised by [`MidiSource`].
#[derive(Debug, Default)]
pub struct MidiObservers {
    pub state_changed: Observers<MidiState>,
    pub devices_changed: Observers<Vec<MidiDeviceRecord>>,
    pub cc_changed: Observers<CcEvent>,
    pub program_changed: Observers<u8>,
    pub parameter_changed: Observers<ParameterChange>,
    pub learn_completed: Observers<CcAssignment>,
    pub learn_state_changed: Observers<LearnState>,
    pub error: Observers<LiveSignalError>,
}

#[derive(Debug, Default)]
struct Routing {
    filter: ChannelFilter,
    clock_policy: ClockPolicy,
    learn: MidiLearnEngine,
    mappings: BTreeMap<CcKey, CcMapping>,
}

impl Routing {
    fn admits(&self, message: &MidiMessage) -> bool {
        match message {
            MidiMessage::Clock => match self.clock_policy {
                ClockPolicy::BypassFilter => true,
                ClockPolicy::FollowFilter => self.filter.accepts(TIMING_CLOCK & 0x0F),
            },
            other => other
                .channel()
                .map(|channel| self.filter.accepts(channel))
                .unwrap_or(true),
        }
    }
}

/// Notifications collected under the routing lock and raised after it.
#[derive(Default)]
struct Effects {
    learned: Option<CcAssignment>,
    cc: Option<CcEvent>,
    parameter: Option<ParameterChange>,
    program: Option<u8>,
}

impl Effects {
    fn dispatch(self, observers: &MidiObservers) {
        if let Some(assignment) = self.learned {
            observers.learn_completed.notify(&assignment);
            observers.learn_state_changed.notify(&LearnState::Idle);
        }
        if let Some(event) = self.cc {
            observers.cc_changed.notify(&event);
        }
        if let Some(change) = self.parameter {
            observers.parameter_changed.notify(&change);
        }
        if let Some(program) = self.program {
            observers.program_changed.notify(&program);
        }
    }
}

/// Live connections, keyed by port id. Ports are looked up by id on every
/// event, never held across one.
struct MidiSession {
    access: Box<dyn MidiAccess>,
    inputs: HashMap<String, Box<dyn Detach>>,
    outputs: HashMap<String, Box<dyn OutputConnection>>,
    watcher: Option<Box<dyn Detach>>,
}

impl MidiSession {
    fn attach(&mut self, core: &Arc<MidiCore>, port: &PortDescriptor, generation: u64) {
        let result = match port.kind {
            PortKind::Input if !self.inputs.contains_key(&port.id) => self
                .access
                .open_input(&port.id, message_handler(core, generation))
                .map(|listener| {
                    self.inputs.insert(port.id.clone(), listener);
                }),
            PortKind::Output if !self.outputs.contains_key(&port.id) => {
                self.access.open_output(&port.id).map(|output| {
                    self.outputs.insert(port.id.clone(), output);
                })
            }
            _ => Ok(()),
        };
        if let Err(err) = result {
            warn!(port = %port.id, error = %err, "failed to attach midi port");
        }
    }

    fn remove(&mut self, port: &PortDescriptor) -> Removed {
        match port.kind {
            PortKind::Input => Removed {
                input: self.inputs.remove(&port.id),
                output: None,
            },
            PortKind::Output => Removed {
                input: None,
                output: self.outputs.remove(&port.id),
            },
        }
    }

    fn devices(&self) -> Vec<MidiDeviceRecord> {
        self.access
            .inputs()
            .into_iter()
            .chain(self.access.outputs())
            .map(MidiDeviceRecord::from)
            .collect()
    }

    fn close(mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            watcher.detach();
        }
        for (_, mut listener) in self.inputs.drain() {
            listener.detach();
        }
        self.outputs.clear();
    }
}

#[derive(Default)]
struct Removed {
    input: Option<Box<dyn Detach>>,
    output: Option<Box<dyn OutputConnection>>,
}

impl Removed {
    fn release(self) {
        if let Some(mut listener) = self.input {
            listener.detach();
        }
        drop(self.output);
    }
}

/// State shared with backend callbacks, which hold it weakly.
struct MidiCore {
    state: Mutex<MidiState>,
    routing: Mutex<Routing>,
    session: Mutex<Option<MidiSession>>,
    snapshot: ArcSwap<MidiSnapshot>,
    generation: AtomicU64,
    observers: MidiObservers,
}

fn message_handler(core: &Arc<MidiCore>, generation: u64) -> MessageHandler {
    let core = Arc::downgrade(core);
    Arc::new(move |bytes: &[u8]| {
        if let Some(core) = core.upgrade() {
            core.handle_message(Some(generation), bytes);
        }
    })
}

fn port_event_handler(core: &Arc<MidiCore>, generation: u64) -> PortEventHandler {
    let core = Arc::downgrade(core);
    Arc::new(move |event: &PortEvent| {
        if let Some(core) = core.upgrade() {
            MidiCore::handle_port_event(&core, generation, event);
        }
    })
}

impl MidiCore {
    fn handle_message(&self, generation: Option<u64>, bytes: &[u8]) {
        let Some(message) = MidiMessage::from_bytes(bytes) else {
            trace!(len = bytes.len(), "ignoring undecodable midi payload");
            return;
        };

        let effects = {
            let Ok(mut routing) = self.routing() else {
                return;
            };
            if generation.is_some_and(|generation| !self.is_current(generation)) {
                return;
            }
            if !routing.admits(&message) {
                trace!(?message, filter = %routing.filter, "midi message filtered");
                return;
            }

            match message {
                MidiMessage::ControlChange {
                    channel,
                    controller,
                    value,
                } => self.control_change(&mut routing, channel, controller, value),
                MidiMessage::ProgramChange { program, .. } => {
                    self.edit_snapshot(|snapshot| snapshot.program_change = Some(program));
                    Effects {
                        program: Some(program),
                        ..Effects::default()
                    }
                }
                MidiMessage::Clock => {
                    self.edit_snapshot(|snapshot| snapshot.clock += 1);
                    Effects::default()
                }
                other => {
                    trace!(message = ?other, "midi message decoded");
                    Effects::default()
                }
            }
        };

        effects.dispatch(&self.observers);
    }

    fn control_change(&self, routing: &mut Routing, channel: u8, controller: u8, value: u8) -> Effects {
        let key = CcKey::new(channel, controller);
        let value = value.min(127);
        let normalized = value as f32 / 127.0;

        // The learned control's first value still flows through routing.
        let learned = routing.learn.capture(channel, controller);
        if let Some(assignment) = &learned {
            info!(parameter = %assignment.parameter_name, %key, "midi learn completed");
        }

        self.edit_snapshot(|snapshot| {
            snapshot.cc.insert(key, normalized);
        });

        let routed = if let Some(assignment) = routing.learn.get_assignment(key) {
            Some((
                assignment.parameter_name.clone(),
                MidiLearnEngine::map_midi_value(value, assignment.min, assignment.max),
            ))
        } else if let Some(mapping) = routing.mappings.get_mut(&key) {
            mapping.current_value = mapping.min + normalized * (mapping.max - mapping.min);
            Some((mapping.parameter_path.clone(), mapping.current_value))
        } else {
            None
        };

        let mut effects = Effects {
            learned,
            ..Effects::default()
        };
        if let Some((parameter, scaled)) = routed {
            effects.cc = Some(CcEvent {
                channel,
                cc_number: controller,
                raw: value,
                value: scaled,
            });
            effects.parameter = Some(ParameterChange {
                parameter,
                value: scaled,
            });
        }
        effects
    }

    fn handle_port_event(core: &Arc<Self>, generation: u64, event: &PortEvent) {
        let removed = {
            let Ok(mut slot) = core.session() else {
                return;
            };
            if !core.is_current(generation) {
                return;
            }
            let Some(session) = slot.as_mut() else {
                return;
            };
            match event.state() {
                PortState::Connected => {
                    session.attach(core, &event.port, generation);
                    Removed::default()
                }
                PortState::Disconnected => session.remove(&event.port),
            }
        };
        removed.release();

        info!(
            port = %event.port.id,
            kind = ?event.port.kind,
            state = ?event.state(),
            "midi port changed"
        );
        core.observers.devices_changed.notify(&core.devices());
    }

    fn devices(&self) -> Vec<MidiDeviceRecord> {
        match self.session() {
            Ok(slot) => slot.as_ref().map(MidiSession::devices).unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    /// Callers hold the routing lock, which serialises snapshot writers.
    fn edit_snapshot(&self, edit: impl FnOnce(&mut MidiSnapshot)) {
        let mut next = MidiSnapshot::clone(&self.snapshot.load());
        edit(&mut next);
        self.snapshot.store(Arc::new(next));
    }

    /// Starts a fresh snapshot. Holding the routing lock keeps a message in
    /// flight from writing the old values back.
    fn reset_snapshot(&self) -> Result<()> {
        let _routing = self.routing()?;
        self.snapshot.store(Arc::new(MidiSnapshot::empty()));
        Ok(())
    }

    /// Returns the previous state.
    fn set_state(&self, state: MidiState) -> MidiState {
        match self.state.lock() {
            Ok(mut current) => std::mem::replace(&mut *current, state),
            Err(_) => MidiState::Error,
        }
    }

    fn state(&self) -> MidiState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(MidiState::Error)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn routing(&self) -> Result<MutexGuard<'_, Routing>> {
        self.routing
            .lock()
            .map_err(|_| LiveSignalError::Poisoned("midi routing"))
    }

    fn session(&self) -> Result<MutexGuard<'_, Option<MidiSession>>> {
        self.session
            .lock()
            .map_err(|_| LiveSignalError::Poisoned("midi session"))
    }
}

/// Owns the MIDI access session, its ports and the decoded snapshot.
///
/// Incoming messages and hot-plug events arrive on backend threads. They are
/// routed through a shared core that the callbacks hold weakly, so dropping
/// the source silences them. Every method takes `&self`.
pub struct MidiSource<B> {
    backend: B,
    core: Arc<MidiCore>,
}

impl<B: MidiBackend> MidiSource<B> {
    /// Creates an idle source with the default routing.
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, &MidiConfig::default())
    }

    /// Creates an idle source whose channel filter and clock policy come
    /// from `config`. An out-of-range channel falls back to `All`.
    pub fn with_config(backend: B, config: &MidiConfig) -> Self {
        let filter = match config.channel_filter.validate() {
            Ok(()) => config.channel_filter,
            Err(err) => {
                warn!(error = %err, "ignoring configured channel filter");
                ChannelFilter::All
            }
        };
        let routing = Routing {
            filter,
            clock_policy: config.clock_policy,
            ..Routing::default()
        };
        Self {
            backend,
            core: Arc::new(MidiCore {
                state: Mutex::new(MidiState::Idle),
                routing: Mutex::new(routing),
                session: Mutex::new(None),
                snapshot: ArcSwap::from_pointee(MidiSnapshot::empty()),
                generation: AtomicU64::new(0),
                observers: MidiObservers::default(),
            }),
        }
    }

    /// Returns the platform backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Returns the observer lists for subscription.
    pub fn observers(&self) -> &MidiObservers {
        &self.core.observers
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> MidiState {
        self.core.state()
    }

    /// Whether a MIDI session is open.
    pub fn is_active(&self) -> bool {
        self.state() == MidiState::Active
    }

    /// Latest snapshot. Writers replace it wholesale.
    pub fn data(&self) -> Arc<MidiSnapshot> {
        self.core.snapshot.load_full()
    }

    /// Last normalised value for `channel:cc_number`, or 0.
    pub fn cc_value(&self, channel: u8, cc_number: u8) -> f32 {
        self.core.snapshot.load().cc_value(channel, cc_number)
    }

    /// Inputs and outputs currently present, read from the platform.
    pub fn devices(&self) -> Vec<MidiDeviceRecord> {
        self.core.devices()
    }

    /// Connected input ports only.
    pub fn inputs(&self) -> Vec<MidiDeviceRecord> {
        self.devices_of(PortKind::Input)
    }

    /// Connected output ports only.
    pub fn outputs(&self) -> Vec<MidiDeviceRecord> {
        self.devices_of(PortKind::Output)
    }

    fn devices_of(&self, kind: PortKind) -> Vec<MidiDeviceRecord> {
        self.devices()
            .into_iter()
            .filter(|device| device.kind == kind)
            .collect()
    }

    /// Requests MIDI access, attaches every present port and starts watching
    /// for hot-plug. An already active session is stopped first.
    pub async fn initialize(&self, sysex_enabled: bool) -> bool {
        if !self.backend.is_supported() {
            self.mark_unsupported();
            return false;
        }
        if matches!(self.state(), MidiState::Active | MidiState::Requesting) {
            self.stop();
        }

        let generation = self.core.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.core.set_state(MidiState::Requesting);
        self.core
            .observers
            .state_changed
            .notify(&MidiState::Requesting);

        match self.connect(sysex_enabled, generation).await {
            Ok(()) => true,
            Err(LiveSignalError::Abandoned) => {
                debug!("midi initialization abandoned after stop");
                false
            }
            Err(err) if err.kind() == ErrorKind::UnsupportedPlatform => {
                if self.core.is_current(generation) {
                    self.mark_unsupported();
                }
                false
            }
            Err(err) => {
                self.fail(generation, err);
                false
            }
        }
    }

    /// Detaches every port, clears the snapshot and static mappings and
    /// returns to `Idle`. Learned assignments survive. Safe to call at any
    /// time.
    pub fn stop(&self) {
        self.core.generation.fetch_add(1, Ordering::SeqCst);

        let session = self.core.session().ok().and_then(|mut slot| slot.take());
        if let Some(session) = session {
            session.close();
        }

        if let Ok(mut routing) = self.core.routing() {
            routing.mappings.clear();
        }
        if let Err(err) = self.core.reset_snapshot() {
            warn!(error = %err, "failed to clear midi snapshot");
        }

        if self.state() == MidiState::Unsupported {
            return;
        }
        if self.core.set_state(MidiState::Idle) != MidiState::Idle {
            info!("midi source stopped");
            self.core.observers.state_changed.notify(&MidiState::Idle);
        }
    }

    /// Routes one raw message exactly as if it had arrived on an input.
    pub fn handle_midi_message(&self, bytes: &[u8]) {
        self.core.handle_message(None, bytes);
    }

    /// Returns the active channel filter.
    pub fn channel_filter(&self) -> ChannelFilter {
        self.core
            .routing()
            .map(|routing| routing.filter)
            .unwrap_or_default()
    }

    /// Replaces the channel filter. A channel outside `0..=15` is rejected
    /// and the previous filter stays in place.
    pub fn set_channel_filter(&self, filter: ChannelFilter) -> Result<()> {
        filter.validate()?;
        self.core.routing()?.filter = filter;
        debug!(%filter, "midi channel filter set");
        Ok(())
    }

    /// Returns whether clock ticks follow the channel filter.
    pub fn clock_policy(&self) -> ClockPolicy {
        self.core
            .routing()
            .map(|routing| routing.clock_policy)
            .unwrap_or_default()
    }

    /// Replaces the clock policy.
    pub fn set_clock_policy(&self, policy: ClockPolicy) {
        if let Ok(mut routing) = self.core.routing() {
            routing.clock_policy = policy;
        }
    }

    /// Inserts or replaces the mapping for its `channel:cc` key.
    pub fn set_cc_mapping(&self, mapping: CcMapping) {
        if let Ok(mut routing) = self.core.routing() {
            routing.mappings.insert(mapping.key(), mapping);
        }
    }

    /// Removes and returns the static mapping for `channel:cc_number`.
    pub fn remove_cc_mapping(&self, channel: u8, cc_number: u8) -> Option<CcMapping> {
        self.core
            .routing()
            .ok()?
            .mappings
            .remove(&CcKey::new(channel, cc_number))
    }

    /// Static mappings ordered by key.
    pub fn cc_mappings(&self) -> Vec<CcMapping> {
        self.core
            .routing()
            .map(|routing| routing.mappings.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Removes every static mapping.
    pub fn clear_cc_mappings(&self) {
        if let Ok(mut routing) = self.core.routing() {
            routing.mappings.clear();
        }
    }

    /// Arms learn mode for `parameter`, replacing any earlier arm.
    pub fn start_learning(&self, parameter: &str) {
        let Ok(mut routing) = self.core.routing() else {
            return;
        };
        routing.learn.start_learning(parameter);
        let state = routing.learn.state().clone();
        drop(routing);
        self.core.observers.learn_state_changed.notify(&state);
    }

    /// Disarms learn mode without creating an assignment.
    pub fn cancel_learning(&self) {
        let cancelled = self
            .core
            .routing()
            .map(|mut routing| routing.learn.cancel_learning())
            .unwrap_or(false);
        if cancelled {
            self.core
                .observers
                .learn_state_changed
                .notify(&LearnState::Idle);
        }
    }

    /// Returns the learn state.
    pub fn learning(&self) -> LearnState {
        self.core
            .routing()
            .map(|routing| routing.learn.state().clone())
            .unwrap_or_default()
    }

    /// Learned assignments sorted by parameter name.
    pub fn assignments(&self) -> Vec<CcAssignment> {
        self.core
            .routing()
            .map(|routing| routing.learn.assignments())
            .unwrap_or_default()
    }

    /// Drops the learned assignment for `parameter`.
    pub fn remove_assignment(&self, parameter: &str) -> Option<CcAssignment> {
        self.core.routing().ok()?.learn.remove_assignment(parameter)
    }

    /// Output range used the next time `parameter` is learned.
    pub fn set_parameter_range(&self, parameter: &str, min: f32, max: f32) {
        if let Ok(mut routing) = self.core.routing() {
            routing.learn.set_parameter_range(parameter, min, max);
        }
    }

    /// Sends raw bytes to output `device_id`. Data bytes are masked to 7
    /// bits. Fails unless the output exists and is open.
    pub fn send_message(&self, device_id: &str, bytes: &[u8], timestamp: Option<f64>) -> bool {
        match self.try_send(device_id, bytes, timestamp) {
            Ok(()) => true,
            Err(err) => {
                warn!(device = device_id, error = %err, "midi send failed");
                false
            }
        }
    }

    /// Sends a Control Change built from `channel`, `cc_number` and `value`.
    pub fn send_cc(&self, device_id: &str, channel: u8, cc_number: u8, value: u8) -> bool {
        let message = MidiMessage::ControlChange {
            channel,
            controller: cc_number,
            value,
        };
        self.send_message(device_id, &message.to_bytes(), None)
    }

    /// Sends a Program Change on `channel`.
    pub fn send_program_change(&self, device_id: &str, channel: u8, program: u8) -> bool {
        let message = MidiMessage::ProgramChange { channel, program };
        self.send_message(device_id, &message.to_bytes(), None)
    }

    fn try_send(&self, device_id: &str, bytes: &[u8], timestamp: Option<f64>) -> Result<()> {
        let (status, data) = bytes
            .split_first()
            .ok_or(LiveSignalError::InvalidInput("empty midi message"))?;
        let masked: Vec<u8> = std::iter::once(*status)
            .chain(data.iter().map(|byte| byte & 0x7F))
            .collect();

        let mut slot = self.core.session()?;
        let output = slot
            .as_mut()
            .and_then(|session| session.outputs.get_mut(device_id))
            .ok_or_else(|| LiveSignalError::DeviceNotFound(device_id.to_string()))?;
        if !output.is_open() {
            return Err(LiveSignalError::msg(format!("output {device_id} is not open")));
        }
        output.send(&masked, timestamp)
    }

    async fn connect(&self, sysex_enabled: bool, generation: u64) -> Result<()> {
        let mut access = self.backend.request_access(sysex_enabled).await?;
        if !self.core.is_current(generation) {
            return Err(LiveSignalError::Abandoned);
        }
        self.core.reset_snapshot()?;

        let watcher = access.watch(port_event_handler(&self.core, generation))?;
        let mut session = MidiSession {
            access,
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            watcher: Some(watcher),
        };
        let ports: Vec<PortDescriptor> = session
            .access
            .inputs()
            .into_iter()
            .chain(session.access.outputs())
            .collect();
        for port in &ports {
            session.attach(&self.core, port, generation);
        }

        let orphan = {
            let mut slot = self.core.session()?;
            if self.core.is_current(generation) {
                *slot = Some(session);
                self.core.set_state(MidiState::Active);
                None
            } else {
                Some(session)
            }
        };
        if let Some(session) = orphan {
            session.close();
            return Err(LiveSignalError::Abandoned);
        }

        info!(
            ports = ports.len(),
            sysex = sysex_enabled,
            "midi source active"
        );
        self.core.observers.state_changed.notify(&MidiState::Active);
        self.core
            .observers
            .devices_changed
            .notify(&self.core.devices());
        Ok(())
    }

    fn mark_unsupported(&self) {
        if self.core.set_state(MidiState::Unsupported) == MidiState::Unsupported {
            return;
        }
        let err = LiveSignalError::UnsupportedPlatform("MIDI".into());
        warn!(error = %err, "midi unavailable");
        self.core.observers.error.notify(&err);
        self.core
            .observers
            .state_changed
            .notify(&MidiState::Unsupported);
    }

    fn fail(&self, generation: u64, err: LiveSignalError) {
        if !self.core.is_current(generation) {
            debug!(error = %err, "ignoring failure of superseded midi initialization");
            return;
        }
        self.core.set_state(MidiState::Error);
        warn!(error = %err, "midi initialization failed");
        self.core.observers.error.notify(&err);
        self.core.observers.state_changed.notify(&MidiState::Error);
    }
}

impl<B> std::fmt::Debug for MidiSource<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MidiSource")
            .field("generation", &self.core.generation.load(Ordering::Relaxed))
            .finish()
    }
}
