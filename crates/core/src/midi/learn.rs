use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::LiveSignalError;

/// Composite `channel:cc` routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CcKey {
    pub channel: u8,
    pub cc_number: u8,
}

impl CcKey {
    pub fn new(channel: u8, cc_number: u8) -> Self {
        Self { channel, cc_number }
    }
}

impl fmt::Display for CcKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel, self.cc_number)
    }
}

impl FromStr for CcKey {
    type Err = LiveSignalError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (channel, cc) = value
            .split_once(':')
            .ok_or(LiveSignalError::InvalidInput("cc key must be channel:cc"))?;
        let channel = channel
            .parse()
            .map_err(|_| LiveSignalError::InvalidInput("cc key channel is not a number"))?;
        let cc_number = cc
            .parse()
            .map_err(|_| LiveSignalError::InvalidInput("cc key controller is not a number"))?;
        Ok(Self { channel, cc_number })
    }
}

impl TryFrom<String> for CcKey {
    type Error = LiveSignalError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CcKey> for String {
    fn from(value: CcKey) -> Self {
        value.to_string()
    }
}

/// Binding created by learn mode, owned by its parameter name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CcAssignment {
    pub parameter_name: String,
    pub channel: u8,
    pub cc_number: u8,
    pub min: f32,
    pub max: f32,
}

impl CcAssignment {
    pub fn key(&self) -> CcKey {
        CcKey::new(self.channel, self.cc_number)
    }
}

/// Output range for a learnable parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterRange {
    pub min: f32,
    pub max: f32,
}

impl Default for ParameterRange {
    fn default() -> Self {
        Self { min: 0.0, max: 1.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "parameter", rename_all = "lowercase")]
pub enum LearnState {
    #[default]
    Idle,
    Learning(String),
}

/// Interactive CC-to-parameter binding.
///
/// Assignments are owned by parameter name; `by_key` is derived from them
/// and maintained on every insert and removal. A key routes to at most one
/// parameter: learning a control that is already bound moves it to the new
/// parameter.
#[derive(Debug, Default)]
pub struct MidiLearnEngine {
    state: LearnState,
    assignments: HashMap<String, CcAssignment>,
    by_key: HashMap<CcKey, String>,
    ranges: HashMap<String, ParameterRange>,
}

impl MidiLearnEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the learn state.
    pub fn state(&self) -> &LearnState {
        &self.state
    }

    pub fn is_learning(&self) -> bool {
        matches!(self.state, LearnState::Learning(_))
    }

    /// Arms learning for `parameter`. Returns the parameter whose arm was
    /// cancelled, if any.
    pub fn start_learning(&mut self, parameter: impl Into<String>) -> Option<String> {
        let parameter = parameter.into();
        debug!(%parameter, "midi learn armed");
        match std::mem::replace(&mut self.state, LearnState::Learning(parameter)) {
            LearnState::Learning(previous) => Some(previous),
            LearnState::Idle => None,
        }
    }

    /// Returns `false` when nothing was armed.
    pub fn cancel_learning(&mut self) -> bool {
        let was_learning = self.is_learning();
        self.state = LearnState::Idle;
        was_learning
    }

    /// Whether the event was consumed by an armed learn.
    pub fn handle_midi_input(&mut self, channel: u8, cc_number: u8) -> bool {
        self.capture(channel, cc_number).is_some()
    }

    /// Completes an armed learn with this control, returning the new
    /// assignment.
    pub fn capture(&mut self, channel: u8, cc_number: u8) -> Option<CcAssignment> {
        let LearnState::Learning(parameter) = std::mem::take(&mut self.state) else {
            return None;
        };

        let range = self.ranges.get(&parameter).copied().unwrap_or_default();
        let assignment = CcAssignment {
            parameter_name: parameter,
            channel,
            cc_number,
            min: range.min,
            max: range.max,
        };
        self.insert(assignment.clone());
        Some(assignment)
    }

    /// Deletes the assignment for `parameter` from both indexes.
    pub fn remove_assignment(&mut self, parameter: &str) -> Option<CcAssignment> {
        let removed = self.assignments.remove(parameter)?;
        self.by_key.remove(&removed.key());
        Some(removed)
    }

    /// Dispatch-time lookup by control.
    pub fn get_assignment(&self, key: CcKey) -> Option<&CcAssignment> {
        self.by_key
            .get(&key)
            .and_then(|parameter| self.assignments.get(parameter))
    }

    /// Looks up an assignment by parameter name.
    pub fn assignment(&self, parameter: &str) -> Option<&CcAssignment> {
        self.assignments.get(parameter)
    }

    /// Every assignment, sorted by parameter name.
    pub fn assignments(&self) -> Vec<CcAssignment> {
        let mut all: Vec<CcAssignment> = self.assignments.values().cloned().collect();
        all.sort_by(|a, b| a.parameter_name.cmp(&b.parameter_name));
        all
    }

    /// Declares the output range used for future assignments of `parameter`.
    /// An existing assignment keeps the range it was learned with.
    pub fn set_parameter_range(&mut self, parameter: impl Into<String>, min: f32, max: f32) {
        self.ranges
            .insert(parameter.into(), ParameterRange { min, max });
    }

    pub fn clear_assignments(&mut self) {
        self.assignments.clear();
        self.by_key.clear();
    }

    /// Scales a 7-bit controller value into `[min, max]`.
    pub fn map_midi_value(raw: u8, min: f32, max: f32) -> f32 {
        let normalized = raw.min(127) as f32 / 127.0;
        min + normalized * (max - min)
    }

    fn insert(&mut self, assignment: CcAssignment) {
        let key = assignment.key();
        if let Some(previous) = self.assignments.remove(&assignment.parameter_name) {
            self.by_key.remove(&previous.key());
        }
        if let Some(displaced) = self.by_key.remove(&key) {
            self.assignments.remove(&displaced);
            debug!(parameter = %displaced, %key, "assignment displaced by learn");
        }
        self.by_key.insert(key, assignment.parameter_name.clone());
        self.assignments
            .insert(assignment.parameter_name.clone(), assignment);
    }
}
