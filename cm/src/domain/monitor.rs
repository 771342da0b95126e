//! Monitor records and the rules that govern their mutation
//!
//! A monitor record tracks where one entity stands in its local state
//! machine and which orchestration, if any, currently owns it. Records are
//! only ever mutated through [`MonitorRecord::apply`] after
//! [`MonitorRecord::check`] accepted the patch.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::entity::EntityRef;
use super::id::OrchestrationId;
use super::path::{PathError, validate_name};

/// Position of an entity in its local state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    /// At rest, no action running
    #[default]
    Idle,

    // Transitional
    Starting,
    Stopping,
    ShuttingDown,
    Freezing,
    Thawing,

    // Terminal, success
    Started,
    Stopped,
    Shutdown,
    Frozen,
    Thawed,

    // Terminal, failure
    StartFailed,
    StopFailed,
    ShutdownFailed,
    FreezeFailed,
    ThawFailed,
}

impl MonitorState {
    const ALL: [MonitorState; 16] = [
        Self::Idle,
        Self::Starting,
        Self::Stopping,
        Self::ShuttingDown,
        Self::Freezing,
        Self::Thawing,
        Self::Started,
        Self::Stopped,
        Self::Shutdown,
        Self::Frozen,
        Self::Thawed,
        Self::StartFailed,
        Self::StopFailed,
        Self::ShutdownFailed,
        Self::FreezeFailed,
        Self::ThawFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Stopping => "stopping",
            Self::ShuttingDown => "shutting_down",
            Self::Freezing => "freezing",
            Self::Thawing => "thawing",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Shutdown => "shutdown",
            Self::Frozen => "frozen",
            Self::Thawed => "thawed",
            Self::StartFailed => "start_failed",
            Self::StopFailed => "stop_failed",
            Self::ShutdownFailed => "shutdown_failed",
            Self::FreezeFailed => "freeze_failed",
            Self::ThawFailed => "thaw_failed",
        }
    }

    pub fn is_idle(&self) -> bool {
        *self == Self::Idle
    }

    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Stopping | Self::ShuttingDown | Self::Freezing | Self::Thawing
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::StartFailed | Self::StopFailed | Self::ShutdownFailed | Self::FreezeFailed | Self::ThawFailed
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_idle() && !self.is_transitional()
    }

    /// Idle or terminal: no action is running against the entity
    pub fn is_at_rest(&self) -> bool {
        !self.is_transitional()
    }

    /// Idle < transitional < terminal
    pub fn rank(&self) -> u8 {
        if self.is_idle() {
            0
        } else if self.is_transitional() {
            1
        } else {
            2
        }
    }

    /// States that only make sense for object instances
    fn is_instance_only(&self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Started | Self::StartFailed | Self::Stopping | Self::Stopped | Self::StopFailed
        )
    }
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MonitorState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|state| state.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown monitor state '{}'", s))
    }
}

/// Node-local action trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalExpect {
    Start,
    Stop,
    Shutdown,
    Freeze,
    Thaw,
}

impl LocalExpect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Shutdown => "shutdown",
            Self::Freeze => "freeze",
            Self::Thaw => "thaw",
        }
    }

    /// State held while the action runs
    pub fn transitional(&self) -> MonitorState {
        match self {
            Self::Start => MonitorState::Starting,
            Self::Stop => MonitorState::Stopping,
            Self::Shutdown => MonitorState::ShuttingDown,
            Self::Freeze => MonitorState::Freezing,
            Self::Thaw => MonitorState::Thawing,
        }
    }

    /// Terminal state reached when the action succeeds
    pub fn target(&self) -> MonitorState {
        match self {
            Self::Start => MonitorState::Started,
            Self::Stop => MonitorState::Stopped,
            Self::Shutdown => MonitorState::Shutdown,
            Self::Freeze => MonitorState::Frozen,
            Self::Thaw => MonitorState::Thawed,
        }
    }

    /// Terminal state reached when the action fails
    pub fn failure(&self) -> MonitorState {
        match self {
            Self::Start => MonitorState::StartFailed,
            Self::Stop => MonitorState::StopFailed,
            Self::Shutdown => MonitorState::ShutdownFailed,
            Self::Freeze => MonitorState::FreezeFailed,
            Self::Thaw => MonitorState::ThawFailed,
        }
    }

    pub fn applies_to_node(&self) -> bool {
        !matches!(self, Self::Start | Self::Stop)
    }
}

impl fmt::Display for LocalExpect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LocalExpect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "shutdown" => Ok(Self::Shutdown),
            "freeze" => Ok(Self::Freeze),
            "thaw" => Ok(Self::Thaw),
            other => Err(format!("unknown local expect '{}'", other)),
        }
    }
}

/// Cluster-wide target outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobalExpect {
    Started,
    Stopped,
    Frozen,
    Thawed,
    PlacedAt,
}

impl GlobalExpect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Frozen => "frozen",
            Self::Thawed => "thawed",
            Self::PlacedAt => "placed_at",
        }
    }

    pub fn applies_to_node(&self) -> bool {
        matches!(self, Self::Frozen | Self::Thawed)
    }
}

impl fmt::Display for GlobalExpect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GlobalExpect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(Self::Started),
            "stopped" => Ok(Self::Stopped),
            "frozen" => Ok(Self::Frozen),
            "thawed" => Ok(Self::Thawed),
            "placed_at" | "placed-at" => Ok(Self::PlacedAt),
            other => Err(format!("unknown global expect '{}'", other)),
        }
    }
}

/// Payload attached to a global expectation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GlobalExpectOptions {
    #[default]
    None,
    /// Ordered list of destination nodes for a relocation
    PlacedAt { destination: Vec<String> },
}

/// Partial update of an optional field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Update<T> {
    #[default]
    Keep,
    Clear,
    Set(T),
}

impl<T: Clone> Update<T> {
    fn is_keep(&self) -> bool {
        matches!(self, Self::Keep)
    }

    fn resolve(&self, current: Option<T>) -> Option<T> {
        match self {
            Self::Keep => current,
            Self::Clear => None,
            Self::Set(value) => Some(value.clone()),
        }
    }
}

/// Patch validation errors, detected before a request is published
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Patch changes nothing")]
    EmptyPatch,

    #[error("{field} '{value}' does not apply to node {node}")]
    NotApplicableToNode {
        field: &'static str,
        value: String,
        node: String,
    },

    #[error("placed_at requires a non-empty destination list")]
    MissingDestination,

    #[error("Global expect options given without placed_at")]
    UnexpectedOptions,

    #[error("Invalid destination: {0}")]
    InvalidDestination(PathError),
}

/// Partial update proposed for one monitor record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MonitorPatch {
    pub state: Option<MonitorState>,
    pub local_expect: Update<LocalExpect>,
    pub global_expect: Update<GlobalExpect>,
    pub global_expect_options: Option<GlobalExpectOptions>,
    /// Precondition: only apply if the record is currently in this state
    pub if_state: Option<MonitorState>,
    /// Precondition: only apply while this local expectation is pending
    pub if_local_expect: Option<LocalExpect>,
}

impl MonitorPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(mut self, state: MonitorState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn local_expect(mut self, expect: LocalExpect) -> Self {
        self.local_expect = Update::Set(expect);
        self
    }

    pub fn clear_local_expect(mut self) -> Self {
        self.local_expect = Update::Clear;
        self
    }

    pub fn global_expect(mut self, expect: GlobalExpect) -> Self {
        self.global_expect = Update::Set(expect);
        self
    }

    pub fn clear_global_expect(mut self) -> Self {
        self.global_expect = Update::Clear;
        self
    }

    pub fn placed_at(mut self, destination: Vec<String>) -> Self {
        self.global_expect = Update::Set(GlobalExpect::PlacedAt);
        self.global_expect_options = Some(GlobalExpectOptions::PlacedAt { destination });
        self
    }

    pub fn if_state(mut self, state: MonitorState) -> Self {
        self.if_state = Some(state);
        self
    }

    pub fn if_local_expect(mut self, expect: LocalExpect) -> Self {
        self.if_local_expect = Some(expect);
        self
    }

    pub fn is_noop(&self) -> bool {
        self.state.is_none()
            && self.local_expect.is_keep()
            && self.global_expect.is_keep()
            && self.global_expect_options.is_none()
    }

    /// Reject malformed patches before they reach the entity's worker
    pub fn validate(&self, entity: &EntityRef) -> Result<(), ValidationError> {
        debug!(%entity, ?self, "MonitorPatch::validate: called");
        if self.is_noop() {
            return Err(ValidationError::EmptyPatch);
        }

        if let EntityRef::Node(node) = entity {
            let not_applicable = |field, value: &dyn fmt::Display| ValidationError::NotApplicableToNode {
                field,
                value: value.to_string(),
                node: node.clone(),
            };
            if let Some(state) = self.state
                && state.is_instance_only()
            {
                return Err(not_applicable("state", &state));
            }
            if let Update::Set(expect) = self.local_expect
                && !expect.applies_to_node()
            {
                return Err(not_applicable("local_expect", &expect));
            }
            if let Update::Set(expect) = self.global_expect
                && !expect.applies_to_node()
            {
                return Err(not_applicable("global_expect", &expect));
            }
        }

        let placing = self.global_expect == Update::Set(GlobalExpect::PlacedAt);
        match &self.global_expect_options {
            Some(GlobalExpectOptions::PlacedAt { destination }) => {
                if !placing {
                    return Err(ValidationError::UnexpectedOptions);
                }
                if destination.is_empty() {
                    return Err(ValidationError::MissingDestination);
                }
                for node in destination {
                    validate_name(node).map_err(ValidationError::InvalidDestination)?;
                }
            }
            Some(GlobalExpectOptions::None) | None if placing => {
                return Err(ValidationError::MissingDestination);
            }
            _ => {}
        }
        Ok(())
    }
}

/// Why an update was refused by the entity's worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    #[error("orchestration {current} is in flight (state {state})")]
    InFlight { current: OrchestrationId, state: MonitorState },

    #[error("terminal state {state} cannot change to {requested} within the same orchestration")]
    TerminalLocked {
        state: MonitorState,
        requested: MonitorState,
    },

    #[error("expected state {expected}, found {actual}")]
    StateMismatch {
        expected: MonitorState,
        actual: MonitorState,
    },

    #[error("expected pending {expected}, found {}", .actual.as_ref().map(|a| a.as_str()).unwrap_or("none"))]
    ExpectMismatch {
        expected: LocalExpect,
        actual: Option<LocalExpect>,
    },
}

/// Monitor state of one entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorRecord {
    pub state: MonitorState,
    pub local_expect: Option<LocalExpect>,
    pub global_expect: Option<GlobalExpect>,
    #[serde(default)]
    pub global_expect_options: GlobalExpectOptions,
    pub orchestration_id: Option<OrchestrationId>,
    pub updated_at: DateTime<Utc>,
}

impl Default for MonitorRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorRecord {
    /// Fresh record for a newly observed entity
    pub fn new() -> Self {
        Self {
            state: MonitorState::Idle,
            local_expect: None,
            global_expect: None,
            global_expect_options: GlobalExpectOptions::None,
            orchestration_id: None,
            updated_at: Utc::now(),
        }
    }

    /// An orchestration owns this entity and still has work pending on it
    ///
    /// A terminal state with a fresh local expectation counts: the new
    /// action has been requested but not started yet.
    pub fn is_in_flight(&self) -> bool {
        if self.orchestration_id.is_none() {
            return false;
        }
        self.state.is_transitional()
            || self.local_expect.is_some()
            || (self.state.is_idle() && self.global_expect.is_some())
    }

    /// Decide whether `patch` proposed by `candidate` may be applied
    pub fn check(&self, patch: &MonitorPatch, candidate: OrchestrationId) -> Result<(), ConflictReason> {
        if let Some(current) = self.orchestration_id
            && current != candidate
            && self.is_in_flight()
        {
            return Err(ConflictReason::InFlight {
                current,
                state: self.state,
            });
        }

        if let Some(expected) = patch.if_state
            && expected != self.state
        {
            return Err(ConflictReason::StateMismatch {
                expected,
                actual: self.state,
            });
        }

        if let Some(expected) = patch.if_local_expect
            && self.local_expect != Some(expected)
        {
            return Err(ConflictReason::ExpectMismatch {
                expected,
                actual: self.local_expect,
            });
        }

        // The action that produced this terminal state has completed
        if self.orchestration_id == Some(candidate)
            && self.state.is_terminal()
            && self.local_expect.is_none()
            && let Some(requested) = patch.state
            && requested != self.state
        {
            return Err(ConflictReason::TerminalLocked {
                state: self.state,
                requested,
            });
        }

        Ok(())
    }

    /// Apply an accepted patch on behalf of `candidate`
    pub fn apply(&mut self, patch: &MonitorPatch, candidate: OrchestrationId) {
        if let Some(state) = patch.state {
            self.state = state;
        }
        self.local_expect = patch.local_expect.resolve(self.local_expect);
        match &patch.global_expect {
            Update::Keep => {}
            Update::Clear => {
                self.global_expect = None;
                self.global_expect_options = GlobalExpectOptions::None;
            }
            Update::Set(expect) => {
                self.global_expect = Some(*expect);
                self.global_expect_options = patch.global_expect_options.clone().unwrap_or_default();
            }
        }

        // Back at rest with nothing pending: the orchestration lets go
        self.orchestration_id = if self.state.is_idle() && self.local_expect.is_none() && self.global_expect.is_none() {
            None
        } else {
            Some(candidate)
        };
        self.updated_at = Utc::now();
    }
}
