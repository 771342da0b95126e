//! Domain types for clusterman
//!
//! Naming (object paths, entity references), orchestration identifiers and
//! the monitor record model with its mutation rules.

mod entity;
mod id;
mod monitor;
mod path;

pub use entity::EntityRef;
pub use id::OrchestrationId;
pub use monitor::{
    ConflictReason, GlobalExpect, GlobalExpectOptions, LocalExpect, MonitorPatch, MonitorRecord, MonitorState, Update,
    ValidationError,
};
pub use path::{ObjectKind, ObjectPath, PathError, ROOT_NAMESPACE, validate_name};
