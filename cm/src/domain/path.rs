//! Object path parsing
//!
//! An object path names a cluster object as `<namespace>/<kind>/<name>`.
//! A bare name is shorthand for a service in the `root` namespace, and
//! `<namespace>/<name>` is shorthand for a service in that namespace.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Namespace used when a path does not name one
pub const ROOT_NAMESPACE: &str = "root";

/// Maximum length of a namespace or object name
const MAX_NAME_LEN: usize = 63;

/// Errors from object path and node name parsing
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("Empty path")]
    Empty,

    #[error("Too many path elements in '{0}'")]
    TooManyElements(String),

    #[error("Unknown object kind '{0}'")]
    UnknownKind(String),

    #[error("Invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },
}

/// Kind of cluster object
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    /// Service
    Svc,
    /// Volume
    Vol,
    /// Config store
    Cfg,
    /// Secret store
    Sec,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Svc => "svc",
            Self::Vol => "vol",
            Self::Cfg => "cfg",
            Self::Sec => "sec",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectKind {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "svc" => Ok(Self::Svc),
            "vol" => Ok(Self::Vol),
            "cfg" => Ok(Self::Cfg),
            "sec" => Ok(Self::Sec),
            other => Err(PathError::UnknownKind(other.to_string())),
        }
    }
}

/// Fully qualified object path
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectPath {
    namespace: String,
    kind: ObjectKind,
    name: String,
}

impl ObjectPath {
    /// Build a path from its parts, validating the names
    pub fn new(namespace: &str, kind: ObjectKind, name: &str) -> Result<Self, PathError> {
        validate_name(namespace)?;
        validate_name(name)?;
        Ok(Self {
            namespace: namespace.to_string(),
            kind,
            name: name.to_string(),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.kind, self.name)
    }
}

impl FromStr for ObjectPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(PathError::Empty);
        }
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [name] => Self::new(ROOT_NAMESPACE, ObjectKind::Svc, name),
            [namespace, name] => Self::new(namespace, ObjectKind::Svc, name),
            [namespace, kind, name] => Self::new(namespace, kind.parse()?, name),
            _ => Err(PathError::TooManyElements(s.to_string())),
        }
    }
}

impl TryFrom<String> for ObjectPath {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ObjectPath> for String {
    fn from(path: ObjectPath) -> Self {
        path.to_string()
    }
}

/// Validate a namespace, object name or node name
///
/// Names are lowercase DNS-label style: alphanumerics, `-` and `.`, starting
/// with an alphanumeric.
pub fn validate_name(name: &str) -> Result<(), PathError> {
    let invalid = |reason| PathError::InvalidName {
        name: name.to_string(),
        reason,
    };
    if name.is_empty() {
        return Err(invalid("empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(invalid("too long"));
    }
    if !name.starts_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit()) {
        return Err(invalid("must start with a lowercase letter or digit"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
    {
        return Err(invalid("only lowercase letters, digits, '-' and '.' are allowed"));
    }
    Ok(())
}
