use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;
use uuid::Uuid;

/// Opaque job identifier handed out by storage.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Time-ordered identifier for backends that mint their own ids.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// What to invoke: a type, a method on it, and already-serialized arguments.
///
/// kiln never interprets `args`; the [`JobPerformer`](crate::performer::JobPerformer)
/// supplied by the host does.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvocationData {
    pub type_name: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
}

impl InvocationData {
    pub fn new(type_name: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            method: method.into(),
            args: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<serde_json::Value>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_args(mut self, args: Vec<serde_json::Value>) -> Self {
        self.args = args;
        self
    }
}

impl Display for InvocationData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.type_name, self.method)
    }
}

/// A job as handed to the performer. Immutable once built.
#[derive(Clone, Debug)]
pub struct BackgroundJob {
    pub id: JobId,
    pub invocation: InvocationData,
    pub created_at: DateTime<Utc>,
}

/// Stored job record, as returned by `get_job_data`.
#[derive(Clone, Debug)]
pub struct JobData {
    pub invocation: InvocationData,
    pub state_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub parameters: BTreeMap<String, String>,
}

impl JobData {
    pub fn to_background_job(&self, id: JobId) -> BackgroundJob {
        BackgroundJob {
            id,
            invocation: self.invocation.clone(),
            created_at: self.created_at,
        }
    }
}
