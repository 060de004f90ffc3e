use std::fmt::Display;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of one running server: `{name}:{pid}:{guid}`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ServerId(String);

impl ServerId {
    /// Mint a fresh identity for a server with the given name.
    pub fn generate(server_name: &str) -> Self {
        Self(format!(
            "{}:{}:{}",
            server_name.to_lowercase(),
            std::process::id(),
            Uuid::new_v4()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ServerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ServerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Correlation id minted each time a component (re)starts.
///
/// Workers stamp it into the Processing state as the worker id, so a
/// restarted worker never mistakes an older run's claim for its own.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub Uuid);

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for ExecutionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Host name used when no server name is configured.
pub fn default_server_name() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .find_map(|key| std::env::var(key).ok().filter(|v| !v.trim().is_empty()))
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_id_contains_name_and_pid() {
        let id = ServerId::generate("Worker-Box");
        let pid = std::process::id().to_string();
        let parts: Vec<&str> = id.as_str().splitn(3, ':').collect();
        assert_eq!(parts[0], "worker-box");
        assert_eq!(parts[1], pid);
        assert!(Uuid::parse_str(parts[2]).is_ok());
    }

    #[test]
    fn execution_ids_are_unique() {
        assert_ne!(ExecutionId::new(), ExecutionId::new());
    }
}
