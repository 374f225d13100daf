use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of an external requester that asks for chunks to stay resident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LoaderId(pub Uuid);

impl LoaderId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LoaderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LoaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loader-{}", self.0.simple())
    }
}

/// Describes which world a storage backend reads and writes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorldInfo {
    pub name: String,
}

impl Default for WorldInfo {
    fn default() -> Self {
        Self::new("world")
    }
}

impl WorldInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// File-system safe snake_case id derived from the name.
    pub fn id(&self) -> String {
        self.name
            .to_lowercase()
            .replace(' ', "_")
            .chars()
            .filter(|c| !c.is_control() && !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*'))
            .collect()
    }
}

impl fmt::Display for WorldInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "World {}", self.name)
    }
}
