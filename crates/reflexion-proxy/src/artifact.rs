use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// An artifact produced by a worker call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    /// The artifact body (text form; binary artifacts go through a path ref)
    pub content: String,
    /// Worker-supplied metadata (exit code, tool version, ...)
    pub metadata: HashMap<String, String>,
    /// How long the worker took to produce it
    #[serde(with = "duration_secs")]
    pub duration: Duration,
}

impl Artifact {
    pub fn new(content: String, metadata: HashMap<String, String>, duration: Duration) -> Self {
        Self {
            content,
            metadata,
            duration,
        }
    }

    /// A stable reference for persisting alongside the attempt row
    pub fn reference(&self) -> String {
        self.metadata
            .get("ref")
            .cloned()
            .unwrap_or_else(|| format!("inline:{}", self.content.len()))
    }

    pub fn content_lines(&self) -> usize {
        self.content.lines().count()
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs))
    }
}
