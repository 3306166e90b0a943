use std::fmt;

use serde::{Deserialize, Serialize};

/// Server-assigned identifier of a generation job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Server-relative path of the image produced (or being produced) by this job.
    pub fn image_path(&self) -> String {
        format!("job/image?uuid={}", self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Number,
    Select,
    Checkbox,
    File,
}

impl FieldKind {
    /// File inputs never round-trip through the local field store.
    pub fn is_persisted(self) -> bool {
        self != FieldKind::File
    }
}
