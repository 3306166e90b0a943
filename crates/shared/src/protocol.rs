use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::domain::JobId;

pub const PROMPT_FIELD: &str = "prompt";
pub const SEED_FIELD: &str = "seed";
pub const STEPS_FIELD: &str = "steps";
pub const STRENGTH_FIELD: &str = "strength";
pub const INIT_IMAGE_FIELD: &str = "initimg";
pub const INIT_IMAGE_NAME_FIELD: &str = "initimg_name";
pub const PROGRESS_IMAGES_FIELD: &str = "progress_images";

/// Seed reported when the server echoes back a blank or unparseable one.
pub const UNKNOWN_SEED: i64 = -1;

/// JSON body posted to the generation endpoint: one entry per form field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobRequest(pub Map<String, Value>);

impl JobRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(name.into(), value)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn prompt(&self) -> &str {
        self.get(PROMPT_FIELD)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn has_init_image(&self) -> bool {
        matches!(self.get(INIT_IMAGE_FIELD), Some(Value::String(data)) if !data.is_empty())
    }

    /// Reads a numeric field whether the form sent it as a number or a string.
    pub fn number(&self, name: &str) -> Option<f64> {
        match self.get(name)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Steps the server will actually run: image-to-image only runs the
    /// `strength` fraction of the schedule.
    pub fn total_steps(&self) -> u32 {
        let steps = self.number(STEPS_FIELD).unwrap_or(0.0).max(0.0);
        let total = if self.has_init_image() {
            let strength = self.number(STRENGTH_FIELD).unwrap_or(0.0).max(0.0);
            (strength * steps).floor()
        } else {
            steps.floor()
        };
        total as u32
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciTelemetry {
    #[serde(default, deserialize_with = "lenient_text")]
    pub tx_util: String,
    #[serde(default, deserialize_with = "lenient_text")]
    pub rx_util: String,
}

/// nvidia-smi readings the server attaches to every streamed event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuTelemetry {
    #[serde(default, deserialize_with = "lenient_text")]
    pub temp: String,
    #[serde(default, deserialize_with = "lenient_text")]
    pub power: String,
    #[serde(default, deserialize_with = "lenient_text")]
    pub util: String,
    #[serde(
        default,
        deserialize_with = "lenient_block",
        skip_serializing_if = "Option::is_none"
    )]
    pub pci: Option<PciTelemetry>,
}

impl GpuTelemetry {
    pub fn summary(&self) -> String {
        format!("GPU: {} ({} / {})", self.util, self.temp, self.power)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPosition {
    #[serde(default)]
    pub pos: u32,
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub working: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTag {
    Queued,
    Step,
    Result,
    UpscalingStarted,
    UpscalingDone,
    Canceled,
    Error,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum EventKind {
    Queued,
    Step {
        step: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    Result {
        #[serde(default = "unknown_seed", deserialize_with = "lenient_seed")]
        seed: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default)]
        config: Map<String, Value>,
    },
    UpscalingStarted {
        #[serde(default)]
        processed_file_cnt: u64,
    },
    UpscalingDone,
    Canceled,
    Error {
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Unknown,
}

impl EventKind {
    pub fn tag(&self) -> EventTag {
        match self {
            EventKind::Queued => EventTag::Queued,
            EventKind::Step { .. } => EventTag::Step,
            EventKind::Result { .. } => EventTag::Result,
            EventKind::UpscalingStarted { .. } => EventTag::UpscalingStarted,
            EventKind::UpscalingDone => EventTag::UpscalingDone,
            EventKind::Canceled => EventTag::Canceled,
            EventKind::Error { .. } => EventTag::Error,
            EventKind::Unknown => EventTag::Unknown,
        }
    }
}

/// One line of the newline-delimited job stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<JobId>,
    #[serde(
        default,
        deserialize_with = "lenient_block",
        skip_serializing_if = "Option::is_none"
    )]
    pub gpu: Option<GpuTelemetry>,
    #[serde(
        default,
        deserialize_with = "lenient_block",
        skip_serializing_if = "Option::is_none"
    )]
    pub jobpos: Option<JobPosition>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl StreamEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            uuid: None,
            gpu: None,
            jobpos: None,
            kind,
        }
    }

    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(JobId::new(uuid));
        self
    }

    pub fn with_jobpos(mut self, jobpos: JobPosition) -> Self {
        self.jobpos = Some(jobpos);
        self
    }

    pub fn with_gpu(mut self, gpu: GpuTelemetry) -> Self {
        self.gpu = Some(gpu);
        self
    }

    pub fn tag(&self) -> EventTag {
        self.kind.tag()
    }
}

// nvidia-smi readings come from converted XML, so empty elements show up as
// null and numbers are not always quoted.
fn lenient_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => String::new(),
        Value::String(text) => text,
        other => other.to_string(),
    })
}

/// A telemetry block that does not fit its shape is dropped, never the event.
fn lenient_block<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

fn unknown_seed() -> i64 {
    UNKNOWN_SEED
}

// The worker may echo the form's raw seed, which can be `""` or `"-1"`.
fn lenient_seed<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(UNKNOWN_SEED),
        Value::String(text) => text.trim().parse().unwrap_or(UNKNOWN_SEED),
        _ => UNKNOWN_SEED,
    })
}

/// Body of `GET /status`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusReport {
    #[serde(default)]
    pub status: Value,
    #[serde(default)]
    pub working: Value,
    #[serde(default)]
    pub nvidia: Value,
    #[serde(default)]
    pub queuesize: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub status: String,
}
