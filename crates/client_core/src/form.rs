//! Generation form model and the controller that mirrors it into local storage.

use std::{collections::BTreeMap, path::PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use shared::{
    domain::FieldKind,
    protocol::{INIT_IMAGE_FIELD, PROMPT_FIELD, SEED_FIELD},
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const RANDOM_SEED: &str = "-1";
const CHECKED: &str = "on";
const UNCHECKED: &str = "off";

pub const SAMPLERS: &[&str] = &[
    "ddim",
    "plms",
    "k_lms",
    "k_dpm_2",
    "k_dpm_2_a",
    "k_euler",
    "k_euler_a",
    "k_heun",
];
pub const UPSCALE_LEVELS: &[&str] = &["", "2", "4"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub default: &'static str,
    pub options: &'static [&'static str],
}

impl FieldSpec {
    pub const fn text(name: &'static str, default: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::Text,
            default,
            options: &[],
        }
    }

    pub const fn number(name: &'static str, default: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::Number,
            default,
            options: &[],
        }
    }

    pub const fn select(
        name: &'static str,
        default: &'static str,
        options: &'static [&'static str],
    ) -> Self {
        Self {
            name,
            kind: FieldKind::Select,
            default,
            options,
        }
    }

    pub const fn checkbox(name: &'static str, checked: bool) -> Self {
        Self {
            name,
            kind: FieldKind::Checkbox,
            default: if checked { CHECKED } else { UNCHECKED },
            options: &[],
        }
    }

    pub const fn file(name: &'static str) -> Self {
        Self {
            name,
            kind: FieldKind::File,
            default: "",
            options: &[],
        }
    }
}

/// Fields of the image generation form, in display order.
pub const GENERATE_FORM: &[FieldSpec] = &[
    FieldSpec::text(PROMPT_FIELD, ""),
    FieldSpec::number("iterations", "1"),
    FieldSpec::number("steps", "50"),
    FieldSpec::number("cfg_scale", "7.5"),
    FieldSpec::select("sampler_name", "k_lms", SAMPLERS),
    FieldSpec::number("width", "512"),
    FieldSpec::number("height", "512"),
    FieldSpec::number(SEED_FIELD, RANDOM_SEED),
    FieldSpec::file(INIT_IMAGE_FIELD),
    FieldSpec::number("strength", "0.75"),
    FieldSpec::checkbox("fit", true),
    FieldSpec::number("gfpgan_strength", "0.8"),
    FieldSpec::select("upscale_level", "", UPSCALE_LEVELS),
    FieldSpec::number("upscale_strength", "0.75"),
    FieldSpec::checkbox("progress_images", false),
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormError {
    #[error("unknown form field '{0}'")]
    UnknownField(String),
    #[error("field '{field}' does not accept '{value}' (expected one of: {options})")]
    InvalidOption {
        field: String,
        value: String,
        options: String,
    },
    #[error("field '{field}' expects a number, got '{value}'")]
    InvalidNumber { field: String, value: String },
    #[error("field '{field}' expects on/off, got '{value}'")]
    InvalidCheckbox { field: String, value: String },
    #[error("form is disabled while a job is running")]
    Disabled,
    #[error("failed to read image '{path}': {reason}")]
    ImageRead { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FormField {
    spec: FieldSpec,
    value: String,
}

impl FormField {
    pub fn name(&self) -> &'static str {
        self.spec.name
    }

    pub fn kind(&self) -> FieldKind {
        self.spec.kind
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn is_checked(&self) -> bool {
        self.spec.kind == FieldKind::Checkbox && self.value == CHECKED
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Form {
    action: String,
    fields: Vec<FormField>,
    disabled: bool,
}

impl Form {
    pub fn new(action: impl Into<String>, specs: &[FieldSpec]) -> Self {
        Self {
            action: action.into(),
            fields: specs
                .iter()
                .map(|spec| FormField {
                    spec: *spec,
                    value: spec.default.to_string(),
                })
                .collect(),
            disabled: false,
        }
    }

    /// The generation form, posting to the server root.
    pub fn generate() -> Self {
        Self::new("", GENERATE_FORM)
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn fields(&self) -> impl Iterator<Item = &FormField> {
        self.fields.iter()
    }

    pub fn field(&self, name: &str) -> Option<&FormField> {
        self.fields.iter().find(|f| f.spec.name == name)
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.field(name).map(FormField::value)
    }

    pub fn prompt(&self) -> &str {
        self.value(PROMPT_FIELD).unwrap_or_default()
    }

    pub fn init_image(&self) -> Option<PathBuf> {
        self.value(INIT_IMAGE_FIELD)
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from)
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn disable(&mut self) {
        self.disabled = true;
    }

    pub fn enable(&mut self) {
        self.disabled = false;
    }

    /// Edits a field the way a user would; rejected while the form is disabled.
    pub fn set(&mut self, name: &str, value: &str) -> Result<(), FormError> {
        if self.disabled {
            return Err(FormError::Disabled);
        }
        let field = self
            .fields
            .iter_mut()
            .find(|f| f.spec.name == name)
            .ok_or_else(|| FormError::UnknownField(name.to_string()))?;
        field.value = normalize_value(&field.spec, value)?;
        Ok(())
    }

    /// Programmatic prompt replacement, allowed while disabled.
    pub(crate) fn replace_prompt(&mut self, prompt: impl Into<String>) {
        if let Some(field) = self.fields.iter_mut().find(|f| f.spec.name == PROMPT_FIELD) {
            field.value = prompt.into();
        }
    }

    /// Restores every field to its default.
    pub fn reset(&mut self) {
        for field in &mut self.fields {
            field.value = field.spec.default.to_string();
        }
    }
}

fn normalize_value(spec: &FieldSpec, value: &str) -> Result<String, FormError> {
    match spec.kind {
        FieldKind::Text | FieldKind::File => Ok(value.to_string()),
        FieldKind::Number => {
            let trimmed = value.trim();
            if trimmed.is_empty() || trimmed.parse::<f64>().is_ok() {
                Ok(trimmed.to_string())
            } else {
                Err(FormError::InvalidNumber {
                    field: spec.name.to_string(),
                    value: value.to_string(),
                })
            }
        }
        FieldKind::Select => {
            if spec.options.contains(&value) {
                Ok(value.to_string())
            } else {
                Err(FormError::InvalidOption {
                    field: spec.name.to_string(),
                    value: value.to_string(),
                    options: spec.options.join(", "),
                })
            }
        }
        FieldKind::Checkbox => match value.trim().to_ascii_lowercase().as_str() {
            "on" | "true" | "1" | "yes" => Ok(CHECKED.to_string()),
            "off" | "false" | "0" | "no" | "" => Ok(UNCHECKED.to_string()),
            _ => Err(FormError::InvalidCheckbox {
                field: spec.name.to_string(),
                value: value.to_string(),
            }),
        },
    }
}

/// Key-value store the form snapshot is mirrored into.
#[async_trait]
pub trait FieldStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<String>>;
    async fn set(&self, name: &str, value: &str) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

#[async_trait]
impl FieldStore for storage::Storage {
    async fn get(&self, name: &str) -> Result<Option<String>> {
        self.field(name).await
    }

    async fn set(&self, name: &str, value: &str) -> Result<()> {
        self.set_field(name, value).await
    }

    async fn clear(&self) -> Result<()> {
        self.clear_fields().await.map(|_| ())
    }
}

#[derive(Debug, Default)]
pub struct MemoryFieldStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryFieldStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> BTreeMap<String, String> {
        self.values.lock().await.clone()
    }
}

#[async_trait]
impl FieldStore for MemoryFieldStore {
    async fn get(&self, name: &str) -> Result<Option<String>> {
        Ok(self.values.lock().await.get(name).cloned())
    }

    async fn set(&self, name: &str, value: &str) -> Result<()> {
        self.values
            .lock()
            .await
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.values.lock().await.clear();
        Ok(())
    }
}

pub struct FormController<S: FieldStore> {
    store: S,
}

impl<S: FieldStore> FormController<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Writes every non-file field into the store.
    pub async fn save(&self, form: &Form) -> Result<()> {
        for field in form.fields().filter(|f| f.kind().is_persisted()) {
            self.store.set(field.name(), field.value()).await?;
        }
        debug!("form: saved field snapshot");
        Ok(())
    }

    /// Overwrites fields that have a stored value; others keep their current value.
    pub async fn load(&self, form: &mut Form) -> Result<()> {
        let names: Vec<&'static str> = form
            .fields()
            .filter(|f| f.kind().is_persisted())
            .map(FormField::name)
            .collect();
        for name in names {
            let Some(stored) = self.store.get(name).await? else {
                continue;
            };
            if let Err(err) = form.set(name, &stored) {
                warn!(field = name, error = %err, "form: ignoring invalid stored value");
            }
        }
        Ok(())
    }

    /// Erases the snapshot and resets the form. The prompt text survives both
    /// in the form and in the store.
    pub async fn clear(&self, form: &mut Form) -> Result<()> {
        self.store.clear().await?;
        let prompt = form.prompt().to_string();
        form.reset();
        form.replace_prompt(prompt.as_str());
        if !prompt.is_empty() {
            self.store.set(PROMPT_FIELD, &prompt).await?;
        }
        Ok(())
    }

    pub async fn reset_seed(&self, form: &mut Form) -> Result<()> {
        form.set(SEED_FIELD, RANDOM_SEED)?;
        self.save(form).await
    }

    /// Applies one user edit and persists the snapshot, like a form change event.
    pub async fn update(&self, form: &mut Form, name: &str, value: &str) -> Result<()> {
        form.set(name, value)?;
        self.save(form).await
    }

    /// Repopulates the form with the configuration a result was generated from.
    pub async fn apply_result(
        &self,
        form: &mut Form,
        seed: i64,
        config: &Map<String, Value>,
    ) -> Result<()> {
        let names: Vec<&'static str> = form
            .fields()
            .filter(|f| f.kind().is_persisted())
            .map(FormField::name)
            .collect();
        for name in names {
            let Some(value) = config.get(name).and_then(config_value_text) else {
                continue;
            };
            if let Err(err) = form.set(name, &value) {
                warn!(field = name, error = %err, "form: result config value rejected");
            }
        }
        form.set(SEED_FIELD, &seed.to_string())?;
        self.save(form).await
    }
}

fn config_value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(true) => Some(CHECKED.to_string()),
        Value::Bool(false) => Some(UNCHECKED.to_string()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
#[path = "tests/form_tests.rs"]
mod tests;
