//! Serializes the generation form into the JSON job body.

use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{Number, Value};
use shared::{
    domain::FieldKind,
    protocol::{JobRequest, INIT_IMAGE_FIELD, INIT_IMAGE_NAME_FIELD},
};

use crate::form::{Form, FormError};

const FALLBACK_MIME: &str = "application/octet-stream";

/// Builds the job body from every field. The image input is read from disk and
/// inlined as a data URL, or sent as `null` when no file is chosen.
pub async fn build_request(form: &Form) -> Result<JobRequest, FormError> {
    let mut request = JobRequest::new();
    for field in form.fields() {
        match field.kind() {
            FieldKind::File => {}
            FieldKind::Checkbox => {
                if field.is_checked() {
                    request.insert(field.name(), Value::String("on".to_string()));
                }
            }
            FieldKind::Number => {
                request.insert(field.name(), number_value(field.value()));
            }
            FieldKind::Text | FieldKind::Select => {
                request.insert(field.name(), Value::String(field.value().to_string()));
            }
        }
    }

    match form.init_image() {
        Some(path) => {
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|err| FormError::ImageRead {
                    path: path.clone(),
                    reason: err.to_string(),
                })?;
            request.insert(
                INIT_IMAGE_FIELD,
                Value::String(data_url(&bytes, mime_for(&path))),
            );
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            request.insert(INIT_IMAGE_NAME_FIELD, Value::String(name));
        }
        None => {
            request.insert(INIT_IMAGE_FIELD, Value::Null);
            request.insert(INIT_IMAGE_NAME_FIELD, Value::String(String::new()));
        }
    }

    Ok(request)
}

pub fn data_url(bytes: &[u8], mime: &str) -> String {
    format!("data:{mime};base64,{}", STANDARD.encode(bytes))
}

fn mime_for(path: &Path) -> &'static str {
    mime_guess::from_path(path)
        .first_raw()
        .unwrap_or(FALLBACK_MIME)
}

fn number_value(raw: &str) -> Value {
    if let Ok(int) = raw.parse::<i64>() {
        return Value::Number(int.into());
    }
    raw.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(raw.to_string()))
}

#[cfg(test)]
#[path = "tests/request_tests.rs"]
mod tests;
