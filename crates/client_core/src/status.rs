//! Server status polling and its one-line text rendering.

use std::time::Duration;

use futures::{stream::BoxStream, StreamExt};
use serde_json::Value;
use shared::protocol::StatusReport;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::IntervalStream;
use tracing::warn;

use crate::DreamClient;

const SMI_GPU: &str = "/nvidia_smi_log/gpu";

pub fn render_status(report: &StatusReport) -> String {
    let mut parts = vec![gpu_line(&report.nvidia), format!("queue: {}", report.queuesize)];

    if let Some(working) = report.working.as_str().filter(|w| !w.is_empty()) {
        parts.push(format!("working: {working}"));
    }
    let status = report
        .status
        .pointer("/status")
        .and_then(Value::as_str)
        .or_else(|| report.status.as_str());
    if let Some(status) = status.filter(|s| !s.is_empty()) {
        parts.push(status.to_string());
    }

    parts.join(" | ")
}

fn gpu_line(nvidia: &Value) -> String {
    let Some(gpu) = nvidia.pointer(SMI_GPU) else {
        return "GPU: unavailable".to_string();
    };
    let read = |path: &str| {
        gpu.pointer(path)
            .and_then(Value::as_str)
            .unwrap_or("?")
            .to_string()
    };
    format!(
        "GPU: {} ({} / {})",
        read("/utilization/gpu_util"),
        read("/temperature/gpu_temp"),
        read("/power_readings/power_draw"),
    )
}

/// Polls `GET /status` on a fixed timer. Failed polls are logged and skipped.
pub fn status_updates(client: DreamClient, every: Duration) -> BoxStream<'static, String> {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    IntervalStream::new(interval)
        .filter_map(move |_| {
            let client = client.clone();
            async move {
                match client.status().await {
                    Ok(report) => Some(render_status(&report)),
                    Err(err) => {
                        warn!(error = %err, "status: poll failed");
                        None
                    }
                }
            }
        })
        .boxed()
}
