//! Pure job view reducer: `(JobView, StreamEvent) -> JobView`.

use std::fmt;

use serde_json::{Map, Value};
use shared::{
    domain::JobId,
    protocol::{EventKind, EventTag, JobRequest, StreamEvent, PROGRESS_IMAGES_FIELD, PROMPT_FIELD},
};

pub const FAILURE_ALERT: &str = "Error occurred while generating.";

#[derive(Debug, Clone, PartialEq)]
pub struct Thumbnail {
    pub job_id: Option<JobId>,
    pub image_path: String,
    pub caption: String,
    pub seed: i64,
    pub config: Map<String, Value>,
}

impl Thumbnail {
    pub fn prompt(&self) -> &str {
        self.config
            .get(PROMPT_FIELD)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }
}

/// Everything a renderer needs to draw one job in progress.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobView {
    pub total_steps: u32,
    pub progress: u32,
    pub progress_visible: bool,
    pub preview_enabled: bool,
    pub preview_image: Option<String>,
    pub queue_banner: Option<String>,
    /// Processed-file count while the server is upscaling.
    pub upscaling: Option<u64>,
    pub gpu_info: Option<String>,
    /// Newest first.
    pub results: Vec<Thumbnail>,
    pub job_id: Option<JobId>,
    pub server_error: Option<String>,
    pub saw_output: bool,
}

impl JobView {
    pub fn begin(request: &JobRequest) -> Self {
        Self {
            total_steps: request.total_steps(),
            progress_visible: true,
            preview_enabled: request.contains(PROGRESS_IMAGES_FIELD),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureAlert {
    pub message: &'static str,
    pub server_error: Option<String>,
}

impl fmt::Display for FailureAlert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.server_error {
            Some(detail) => write!(f, "{} ({detail})", self.message),
            None => f.write_str(self.message),
        }
    }
}

pub type Handler = fn(JobView, &StreamEvent) -> JobView;

/// Dispatch table from event kind to its handler.
pub fn handler_for(tag: EventTag) -> Handler {
    match tag {
        EventTag::Queued => on_queued,
        EventTag::Step => on_step,
        EventTag::Result => on_result,
        EventTag::UpscalingStarted => on_upscaling_started,
        EventTag::UpscalingDone => on_upscaling_done,
        EventTag::Canceled => on_canceled,
        EventTag::Error => on_error,
        EventTag::Unknown => ignore,
    }
}

pub fn reduce(view: JobView, event: &StreamEvent) -> JobView {
    let view = observe_common(view, event);
    handler_for(event.tag())(view, event)
}

/// Terminal transition once the stream has closed. The alert is produced here
/// and nowhere else, so a job raises it at most once.
pub fn finish(mut view: JobView) -> (JobView, Option<FailureAlert>) {
    view.progress_visible = false;
    view.progress = 0;
    view.gpu_info = None;
    let alert = (!view.saw_output).then(|| FailureAlert {
        message: FAILURE_ALERT,
        server_error: view.server_error.clone(),
    });
    (view, alert)
}

fn observe_common(mut view: JobView, event: &StreamEvent) -> JobView {
    if let Some(gpu) = &event.gpu {
        view.gpu_info = Some(gpu.summary());
    }
    if let Some(job_id) = &event.uuid {
        view.job_id = Some(job_id.clone());
    }
    view
}

fn on_queued(mut view: JobView, event: &StreamEvent) -> JobView {
    let position = event.jobpos.map(|p| p.pos).unwrap_or_default();
    view.queue_banner = Some(format!("Your prompt is queued, position: {position}"));
    view
}

fn on_step(mut view: JobView, event: &StreamEvent) -> JobView {
    let EventKind::Step { step, url } = &event.kind else {
        return view;
    };
    view.progress = *step;
    view.queue_banner = None;
    if let Some(url) = url {
        view.preview_image = Some(
            view.job_id
                .as_ref()
                .map(JobId::image_path)
                .unwrap_or_else(|| url.clone()),
        );
    }
    view
}

fn on_result(mut view: JobView, event: &StreamEvent) -> JobView {
    let EventKind::Result { seed, url, config } = &event.kind else {
        return view;
    };
    view.upscaling = None;
    view.saw_output = true;

    let image_path = view
        .job_id
        .as_ref()
        .map(JobId::image_path)
        .or_else(|| url.clone())
        .unwrap_or_default();
    let prompt = config
        .get(PROMPT_FIELD)
        .and_then(Value::as_str)
        .unwrap_or_default();
    view.results.insert(
        0,
        Thumbnail {
            job_id: view.job_id.clone(),
            image_path,
            caption: format!("{seed} | {prompt}"),
            seed: *seed,
            config: config.clone(),
        },
    );
    view.progress = 0;
    view
}

fn on_upscaling_started(mut view: JobView, event: &StreamEvent) -> JobView {
    if let EventKind::UpscalingStarted { processed_file_cnt } = &event.kind {
        view.upscaling = Some(*processed_file_cnt);
    }
    view
}

fn on_upscaling_done(mut view: JobView, _event: &StreamEvent) -> JobView {
    view.upscaling = None;
    view
}

fn on_canceled(mut view: JobView, _event: &StreamEvent) -> JobView {
    view.saw_output = true;
    view
}

fn on_error(mut view: JobView, event: &StreamEvent) -> JobView {
    if let EventKind::Error { message } = &event.kind {
        view.server_error = Some(message.clone());
    }
    view
}

fn ignore(view: JobView, _event: &StreamEvent) -> JobView {
    view
}

#[cfg(test)]
#[path = "tests/reducer_tests.rs"]
mod tests;
