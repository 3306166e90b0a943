//! Line-oriented terminal rendering of a running job.

use std::io::Write;

use client_core::{FailureAlert, JobObserver, JobView, StreamError, Thumbnail};
use shared::protocol::{EventKind, StreamEvent};
use tracing::warn;
use url::Url;

pub struct TerminalRenderer<W: Write + Send> {
    out: W,
    base_url: Url,
    last_gpu: Option<String>,
}

impl<W: Write + Send> TerminalRenderer<W> {
    pub fn new(out: W, base_url: Url) -> Self {
        Self {
            out,
            base_url,
            last_gpu: None,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn image_url(&self, path: &str) -> String {
        self.base_url
            .join(path)
            .map(String::from)
            .unwrap_or_else(|_| path.to_string())
    }

    fn line(&mut self, text: impl AsRef<str>) {
        if let Err(err) = writeln!(self.out, "{}", text.as_ref()).and_then(|_| self.out.flush()) {
            warn!(error = %err, "render: write failed");
        }
    }

    fn render_event(&mut self, view: &JobView, event: &StreamEvent) {
        if view.gpu_info != self.last_gpu {
            self.last_gpu = view.gpu_info.clone();
            if let Some(gpu) = &view.gpu_info {
                self.line(gpu);
            }
        }

        match &event.kind {
            EventKind::Queued => {
                if let Some(banner) = &view.queue_banner {
                    self.line(banner);
                }
            }
            EventKind::Step { .. } => {
                let mut text = format!("[step {}/{}]", view.progress, view.total_steps);
                if view.preview_enabled {
                    if let Some(preview) = &view.preview_image {
                        text.push_str(&format!(" preview: {}", self.image_url(preview)));
                    }
                }
                self.line(text);
            }
            EventKind::Result { .. } => {
                if let Some(thumb) = view.results.first() {
                    let text = self.result_line(thumb);
                    self.line(text);
                }
            }
            EventKind::UpscalingStarted { processed_file_cnt } => {
                self.line(format!("Upscaling... ({processed_file_cnt} processed)"));
            }
            EventKind::UpscalingDone => self.line("Upscaling done."),
            EventKind::Canceled => self.line("Job canceled."),
            EventKind::Error { message } => self.line(format!("Server error: {message}")),
            EventKind::Unknown => {}
        }
    }

    fn result_line(&self, thumb: &Thumbnail) -> String {
        format!("{}  {}", thumb.caption, self.image_url(&thumb.image_path))
    }
}

impl<W: Write + Send> JobObserver for TerminalRenderer<W> {
    fn on_started(&mut self, view: &JobView) {
        self.line(format!("Submitting job ({} steps)...", view.total_steps));
    }

    fn on_event(&mut self, view: &JobView, event: &StreamEvent) {
        self.render_event(view, event);
    }

    fn on_stream_error(&mut self, err: &StreamError) {
        if err.is_terminal() {
            self.line(format!("Connection lost: {err}"));
        }
    }

    fn on_finished(&mut self, view: &JobView, alert: Option<&FailureAlert>) {
        match alert {
            Some(alert) => self.line(alert.to_string()),
            None => self.line(format!("Done: {} image(s).", view.results.len())),
        }
    }
}

#[cfg(test)]
#[path = "tests/render_tests.rs"]
mod tests;
