//! Drives one job: form lockout, streamed reduction, and termination.

use std::sync::Arc;

use anyhow::Result;
use futures::{Stream, StreamExt};
use shared::{domain::JobId, protocol::StreamEvent};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    form::{Form, FormError},
    reducer::{finish, reduce, FailureAlert, JobView},
    request::build_request,
    stream::StreamError,
    DreamClient,
};

/// Most recent job id seen on the stream. Held by the caller and handed to
/// the cancel action; the stream loop is the only writer.
#[derive(Debug, Clone)]
pub struct JobTracker {
    tx: Arc<watch::Sender<Option<JobId>>>,
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> Option<JobId> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<JobId>> {
        self.tx.subscribe()
    }

    pub(crate) fn record(&self, job_id: &JobId) {
        self.tx.send_if_modified(|current| {
            if current.as_ref() == Some(job_id) {
                false
            } else {
                *current = Some(job_id.clone());
                true
            }
        });
    }
}

/// Rendering surface notified as the view changes.
pub trait JobObserver: Send {
    fn on_started(&mut self, _view: &JobView) {}
    fn on_event(&mut self, view: &JobView, event: &StreamEvent);
    fn on_stream_error(&mut self, _err: &StreamError) {}
    fn on_finished(&mut self, view: &JobView, alert: Option<&FailureAlert>);
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub view: JobView,
    pub alert: Option<FailureAlert>,
    pub events_seen: usize,
}

/// Folds a decoded event sequence through the reducer until it ends.
pub async fn drive<S, O>(mut view: JobView, events: S, observer: &mut O) -> JobOutcome
where
    S: Stream<Item = Result<StreamEvent, StreamError>>,
    O: JobObserver + ?Sized,
{
    let mut events = std::pin::pin!(events);
    let mut events_seen = 0usize;
    while let Some(item) = events.next().await {
        match item {
            Ok(event) => {
                events_seen += 1;
                debug!(tag = ?event.tag(), job_id = ?event.uuid, "job: event");
                view = reduce(view, &event);
                observer.on_event(&view, &event);
            }
            Err(err) => {
                warn!(error = %err, "job: stream item failed");
                observer.on_stream_error(&err);
                if err.is_terminal() {
                    break;
                }
            }
        }
    }

    let (view, alert) = finish(view);
    JobOutcome {
        view,
        alert,
        events_seen,
    }
}

/// Submits the form and renders the job until its stream closes. The form is
/// disabled for the duration and re-enabled with its original prompt after.
pub async fn run_job<O>(
    client: &DreamClient,
    form: &mut Form,
    tracker: &JobTracker,
    observer: &mut O,
) -> Result<JobOutcome>
where
    O: JobObserver + ?Sized,
{
    if form.is_disabled() {
        return Err(FormError::Disabled.into());
    }

    let prompt = form.prompt().to_string();
    let request = build_request(form).await?;
    let view = JobView::begin(&request);

    form.disable();
    form.replace_prompt(format!("Generating: \"{prompt}\""));
    observer.on_started(&view);
    info!(total_steps = view.total_steps, "job: submitting");

    let events = match client.submit(form.action(), &request, tracker).await {
        Ok(events) => events,
        Err(err) => {
            restore_form(form, prompt);
            return Err(err);
        }
    };

    let outcome = drive(view, events, observer).await;
    restore_form(form, prompt);
    observer.on_finished(&outcome.view, outcome.alert.as_ref());

    match &outcome.alert {
        Some(alert) => warn!(events = outcome.events_seen, %alert, "job: finished without output"),
        None => info!(
            events = outcome.events_seen,
            results = outcome.view.results.len(),
            "job: finished"
        ),
    }
    Ok(outcome)
}

fn restore_form(form: &mut Form, prompt: String) {
    form.enable();
    form.replace_prompt(prompt);
}

#[cfg(test)]
#[path = "tests/job_tests.rs"]
mod tests;
