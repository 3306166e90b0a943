use super::*;
use futures::stream;
use serde_json::json;
use shared::protocol::{EventKind, EventTag, JobRequest, STEPS_FIELD};

#[derive(Default)]
struct RecordingObserver {
    started: usize,
    tags: Vec<EventTag>,
    progress: Vec<u32>,
    stream_errors: usize,
    finished: Vec<Option<FailureAlert>>,
}

impl JobObserver for RecordingObserver {
    fn on_started(&mut self, _view: &JobView) {
        self.started += 1;
    }

    fn on_event(&mut self, view: &JobView, event: &StreamEvent) {
        self.tags.push(event.tag());
        self.progress.push(view.progress);
    }

    fn on_stream_error(&mut self, _err: &StreamError) {
        self.stream_errors += 1;
    }

    fn on_finished(&mut self, _view: &JobView, alert: Option<&FailureAlert>) {
        self.finished.push(alert.cloned());
    }
}

fn begin() -> JobView {
    let mut request = JobRequest::new();
    request.insert(STEPS_FIELD, json!(20));
    JobView::begin(&request)
}

fn malformed() -> StreamError {
    crate::stream::parse_line("{oops").expect_err("malformed")
}

#[tokio::test]
async fn drive_skips_malformed_lines_and_keeps_order() {
    let items = vec![
        Ok(StreamEvent::new(EventKind::Step { step: 1, url: None })),
        Err(malformed()),
        Ok(StreamEvent::new(EventKind::Step { step: 2, url: None })),
        Ok(StreamEvent::new(EventKind::Canceled)),
    ];
    let mut observer = RecordingObserver::default();

    let outcome = drive(begin(), stream::iter(items), &mut observer).await;

    assert_eq!(
        observer.tags,
        vec![EventTag::Step, EventTag::Step, EventTag::Canceled]
    );
    assert_eq!(observer.progress, vec![1, 2, 2]);
    assert_eq!(observer.stream_errors, 1);
    assert_eq!(outcome.events_seen, 3);
    assert_eq!(outcome.alert, None);
}

#[tokio::test]
async fn drive_stops_at_transport_failure_and_alerts() {
    let items = vec![
        Ok(StreamEvent::new(EventKind::Step { step: 1, url: None })),
        Err(StreamError::Transport("reset".to_string())),
        Ok(StreamEvent::new(EventKind::Canceled)),
    ];
    let mut observer = RecordingObserver::default();

    let outcome = drive(begin(), stream::iter(items), &mut observer).await;

    assert_eq!(outcome.events_seen, 1);
    assert_eq!(
        outcome.alert.map(|a| a.message),
        Some(crate::reducer::FAILURE_ALERT)
    );
}

#[test]
fn tracker_keeps_last_written_job_id() {
    let tracker = JobTracker::new();
    assert_eq!(tracker.current(), None);

    let mut rx = tracker.subscribe();
    tracker.record(&JobId::new("a"));
    tracker.record(&JobId::new("b"));
    assert_eq!(tracker.current(), Some(JobId::new("b")));
    assert!(rx.has_changed().expect("sender alive"));
    assert_eq!(*rx.borrow_and_update(), Some(JobId::new("b")));

    tracker.record(&JobId::new("b"));
    assert!(!rx.has_changed().expect("sender alive"));
}

#[tokio::test]
async fn disabled_form_cannot_submit() {
    let client = DreamClient::new("http://127.0.0.1:9").expect("client");
    let mut form = Form::generate();
    form.disable();
    let mut observer = RecordingObserver::default();

    let err = run_job(&client, &mut form, &JobTracker::new(), &mut observer)
        .await
        .expect_err("disabled");
    assert!(err.to_string().contains("disabled"));
    assert_eq!(observer.started, 0);
}
