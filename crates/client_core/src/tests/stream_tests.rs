use super::*;
use futures::stream;
use shared::protocol::{EventKind, EventTag};

fn chunks(parts: &[&str]) -> Vec<Result<Vec<u8>, String>> {
    parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect()
}

async fn collect(parts: Vec<Result<Vec<u8>, String>>) -> Vec<Result<StreamEvent, StreamError>> {
    decode_events(stream::iter(parts)).collect().await
}

#[test]
fn line_decoder_handles_split_lines_and_crlf() {
    let mut decoder = LineDecoder::new();
    assert!(decoder.push(b"{\"event\":\"que").is_empty());
    assert_eq!(
        decoder.push(b"ued\"}\r\n\n{\"event\""),
        vec!["{\"event\":\"queued\"}".to_string()]
    );
    assert_eq!(decoder.push(b":\"canceled\"}"), Vec::<String>::new());
    assert_eq!(
        decoder.finish(),
        Some("{\"event\":\"canceled\"}".to_string())
    );
    assert_eq!(decoder.finish(), None);
}

#[test]
fn line_decoder_keeps_multibyte_characters_across_chunks() {
    let line = "{\"prompt\":\"caf\u{e9}\"}\n".as_bytes();
    let split = line.len() - 4;
    let mut decoder = LineDecoder::new();
    assert!(decoder.push(&line[..split]).is_empty());
    assert_eq!(decoder.push(&line[split..]), vec!["{\"prompt\":\"café\"}"]);
}

#[tokio::test]
async fn decodes_events_in_emission_order_across_chunk_boundaries() {
    let events = collect(chunks(&[
        "{\"event\":\"queued\",\"uuid\":\"j1\",\"jobpos\":{\"pos\":2}}\n{\"event\":\"st",
        "ep\",\"step\":1}\n{\"event\":\"step\",\"step\":2}\n",
        "{\"event\":\"result\",\"seed\":7,\"config\":{}}",
    ]))
    .await;

    let tags: Vec<EventTag> = events
        .iter()
        .map(|e| e.as_ref().expect("event").tag())
        .collect();
    assert_eq!(
        tags,
        vec![
            EventTag::Queued,
            EventTag::Step,
            EventTag::Step,
            EventTag::Result
        ]
    );
    assert_eq!(
        events[2].as_ref().expect("step").kind,
        EventKind::Step { step: 2, url: None }
    );
}

#[tokio::test]
async fn malformed_line_is_reported_without_dropping_neighbours() {
    let events = collect(chunks(&[
        "{\"event\":\"step\",\"step\":1}\n",
        "{not json}\n",
        "{\"event\":\"canceled\"}\n",
    ]))
    .await;

    assert_eq!(events.len(), 3);
    assert!(events[0].is_ok());
    match &events[1] {
        Err(err @ StreamError::MalformedEvent { line, .. }) => {
            assert_eq!(line, "{not json}");
            assert!(!err.is_terminal());
        }
        other => panic!("unexpected item: {other:?}"),
    }
    assert_eq!(
        events[2].as_ref().expect("canceled").tag(),
        EventTag::Canceled
    );
}

#[tokio::test]
async fn transport_error_ends_the_stream() {
    let parts = vec![
        Ok(b"{\"event\":\"step\",\"step\":3}\n{\"event\":\"st".to_vec()),
        Err("connection reset".to_string()),
        Ok(b"ep\",\"step\":4}\n".to_vec()),
    ];
    let events = collect(parts).await;

    assert_eq!(events.len(), 2);
    assert!(events[0].is_ok());
    match &events[1] {
        Err(err @ StreamError::Transport(message)) => {
            assert!(message.contains("connection reset"));
            assert!(err.is_terminal());
        }
        other => panic!("unexpected item: {other:?}"),
    }
}

#[tokio::test]
async fn empty_body_yields_no_events() {
    assert!(collect(chunks(&["", "\n\n"])).await.is_empty());
}
