//! Newline-delimited JSON decoding of the job event stream.

use std::{collections::VecDeque, fmt::Display, pin::Pin};

use futures::{stream::BoxStream, Stream, StreamExt};
use shared::protocol::StreamEvent;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("event stream transport failed: {0}")]
    Transport(String),
    #[error("malformed event line {line:?}: {source}")]
    MalformedEvent {
        line: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StreamError {
    /// Transport failures end the stream; malformed lines do not.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamError::Transport(_))
    }
}

/// Lazy, finite, non-restartable sequence of decoded job events.
pub type EventStream = BoxStream<'static, Result<StreamEvent, StreamError>>;

/// Splits a byte stream into text lines. Bytes are buffered until a newline
/// arrives, so lines and multi-byte characters may straddle chunks.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=end).collect();
            if let Some(line) = text_line(&raw[..end]) {
                lines.push(line);
            }
        }
        lines
    }

    /// Flushes a trailing line that was never newline-terminated.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        text_line(&rest)
    }
}

fn text_line(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

pub fn parse_line(line: &str) -> Result<StreamEvent, StreamError> {
    serde_json::from_str(line).map_err(|source| StreamError::MalformedEvent {
        line: line.to_string(),
        source,
    })
}

struct DecodeState<S> {
    inner: Pin<Box<S>>,
    decoder: LineDecoder,
    pending: VecDeque<String>,
    done: bool,
}

/// Turns raw response chunks into events, preserving emission order.
pub fn decode_events<S, B, E>(bytes: S) -> EventStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = DecodeState {
        inner: Box::pin(bytes),
        decoder: LineDecoder::new(),
        pending: VecDeque::new(),
        done: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(line) = state.pending.pop_front() {
                return Some((parse_line(&line), state));
            }
            if state.done {
                return None;
            }
            match state.inner.next().await {
                Some(Ok(chunk)) => {
                    let lines = state.decoder.push(chunk.as_ref());
                    state.pending.extend(lines);
                }
                Some(Err(err)) => {
                    state.done = true;
                    state.decoder = LineDecoder::new();
                    return Some((Err(StreamError::Transport(err.to_string())), state));
                }
                None => {
                    state.done = true;
                    if let Some(line) = state.decoder.finish() {
                        state.pending.push_back(line);
                    }
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
#[path = "tests/stream_tests.rs"]
mod tests;
