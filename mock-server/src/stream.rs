use std::{fmt, time::Duration};

use crate::api::{AssistantMessage, ToolCall};

/// Protocol frames of one streamed completion, in emission order: exactly one
/// `RoleOpen` first, zero or more deltas, exactly one `Finish`, exactly one
/// `Done` last.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamFrame {
    RoleOpen,
    ContentDelta(String),
    /// Tool calls are announced atomically, never argument-by-argument.
    ToolDelta(ToolCall),
    Finish(String),
    Done,
}

/// The consumer of the stream is gone; the encoder must stop immediately.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SinkClosed;

impl fmt::Display for SinkClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("stream sink closed")
    }
}

impl std::error::Error for SinkClosed {}

pub trait FrameSink: Send {
    fn emit(
        &mut self,
        frame: StreamFrame,
    ) -> impl Future<Output = Result<(), SinkClosed>> + Send + '_;
}

/// Delay between content deltas. The delay is deliberate: it makes the
/// simulated stream observably incremental to clients under test.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pacing {
    pub delta_delay: Duration,
}

impl Pacing {
    pub const fn none() -> Self {
        Self {
            delta_delay: Duration::ZERO,
        }
    }
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            delta_delay: Duration::from_millis(50),
        }
    }
}

/// Drives `sink` through the full frame sequence for one synthesized message.
/// Prose is split on whitespace and emitted one word per delta, each carrying
/// a trailing space except the last. A failed emit aborts encoding, dropping
/// any pending pacing timer with it.
pub async fn encode<S: FrameSink>(
    message: &AssistantMessage,
    finish_reason: &str,
    pacing: Pacing,
    sink: &mut S,
) -> Result<(), SinkClosed> {
    sink.emit(StreamFrame::RoleOpen).await?;

    if let Some(calls) = &message.tool_calls {
        for call in calls {
            sink.emit(StreamFrame::ToolDelta(call.clone())).await?;
        }
    } else if let Some(content) = &message.content {
        let words: Vec<&str> = content.split_whitespace().collect();
        for (i, word) in words.iter().enumerate() {
            if !pacing.delta_delay.is_zero() {
                tokio::time::sleep(pacing.delta_delay).await;
            }
            let mut delta = (*word).to_string();
            if i + 1 < words.len() {
                delta.push(' ');
            }
            sink.emit(StreamFrame::ContentDelta(delta)).await?;
        }
    }

    sink.emit(StreamFrame::Finish(finish_reason.to_string()))
        .await?;
    sink.emit(StreamFrame::Done).await
}
