//! Server-Sent Events (SSE) streaming for Gemini `streamGenerateContent`.
//!
//! Each `data:` line carries a complete `GenerateContentResponse` JSON
//! object holding the next text delta. Usage metadata arrives on the last
//! chunk.

use super::classify::error_for_status;
use super::client::{Generation, UsageInfo};
use super::gemini::{GenerateRequest, GenerateResponse, GenerationConfig, GeminiClient, to_contents};
use crate::{Error, PromptPart, Result};
use tracing::{debug, trace, warn};

/// A single event from an SSE stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// An incremental text content delta.
    TextDelta(String),
    /// Token usage information (sent in the final chunk).
    Usage(UsageInfo),
    /// The model stopped, with the provider's finish reason.
    Finished(String),
    /// The stream is complete.
    Done,
}

impl GeminiClient {
    /// Stream a generation, invoking `on_chunk` for each text delta as it
    /// arrives off the wire. The assembled text is returned at the end.
    pub(crate) async fn stream_generate(
        &self,
        parts: &[PromptPart],
        max_output_tokens: u32,
        on_chunk: &(dyn Fn(&str) + Send + Sync),
    ) -> Result<Generation> {
        let key = self.key()?;
        let body = GenerateRequest {
            contents: to_contents(parts),
            generation_config: GenerationConfig { max_output_tokens },
        };
        let url = format!("{}?alt=sse", self.method_url("streamGenerateContent"));

        debug!("Sending streaming generate request ({} parts)", parts.len());

        let mut resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(error_for_status("Gemini API", status.as_u16(), &text));
        }

        // Read incrementally via chunk() so long answers don't hit a single
        // body timeout.
        let mut events = Vec::new();
        let mut buffer = String::new();

        while let Some(chunk) = resp.chunk().await? {
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline_pos) = buffer.find('\n') {
                let line: String = buffer.drain(..=newline_pos).collect();
                let before = events.len();
                parse_sse_line(&line, &mut events);
                emit_text(&events[before..], on_chunk);
            }
        }

        // Incomplete final line.
        let before = events.len();
        parse_sse_line(&buffer, &mut events);
        emit_text(&events[before..], on_chunk);
        events.push(StreamEvent::Done);

        debug!("Stream completed with {} events", events.len());

        let text = collect_text(&events);
        if text.is_empty() {
            let reason = finish_reason(&events).unwrap_or_else(|| "unknown".into());
            return Err(Error::Api(format!("generation stopped, reason: {reason}")));
        }
        Ok(Generation {
            text,
            usage: extract_usage(&events),
            finish_reason: finish_reason(&events),
        })
    }
}

fn emit_text(events: &[StreamEvent], on_chunk: &(dyn Fn(&str) + Send + Sync)) {
    for ev in events {
        if let StreamEvent::TextDelta(delta) = ev {
            on_chunk(delta);
        }
    }
}

/// Parse one SSE line into stream events. Comments, blank lines and
/// non-`data:` fields are ignored.
pub fn parse_sse_line(line: &str, events: &mut Vec<StreamEvent>) {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return;
    }
    let Some(data) = line.strip_prefix("data:") else {
        return;
    };
    let data = data.trim_start();
    match serde_json::from_str::<GenerateResponse>(data) {
        Ok(chunk) => {
            let text = chunk.text();
            if !text.is_empty() {
                events.push(StreamEvent::TextDelta(text));
            }
            if let Some(reason) = chunk.finish_reason() {
                trace!("Stream finish_reason: {reason}");
                events.push(StreamEvent::Finished(reason));
            }
            if let Some(usage) = chunk.usage_metadata {
                events.push(StreamEvent::Usage(usage.into()));
            }
        }
        Err(e) => {
            warn!("Failed to parse SSE chunk: {e}");
        }
    }
}

/// Assemble a complete text string from a sequence of stream events.
pub fn collect_text(events: &[StreamEvent]) -> String {
    let mut text = String::new();
    for event in events {
        if let StreamEvent::TextDelta(delta) = event {
            text.push_str(delta);
        }
    }
    text
}

/// Extract the last usage report from stream events (if present).
pub fn extract_usage(events: &[StreamEvent]) -> Option<UsageInfo> {
    events.iter().rev().find_map(|e| match e {
        StreamEvent::Usage(u) => Some(u.clone()),
        _ => None,
    })
}

fn finish_reason(events: &[StreamEvent]) -> Option<String> {
    events.iter().rev().find_map(|e| match e {
        StreamEvent::Finished(r) => Some(r.clone()),
        _ => None,
    })
}
