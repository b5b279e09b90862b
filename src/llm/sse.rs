//! Incremental decoder for provider SSE byte streams.
//!
//! Every HTTP adapter pipes its response body through [`parts_from_sse`]
//! with a provider-specific [`FrameParser`].

use futures::{Stream, StreamExt};

use super::{PartStream, StreamPart, UsageReporter};
use crate::normalized::Usage;

/// One decoded server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Buffers raw bytes and yields complete frames as they arrive.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    /// Feed a chunk and drain every frame it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut frames = Vec::new();
        while let Some(pos) = find_double_newline(&self.buf) {
            let raw = self.buf.drain(..pos + 2).collect::<Vec<_>>();
            if let Some(frame) = parse_frame(&String::from_utf8_lossy(&raw)) {
                frames.push(frame);
            }
        }
        frames
    }
}

/// Provider-specific interpretation of decoded frames.
pub(crate) trait FrameParser: Send + 'static {
    /// Map one frame to at most one part.
    fn parse(&mut self, frame: &SseFrame) -> anyhow::Result<Option<StreamPart>>;

    /// Usage accumulated so far, if the provider reported any.
    fn usage(&self) -> Option<Usage>;
}

/// Decode a provider byte stream into normalized parts.
///
/// Usage is reported only when the body ends normally; a transport fault or
/// a parse failure ends the stream with an error item instead.
pub(crate) fn parts_from_sse<S, B, P>(byte_stream: S, mut parser: P, reporter: UsageReporter) -> PartStream
where
    S: Stream<Item = reqwest::Result<B>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    P: FrameParser,
{
    Box::pin(async_stream::stream! {
        let mut decoder = SseDecoder::default();

        futures::pin_mut!(byte_stream);
        while let Some(chunk) = byte_stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(anyhow::Error::from(e).context("provider stream interrupted"));
                    return;
                }
            };

            for frame in decoder.push(chunk.as_ref()) {
                match parser.parse(&frame) {
                    Ok(Some(part)) => yield Ok(part),
                    Ok(None) => {}
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        }

        if let Some(usage) = parser.usage() {
            reporter.report(usage);
        }
    })
}

/// Read a provider usage object, summing parts when no total is given.
pub(crate) fn read_usage(v: &serde_json::Value, input: &str, output: &str, total: &str) -> Usage {
    let input_tokens = v.get(input).and_then(serde_json::Value::as_u64).unwrap_or(0);
    let output_tokens = v.get(output).and_then(serde_json::Value::as_u64).unwrap_or(0);
    let total_tokens = v
        .get(total)
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(input_tokens + output_tokens);
    Usage {
        input_tokens,
        output_tokens,
        total_tokens,
    }
}

/// Extract the message of a top-level `{"error": ...}` object.
pub(crate) fn provider_error(v: &serde_json::Value) -> Option<String> {
    let err = v.get("error").filter(|e| !e.is_null())?;
    Some(
        err.get("message")
            .and_then(serde_json::Value::as_str)
            .map_or_else(|| err.to_string(), str::to_string),
    )
}

fn parse_frame(text: &str) -> Option<SseFrame> {
    let mut frame = SseFrame::default();
    let mut data_lines: Vec<&str> = Vec::new();

    for line in text.lines() {
        if let Some(name) = line.strip_prefix("event:") {
            frame.event = Some(name.trim().to_string());
        } else if let Some(data) = line.strip_prefix("data:") {
            data_lines.push(data.strip_prefix(' ').unwrap_or(data));
        }
    }

    if data_lines.is_empty() {
        return None;
    }
    frame.data = data_lines.join("\n");
    Some(frame)
}

/// Find the position of a double newline in the buffer.
fn find_double_newline(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_split_across_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"event: message_start\ndata: {\"a\"").is_empty());
        let frames = decoder.push(b":1}\n\ndata: [DONE]\n\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event.as_deref(), Some("message_start"));
        assert_eq!(frames[0].data, "{\"a\":1}");
        assert_eq!(frames[1].event, None);
        assert_eq!(frames[1].data, "[DONE]");
    }

    #[test]
    fn test_read_usage_sums_missing_total() {
        let v = serde_json::json!({"prompt_tokens": 5, "completion_tokens": 7});
        let usage = read_usage(&v, "prompt_tokens", "completion_tokens", "total_tokens");
        assert_eq!(usage, Usage::new(5, 7));
    }

    #[test]
    fn test_provider_error_message() {
        let v = serde_json::json!({"error": {"message": "overloaded", "type": "server_error"}});
        assert_eq!(provider_error(&v).as_deref(), Some("overloaded"));
        assert!(provider_error(&serde_json::json!({"error": null})).is_none());
    }

    #[test]
    fn test_crlf_and_comments() {
        let mut decoder = SseDecoder::default();
        let frames = decoder.push(b": keep-alive\r\n\r\ndata: {}\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{}");
    }
}
