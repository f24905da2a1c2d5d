//! Incremental server-sent-event scanning over forwarded bytes.
//!
//! Streaming responses pass through the proxy verbatim; this scanner watches
//! the same bytes to pick out the trailing usage object and to count the
//! delta content that backs the character-based estimate when no usage
//! object ever arrives.

use bytes::BytesMut;
use serde_json::Value;

const MAX_BUFFER_BYTES: usize = 512 * 1024;
const KEEP_TAIL_BYTES: usize = 128 * 1024;

/// Token counts observed in a streamed response body.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ObservedUsage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

#[derive(Default)]
pub struct SseUsageScanner {
    buffer: BytesMut,
    observed: Option<ObservedUsage>,
    delta_content_chars: u64,
    saw_done: bool,
}

impl SseUsageScanner {
    pub fn ingest(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);

        while let Some((event_len, delimiter_len)) = next_event_boundary(&self.buffer) {
            let event = self.buffer.split_to(event_len);
            let _ = self.buffer.split_to(delimiter_len);
            self.scan_event(&event);
        }

        // An upstream that never sends an event delimiter must not grow the
        // buffer without bound.
        if self.buffer.len() > MAX_BUFFER_BYTES {
            let keep_from = self.buffer.len().saturating_sub(KEEP_TAIL_BYTES);
            self.buffer = self.buffer.split_off(keep_from);
        }
    }

    fn scan_event(&mut self, event: &[u8]) {
        let Some(data) = join_data_lines(event) else {
            return;
        };
        let trimmed = data.trim();
        if trimmed == "[DONE]" {
            self.saw_done = true;
            return;
        }
        if !trimmed.starts_with('{') {
            return;
        }
        let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
            return;
        };

        if let Some(usage) = value.get("usage").and_then(Value::as_object) {
            let input = usage.get("prompt_tokens").and_then(Value::as_u64);
            let output = usage.get("completion_tokens").and_then(Value::as_u64);
            if input.is_some() || output.is_some() {
                self.observed = Some(ObservedUsage {
                    input_tokens: input,
                    output_tokens: output,
                });
            }
        }

        if let Some(choices) = value.get("choices").and_then(Value::as_array) {
            for choice in choices {
                if let Some(content) = choice
                    .get("delta")
                    .and_then(|delta| delta.get("content"))
                    .and_then(Value::as_str)
                {
                    self.delta_content_chars = self
                        .delta_content_chars
                        .saturating_add(content.chars().count() as u64);
                }
            }
        }
    }

    pub fn observed_usage(&self) -> Option<ObservedUsage> {
        self.observed
    }

    /// Characters of streamed delta content, the estimation input when the
    /// upstream never reported usage.
    pub fn delta_content_chars(&self) -> u64 {
        self.delta_content_chars
    }

    pub fn saw_done(&self) -> bool {
        self.saw_done
    }
}

/// Position and length of the next `\n\n` or `\r\n\r\n` event delimiter.
/// A single forward scan keeps mixed newline styles splitting at the
/// earliest boundary.
fn next_event_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    let mut idx = 0usize;
    while idx + 1 < buf.len() {
        if buf[idx] == b'\n' && buf[idx + 1] == b'\n' {
            return Some((idx, 2));
        }
        if idx + 3 < buf.len()
            && buf[idx] == b'\r'
            && buf[idx + 1] == b'\n'
            && buf[idx + 2] == b'\r'
            && buf[idx + 3] == b'\n'
        {
            return Some((idx, 4));
        }
        idx += 1;
    }
    None
}

/// Concatenated payload of an event's `data:` lines, or `None` when the
/// event carries no data field.
fn join_data_lines(event: &[u8]) -> Option<String> {
    let mut out = String::new();
    for line in event.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(rest) = line.strip_prefix(b"data:") else {
            continue;
        };
        let Ok(rest) = std::str::from_utf8(rest) else {
            continue;
        };
        let rest = rest.trim();
        if rest.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(rest);
    }
    (!out.is_empty()).then_some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_event_is_extracted_from_the_tail() {
        let mut scanner = SseUsageScanner::default();
        scanner.ingest(b"data: {\"choices\":[{\"delta\":{\"content\":\"hel\"}}]}\n\n");
        scanner.ingest(b"data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n");
        scanner.ingest(
            b"data: {\"choices\":[],\"usage\":{\"prompt_tokens\":9,\"completion_tokens\":2}}\n\n",
        );
        scanner.ingest(b"data: [DONE]\n\n");

        let usage = scanner.observed_usage().expect("usage");
        assert_eq!(usage.input_tokens, Some(9));
        assert_eq!(usage.output_tokens, Some(2));
        assert_eq!(scanner.delta_content_chars(), 5);
        assert!(scanner.saw_done());
    }

    #[test]
    fn events_split_across_chunks_are_reassembled() {
        let mut scanner = SseUsageScanner::default();
        scanner.ingest(b"data: {\"usage\":{\"prompt_tok");
        scanner.ingest(b"ens\":4,\"completion_tokens\":6}}");
        assert!(scanner.observed_usage().is_none());
        scanner.ingest(b"\n\n");
        assert_eq!(
            scanner.observed_usage(),
            Some(ObservedUsage {
                input_tokens: Some(4),
                output_tokens: Some(6),
            })
        );
    }

    #[test]
    fn crlf_delimiters_and_multi_line_data_are_handled() {
        let mut scanner = SseUsageScanner::default();
        scanner.ingest(
            b"event: message\r\ndata: {\"usage\":{\"prompt_tokens\":1,\r\ndata: \"completion_tokens\":2}}\r\n\r\n",
        );
        // Multi-line data joins with a newline, which is legal inside JSON.
        assert_eq!(
            scanner.observed_usage(),
            Some(ObservedUsage {
                input_tokens: Some(1),
                output_tokens: Some(2),
            })
        );
    }

    #[test]
    fn non_json_and_comment_events_are_ignored() {
        let mut scanner = SseUsageScanner::default();
        scanner.ingest(b": keepalive\n\ndata: not json\n\n");
        assert!(scanner.observed_usage().is_none());
        assert_eq!(scanner.delta_content_chars(), 0);
    }

    #[test]
    fn runaway_event_without_delimiter_is_bounded() {
        let mut scanner = SseUsageScanner::default();
        let blob = vec![b'x'; MAX_BUFFER_BYTES + 64];
        scanner.ingest(&blob);
        assert!(scanner.buffer.len() <= KEEP_TAIL_BYTES);
    }
}
