//! Server-sent-event decoding for streamed completions.

use std::collections::VecDeque;

use anyhow::{anyhow, Result};
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use serde_json::Value;

use super::providers::TextStream;

/// Pulls the text delta (if any) out of one decoded event payload.
pub type DeltaExtractor = fn(&Value) -> Option<String>;

struct SseState<B, E> {
    bytes: BoxStream<'static, std::result::Result<B, E>>,
    buffer: Vec<u8>,
    pending: VecDeque<Result<String>>,
    extract: DeltaExtractor,
    done: bool,
}

impl<B, E> SseState<B, E> {
    fn drain_lines(&mut self) {
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.handle_line(&String::from_utf8_lossy(&line));
        }
    }

    fn handle_line(&mut self, line: &str) {
        let line = line.trim_end_matches(['\r', '\n']);
        let Some(data) = line.strip_prefix("data:") else {
            return;
        };
        let data = data.trim_start();

        if data == "[DONE]" {
            self.done = true;
            return;
        }

        let Ok(json) = serde_json::from_str::<Value>(data) else {
            tracing::trace!(line = data, "skipping undecodable event");
            return;
        };

        if let Some(error) = json.get("error").filter(|e| !e.is_null()) {
            let message = error["message"]
                .as_str()
                .map(String::from)
                .unwrap_or_else(|| error.to_string());
            self.pending.push_back(Err(anyhow!(message)));
            self.done = true;
            return;
        }

        if let Some(text) = (self.extract)(&json).filter(|t| !t.is_empty()) {
            self.pending.push_back(Ok(text));
        }
    }
}

/// Turn a raw response body into a stream of text deltas.
///
/// Lines are split on `\n` at the byte level so multi-byte characters that
/// straddle network chunks decode intact. `data: [DONE]` or an `error`
/// payload ends the stream.
pub fn sse_deltas<S, B, E>(bytes: S, extract: DeltaExtractor) -> TextStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<anyhow::Error> + Send + 'static,
{
    let state = SseState {
        bytes: bytes.boxed(),
        buffer: Vec::new(),
        pending: VecDeque::new(),
        extract,
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.done {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    state.buffer.extend_from_slice(chunk.as_ref());
                    state.drain_lines();
                }
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(e.into()), state));
                }
                None => {
                    state.done = true;
                    let rest = std::mem::take(&mut state.buffer);
                    state.handle_line(&String::from_utf8_lossy(&rest));
                }
            }
        }
    })
    .boxed()
}

/// Anthropic Messages API: `content_block_delta` / `text_delta`
pub fn anthropic_delta(json: &Value) -> Option<String> {
    if json["type"].as_str() != Some("content_block_delta") {
        return None;
    }
    if json["delta"]["type"].as_str() != Some("text_delta") {
        return None;
    }
    json["delta"]["text"].as_str().map(String::from)
}

/// OpenAI-compatible chat completions: `choices[0].delta.content`
pub fn openai_delta(json: &Value) -> Option<String> {
    json["choices"][0]["delta"]["content"]
        .as_str()
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(chunks: &[&str]) -> impl Stream<Item = std::result::Result<Vec<u8>, std::io::Error>> {
        let owned: Vec<_> = chunks.iter().map(|c| Ok(c.as_bytes().to_vec())).collect();
        stream::iter(owned)
    }

    async fn collect(stream: TextStream) -> Vec<Result<String>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn test_openai_deltas_across_chunk_boundaries() {
        let stream = sse_deltas(
            body(&[
                "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\ndata: {\"choi",
                "ces\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
                "data: [DONE]\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n",
            ]),
            openai_delta,
        );

        let deltas: Vec<String> = collect(stream).await.into_iter().map(|d| d.unwrap()).collect();
        assert_eq!(deltas, vec!["Hel", "lo"]);
    }

    #[tokio::test]
    async fn test_anthropic_skips_non_text_events() {
        let stream = sse_deltas(
            body(&[
                "event: message_start\ndata: {\"type\":\"message_start\"}\n\n",
                "event: content_block_delta\r\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\r\n\r\n",
                "data: {\"type\":\"message_stop\"}",
            ]),
            anthropic_delta,
        );

        let deltas: Vec<String> = collect(stream).await.into_iter().map(|d| d.unwrap()).collect();
        assert_eq!(deltas, vec!["Hi"]);
    }

    #[tokio::test]
    async fn test_multibyte_split_between_chunks() {
        let payload = "data: {\"choices\":[{\"delta\":{\"content\":\"caf\u{e9}\"}}]}\n";
        let bytes = payload.as_bytes();
        let split = payload.find('\u{e9}').unwrap() + 1;

        let chunks: Vec<std::result::Result<Vec<u8>, std::io::Error>> =
            vec![Ok(bytes[..split].to_vec()), Ok(bytes[split..].to_vec())];
        let stream = sse_deltas(stream::iter(chunks), openai_delta);

        let deltas: Vec<String> = collect(stream).await.into_iter().map(|d| d.unwrap()).collect();
        assert_eq!(deltas, vec!["caf\u{e9}"]);
    }

    #[tokio::test]
    async fn test_error_payload_ends_stream() {
        let stream = sse_deltas(
            body(&[
                "data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n",
                "data: {\"type\":\"error\",\"error\":{\"message\":\"overloaded\"}}\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"never\"}}]}\n",
            ]),
            openai_delta,
        );

        let items = collect(stream).await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "partial");
        assert_eq!(items[1].as_ref().unwrap_err().to_string(), "overloaded");
    }
}
