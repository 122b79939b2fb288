use anyhow::{anyhow, Result};
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chat::Message;

/// Sampling parameters are fixed by this layer, not exposed as configuration.
pub const TEMPERATURE: f32 = 1.0;
pub const TOP_P: f32 = 1.0;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
    options: SamplingOptions,
}

#[derive(Serialize)]
struct SamplingOptions {
    temperature: f32,
    top_p: f32,
}

#[derive(Deserialize)]
struct ChatLine {
    #[serde(default)]
    message: Option<ChatLineMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    prompt_eval_duration: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
    #[serde(default)]
    eval_duration: Option<u64>,
}

#[derive(Deserialize)]
struct ChatLineMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct PullLine {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    completed: Option<u64>,
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Serialize)]
struct PullRequest<'a> {
    name: &'a str,
    stream: bool,
}

#[derive(Deserialize)]
struct TagsModel {
    name: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    models: Vec<TagsModel>,
}

/// One incremental piece of a streamed completion. The terminal chunk carries
/// the engine's runtime counters.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatChunk {
    pub content: String,
    pub done: bool,
    pub stats: Option<RuntimeStats>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuntimeStats {
    pub prompt_tokens: u64,
    pub prompt_duration_ns: u64,
    pub tokens: u64,
    pub duration_ns: u64,
}

impl RuntimeStats {
    /// Human-readable throughput summary for the status line.
    pub fn text(&self) -> String {
        format!(
            "prefill: {:.1} tok/s, decode: {:.1} tok/s",
            tokens_per_sec(self.prompt_tokens, self.prompt_duration_ns),
            tokens_per_sec(self.tokens, self.duration_ns),
        )
    }
}

fn tokens_per_sec(tokens: u64, duration_ns: u64) -> f64 {
    if duration_ns == 0 {
        return 0.0;
    }
    tokens as f64 / (duration_ns as f64 / 1e9)
}

/// Accumulates raw bytes and drains complete newline-delimited records.
/// NDJSON lines can be split across HTTP chunks, so a carry buffer is needed.
struct LineBuffer {
    carry: Vec<u8>,
}

impl LineBuffer {
    fn new() -> Self {
        Self { carry: Vec::new() }
    }

    fn push(&mut self, bytes: &[u8]) {
        self.carry.extend_from_slice(bytes);
    }

    fn next_line(&mut self) -> Option<String> {
        let pos = self.carry.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.carry.drain(..=pos).collect();
        Some(String::from_utf8_lossy(&line).trim().to_string())
    }

    /// Whatever is left once the byte stream ends (a final unterminated line).
    fn take_remainder(&mut self) -> Option<String> {
        if self.carry.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.carry);
        let line = String::from_utf8_lossy(&rest).trim().to_string();
        (!line.is_empty()).then_some(line)
    }
}

/// Handle to the inference engine. One per session, cheap to clone so
/// background tasks can hold their own copy.
#[derive(Clone)]
pub struct EngineClient {
    client: Client,
    base_url: String,
}

impl EngineClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// The engine's model catalog.
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.base_url);

        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(anyhow!("Failed to list models: {}", response.status()));
        }

        let tags: TagsResponse = response.json().await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    /// Loads a model into the engine, republishing each progress report
    /// through the callback as human-readable status text.
    pub async fn load_model(&self, model: &str, mut on_progress: impl FnMut(String)) -> Result<()> {
        let url = format!("{}/api/pull", self.base_url);
        debug!(model, "loading model");

        let request = PullRequest {
            name: model,
            stream: true,
        };

        let response = self.client.post(&url).json(&request).send().await?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "Model load failed with status: {}. Make sure the engine is running with: ollama serve",
                response.status()
            ));
        }

        let mut stream = response.bytes_stream();
        let mut lines = LineBuffer::new();
        while let Some(chunk) = stream.next().await {
            lines.push(&chunk?);
            while let Some(line) = lines.next_line() {
                if line.is_empty() {
                    continue;
                }
                let report: PullLine = serde_json::from_str(&line)?;
                if let Some(err) = report.error {
                    return Err(anyhow!(err));
                }
                if let Some(text) = progress_text(&report) {
                    on_progress(text);
                }
            }
        }
        debug!(model, "model loaded");

        Ok(())
    }

    /// Opens a streaming completion over the full conversation. The returned
    /// stream is finite and non-restartable: fragments in engine order, then
    /// a terminal chunk with `done` set.
    pub async fn chat_stream(&self, model: &str, messages: &[Message]) -> Result<ChatStream> {
        let url = format!("{}/api/chat", self.base_url);
        debug!(model, turns = messages.len(), "starting completion");

        let request = ChatRequest {
            model,
            messages,
            stream: true,
            options: SamplingOptions {
                temperature: TEMPERATURE,
                top_p: TOP_P,
            },
        };

        let response = self.client.post(&url).json(&request).send().await?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "Completion request failed with status: {}",
                response.status()
            ));
        }

        Ok(ChatStream {
            bytes: response.bytes_stream().boxed(),
            lines: LineBuffer::new(),
            finished: false,
        })
    }
}

fn progress_text(report: &PullLine) -> Option<String> {
    let status = report.status.as_deref()?;
    match (report.completed, report.total) {
        (Some(completed), Some(total)) if total > 0 => {
            let percent = completed as f64 / total as f64 * 100.0;
            Some(format!("{}: {:.0}%", status, percent))
        }
        _ => Some(status.to_string()),
    }
}

pub struct ChatStream {
    bytes: BoxStream<'static, reqwest::Result<Bytes>>,
    lines: LineBuffer,
    finished: bool,
}

impl ChatStream {
    async fn next_chunk(&mut self) -> Result<Option<ChatChunk>> {
        if self.finished {
            return Ok(None);
        }
        loop {
            if let Some(line) = self.lines.next_line() {
                if line.is_empty() {
                    continue;
                }
                return self.parse_line(&line).map(Some);
            }
            match self.bytes.next().await {
                Some(chunk) => self.lines.push(&chunk?),
                None => {
                    self.finished = true;
                    return match self.lines.take_remainder() {
                        Some(line) => self.parse_line(&line).map(Some),
                        None => Ok(None),
                    };
                }
            }
        }
    }

    fn parse_line(&mut self, line: &str) -> Result<ChatChunk> {
        let parsed: ChatLine = serde_json::from_str(line)?;
        if let Some(err) = parsed.error {
            self.finished = true;
            return Err(anyhow!(err));
        }
        if parsed.done {
            self.finished = true;
        }
        let stats = parsed.done.then(|| RuntimeStats {
            prompt_tokens: parsed.prompt_eval_count.unwrap_or(0),
            prompt_duration_ns: parsed.prompt_eval_duration.unwrap_or(0),
            tokens: parsed.eval_count.unwrap_or(0),
            duration_ns: parsed.eval_duration.unwrap_or(0),
        });
        Ok(ChatChunk {
            content: parsed.message.map(|m| m.content).unwrap_or_default(),
            done: parsed.done,
            stats,
        })
    }

    /// Lazy chunk sequence for the generation adapter.
    pub fn chunks(self) -> impl Stream<Item = Result<ChatChunk>> + Unpin {
        Box::pin(futures_util::stream::try_unfold(self, |mut s| async move {
            Ok::<_, anyhow::Error>(s.next_chunk().await?.map(|chunk| (chunk, s)))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_handles_lines_split_across_chunks() {
        let mut lines = LineBuffer::new();
        lines.push(b"{\"a\":");
        assert_eq!(lines.next_line(), None);
        lines.push(b"1}\n{\"b\":2}\n{\"c\"");
        assert_eq!(lines.next_line(), Some("{\"a\":1}".to_string()));
        assert_eq!(lines.next_line(), Some("{\"b\":2}".to_string()));
        assert_eq!(lines.next_line(), None);
        assert_eq!(lines.take_remainder(), Some("{\"c\"".to_string()));
        assert_eq!(lines.take_remainder(), None);
    }

    #[test]
    fn chat_line_parses_fragment_and_terminal_chunk() {
        let mut stream = ChatStream {
            bytes: futures_util::stream::empty().boxed(),
            lines: LineBuffer::new(),
            finished: false,
        };

        let chunk = stream
            .parse_line(r#"{"message":{"role":"assistant","content":"He"},"done":false}"#)
            .unwrap();
        assert_eq!(chunk.content, "He");
        assert!(!chunk.done);
        assert!(chunk.stats.is_none());

        let last = stream
            .parse_line(
                r#"{"message":{"role":"assistant","content":""},"done":true,"eval_count":20,"eval_duration":2000000000,"prompt_eval_count":5,"prompt_eval_duration":500000000}"#,
            )
            .unwrap();
        assert!(last.done);
        let stats = last.stats.unwrap();
        assert_eq!(stats.tokens, 20);
        assert_eq!(stats.text(), "prefill: 10.0 tok/s, decode: 10.0 tok/s");
    }

    #[test]
    fn engine_error_line_becomes_an_error() {
        let mut stream = ChatStream {
            bytes: futures_util::stream::empty().boxed(),
            lines: LineBuffer::new(),
            finished: false,
        };
        let err = stream
            .parse_line(r#"{"error":"model not found"}"#)
            .unwrap_err();
        assert_eq!(err.to_string(), "model not found");
    }

    #[test]
    fn progress_text_includes_percentage_when_known() {
        let report: PullLine =
            serde_json::from_str(r#"{"status":"downloading weights","completed":45,"total":100}"#)
                .unwrap();
        assert_eq!(
            progress_text(&report),
            Some("downloading weights: 45%".to_string())
        );

        let bare: PullLine = serde_json::from_str(r#"{"status":"verifying digest"}"#).unwrap();
        assert_eq!(progress_text(&bare), Some("verifying digest".to_string()));
    }

    #[test]
    fn stats_text_handles_zero_duration() {
        let stats = RuntimeStats {
            prompt_tokens: 5,
            prompt_duration_ns: 0,
            tokens: 0,
            duration_ns: 0,
        };
        assert_eq!(stats.text(), "prefill: 0.0 tok/s, decode: 0.0 tok/s");
    }
}
