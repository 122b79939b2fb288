use anyhow::Result;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::chat::Message;
use crate::engine::{ChatChunk, EngineClient};

/// Events published by background engine tasks to the UI loop. The loop is
/// the single reader; tasks never touch app state directly.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Latest human-readable model download status.
    LoadProgress(String),
    /// Load attempt ended; `Err` carries the failure message.
    LoadFinished(Result<(), String>),
    /// Cumulative generated text so far. Receivers replace, not append.
    Update(String),
    /// Stream exhausted; `text` is the engine's canonical final message.
    Finished {
        text: String,
        stats: Option<String>,
    },
    /// Generation failed. Fragments already delivered stay visible.
    Failed(String),
}

/// Drives one request/response cycle over an already-open fragment stream.
/// Emits zero or more `Update`s, then exactly one of `Finished`/`Failed`.
pub async fn run_generation<S>(mut chunks: S, tx: &mpsc::UnboundedSender<EngineEvent>)
where
    S: Stream<Item = Result<ChatChunk>> + Unpin,
{
    let mut buffer = String::new();
    let mut stats = None;

    loop {
        match chunks.next().await {
            Some(Ok(chunk)) => {
                if !chunk.content.is_empty() {
                    buffer.push_str(&chunk.content);
                    let _ = tx.send(EngineEvent::Update(buffer.clone()));
                }
                if chunk.done {
                    stats = chunk.stats;
                    break;
                }
            }
            Some(Err(e)) => {
                debug!(error = %e, "generation failed mid-stream");
                let _ = tx.send(EngineEvent::Failed(e.to_string()));
                return;
            }
            None => break,
        }
    }

    debug!(chars = buffer.len(), "generation finished");
    let _ = tx.send(EngineEvent::Finished {
        text: buffer,
        stats: stats.map(|s| s.text()),
    });
}

/// Fire-and-forget entry point for the view shell: opens the completion and
/// consumes it on a background task. Submission failures take the same
/// terminal path as mid-stream ones.
pub fn spawn_generation(
    engine: EngineClient,
    model: String,
    messages: Vec<Message>,
    tx: mpsc::UnboundedSender<EngineEvent>,
) {
    tokio::spawn(async move {
        match engine.chat_stream(&model, &messages).await {
            Ok(stream) => run_generation(stream.chunks(), &tx).await,
            Err(e) => {
                let _ = tx.send(EngineEvent::Failed(e.to_string()));
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use futures_util::stream;

    fn fragment(content: &str) -> Result<ChatChunk> {
        Ok(ChatChunk {
            content: content.to_string(),
            done: false,
            stats: None,
        })
    }

    fn terminal() -> Result<ChatChunk> {
        Ok(ChatChunk {
            content: String::new(),
            done: true,
            stats: None,
        })
    }

    async fn drive(chunks: Vec<Result<ChatChunk>>) -> Vec<EngineEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        run_generation(stream::iter(chunks), &tx).await;
        drop(tx);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn updates_carry_cumulative_text_then_finish() {
        let events = drive(vec![fragment("He"), fragment("llo"), terminal()]).await;

        assert_eq!(
            events,
            vec![
                EngineEvent::Update("He".to_string()),
                EngineEvent::Update("Hello".to_string()),
                EngineEvent::Finished {
                    text: "Hello".to_string(),
                    stats: None,
                },
            ]
        );
    }

    #[tokio::test]
    async fn failure_mid_stream_keeps_delivered_fragments() {
        let events = drive(vec![fragment("He"), Err(anyhow!("engine crashed"))]).await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0], EngineEvent::Update("He".to_string()));
        assert_eq!(events[1], EngineEvent::Failed("engine crashed".to_string()));
    }

    #[tokio::test]
    async fn empty_stream_still_finishes_exactly_once() {
        let events = drive(vec![]).await;
        assert_eq!(
            events,
            vec![EngineEvent::Finished {
                text: String::new(),
                stats: None,
            }]
        );
    }

    #[tokio::test]
    async fn exactly_one_terminal_event() {
        for chunks in [
            vec![fragment("a"), terminal()],
            vec![Err(anyhow!("boom"))],
            vec![fragment("a"), fragment("b"), Err(anyhow!("boom"))],
            vec![terminal()],
        ] {
            let events = drive(chunks).await;
            let terminals = events
                .iter()
                .filter(|e| {
                    matches!(e, EngineEvent::Finished { .. } | EngineEvent::Failed(_))
                })
                .count();
            assert_eq!(terminals, 1);
            assert!(matches!(
                events.last().unwrap(),
                EngineEvent::Finished { .. } | EngineEvent::Failed(_)
            ));
        }
    }

    #[tokio::test]
    async fn terminal_chunk_stats_are_formatted() {
        use crate::engine::RuntimeStats;

        let chunks = vec![
            fragment("hi"),
            Ok(ChatChunk {
                content: String::new(),
                done: true,
                stats: Some(RuntimeStats {
                    prompt_tokens: 10,
                    prompt_duration_ns: 1_000_000_000,
                    tokens: 30,
                    duration_ns: 2_000_000_000,
                }),
            }),
        ];
        let events = drive(chunks).await;

        match events.last().unwrap() {
            EngineEvent::Finished { text, stats } => {
                assert_eq!(text, "hi");
                assert_eq!(
                    stats.as_deref(),
                    Some("prefill: 10.0 tok/s, decode: 15.0 tok/s")
                );
            }
            other => panic!("expected Finished, got {:?}", other),
        }
    }
}
