use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use conclave_core::config::CompactionConfig;
use conclave_core::event::{EventSink, StreamEvent};
use conclave_core::traits::ChatModel;
use conclave_core::types::ChatMessage;

const SUMMARY_PROMPT: &str = "Summarize the following conversation excerpt in a few sentences. \
Preserve decisions, open questions, and who said what. Reply with the summary only.";

/// Summarizes messages that fell out of the history window into a single
/// synthetic turn, so long-running sessions keep early context in
/// compressed form. Failures fall back to plain trimming.
pub struct Compactor {
    config: CompactionConfig,
    model: Arc<dyn ChatModel>,
    // Summaries keyed by a hash of the dropped content, so repeated
    // invocations against the same prefix don't re-summarize.
    cache: Mutex<HashMap<u64, String>>,
}

impl Compactor {
    pub fn new(config: CompactionConfig, model: Arc<dyn ChatModel>) -> Self {
        Self {
            config,
            model,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Produce a synthetic summary turn for `dropped`, or None when
    /// compaction is disabled, the drop is too small, or the summary
    /// model fails.
    pub async fn compact(
        &self,
        agent_id: &str,
        dropped: &[ChatMessage],
        sink: &EventSink,
    ) -> Option<ChatMessage> {
        if !self.config.enabled || dropped.len() < self.config.min_dropped_messages {
            if !dropped.is_empty() {
                sink.emit(StreamEvent::CompactionStatus {
                    agent_id: agent_id.to_string(),
                    dropped_messages: dropped.len(),
                    summarized: false,
                })
                .await;
            }
            return None;
        }

        let key = content_hash(dropped);
        if let Some(cached) = self.cache.lock().await.get(&key).cloned() {
            debug!(agent_id = %agent_id, "Reusing cached compaction summary");
            sink.emit(StreamEvent::CompactionStatus {
                agent_id: agent_id.to_string(),
                dropped_messages: dropped.len(),
                summarized: true,
            })
            .await;
            return Some(ChatMessage::summary(cached));
        }

        let transcript: String = dropped
            .iter()
            .map(|m| format!("{}: {}\n", m.speaker(), m.text))
            .collect();

        match self.model.invoke(SUMMARY_PROMPT, &transcript).await {
            Ok(summary) => {
                let summary = summary.trim().to_string();
                self.cache.lock().await.insert(key, summary.clone());
                sink.emit(StreamEvent::CompactionStatus {
                    agent_id: agent_id.to_string(),
                    dropped_messages: dropped.len(),
                    summarized: true,
                })
                .await;
                Some(ChatMessage::summary(summary))
            }
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "Compaction failed, trimming without summary");
                sink.emit(StreamEvent::CompactionStatus {
                    agent_id: agent_id.to_string(),
                    dropped_messages: dropped.len(),
                    summarized: false,
                })
                .await;
                None
            }
        }
    }
}

fn content_hash(messages: &[ChatMessage]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for m in messages {
        m.speaker().hash(&mut hasher);
        m.text.hash(&mut hasher);
    }
    hasher.finish()
}
