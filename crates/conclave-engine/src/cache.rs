use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use tracing::debug;

use conclave_core::config::TeamConfig;
use conclave_core::types::SessionId;

use crate::graph::GraphEngine;

/// Fingerprint of everything that requires a rebuilt engine when it
/// changes: the roster and all engine-facing settings.
pub fn config_fingerprint(config: &TeamConfig) -> u64 {
    let mut hasher = DefaultHasher::new();
    // Serialized form; TeamConfig carries floats nowhere, so this is stable.
    serde_json::to_string(config)
        .unwrap_or_default()
        .hash(&mut hasher);
    hasher.finish()
}

/// Per-session engine cache. An engine is rebuilt only when its team
/// config fingerprint changes; otherwise invocations reuse the cached
/// instance and its breaker/budget state.
#[derive(Default)]
pub struct GraphCache {
    entries: Mutex<HashMap<SessionId, (u64, Arc<GraphEngine>)>>,
}

impl GraphCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the session's engine, building one when absent or stale.
    pub fn get_or_build<F>(&self, session: &SessionId, config: &TeamConfig, build: F) -> Arc<GraphEngine>
    where
        F: FnOnce() -> Arc<GraphEngine>,
    {
        let fingerprint = config_fingerprint(config);
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some((cached_fp, engine)) = entries.get(session) {
            if *cached_fp == fingerprint {
                return Arc::clone(engine);
            }
            debug!(session = %session, "Team config changed, rebuilding engine");
        }

        let engine = build();
        entries.insert(session.clone(), (fingerprint, Arc::clone(&engine)));
        engine
    }

    pub fn evict(&self, session: &SessionId) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(session);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
