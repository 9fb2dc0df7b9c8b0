//! Allocation-wide token store shared between the identity hook, the renewal
//! loop and other allocation-level consumers.

use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::broadcast;
use tracing::trace;
use widr_common::AllocationId;

const DEFAULT_BUFFER: usize = 256;

/// Why a token changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    /// Published by the identity hook during startup.
    Initial,
    /// Replaced by the renewal loop.
    Renewed,
}

/// Change notification. Carries no token material; read the store instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenUpdate {
    pub task: String,
    pub identity: String,
    pub kind: UpdateKind,
}

/// Current tokens of one allocation, keyed by task then identity name.
///
/// Safe for concurrent use: writes take a short lock and never await.
pub struct SharedTokenStore {
    alloc_id: AllocationId,
    tokens: RwLock<HashMap<String, HashMap<String, String>>>,
    updates: broadcast::Sender<TokenUpdate>,
}

impl SharedTokenStore {
    pub fn new(alloc_id: AllocationId) -> Self {
        let (updates, _) = broadcast::channel(DEFAULT_BUFFER);
        Self {
            alloc_id,
            tokens: RwLock::new(HashMap::new()),
            updates,
        }
    }

    pub fn alloc_id(&self) -> &AllocationId {
        &self.alloc_id
    }

    /// Replace every token of `task` with `tokens`.
    pub fn publish(&self, task: &str, tokens: HashMap<String, String>) {
        let names: Vec<String> = tokens.keys().cloned().collect();
        self.tokens
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task.to_string(), tokens);

        trace!(alloc_id = %self.alloc_id, task, count = names.len(), "Published task identities");
        for identity in names {
            self.notify(task, identity, UpdateKind::Initial);
        }
    }

    /// Set a single renewed token.
    pub fn update(&self, task: &str, identity: &str, token: &str) {
        self.tokens
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(task.to_string())
            .or_default()
            .insert(identity.to_string(), token.to_string());
        self.notify(task, identity.to_string(), UpdateKind::Renewed);
    }

    pub fn get(&self, task: &str, identity: &str) -> Option<String> {
        self.tokens
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(task)
            .and_then(|m| m.get(identity))
            .cloned()
    }

    /// Snapshot of all tokens for `task`.
    pub fn task_tokens(&self, task: &str) -> HashMap<String, String> {
        self.tokens
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(task)
            .cloned()
            .unwrap_or_default()
    }

    /// Subscribe to token change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<TokenUpdate> {
        self.updates.subscribe()
    }

    fn notify(&self, task: &str, identity: String, kind: UpdateKind) {
        // No subscribers is fine.
        let _ = self.updates.send(TokenUpdate {
            task: task.to_string(),
            identity,
            kind,
        });
    }
}

impl std::fmt::Debug for SharedTokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedTokenStore")
            .field("alloc_id", &self.alloc_id)
            .finish_non_exhaustive()
    }
}
