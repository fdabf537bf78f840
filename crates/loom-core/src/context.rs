//! Per-bead conversation contexts with token budgeting.
//!
//! Each bead carries an ordered message list that is replayed into every
//! provider call. When the estimated token count exceeds the budget the
//! middle of the conversation is replaced with a single summary placeholder;
//! the system message and the most recent messages always survive.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{ChatMessage, MessageRole};

/// Placeholder inserted where truncated middle content used to be.
pub const TRUNCATION_PLACEHOLDER: &str = "[earlier conversation truncated]";

// ---------------------------------------------------------------------------
// ConversationContext
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationContext {
    pub bead_id: String,
    pub messages: Vec<ChatMessage>,
    pub token_count: usize,
    pub updated_at: DateTime<Utc>,
}

impl ConversationContext {
    pub fn new(bead_id: impl Into<String>) -> Self {
        Self {
            bead_id: bead_id.into(),
            messages: Vec::new(),
            token_count: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.token_count += message.token_estimate();
        self.messages.push(message);
        self.updated_at = Utc::now();
    }

    /// Truncate to fit `budget` tokens.
    ///
    /// Keeps the leading system message (when present) and the most recent
    /// messages that fit, replacing the removed middle with one placeholder.
    pub fn truncate_to_budget(&mut self, budget: usize) {
        if self.token_count <= budget {
            return;
        }

        let system: Option<ChatMessage> = self
            .messages
            .first()
            .filter(|m| m.role == MessageRole::System)
            .cloned();
        let system_tokens = system.as_ref().map(|m| m.token_estimate()).unwrap_or(0);
        let placeholder = ChatMessage::system(TRUNCATION_PLACEHOLDER);
        let reserved = system_tokens + placeholder.token_estimate();

        // Walk backwards collecting the newest messages that still fit.
        let mut kept: Vec<ChatMessage> = Vec::new();
        let mut used = reserved;
        let tail_start = usize::from(system.is_some());
        for msg in self.messages[tail_start..].iter().rev() {
            let cost = msg.token_estimate();
            if used + cost > budget {
                break;
            }
            used += cost;
            kept.push(msg.clone());
        }
        kept.reverse();

        let dropped = self.messages.len() - kept.len() - usize::from(system.is_some());
        let mut rebuilt = Vec::with_capacity(kept.len() + 2);
        if let Some(system) = system {
            rebuilt.push(system);
        }
        if dropped > 0 {
            rebuilt.push(placeholder);
        }
        rebuilt.extend(kept);

        debug!(
            bead_id = %self.bead_id,
            dropped,
            token_count = used,
            "conversation truncated to budget"
        );
        self.messages = rebuilt;
        self.token_count = self.messages.iter().map(|m| m.token_estimate()).sum();
    }
}

// ---------------------------------------------------------------------------
// ContextStore
// ---------------------------------------------------------------------------

/// In-memory owner of conversation contexts with a TTL sweep.
pub struct ContextStore {
    contexts: Mutex<HashMap<String, ConversationContext>>,
    token_budget: usize,
    ttl: Duration,
}

impl ContextStore {
    pub fn new(token_budget: usize, ttl: Duration) -> Self {
        Self {
            contexts: Mutex::new(HashMap::new()),
            token_budget,
            ttl,
        }
    }

    /// Append a message to the bead's conversation, truncating to budget.
    pub fn append(&self, bead_id: &str, message: ChatMessage) {
        let mut contexts = self.contexts.lock().expect("context map poisoned");
        let ctx = contexts
            .entry(bead_id.to_string())
            .or_insert_with(|| ConversationContext::new(bead_id));
        ctx.push(message);
        ctx.truncate_to_budget(self.token_budget);
    }

    /// Snapshot of the bead's messages, oldest first.
    pub fn messages(&self, bead_id: &str) -> Vec<ChatMessage> {
        let contexts = self.contexts.lock().expect("context map poisoned");
        contexts
            .get(bead_id)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    pub fn get(&self, bead_id: &str) -> Option<ConversationContext> {
        let contexts = self.contexts.lock().expect("context map poisoned");
        contexts.get(bead_id).cloned()
    }

    pub fn remove(&self, bead_id: &str) {
        let mut contexts = self.contexts.lock().expect("context map poisoned");
        contexts.remove(bead_id);
    }

    /// Drop contexts idle longer than the TTL. Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::hours(24));
        let mut contexts = self.contexts.lock().expect("context map poisoned");
        let before = contexts.len();
        contexts.retain(|_, c| c.updated_at > cutoff);
        before - contexts.len()
    }

    pub fn len(&self) -> usize {
        self.contexts.lock().expect("context map poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_read_back() {
        let store = ContextStore::new(10_000, Duration::from_secs(3600));
        store.append("b1", ChatMessage::system("persona"));
        store.append("b1", ChatMessage::user("do the thing"));
        let msgs = store.messages("b1");
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, MessageRole::System);
    }

    #[test]
    fn truncation_keeps_system_and_tail() {
        let mut ctx = ConversationContext::new("b1");
        ctx.push(ChatMessage::system("system prompt here"));
        for i in 0..20 {
            ctx.push(ChatMessage::user(format!("message number {i} {}", "x".repeat(100))));
        }
        let last = ctx.messages.last().unwrap().content.clone();

        ctx.truncate_to_budget(120);

        assert_eq!(ctx.messages[0].role, MessageRole::System);
        assert_eq!(ctx.messages[0].content, "system prompt here");
        assert_eq!(ctx.messages[1].content, TRUNCATION_PLACEHOLDER);
        assert_eq!(ctx.messages.last().unwrap().content, last);
        assert!(ctx.token_count <= 120 + ctx.messages[0].token_estimate());
    }

    #[test]
    fn truncation_inserts_single_placeholder() {
        let mut ctx = ConversationContext::new("b1");
        ctx.push(ChatMessage::system("sys"));
        for _ in 0..50 {
            ctx.push(ChatMessage::user("y".repeat(200)));
        }
        ctx.truncate_to_budget(200);
        let placeholders = ctx
            .messages
            .iter()
            .filter(|m| m.content == TRUNCATION_PLACEHOLDER)
            .count();
        assert_eq!(placeholders, 1);
    }

    #[test]
    fn under_budget_is_untouched() {
        let mut ctx = ConversationContext::new("b1");
        ctx.push(ChatMessage::user("short"));
        let before = ctx.messages.clone();
        ctx.truncate_to_budget(1000);
        assert_eq!(ctx.messages.len(), before.len());
    }

    #[test]
    fn sweep_removes_idle_contexts() {
        let store = ContextStore::new(1000, Duration::from_millis(0));
        store.append("b1", ChatMessage::user("hello"));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.sweep_expired(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn remove_drops_context() {
        let store = ContextStore::new(1000, Duration::from_secs(60));
        store.append("b1", ChatMessage::user("hello"));
        store.remove("b1");
        assert!(store.get("b1").is_none());
    }
}
