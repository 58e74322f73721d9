use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::protocol::openai_chat::OpenAiMessage;

/// Conversation history for one session id.
#[derive(Debug)]
pub struct Session {
    id: String,
    messages: RwLock<Vec<OpenAiMessage>>,
}

impl Session {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            messages: RwLock::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn clear(&self) {
        self.messages.write().clear();
    }

    pub fn add_system_message(&self, content: impl Into<String>) {
        self.add_message(OpenAiMessage::text("system", content));
    }

    pub fn add_user_message(&self, content: impl Into<String>) {
        self.add_message(OpenAiMessage::text("user", content));
    }

    pub fn add_assistant_message(&self, content: impl Into<String>) {
        self.add_message(OpenAiMessage::text("assistant", content));
    }

    /// Append a structured message (tool calls, tool results, named roles).
    pub fn add_message(&self, message: OpenAiMessage) {
        self.messages.write().push(message);
    }

    /// Swap the whole history in one write.
    pub fn replace(&self, messages: Vec<OpenAiMessage>) {
        *self.messages.write() = messages;
    }

    /// Snapshot of the history; the lock is released before returning.
    #[must_use]
    pub fn messages(&self) -> Vec<OpenAiMessage> {
        self.messages.read().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.read().is_empty()
    }
}

/// Keyed session storage shared by all requests.
pub trait SessionStore: Send + Sync {
    /// Fetch the session for `id`, creating an empty one on first use.
    fn get_or_create(&self, id: &str) -> Arc<Session>;

    fn remove(&self, id: &str) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<FxHashMap<String, Arc<Session>>>,
}

impl InMemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for InMemorySessionStore {
    fn get_or_create(&self, id: &str) -> Arc<Session> {
        if let Some(session) = self.sessions.read().get(id) {
            return Arc::clone(session);
        }
        let mut sessions = self.sessions.write();
        Arc::clone(
            sessions
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Session::new(id))),
        )
    }

    fn remove(&self, id: &str) -> bool {
        self.sessions.write().remove(id).is_some()
    }

    fn len(&self) -> usize {
        self.sessions.read().len()
    }
}
