//! Live control sessions, keyed by the tunnel segment they serve.
//!
//! A client that reconnects supersedes its previous session: the old entry
//! is closed and replaced, so at most one session per connection key is ever
//! live. Adapters publish through the store; no session means the peer is
//! offline and the publish fails immediately.

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;

use crate::control_listener::SessionPublisher;
use protocol::ConnectionKey;

struct SessionEntry {
    session_id: u64,
    publisher: SessionPublisher,
}

#[derive(Clone, Default)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<ConnectionKey, SessionEntry>>>,
}

impl SessionStore {
    pub fn add(&self, key: ConnectionKey, session_id: u64, publisher: SessionPublisher) {
        if let Some(old) = self.sessions.write().insert(key, SessionEntry { session_id, publisher }) {
            log::warn!("[SessionStore] new session for {key}, old session {} will close", old.session_id);
            old.publisher.close();
        }
    }

    pub fn get(&self, key: &ConnectionKey) -> Option<SessionPublisher> {
        self.sessions.read().get(key).map(|entry| entry.publisher.clone())
    }

    /// Removes the entry only if it still belongs to `session_id`; a
    /// superseded session must not evict its replacement.
    pub fn remove(&self, key: &ConnectionKey, session_id: u64) -> bool {
        let mut sessions = self.sessions.write();
        if let Some(entry) = sessions.get(key) {
            if entry.session_id == session_id {
                sessions.remove(key);
                return true;
            }
        }
        false
    }
}
