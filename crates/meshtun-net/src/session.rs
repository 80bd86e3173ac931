//! Per peer-pair session state
//!
//! Sessions are keyed by the ordered pair (source, destination). Traffic we
//! send to B lives under `local + B`, traffic B sends us under `B + local`.

use crate::crypto::SessionCipher;
use crate::transport::StreamHandle;
use meshtun_core::{PeerId, WireHeader};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Direction-sensitive session key
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionKey(String);

impl SessionKey {
    /// Key for frames travelling from `src` to `dst`
    pub fn new(src: &PeerId, dst: &PeerId) -> Self {
        let mut key = src.to_hex();
        key.push_str(&dst.to_hex());
        Self(key)
    }

    /// Key for frames we send to `remote`
    pub fn outbound(local: &PeerId, remote: &PeerId) -> Self {
        Self::new(local, remote)
    }

    /// Key for frames `remote` sends to us
    pub fn inbound(local: &PeerId, remote: &PeerId) -> Self {
        Self::new(remote, local)
    }

    /// Key for the direction a frame header describes
    pub fn for_header(header: &WireHeader) -> Self {
        Self::new(&header.src, &header.dst)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey({}..)", &self.0[..self.0.len().min(16)])
    }
}

/// Stream plus the negotiated cipher, once there is one
#[derive(Clone, Debug)]
pub struct Session {
    pub stream: Arc<StreamHandle>,
    pub cipher: Option<Arc<SessionCipher>>,
}

impl Session {
    pub fn is_ready(&self) -> bool {
        self.cipher.is_some()
    }
}

/// Concurrent session store behind a single coarse lock.
///
/// Entries change at session setup/teardown rate, not per packet.
#[derive(Default)]
pub struct SessionMap {
    sessions: Mutex<HashMap<SessionKey, Session>>,
}

impl SessionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &SessionKey) -> Option<Session> {
        self.sessions.lock().get(key).cloned()
    }

    /// Register a stream without a cipher.
    ///
    /// An entry whose cipher is already negotiated is left alone and `false`
    /// is returned. A pending entry has its stream replaced.
    pub fn create(&self, key: SessionKey, stream: Arc<StreamHandle>) -> bool {
        let mut sessions = self.sessions.lock();
        if sessions.get(&key).is_some_and(Session::is_ready) {
            return false;
        }
        sessions.insert(
            key,
            Session {
                stream,
                cipher: None,
            },
        );
        true
    }

    /// Register a stream together with its negotiated cipher
    pub fn upgrade(&self, key: SessionKey, stream: Arc<StreamHandle>, cipher: Arc<SessionCipher>) {
        self.sessions.lock().insert(
            key,
            Session {
                stream,
                cipher: Some(cipher),
            },
        );
    }

    pub fn replace(&self, key: SessionKey, session: Session) -> Option<Session> {
        self.sessions.lock().insert(key, session)
    }

    pub fn delete(&self, key: &SessionKey) -> Option<Session> {
        self.sessions.lock().remove(key)
    }

    /// Delete `key` only if it is still bound to the stream `stream_id`.
    pub fn delete_stream(&self, key: &SessionKey, stream_id: u64) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get(key) {
            Some(session) if session.stream.id() == stream_id => {
                sessions.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Delete every entry bound to `stream_id`, returning the removed keys.
    pub fn purge_stream(&self, stream_id: u64) -> Vec<SessionKey> {
        let mut removed = Vec::new();
        self.sessions.lock().retain(|key, session| {
            if session.stream.id() == stream_id {
                removed.push(key.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Number of sessions with a negotiated cipher
    pub fn ready_count(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|s| s.is_ready())
            .count()
    }
}
