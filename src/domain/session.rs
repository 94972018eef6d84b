//! Call sessions held by the call queue

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt::Debug;
use std::net::SocketAddr;

/// Anything the call queue can hold: it only needs a stable identifier.
pub trait Session: Debug + Send + Sync {
    fn id(&self) -> &str;
}

/// Signaling state of a queued call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallSessionState {
    /// Admitted and waiting for its turn
    Waiting,
    /// Installed in the current slot
    Active,
    /// Hung up or evicted
    Terminated,
}

/// A call admitted by the proxy.
///
/// The id is the SIP Call-ID of the dialog; `source` is the transport
/// address the INVITE arrived from.
#[derive(Debug)]
pub struct CallSession {
    id: String,
    caller: String,
    callee: String,
    from_tag: Option<String>,
    source: SocketAddr,
    created_at: DateTime<Utc>,
    state: RwLock<CallSessionState>,
}

impl CallSession {
    pub fn new(
        id: impl Into<String>,
        caller: impl Into<String>,
        callee: impl Into<String>,
        from_tag: Option<String>,
        source: SocketAddr,
    ) -> Self {
        Self {
            id: id.into(),
            caller: caller.into(),
            callee: callee.into(),
            from_tag,
            source,
            created_at: Utc::now(),
            state: RwLock::new(CallSessionState::Waiting),
        }
    }

    pub fn caller(&self) -> &str {
        &self.caller
    }

    pub fn callee(&self) -> &str {
        &self.callee
    }

    pub fn from_tag(&self) -> Option<&str> {
        self.from_tag.as_deref()
    }

    pub fn source(&self) -> SocketAddr {
        self.source
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> CallSessionState {
        *self.state.read()
    }

    pub fn set_state(&self, state: CallSessionState) {
        *self.state.write() = state;
    }
}

impl Session for CallSession {
    fn id(&self) -> &str {
        &self.id
    }
}

impl PartialEq for CallSession {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.caller == other.caller
            && self.callee == other.callee
            && self.from_tag == other.from_tag
            && self.source == other.source
            && self.created_at == other.created_at
            && self.state() == other.state()
    }
}
