// Call ledger: bookkeeping for in-flight logical operations
//
// Every asynchronous operation gets one entry keyed by (category, target,
// method). The key is unique among live entries and the id is unique among
// live entries; both are dropped together on destroy.
use connman_proto::errors::AGENT_CANCELED;
use connman_proto::MethodReply;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use crate::call::{Category, PendingCall};
use crate::event::ConnectCallback;
use crate::{ConnmanError, Result};

/// Logical method tag of an asynchronous service connect.
pub const CONNECT_SERVICE: &str = "connect_service";

/// Largest id handed out before wrapping back to 1.
const MAX_CALL_ID: u32 = i32::MAX as u32;

/// Positive id of a live ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(u32);

impl CallId {
    /// `None` for 0 and for values above the id range.
    pub fn new(raw: u32) -> Option<Self> {
        if raw == 0 || raw > MAX_CALL_ID {
            None
        } else {
            Some(Self(raw))
        }
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a logical operation. An empty target is stored as `None`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallKey {
    pub category: Category,
    pub target: Option<String>,
    pub method: String,
}

impl CallKey {
    pub fn new(category: Category, target: Option<&str>, method: &str) -> Self {
        Self {
            category,
            target: target.filter(|t| !t.is_empty()).map(str::to_string),
            method: method.to_string(),
        }
    }
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Some(target) => write!(f, "{}/{}/{}", self.category, target, self.method),
            None => write!(f, "{}/{}", self.category, self.method),
        }
    }
}

/// Inbound agent methods that can be left waiting on an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentMethod {
    RequestInput,
}

pub(crate) struct AgentRequest {
    pub method: AgentMethod,
    pub reply: MethodReply,
}

/// One live operation.
pub struct CallEntry {
    id: CallId,
    key: CallKey,
    wire_method: String,
    pub(crate) pending: Option<PendingCall>,
    pub(crate) completion: Option<ConnectCallback>,
    pub(crate) agent: Option<AgentRequest>,
}

impl CallEntry {
    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn key(&self) -> &CallKey {
        &self.key
    }

    /// Method name sent on the wire, e.g. `Connect`.
    pub fn wire_method(&self) -> &str {
        &self.wire_method
    }

    /// Agent method waiting for an application answer, if any.
    pub fn agent_method(&self) -> Option<AgentMethod> {
        self.agent.as_ref().map(|a| a.method)
    }

    fn info(&self) -> CallInfo {
        CallInfo {
            id: self.id,
            key: self.key.clone(),
            wire_method: self.wire_method.clone(),
            agent_method: self.agent_method(),
        }
    }
}

impl fmt::Debug for CallEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallEntry")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("wire_method", &self.wire_method)
            .field("pending", &self.pending.is_some())
            .field("completion", &self.completion.is_some())
            .field("agent_method", &self.agent_method())
            .finish()
    }
}

/// Owned snapshot of an entry, returned by the locking helpers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInfo {
    pub id: CallId,
    pub key: CallKey,
    pub wire_method: String,
    pub agent_method: Option<AgentMethod>,
}

/// Proof of creation, used to destroy exactly the entry that was created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallTicket {
    id: CallId,
    key: CallKey,
}

impl CallTicket {
    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn key(&self) -> &CallKey {
        &self.key
    }
}

/// Ledger contents. Reachable only through a [`LedgerGuard`].
pub struct LedgerState {
    entries: HashMap<CallId, CallEntry>,
    index: HashMap<CallKey, CallId>,
    next_id: u32,
}

impl LedgerState {
    fn starting_at(next_id: u32) -> Self {
        Self {
            entries: HashMap::new(),
            index: HashMap::new(),
            next_id,
        }
    }

    pub fn find(&self, key: &CallKey) -> Option<&CallEntry> {
        self.index.get(key).and_then(|id| self.entries.get(id))
    }

    pub fn find_mut(&mut self, key: &CallKey) -> Option<&mut CallEntry> {
        let id = *self.index.get(key)?;
        self.entries.get_mut(&id)
    }

    pub fn find_by_id(&self, id: CallId) -> Option<&CallEntry> {
        self.entries.get(&id)
    }

    pub fn find_by_id_mut(&mut self, id: CallId) -> Option<&mut CallEntry> {
        self.entries.get_mut(&id)
    }

    /// Entry created by `ticket`, if it is still live.
    pub fn get_mut(&mut self, ticket: &CallTicket) -> Option<&mut CallEntry> {
        self.entries
            .get_mut(&ticket.id)
            .filter(|entry| entry.key == ticket.key)
    }

    /// Inserts a new entry. Fails with `CallInProgress` if an entry with
    /// the same key is live.
    pub fn create(
        &mut self,
        category: Category,
        target: Option<&str>,
        method: &str,
        wire_method: &str,
    ) -> Result<CallTicket> {
        let key = CallKey::new(category, target, method);
        if self.index.contains_key(&key) {
            warn!(target: "connman::ledger", call = %key, "another call in progress");
            return Err(ConnmanError::CallInProgress(key));
        }

        let id = self.allocate_id();
        self.index.insert(key.clone(), id);
        self.entries.insert(
            id,
            CallEntry {
                id,
                key: key.clone(),
                wire_method: wire_method.to_string(),
                pending: None,
                completion: None,
                agent: None,
            },
        );
        debug!(target: "connman::ledger", call = %key, %id, "call entry created");
        Ok(CallTicket { id, key })
    }

    /// Removes the entry `ticket` refers to. An unknown or stale ticket is
    /// logged and ignored. An agent request still waiting on the entry is
    /// answered with a cancellation.
    pub fn destroy(&mut self, ticket: &CallTicket) -> Option<CallEntry> {
        if self.get_mut(ticket).is_none() {
            warn!(target: "connman::ledger", call = %ticket.key, id = %ticket.id, "bad call entry to destroy");
            return None;
        }
        let mut entry = self.entries.remove(&ticket.id)?;
        self.index.remove(&entry.key);

        if let Some(request) = entry.agent.take() {
            debug!(target: "connman::ledger", id = %entry.id, "cancelling unanswered agent request");
            request.reply.return_error(AGENT_CANCELED, "Request finished");
        }
        debug!(target: "connman::ledger", call = %entry.key, id = %entry.id, "call entry destroyed");
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // Next free id after the last one issued; wraps to 1 past MAX_CALL_ID.
    fn allocate_id(&mut self) -> CallId {
        loop {
            let candidate = self.next_id;
            self.next_id = if candidate >= MAX_CALL_ID { 1 } else { candidate + 1 };
            let id = CallId(candidate);
            if !self.entries.contains_key(&id) {
                return id;
            }
        }
    }
}

/// Exclusive access to the ledger. Holding it lets several steps run
/// atomically with respect to the event loop.
pub struct LedgerGuard<'a> {
    state: MutexGuard<'a, LedgerState>,
}

impl Deref for LedgerGuard<'_> {
    type Target = LedgerState;

    fn deref(&self) -> &LedgerState {
        &self.state
    }
}

impl DerefMut for LedgerGuard<'_> {
    fn deref_mut(&mut self) -> &mut LedgerState {
        &mut self.state
    }
}

/// Thread-safe table of in-flight calls.
pub struct CallLedger {
    state: Mutex<LedgerState>,
}

impl CallLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState::starting_at(1)),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_next_id(next_id: u32) -> Self {
        Self {
            state: Mutex::new(LedgerState::starting_at(next_id)),
        }
    }

    pub fn lock(&self) -> LedgerGuard<'_> {
        LedgerGuard {
            state: self.state.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    pub fn find(&self, category: Category, target: Option<&str>, method: &str) -> Option<CallInfo> {
        self.lock()
            .find(&CallKey::new(category, target, method))
            .map(CallEntry::info)
    }

    pub fn find_by_id(&self, id: CallId) -> Option<CallInfo> {
        self.lock().find_by_id(id).map(CallEntry::info)
    }

    pub fn create(
        &self,
        category: Category,
        target: Option<&str>,
        method: &str,
        wire_method: &str,
    ) -> Result<CallTicket> {
        self.lock().create(category, target, method, wire_method)
    }

    pub fn destroy(&self, ticket: &CallTicket) -> bool {
        self.lock().destroy(ticket).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Default for CallLedger {
    fn default() -> Self {
        Self::new()
    }
}
