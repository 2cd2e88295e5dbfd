//! Approval-gated calls and their single-use results.

use super::signer::TransactionRequest;
use alloy_dyn_abi::TypedData;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use walletbridge_types::{PendingRequest, RpcErrorObject};

/// What to execute once a pending request is approved.
#[derive(Debug, Clone)]
pub enum PendingAction {
    SendTransaction(TransactionRequest),
    SignTypedData(Box<TypedData>),
}

#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub request: PendingRequest,
    pub action: PendingAction,
}

/// Pending requests ordered by id, which is also creation order.
#[derive(Debug, Default)]
pub struct PendingRegistry {
    entries: BTreeMap<u64, PendingEntry>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: PendingEntry) {
        self.entries.insert(entry.request.id, entry);
    }

    /// Take the entry out. A second call for the same id returns `None`.
    pub fn remove(&mut self, request_id: u64) -> Option<PendingEntry> {
        self.entries.remove(&request_id)
    }

    pub fn list(&self) -> Vec<PendingRequest> {
        self.entries.values().map(|e| e.request.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

pub type CellOutcome = Result<Value, RpcErrorObject>;

/// Outcomes of resolved requests, each readable once.
#[derive(Debug, Default)]
pub struct ResultCells {
    cells: HashMap<u64, (Instant, CellOutcome)>,
}

impl ResultCells {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an outcome. The first outcome for an id wins; returns false if
    /// one was already stored.
    pub fn store(&mut self, request_id: u64, outcome: CellOutcome) -> bool {
        if self.cells.contains_key(&request_id) {
            return false;
        }
        self.cells.insert(request_id, (Instant::now(), outcome));
        true
    }

    /// Read and delete.
    pub fn take(&mut self, request_id: u64) -> Option<CellOutcome> {
        self.cells.remove(&request_id).map(|(_, outcome)| outcome)
    }

    /// Drop outcomes stored more than `max_age` ago. Returns how many went.
    pub fn prune(&mut self, max_age: Duration) -> usize {
        let before = self.cells.len();
        self.cells
            .retain(|_, (stored_at, _)| stored_at.elapsed() <= max_age);
        before - self.cells.len()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn clear(&mut self) {
        self.cells.clear();
    }
}

/// Millisecond-timestamp request ids, strictly increasing even when the
/// clock stalls or steps back.
#[derive(Debug, Default)]
pub struct RequestIdGenerator {
    last: u64,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self) -> u64 {
        let now = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0);
        self.next_at(now)
    }

    pub fn next_at(&mut self, now_ms: u64) -> u64 {
        self.last = now_ms.max(self.last + 1);
        self.last
    }
}
