use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use hookguard_types::{
    now_ns, Acquire, CreateResult, GuardError, IdempotencyKey, Lease, Record, Renewal,
    Transition, TransitionResult,
};

use crate::traits::{LeaseLock, RecordStore, RetentionStore};

pub(crate) fn ttl_ns(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_nanos()).unwrap_or(i64::MAX)
}

pub(crate) fn new_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ---------------------------------------------------------------------------
// MemRecordStore
// ---------------------------------------------------------------------------

/// In-memory `RecordStore` backed by a `BTreeMap`.
///
/// Intended for unit tests; not persisted across restarts. The write lock is
/// held for the whole read-modify-write, which makes every operation
/// linearizable.
#[derive(Clone)]
pub struct MemRecordStore {
    inner: Arc<RwLock<BTreeMap<IdempotencyKey, Record>>>,
}

impl MemRecordStore {
    pub fn new() -> Self {
        MemRecordStore { inner: Arc::new(RwLock::new(BTreeMap::new())) }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

impl Default for MemRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore for MemRecordStore {
    async fn create_if_absent(&self, key: &IdempotencyKey) -> Result<CreateResult, GuardError> {
        let mut g = self.inner.write().await;
        if let Some(existing) = g.get(key) {
            return Ok(CreateResult::AlreadyExists(existing.clone()));
        }
        let record = Record::pending(key.clone(), now_ns());
        g.insert(key.clone(), record.clone());
        Ok(CreateResult::Created(record))
    }

    async fn compare_and_transition(
        &self,
        key: &IdempotencyKey,
        transition: Transition,
    ) -> Result<TransitionResult, GuardError> {
        let mut g = self.inner.write().await;
        let Some(current) = g.get(key) else {
            return Ok(TransitionResult::Conflict(None));
        };
        if !current.matches(&transition) {
            return Ok(TransitionResult::Conflict(Some(current.clone())));
        }
        let next = current.transitioned(&transition, now_ns())?;
        g.insert(key.clone(), next.clone());
        Ok(TransitionResult::Committed(next))
    }

    async fn get(&self, key: &IdempotencyKey) -> Result<Option<Record>, GuardError> {
        Ok(self.inner.read().await.get(key).cloned())
    }
}

impl RetentionStore for MemRecordStore {
    async fn purge_terminal_before(&self, cutoff_ns: i64) -> Result<usize, GuardError> {
        let mut g = self.inner.write().await;
        let before = g.len();
        g.retain(|_, r| !(r.state.is_terminal() && r.updated_at_ns < cutoff_ns));
        Ok(before - g.len())
    }
}

// ---------------------------------------------------------------------------
// MemLeaseLock
// ---------------------------------------------------------------------------

/// In-memory `LeaseLock`. Expired leases are reclaimed lazily on `acquire`.
#[derive(Clone)]
pub struct MemLeaseLock {
    held: Arc<RwLock<HashMap<IdempotencyKey, Lease>>>,
}

impl MemLeaseLock {
    pub fn new() -> Self {
        MemLeaseLock { held: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Whether a live lease is currently held on `key`.
    pub async fn is_held(&self, key: &IdempotencyKey) -> bool {
        let now = now_ns();
        self.held.read().await.get(key).map(|l| l.expires_at_ns > now).unwrap_or(false)
    }
}

impl Default for MemLeaseLock {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseLock for MemLeaseLock {
    async fn acquire(&self, key: &IdempotencyKey, ttl: Duration) -> Result<Acquire, GuardError> {
        let mut g = self.held.write().await;
        let now = now_ns();
        if let Some(current) = g.get(key) {
            if current.expires_at_ns > now {
                return Ok(Acquire::Busy);
            }
        }
        let lease = Lease {
            key: key.clone(),
            token: new_token(),
            expires_at_ns: now.saturating_add(ttl_ns(ttl)),
        };
        g.insert(key.clone(), lease.clone());
        Ok(Acquire::Granted(lease))
    }

    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Renewal, GuardError> {
        let mut g = self.held.write().await;
        let now = now_ns();
        match g.get_mut(&lease.key) {
            Some(current) if current.token == lease.token && current.expires_at_ns > now => {
                current.expires_at_ns = now.saturating_add(ttl_ns(ttl));
                Ok(Renewal::Renewed(current.clone()))
            }
            _ => Ok(Renewal::Expired),
        }
    }

    async fn release(&self, lease: &Lease) -> Result<(), GuardError> {
        let mut g = self.held.write().await;
        if g.get(&lease.key).map(|l| l.token == lease.token).unwrap_or(false) {
            g.remove(&lease.key);
        }
        Ok(())
    }
}
