use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use hookguard_types::{
    now_ns, Acquire, CreateResult, GuardError, IdempotencyKey, Lease, Record, Renewal,
    Transition, TransitionResult,
};

use crate::keys::{
    lease_key, parse_terminal_index_key, record_key, terminal_index_bound, terminal_index_key,
};
use crate::mem::{new_token, ttl_ns};
use crate::traits::{LeaseLock, RecordStore, RetentionStore};

fn encode<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, GuardError> {
    bincode::serde::encode_to_vec(val, bincode::config::standard())
        .map_err(|e| GuardError::Codec(e.to_string()))
}

fn decode<T: for<'de> serde::Deserialize<'de>>(bytes: &[u8]) -> Result<T, GuardError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| GuardError::Codec(e.to_string()))
}

fn fjall_err(e: fjall::Error) -> GuardError {
    GuardError::StoreUnavailable(e.to_string())
}

fn fjall_lock_err(e: fjall::Error) -> GuardError {
    GuardError::LockUnavailable(e.to_string())
}

// ---------------------------------------------------------------------------
// FjallStore — shared handle wrapping all keyspaces
// ---------------------------------------------------------------------------

/// Shared storage handle.
///
/// All keyspaces live in a single fjall `Database` so that cross-keyspace
/// write batches are atomic. Read-modify-write sequences take `write_lock`
/// so each one is linearizable for its key.
///
/// `write_lock` is store-wide, so writes to different keys queue behind one
/// another for the length of one read plus one batch commit. No lock is held
/// across a handler or an `.await`, so a busy or slow key never delays work
/// on another key beyond that.
pub struct FjallStore {
    /// The underlying fjall database.
    pub db: fjall::Database,
    /// Idempotency records: `key_utf8` → bincode(Record)
    pub records: fjall::Keyspace,
    /// Live and expired leases: `key_utf8` → bincode(Lease)
    pub leases: fjall::Keyspace,
    /// Terminal records by age: `updated_at_ns_be_i64(8) ++ key_utf8` → b""
    pub terminal_index: fjall::Keyspace,
    write_lock: Mutex<()>,
}

impl FjallStore {
    /// Open (or create) a `FjallStore` at `path`.
    pub fn open(path: &Path) -> Result<Arc<Self>, GuardError> {
        let db = fjall::Database::builder(path).open().map_err(fjall_err)?;
        let records =
            db.keyspace("records", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let leases =
            db.keyspace("leases", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let terminal_index = db
            .keyspace("terminal_index", fjall::KeyspaceCreateOptions::default)
            .map_err(fjall_err)?;
        Ok(Arc::new(FjallStore {
            db,
            records,
            leases,
            terminal_index,
            write_lock: Mutex::new(()),
        }))
    }

    fn serialize(&self) -> Result<MutexGuard<'_, ()>, GuardError> {
        self.write_lock
            .lock()
            .map_err(|_| GuardError::StoreUnavailable("write lock poisoned".into()))
    }

    fn read_record(&self, key: &IdempotencyKey) -> Result<Option<Record>, GuardError> {
        self.records
            .get(record_key(key))
            .map_err(fjall_err)?
            .map(|b| decode::<Record>(&b))
            .transpose()
    }

    fn read_lease(&self, key: &IdempotencyKey) -> Result<Option<Lease>, GuardError> {
        self.leases
            .get(lease_key(key))
            .map_err(fjall_lock_err)?
            .map(|b| decode::<Lease>(&b))
            .transpose()
    }
}

// ---------------------------------------------------------------------------
// FjallRecordStore
// ---------------------------------------------------------------------------

/// `RecordStore` backed by fjall.
///
/// All blocking I/O is wrapped in `tokio::task::spawn_blocking`.
#[derive(Clone)]
pub struct FjallRecordStore(pub Arc<FjallStore>);

impl RecordStore for FjallRecordStore {
    async fn create_if_absent(&self, key: &IdempotencyKey) -> Result<CreateResult, GuardError> {
        let store = self.0.clone();
        let key = key.clone();
        tokio::task::spawn_blocking(move || -> Result<CreateResult, GuardError> {
            let _guard = store.serialize()?;
            if let Some(existing) = store.read_record(&key)? {
                return Ok(CreateResult::AlreadyExists(existing));
            }
            let record = Record::pending(key.clone(), now_ns());
            store.records.insert(record_key(&key), encode(&record)?).map_err(fjall_err)?;
            Ok(CreateResult::Created(record))
        })
        .await
        .map_err(|e| GuardError::StoreUnavailable(e.to_string()))?
    }

    async fn compare_and_transition(
        &self,
        key: &IdempotencyKey,
        transition: Transition,
    ) -> Result<TransitionResult, GuardError> {
        let store = self.0.clone();
        let key = key.clone();
        tokio::task::spawn_blocking(move || -> Result<TransitionResult, GuardError> {
            let _guard = store.serialize()?;
            let Some(current) = store.read_record(&key)? else {
                return Ok(TransitionResult::Conflict(None));
            };
            if !current.matches(&transition) {
                return Ok(TransitionResult::Conflict(Some(current)));
            }
            let next = current.transitioned(&transition, now_ns())?;

            let mut batch = store.db.batch();
            batch.insert(&store.records, record_key(&key), encode(&next)?);
            // Keep the age index in step with the record's terminal state.
            if current.state.is_terminal() {
                batch.remove(
                    &store.terminal_index,
                    terminal_index_key(current.updated_at_ns, &key),
                );
            }
            if next.state.is_terminal() {
                batch.insert(
                    &store.terminal_index,
                    terminal_index_key(next.updated_at_ns, &key),
                    Vec::new(),
                );
            }
            batch.commit().map_err(fjall_err)?;
            Ok(TransitionResult::Committed(next))
        })
        .await
        .map_err(|e| GuardError::StoreUnavailable(e.to_string()))?
    }

    async fn get(&self, key: &IdempotencyKey) -> Result<Option<Record>, GuardError> {
        let store = self.0.clone();
        let key = key.clone();
        tokio::task::spawn_blocking(move || store.read_record(&key))
            .await
            .map_err(|e| GuardError::StoreUnavailable(e.to_string()))?
    }
}

impl RetentionStore for FjallRecordStore {
    async fn purge_terminal_before(&self, cutoff_ns: i64) -> Result<usize, GuardError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<usize, GuardError> {
            let _guard = store.serialize()?;
            let index_keys: Vec<Vec<u8>> = store
                .terminal_index
                .range(Vec::new()..terminal_index_bound(cutoff_ns).to_vec())
                .map(|g| g.into_inner().map(|(k, _)| k.to_vec()).map_err(fjall_err))
                .collect::<Result<_, _>>()?;

            let mut removed = 0;
            let mut batch = store.db.batch();
            for raw in index_keys {
                if let Some((updated_at_ns, key)) = parse_terminal_index_key(&raw) {
                    // Only delete the record the index entry still describes.
                    if let Some(record) = store.read_record(&key)? {
                        if record.state.is_terminal() && record.updated_at_ns == updated_at_ns {
                            batch.remove(&store.records, record_key(&key));
                            removed += 1;
                        }
                    }
                }
                batch.remove(&store.terminal_index, raw);
            }
            batch.commit().map_err(fjall_err)?;
            Ok(removed)
        })
        .await
        .map_err(|e| GuardError::StoreUnavailable(e.to_string()))?
    }
}

// ---------------------------------------------------------------------------
// FjallLeaseLock
// ---------------------------------------------------------------------------

/// `LeaseLock` whose leases live in the `leases` keyspace.
///
/// Ownership changes happen under the store's write lock, so a lease is only
/// handed out after re-reading the current holder.
#[derive(Clone)]
pub struct FjallLeaseLock(pub Arc<FjallStore>);

impl LeaseLock for FjallLeaseLock {
    async fn acquire(&self, key: &IdempotencyKey, ttl: Duration) -> Result<Acquire, GuardError> {
        let store = self.0.clone();
        let key = key.clone();
        tokio::task::spawn_blocking(move || -> Result<Acquire, GuardError> {
            let _guard = store.serialize().map_err(|e| GuardError::LockUnavailable(e.to_string()))?;
            let now = now_ns();
            if let Some(current) = store.read_lease(&key)? {
                if current.expires_at_ns > now {
                    return Ok(Acquire::Busy);
                }
            }
            let lease = Lease {
                key: key.clone(),
                token: new_token(),
                expires_at_ns: now.saturating_add(ttl_ns(ttl)),
            };
            store.leases.insert(lease_key(&key), encode(&lease)?).map_err(fjall_lock_err)?;
            Ok(Acquire::Granted(lease))
        })
        .await
        .map_err(|e| GuardError::LockUnavailable(e.to_string()))?
    }

    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Renewal, GuardError> {
        let store = self.0.clone();
        let lease = lease.clone();
        tokio::task::spawn_blocking(move || -> Result<Renewal, GuardError> {
            let _guard = store.serialize().map_err(|e| GuardError::LockUnavailable(e.to_string()))?;
            let now = now_ns();
            match store.read_lease(&lease.key)? {
                Some(current) if current.token == lease.token && current.expires_at_ns > now => {
                    let renewed =
                        Lease { expires_at_ns: now.saturating_add(ttl_ns(ttl)), ..current };
                    store
                        .leases
                        .insert(lease_key(&renewed.key), encode(&renewed)?)
                        .map_err(fjall_lock_err)?;
                    Ok(Renewal::Renewed(renewed))
                }
                _ => Ok(Renewal::Expired),
            }
        })
        .await
        .map_err(|e| GuardError::LockUnavailable(e.to_string()))?
    }

    async fn release(&self, lease: &Lease) -> Result<(), GuardError> {
        let store = self.0.clone();
        let lease = lease.clone();
        tokio::task::spawn_blocking(move || -> Result<(), GuardError> {
            let _guard = store.serialize().map_err(|e| GuardError::LockUnavailable(e.to_string()))?;
            if let Some(current) = store.read_lease(&lease.key)? {
                if current.token == lease.token {
                    store.leases.remove(lease_key(&lease.key)).map_err(fjall_lock_err)?;
                }
            }
            Ok(())
        })
        .await
        .map_err(|e| GuardError::LockUnavailable(e.to_string()))?
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
