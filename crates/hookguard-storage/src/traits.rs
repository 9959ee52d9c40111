use std::future::Future;
use std::time::Duration;

use hookguard_types::{
    Acquire, CreateResult, GuardError, IdempotencyKey, Lease, Record, Renewal, Transition,
    TransitionResult,
};

/// Durable home of idempotency records.
///
/// Methods use RPITIT (`-> impl Future + Send`) so generic callers can hold
/// the futures across `.await` on a multi-threaded runtime without an
/// `async-trait` dependency.
///
/// Every operation must be linearizable for a single key. Nothing is required
/// across keys.
pub trait RecordStore: Send + Sync + 'static {
    /// Insert a `Pending` record for `key`. If one already exists it is
    /// returned untouched as [`CreateResult::AlreadyExists`].
    fn create_if_absent(&self, key: &IdempotencyKey)
        -> impl Future<Output = Result<CreateResult, GuardError>> + Send;

    /// Apply `transition` only if the stored record still matches its expected
    /// state (and owner, when given). A mismatch is reported as
    /// [`TransitionResult::Conflict`] and leaves the record unchanged.
    ///
    /// Illegal edges fail with [`GuardError::InvalidTransition`].
    fn compare_and_transition(&self, key: &IdempotencyKey, transition: Transition)
        -> impl Future<Output = Result<TransitionResult, GuardError>> + Send;

    /// Read the record for `key`, or `None` if it was never created.
    fn get(&self, key: &IdempotencyKey)
        -> impl Future<Output = Result<Option<Record>, GuardError>> + Send;
}

/// Lease-based mutual exclusion over idempotency keys.
///
/// Leases expire on their own so that a crashed holder cannot wedge a key.
/// Changing the owner of a key is itself a conditional operation: when two
/// callers race to reclaim an expired lease exactly one wins.
pub trait LeaseLock: Send + Sync + 'static {
    /// Grant a lease valid for `ttl` unless a live one is held.
    fn acquire(&self, key: &IdempotencyKey, ttl: Duration)
        -> impl Future<Output = Result<Acquire, GuardError>> + Send;

    /// Extend `lease` by `ttl` from now. Fails with [`Renewal::Expired`] when the
    /// lease lapsed or its token no longer owns the key.
    fn renew(&self, lease: &Lease, ttl: Duration)
        -> impl Future<Output = Result<Renewal, GuardError>> + Send;

    /// Give the key up. Releasing an expired or foreign lease is a no-op.
    fn release(&self, lease: &Lease) -> impl Future<Output = Result<(), GuardError>> + Send;
}

/// Pruning of old terminal records. Only operators and retention tasks call
/// this; the guard never deletes records.
pub trait RetentionStore: Send + Sync + 'static {
    /// Delete `Complete` and `Failed` records last updated before `cutoff_ns`.
    /// Returns how many were removed.
    fn purge_terminal_before(&self, cutoff_ns: i64)
        -> impl Future<Output = Result<usize, GuardError>> + Send;
}
