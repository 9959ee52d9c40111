use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hookguard_storage::{LeaseLock, RecordStore};
use hookguard_types::{
    now_ns, Acquire, GuardError, HandlerError, IdempotencyKey, Lease, Outcome, Record,
    RecordPatch, RecordState, Renewal, Transition, TransitionResult,
};

use crate::policy::GuardPolicy;

/// Conflicting writes tolerated while claiming a key before giving up with
/// `RetryLater`. Under a held lease only a stale-marker reclaim race or a
/// misbehaving lock can produce them.
const MAX_CLAIM_ROUNDS: usize = 4;

/// Runs a business effect at most once concurrently per idempotency key.
///
/// The guard keeps no record state between calls: everything shared lives in
/// the injected [`RecordStore`] and [`LeaseLock`]. The lock suppresses
/// concurrent executions; the store's conditional writes make sure a caller
/// whose lease was reclaimed can never commit over the new holder.
///
/// A crash after the handler's side effect but before the COMPLETE commit
/// looks the same as a crash before the effect, so the next caller runs the
/// handler again. Handlers must therefore be idempotent themselves for the
/// same key, for example by forwarding it to the downstream API.
pub struct Guard<S, L> {
    store: Arc<S>,
    lock: Arc<L>,
    policy: GuardPolicy,
}

impl<S, L> Clone for Guard<S, L> {
    fn clone(&self) -> Self {
        Guard { store: self.store.clone(), lock: self.lock.clone(), policy: self.policy.clone() }
    }
}

enum Admission {
    Leased(Lease),
    Done(Outcome),
}

enum Claim {
    Claimed(Record),
    Done(Outcome),
}

impl<S: RecordStore, L: LeaseLock> Guard<S, L> {
    pub fn new(store: Arc<S>, lock: Arc<L>, policy: GuardPolicy) -> Result<Self, GuardError> {
        policy.validate()?;
        Ok(Guard { store, lock, policy })
    }

    pub fn policy(&self) -> &GuardPolicy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn lock(&self) -> &Arc<L> {
        &self.lock
    }

    /// Process `key` with the guard's own policy.
    pub async fn process<F, Fut>(
        &self,
        key: &IdempotencyKey,
        handler: F,
    ) -> Result<Outcome, GuardError>
    where
        F: FnOnce(IdempotencyKey) -> Fut + Send,
        Fut: Future<Output = Result<Vec<u8>, HandlerError>> + Send,
    {
        self.run(key, handler, &self.policy).await
    }

    /// Process `key` with a per-call policy.
    pub async fn process_with<F, Fut>(
        &self,
        key: &IdempotencyKey,
        handler: F,
        policy: &GuardPolicy,
    ) -> Result<Outcome, GuardError>
    where
        F: FnOnce(IdempotencyKey) -> Fut + Send,
        Fut: Future<Output = Result<Vec<u8>, HandlerError>> + Send,
    {
        policy.validate()?;
        self.run(key, handler, policy).await
    }

    async fn run<F, Fut>(
        &self,
        key: &IdempotencyKey,
        handler: F,
        policy: &GuardPolicy,
    ) -> Result<Outcome, GuardError>
    where
        F: FnOnce(IdempotencyKey) -> Fut + Send,
        Fut: Future<Output = Result<Vec<u8>, HandlerError>> + Send,
    {
        let started = Instant::now();
        let lease = match self.admit(key, policy).await? {
            Admission::Leased(lease) => lease,
            Admission::Done(outcome) => {
                tracing::debug!(%key, ?outcome, "resolved without lease");
                return Ok(outcome);
            }
        };

        let result = self.run_leased(key, handler, policy, &lease).await;

        if let Err(e) = self.lock.release(&lease).await {
            // The lease still expires on its own.
            tracing::warn!(%key, error = %e, "lease release failed");
        }
        match &result {
            Ok(outcome) => tracing::debug!(
                %key,
                ?outcome,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "processed"
            ),
            Err(e) => tracing::warn!(%key, error = %e, "processing aborted"),
        }
        result
    }

    /// Steps 1 and 2: serve cached results and obtain the lease, waiting per
    /// `policy.busy_wait` while another caller holds it.
    async fn admit(
        &self,
        key: &IdempotencyKey,
        policy: &GuardPolicy,
    ) -> Result<Admission, GuardError> {
        let mut observed: Option<Record> = None;
        let mut have_baseline = false;
        if policy.cached_fast_path {
            observed = self.store.get(key).await?;
            have_baseline = true;
            if let Some(outcome) = observed.as_ref().and_then(cached) {
                return Ok(Admission::Done(outcome));
            }
        }

        let mut polls = 0u32;
        loop {
            match self.lock.acquire(key, policy.lease_ttl).await? {
                Acquire::Granted(lease) => return Ok(Admission::Leased(lease)),
                Acquire::Busy => {}
            }
            if !have_baseline {
                observed = self.store.get(key).await?;
                have_baseline = true;
                if let Some(outcome) = observed.as_ref().and_then(cached) {
                    return Ok(Admission::Done(outcome));
                }
            }
            let Some(delay) = policy.busy_wait.delay(polls) else {
                tracing::debug!(%key, polls, "lease busy; deferring");
                return Ok(Admission::Done(Outcome::RetryLater));
            };
            tokio::time::sleep(delay).await;
            polls += 1;

            let current = self.store.get(key).await?;
            if let Some(record) = &current {
                if let Some(outcome) = cached(record) {
                    return Ok(Admission::Done(outcome));
                }
                // The in-flight holder finished with a failure: report it
                // rather than racing to retry behind it.
                if record.state == RecordState::Failed && changed_since(observed.as_ref(), record) {
                    return Ok(Admission::Done(failure_outcome(record, policy)));
                }
            }
            observed = current;
        }
    }

    async fn run_leased<F, Fut>(
        &self,
        key: &IdempotencyKey,
        handler: F,
        policy: &GuardPolicy,
        lease: &Lease,
    ) -> Result<Outcome, GuardError>
    where
        F: FnOnce(IdempotencyKey) -> Fut + Send,
        Fut: Future<Output = Result<Vec<u8>, HandlerError>> + Send,
    {
        let record = match self.claim(key, policy, lease).await? {
            Claim::Claimed(record) => record,
            Claim::Done(outcome) => return Ok(outcome),
        };
        tracing::debug!(%key, attempt = record.attempt_count, "handler starting");

        let result = self.execute(key, handler, policy, lease).await;
        self.commit(key, policy, lease, result).await
    }

    /// Step 3: with the lease held, move the record into PROCESSING under our
    /// token before any side effect can happen.
    async fn claim(
        &self,
        key: &IdempotencyKey,
        policy: &GuardPolicy,
        lease: &Lease,
    ) -> Result<Claim, GuardError> {
        for _ in 0..MAX_CLAIM_ROUNDS {
            let now = now_ns();
            let current = match self.store.get(key).await? {
                Some(record) => record,
                None => self.store.create_if_absent(key).await?.into_record(),
            };

            let transition = match current.state {
                RecordState::Complete => {
                    return Ok(Claim::Done(Outcome::CachedCompleted(
                        current.result.unwrap_or_default(),
                    )));
                }
                RecordState::Pending => Transition::begin_attempt(
                    RecordState::Pending,
                    None,
                    lease.token.clone(),
                    lease.expires_at_ns,
                ),
                RecordState::Failed => {
                    if current.attempt_count >= policy.max_attempts {
                        return Ok(Claim::Done(Outcome::FailedPermanently(
                            current.error.unwrap_or_default(),
                        )));
                    }
                    let wait = policy.retry_backoff.delay_after(current.attempt_count);
                    if now < current.updated_at_ns.saturating_add(duration_ns(wait)) {
                        tracing::debug!(
                            %key,
                            attempts = current.attempt_count,
                            "retry not yet due"
                        );
                        return Ok(Claim::Done(Outcome::RetryLater));
                    }
                    Transition::begin_attempt(
                        RecordState::Failed,
                        None,
                        lease.token.clone(),
                        lease.expires_at_ns,
                    )
                }
                RecordState::Processing if current.is_stale(now) => {
                    // We hold a fresh lease, so the lock agrees nobody is
                    // working on this key: the previous holder crashed.
                    tracing::warn!(
                        %key,
                        stale_owner = current.lease_owner.as_deref().unwrap_or(""),
                        attempts = current.attempt_count,
                        "reclaiming stale PROCESSING record"
                    );
                    if current.attempt_count >= policy.max_attempts {
                        let abandon = Transition {
                            expected_state: RecordState::Processing,
                            expected_owner: current.lease_owner.clone(),
                            new_state: RecordState::Failed,
                            patch: RecordPatch {
                                error: Some(format!(
                                    "attempt {} abandoned: lease expired before commit",
                                    current.attempt_count
                                )),
                                ..RecordPatch::default()
                            },
                        };
                        match self.store.compare_and_transition(key, abandon).await? {
                            TransitionResult::Committed(r) => {
                                return Ok(Claim::Done(Outcome::FailedPermanently(
                                    r.error.unwrap_or_default(),
                                )));
                            }
                            TransitionResult::Conflict(_) => continue,
                        }
                    }
                    Transition::begin_attempt(
                        RecordState::Processing,
                        current.lease_owner.clone(),
                        lease.token.clone(),
                        lease.expires_at_ns,
                    )
                }
                RecordState::Processing => {
                    // Lock is free but the marker is still live: its holder
                    // let go without committing. Wait for it to go stale.
                    tracing::debug!(%key, "live PROCESSING marker without lease");
                    return Ok(Claim::Done(Outcome::RetryLater));
                }
            };

            match self.store.compare_and_transition(key, transition).await? {
                TransitionResult::Committed(record) => return Ok(Claim::Claimed(record)),
                TransitionResult::Conflict(_) => {
                    tracing::debug!(%key, "claim conflicted; re-reading");
                }
            }
        }
        Ok(Claim::Done(Outcome::RetryLater))
    }

    /// Step 4: run the handler, renewing the lease meanwhile if enabled.
    async fn execute<F, Fut>(
        &self,
        key: &IdempotencyKey,
        handler: F,
        policy: &GuardPolicy,
        lease: &Lease,
    ) -> Result<Vec<u8>, HandlerError>
    where
        F: FnOnce(IdempotencyKey) -> Fut + Send,
        Fut: Future<Output = Result<Vec<u8>, HandlerError>> + Send,
    {
        let work = handler(key.clone());
        if !policy.lease_renewal_enabled {
            return work.await;
        }
        tokio::pin!(work);

        let period = (policy.lease_ttl / 2).max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut held = lease.clone();
        let mut renewing = true;
        loop {
            tokio::select! {
                out = &mut work => return out,
                _ = ticker.tick(), if renewing => match self.renew(key, policy, &held).await {
                    Ok(Some(renewed)) => held = renewed,
                    Ok(None) => {
                        tracing::warn!(%key, "lease lost while handler running");
                        renewing = false;
                    }
                    Err(e) => tracing::warn!(%key, error = %e, "lease renewal failed"),
                },
            }
        }
    }

    /// Extend the lease and the record's staleness deadline together.
    async fn renew(
        &self,
        key: &IdempotencyKey,
        policy: &GuardPolicy,
        lease: &Lease,
    ) -> Result<Option<Lease>, GuardError> {
        let renewed = match self.lock.renew(lease, policy.lease_ttl).await? {
            Renewal::Renewed(renewed) => renewed,
            Renewal::Expired => return Ok(None),
        };
        let extend = Transition::extend_lease(renewed.token.clone(), renewed.expires_at_ns);
        match self.store.compare_and_transition(key, extend).await? {
            TransitionResult::Committed(_) => Ok(Some(renewed)),
            TransitionResult::Conflict(_) => Ok(None),
        }
    }

    /// Step 5: commit the handler's result guarded by our lease token.
    async fn commit(
        &self,
        key: &IdempotencyKey,
        policy: &GuardPolicy,
        lease: &Lease,
        result: Result<Vec<u8>, HandlerError>,
    ) -> Result<Outcome, GuardError> {
        let transition = match result {
            Ok(payload) => Transition::complete(lease.token.clone(), payload),
            Err(e) => Transition::fail(lease.token.clone(), e.0),
        };
        match self.store.compare_and_transition(key, transition).await {
            Ok(TransitionResult::Committed(record)) => {
                tracing::info!(
                    %key,
                    state = %record.state,
                    attempt = record.attempt_count,
                    "attempt committed"
                );
                Ok(match record.state {
                    RecordState::Complete => Outcome::Completed(record.result.unwrap_or_default()),
                    _ => failure_outcome(&record, policy),
                })
            }
            Ok(TransitionResult::Conflict(current)) => {
                // Our lease lapsed and another caller reclaimed the key.
                tracing::warn!(%key, "commit rejected: lease was reclaimed");
                Ok(match current {
                    Some(record) => match record.state {
                        RecordState::Complete => {
                            Outcome::CachedCompleted(record.result.unwrap_or_default())
                        }
                        RecordState::Failed => failure_outcome(&record, policy),
                        _ => Outcome::RetryLater,
                    },
                    None => Outcome::RetryLater,
                })
            }
            Err(e) => {
                tracing::error!(
                    %key,
                    error = %e,
                    "commit failed after handler ran; record stays PROCESSING until lease expiry"
                );
                Err(e)
            }
        }
    }
}

fn cached(record: &Record) -> Option<Outcome> {
    match record.state {
        RecordState::Complete => {
            Some(Outcome::CachedCompleted(record.result.clone().unwrap_or_default()))
        }
        _ => None,
    }
}

fn failure_outcome(record: &Record, policy: &GuardPolicy) -> Outcome {
    let error = record.error.clone().unwrap_or_default();
    if record.attempt_count >= policy.max_attempts {
        Outcome::FailedPermanently(error)
    } else {
        Outcome::Failed(error)
    }
}

fn changed_since(before: Option<&Record>, now: &Record) -> bool {
    match before {
        None => true,
        Some(b) => b.state != now.state || b.updated_at_ns != now.updated_at_ns,
    }
}

fn duration_ns(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}
