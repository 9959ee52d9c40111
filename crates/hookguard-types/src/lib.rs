use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as unix nanoseconds.
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

/// Caller-supplied identifier naming one logical webhook event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(key: impl Into<String>) -> Result<Self, GuardError> {
        let key = key.into();
        if key.is_empty() {
            return Err(GuardError::InvalidArgument("idempotency key must not be empty".into()));
        }
        Ok(IdempotencyKey(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for IdempotencyKey {
    type Error = GuardError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        IdempotencyKey::new(value)
    }
}

impl TryFrom<&str> for IdempotencyKey {
    type Error = GuardError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        IdempotencyKey::new(value)
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Processing state of a record.
///
/// Legal edges:
/// * `Pending → Processing`
/// * `Processing → Complete | Failed`
/// * `Processing → Processing` (stale reclaim or lease extension)
/// * `Failed → Processing` (attempt-counted retry)
///
/// `Complete` has no outgoing edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum RecordState {
    Pending,
    Processing,
    Complete,
    Failed,
}

impl RecordState {
    pub fn can_transition_to(self, to: RecordState) -> bool {
        use RecordState::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Processing, Processing)
                | (Processing, Complete)
                | (Processing, Failed)
                | (Failed, Processing)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RecordState::Complete | RecordState::Failed)
    }
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecordState::Pending => "PENDING",
            RecordState::Processing => "PROCESSING",
            RecordState::Complete => "COMPLETE",
            RecordState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Persisted processing state of one idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Record {
    pub key: IdempotencyKey,
    pub state: RecordState,
    /// Present iff `state == Complete`.
    pub result: Option<Vec<u8>>,
    /// Present iff `state == Failed`.
    pub error: Option<String>,
    pub attempt_count: u32,
    /// Present iff `state == Processing`.
    pub lease_owner: Option<String>,
    /// Present iff `state == Processing`.
    pub lease_expires_at_ns: Option<i64>,
    pub created_at_ns: i64,
    pub updated_at_ns: i64,
}

impl Record {
    /// A fresh `Pending` record created at `now`.
    pub fn pending(key: IdempotencyKey, now: i64) -> Self {
        Record {
            key,
            state: RecordState::Pending,
            result: None,
            error: None,
            attempt_count: 0,
            lease_owner: None,
            lease_expires_at_ns: None,
            created_at_ns: now,
            updated_at_ns: now,
        }
    }

    /// `true` for a `Processing` marker whose lease expired at or before `now`.
    pub fn is_stale(&self, now: i64) -> bool {
        self.state == RecordState::Processing
            && self.lease_expires_at_ns.map(|exp| exp <= now).unwrap_or(true)
    }

    /// Whether the stored state (and owner, when the transition names one)
    /// still matches what the caller observed.
    pub fn matches(&self, t: &Transition) -> bool {
        if self.state != t.expected_state {
            return false;
        }
        match &t.expected_owner {
            Some(owner) => self.lease_owner.as_deref() == Some(owner.as_str()),
            None => true,
        }
    }

    /// Build the record that results from applying `t` at `now`.
    ///
    /// Does not check [`Record::matches`]; backends do that first so that a
    /// mismatch is reported as a conflict rather than an error.
    ///
    /// Entering `Processing` has two legal shapes. A counted attempt starts
    /// from `Pending` or `Failed`, or reclaims a `Processing` marker guarded
    /// by its old owner's token. An uncounted extension keeps the guarded
    /// owner. Anything else is an [`GuardError::InvalidTransition`].
    pub fn transitioned(&self, t: &Transition, now: i64) -> Result<Record, GuardError> {
        if !self.state.can_transition_to(t.new_state) || !t.has_legal_shape(self.state) {
            return Err(GuardError::InvalidTransition { from: self.state, to: t.new_state });
        }
        let p = &t.patch;
        let mut next = Record {
            key: self.key.clone(),
            state: t.new_state,
            result: None,
            error: None,
            attempt_count: self.attempt_count + u32::from(p.count_attempt),
            lease_owner: None,
            lease_expires_at_ns: None,
            created_at_ns: self.created_at_ns,
            updated_at_ns: now,
        };
        match t.new_state {
            RecordState::Processing => {
                let (Some(owner), Some(exp)) = (&p.lease_owner, p.lease_expires_at_ns) else {
                    return Err(GuardError::InvalidArgument(
                        "PROCESSING requires lease owner and expiry".into(),
                    ));
                };
                next.lease_owner = Some(owner.clone());
                next.lease_expires_at_ns = Some(exp);
            }
            RecordState::Complete => {
                let Some(result) = &p.result else {
                    return Err(GuardError::InvalidArgument("COMPLETE requires a result".into()));
                };
                next.result = Some(result.clone());
            }
            RecordState::Failed => {
                let Some(error) = &p.error else {
                    return Err(GuardError::InvalidArgument("FAILED requires an error".into()));
                };
                next.error = Some(error.clone());
            }
            RecordState::Pending => {
                return Err(GuardError::InvalidTransition { from: self.state, to: t.new_state });
            }
        }
        Ok(next)
    }
}

/// Field updates carried by a [`Transition`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordPatch {
    pub result: Option<Vec<u8>>,
    pub error: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_expires_at_ns: Option<i64>,
    /// Increment `attempt_count` as part of the write.
    pub count_attempt: bool,
}

/// A conditional state change submitted to `RecordStore::compare_and_transition`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub expected_state: RecordState,
    /// When set, the stored `lease_owner` must equal this token.
    pub expected_owner: Option<String>,
    pub new_state: RecordState,
    pub patch: RecordPatch,
}

impl Transition {
    /// Start (or restart) an attempt: `from → Processing`, counted.
    pub fn begin_attempt(
        from: RecordState,
        expected_owner: Option<String>,
        owner: String,
        expires_at_ns: i64,
    ) -> Self {
        Transition {
            expected_state: from,
            expected_owner,
            new_state: RecordState::Processing,
            patch: RecordPatch {
                lease_owner: Some(owner),
                lease_expires_at_ns: Some(expires_at_ns),
                count_attempt: true,
                ..RecordPatch::default()
            },
        }
    }

    /// Push out the staleness deadline of a marker the caller still owns.
    pub fn extend_lease(owner: String, expires_at_ns: i64) -> Self {
        Transition {
            expected_state: RecordState::Processing,
            expected_owner: Some(owner.clone()),
            new_state: RecordState::Processing,
            patch: RecordPatch {
                lease_owner: Some(owner),
                lease_expires_at_ns: Some(expires_at_ns),
                ..RecordPatch::default()
            },
        }
    }

    fn has_legal_shape(&self, from: RecordState) -> bool {
        if self.new_state != RecordState::Processing {
            return true;
        }
        let p = &self.patch;
        match (from, &self.expected_owner) {
            (RecordState::Processing, None) => false,
            (RecordState::Processing, Some(_)) if p.count_attempt => true,
            (RecordState::Processing, Some(holder)) => p.lease_owner.as_ref() == Some(holder),
            _ => p.count_attempt,
        }
    }

    pub fn complete(owner: String, result: Vec<u8>) -> Self {
        Transition {
            expected_state: RecordState::Processing,
            expected_owner: Some(owner),
            new_state: RecordState::Complete,
            patch: RecordPatch { result: Some(result), ..RecordPatch::default() },
        }
    }

    pub fn fail(owner: String, error: String) -> Self {
        Transition {
            expected_state: RecordState::Processing,
            expected_owner: Some(owner),
            new_state: RecordState::Failed,
            patch: RecordPatch { error: Some(error), ..RecordPatch::default() },
        }
    }
}

/// Result of `RecordStore::create_if_absent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateResult {
    Created(Record),
    AlreadyExists(Record),
}

impl CreateResult {
    pub fn into_record(self) -> Record {
        match self {
            CreateResult::Created(r) | CreateResult::AlreadyExists(r) => r,
        }
    }
}

/// Result of `RecordStore::compare_and_transition`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    Committed(Record),
    /// The stored record no longer matched; carries what is stored now.
    Conflict(Option<Record>),
}

/// Time-bounded ownership of one key, handed out by a `LeaseLock`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Lease {
    pub key: IdempotencyKey,
    pub token: String,
    pub expires_at_ns: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquire {
    Granted(Lease),
    /// A live lease is held by someone else.
    Busy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Renewal {
    Renewed(Lease),
    Expired,
}

/// What `Guard::process` reports back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The handler ran in this call and its result was committed.
    Completed(Vec<u8>),
    /// A previous execution already completed; this is its stored result.
    CachedCompleted(Vec<u8>),
    /// The attempt failed; the key may be retried.
    Failed(String),
    /// Attempts are exhausted; the handler will not run again for this key.
    FailedPermanently(String),
    /// Another execution is in flight, or a retry is not yet due.
    RetryLater,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Completed(_) | Outcome::CachedCompleted(_))
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, Outcome::CachedCompleted(_))
    }

    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            Outcome::Completed(p) | Outcome::CachedCompleted(p) => Some(p),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Outcome::Failed(e) | Outcome::FailedPermanently(e) => Some(e),
            _ => None,
        }
    }
}

/// Business-level failure returned by a handler.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        HandlerError(msg.into())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum GuardError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("lock unavailable: {0}")]
    LockUnavailable(String),
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: RecordState, to: RecordState },
    #[error("codec error: {0}")]
    Codec(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl GuardError {
    /// Infrastructure failures the upstream delivery retry should absorb.
    pub fn is_transient(&self) -> bool {
        matches!(self, GuardError::StoreUnavailable(_) | GuardError::LockUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> IdempotencyKey {
        IdempotencyKey::new(s).unwrap()
    }

    #[test]
    fn empty_key_rejected() {
        assert!(matches!(IdempotencyKey::new(""), Err(GuardError::InvalidArgument(_))));
        assert_eq!(IdempotencyKey::try_from("evt_1").unwrap().as_str(), "evt_1");
    }

    #[test]
    fn complete_has_no_outgoing_edges() {
        for to in [
            RecordState::Pending,
            RecordState::Processing,
            RecordState::Complete,
            RecordState::Failed,
        ] {
            assert!(!RecordState::Complete.can_transition_to(to));
        }
        assert!(!RecordState::Pending.can_transition_to(RecordState::Complete));
        assert!(!RecordState::Failed.can_transition_to(RecordState::Complete));
        assert!(RecordState::Failed.can_transition_to(RecordState::Processing));
    }

    #[test]
    fn begin_attempt_counts_and_sets_lease() {
        let r = Record::pending(key("k"), 10);
        let t = Transition::begin_attempt(RecordState::Pending, None, "tok".into(), 500);
        assert!(r.matches(&t));
        let next = r.transitioned(&t, 20).unwrap();
        assert_eq!(next.state, RecordState::Processing);
        assert_eq!(next.attempt_count, 1);
        assert_eq!(next.lease_owner.as_deref(), Some("tok"));
        assert_eq!(next.lease_expires_at_ns, Some(500));
        assert_eq!(next.created_at_ns, 10);
        assert_eq!(next.updated_at_ns, 20);
    }

    #[test]
    fn complete_clears_lease_fields() {
        let r = Record::pending(key("k"), 0)
            .transitioned(&Transition::begin_attempt(RecordState::Pending, None, "a".into(), 9), 1)
            .unwrap();
        let done = r.transitioned(&Transition::complete("a".into(), b"ok".to_vec()), 2).unwrap();
        assert_eq!(done.result.as_deref(), Some(&b"ok"[..]));
        assert!(done.lease_owner.is_none());
        assert!(done.lease_expires_at_ns.is_none());
        assert!(done.error.is_none());
        assert_eq!(done.attempt_count, 1);
    }

    #[test]
    fn owner_guard_mismatch() {
        let r = Record::pending(key("k"), 0)
            .transitioned(&Transition::begin_attempt(RecordState::Pending, None, "a".into(), 9), 1)
            .unwrap();
        assert!(!r.matches(&Transition::complete("b".into(), vec![])));
        assert!(r.matches(&Transition::complete("a".into(), vec![])));
    }

    #[test]
    fn illegal_edge_is_an_error() {
        let r = Record::pending(key("k"), 0);
        let err = r.transitioned(&Transition::complete("a".into(), vec![]), 1).unwrap_err();
        assert!(matches!(
            err,
            GuardError::InvalidTransition { from: RecordState::Pending, to: RecordState::Complete }
        ));
    }

    fn uncounted(from: RecordState, expected_owner: Option<&str>, owner: &str) -> Transition {
        Transition {
            expected_state: from,
            expected_owner: expected_owner.map(String::from),
            new_state: RecordState::Processing,
            patch: RecordPatch {
                lease_owner: Some(owner.into()),
                lease_expires_at_ns: Some(20),
                ..RecordPatch::default()
            },
        }
    }

    #[test]
    fn processing_entry_shapes() {
        let pending = Record::pending(key("k"), 0);
        let live = pending
            .transitioned(&Transition::begin_attempt(RecordState::Pending, None, "a".into(), 9), 1)
            .unwrap();
        let failed = live.transitioned(&Transition::fail("a".into(), "boom".into()), 2).unwrap();

        let rejected = [
            (&live, Transition::begin_attempt(RecordState::Processing, None, "b".into(), 20)),
            (&live, uncounted(RecordState::Processing, None, "a")),
            (&live, uncounted(RecordState::Processing, Some("a"), "b")),
            (&failed, uncounted(RecordState::Failed, None, "b")),
            (&pending, uncounted(RecordState::Pending, None, "b")),
        ];
        for (record, t) in rejected {
            assert!(
                matches!(record.transitioned(&t, 3), Err(GuardError::InvalidTransition { .. })),
                "accepted {t:?}"
            );
        }

        let extended = live.transitioned(&Transition::extend_lease("a".into(), 20), 3).unwrap();
        assert_eq!(extended.attempt_count, 1);
        assert_eq!(extended.lease_expires_at_ns, Some(20));

        let reclaim =
            Transition::begin_attempt(RecordState::Processing, Some("a".into()), "b".into(), 20);
        let reclaimed = live.transitioned(&reclaim, 3).unwrap();
        assert_eq!(reclaimed.attempt_count, 2);
        assert_eq!(reclaimed.lease_owner.as_deref(), Some("b"));
    }

    #[test]
    fn staleness() {
        let mut r = Record::pending(key("k"), 0);
        assert!(!r.is_stale(100));
        r.state = RecordState::Processing;
        r.lease_expires_at_ns = Some(50);
        assert!(r.is_stale(50));
        assert!(!r.is_stale(49));
    }

    #[test]
    fn outcome_helpers() {
        assert!(Outcome::CachedCompleted(vec![1]).is_cached());
        assert_eq!(Outcome::Completed(vec![1]).payload(), Some(&[1u8][..]));
        assert_eq!(Outcome::FailedPermanently("x".into()).error(), Some("x"));
        assert!(!Outcome::RetryLater.is_success());
        assert!(GuardError::StoreUnavailable("down".into()).is_transient());
        assert!(!GuardError::Codec("bad".into()).is_transient());
    }
}
