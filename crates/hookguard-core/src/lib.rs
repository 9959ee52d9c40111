//! Idempotency guard for at-least-once webhook deliveries.
//!
//! [`Guard::process`] drives one idempotency record through
//! `PENDING → PROCESSING → COMPLETE | FAILED`, running the caller's handler
//! under a lease and replaying the stored result to every later delivery.

mod guard;
mod policy;


pub use guard::Guard;
pub use policy::{BusyWait, BusyWaitMode, GuardPolicy, PolicyConfig, RetryBackoff};

pub use hookguard_types::{GuardError, HandlerError, IdempotencyKey, Outcome};
