pub mod fjall;
pub mod keys;
pub mod mem;
pub mod retention;
pub mod traits;

pub use fjall::{FjallLeaseLock, FjallRecordStore, FjallStore};
pub use mem::{MemLeaseLock, MemRecordStore};
pub use retention::RetentionTask;
pub use traits::{LeaseLock, RecordStore, RetentionStore};
