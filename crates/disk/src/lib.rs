pub mod ledger;
pub mod local;
pub mod object_store;
pub mod remote;
pub mod retry;

pub use ledger::ReservationLedger;
pub use local::LocalDisk;
pub use object_store::{MemoryObjectStore, StoreOp};
pub use remote::{RemoteDiskOptions, RetryingObjectStoreDisk};
pub use retry::RetryPolicy;
