pub mod coordinator;
pub mod error;
pub mod executor;
pub mod resolver;
pub mod staging;

pub use coordinator::{Admission, CoordinatorError, CoordinatorHandle, TransferProgress};
pub use error::{ErrorKind, SyncError};
pub use executor::{DownloadExecutor, TransferOutcome};
pub use resolver::{PartialTransfer, TargetState, TransferStateResolver};
pub use staging::{FileRecord, StagingStore, SyncMetadata};
