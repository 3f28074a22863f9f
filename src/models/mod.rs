pub mod bulk_operation;
pub mod retry_log;

pub use bulk_operation::{BulkOperation, NewBulkOperation, OperationStatus, Progress};
pub use retry_log::{RetryLogEntry, ScheduledRetry};
