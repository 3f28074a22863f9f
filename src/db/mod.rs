pub mod bulk_operations;
pub mod retry_log;
