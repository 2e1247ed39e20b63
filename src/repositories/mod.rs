//! # Repositories
//!
//! SeaORM-backed persistence used by the control plane.

pub mod operation_record;

pub use operation_record::{NewRecord, OperationRecordRepository, RecordFilter, RecordPage};
