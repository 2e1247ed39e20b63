//! # Data Models
//!
//! SeaORM entities persisted by the control plane.

pub mod control_lease;
pub mod operation_record;
pub mod scale_lock;

pub use control_lease::Entity as ControlLease;
pub use operation_record::Entity as OperationRecord;
pub use operation_record::{NodesRecordDetail, RecordStatus, RecordType};
pub use scale_lock::Entity as ScaleLock;
