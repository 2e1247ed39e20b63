//! ScaleLock entity model
//!
//! Key-value rows backing the cluster scale lock.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "scale_locks")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub lock_key: String,

    #[sea_orm(column_type = "Text", nullable)]
    pub value: Option<String>,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
