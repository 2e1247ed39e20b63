//! # OperationRecord Repository
//!
//! Persistence for the operation log. Queries take an explicit
//! [`RecordFilter`] instead of accumulating conditions on shared state, and
//! status writes go through the record state machine.

use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set,
};
use tracing::{debug, info};

use crate::error::{ScaleError, map_db_err};
use crate::models::operation_record::{
    ActiveModel, Column, Entity, Model, NodesRecordDetail, RecordStatus, RecordType,
};

const DEFAULT_PAGE_SIZE: u64 = 20;
const MAX_PAGE_SIZE: u64 = 500;

/// Predicates for selecting operation records. Empty lists match everything.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub ids: Vec<i64>,
    pub record_types: Vec<RecordType>,
    pub cluster_names: Vec<String>,
    pub statuses: Vec<RecordStatus>,
    pub user_ids: Vec<String>,
    pub pipeline_ids: Vec<i64>,
    pub org_id: Option<i64>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    /// 1-based page number; 0 is treated as 1
    pub page_no: u64,
    /// 0 selects the default page size
    pub page_size: u64,
}

impl RecordFilter {
    pub fn for_cluster(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_names: vec![cluster_name.into()],
            ..Self::default()
        }
    }

    pub fn with_types(mut self, types: impl IntoIterator<Item = RecordType>) -> Self {
        self.record_types = types.into_iter().collect();
        self
    }

    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = RecordStatus>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_ids = vec![user_id.into()];
        self
    }

    pub fn with_page(mut self, page_no: u64, page_size: u64) -> Self {
        self.page_no = page_no;
        self.page_size = page_size;
        self
    }

    fn condition(&self) -> Condition {
        let mut cond = Condition::all();
        if !self.ids.is_empty() {
            cond = cond.add(Column::Id.is_in(self.ids.clone()));
        }
        if !self.record_types.is_empty() {
            cond = cond.add(Column::RecordType.is_in(self.record_types.clone()));
        }
        if !self.cluster_names.is_empty() {
            cond = cond.add(Column::ClusterName.is_in(self.cluster_names.clone()));
        }
        if !self.statuses.is_empty() {
            cond = cond.add(Column::Status.is_in(self.statuses.clone()));
        }
        if !self.user_ids.is_empty() {
            cond = cond.add(Column::UserId.is_in(self.user_ids.clone()));
        }
        if !self.pipeline_ids.is_empty() {
            cond = cond.add(Column::PipelineId.is_in(self.pipeline_ids.clone()));
        }
        if let Some(org_id) = self.org_id {
            cond = cond.add(Column::OrgId.eq(org_id));
        }
        if let Some(after) = self.created_after {
            cond = cond.add(Column::CreatedAt.gte(after.fixed_offset()));
        }
        if let Some(before) = self.created_before {
            cond = cond.add(Column::CreatedAt.lt(before.fixed_offset()));
        }
        cond
    }

    fn page(&self) -> (u64, u64) {
        let size = match self.page_size {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        };
        (self.page_no.max(1), size)
    }
}

/// One page of records, newest first.
#[derive(Debug, Clone, Default)]
pub struct RecordPage {
    pub total: u64,
    pub records: Vec<Model>,
}

/// Values for a new record.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub record_type: RecordType,
    pub user_id: String,
    pub org_id: i64,
    pub cluster_name: String,
    pub status: RecordStatus,
    pub detail: String,
    pub pipeline_id: i64,
}

/// Repository for operation record database operations
#[derive(Clone)]
pub struct OperationRecordRepository {
    db: DatabaseConnection,
}

impl OperationRecordRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Insert a record. A record without a backing job must be written
    /// terminal, and a `processing` record must name its job.
    pub async fn create(&self, record: NewRecord) -> Result<Model, ScaleError> {
        if record.pipeline_id == 0 && !record.status.is_terminal() {
            return Err(ScaleError::InvalidRequest(format!(
                "{} record without a pipeline id must be terminal",
                record.record_type
            )));
        }

        let now = Utc::now().fixed_offset();
        let active = ActiveModel {
            record_type: Set(record.record_type),
            user_id: Set(record.user_id),
            org_id: Set(record.org_id),
            cluster_name: Set(record.cluster_name),
            status: Set(record.status),
            detail: Set(record.detail),
            pipeline_id: Set(record.pipeline_id),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };

        let model = active
            .insert(&self.db)
            .await
            .map_err(|err| map_db_err("failed to insert operation record", err))?;

        info!(
            record_id = model.id,
            record_type = %model.record_type,
            cluster = %model.cluster_name,
            status = %model.status,
            pipeline_id = model.pipeline_id,
            "Operation record created"
        );

        Ok(model)
    }

    pub async fn find(&self, id: i64) -> Result<Option<Model>, ScaleError> {
        Entity::find_by_id(id)
            .one(&self.db)
            .await
            .map_err(|err| map_db_err("failed to load operation record", err))
    }

    /// Query one page of records matching `filter`, newest first.
    pub async fn query(&self, filter: &RecordFilter) -> Result<RecordPage, ScaleError> {
        let base = Entity::find().filter(filter.condition());

        let total = base
            .clone()
            .count(&self.db)
            .await
            .map_err(|err| map_db_err("failed to count operation records", err))?;

        let (page_no, page_size) = filter.page();
        let records = base
            .order_by_desc(Column::Id)
            .offset((page_no - 1) * page_size)
            .limit(page_size)
            .all(&self.db)
            .await
            .map_err(|err| map_db_err("failed to query operation records", err))?;

        Ok(RecordPage { total, records })
    }

    /// Newest record matching `filter`, ignoring its paging.
    pub async fn latest(&self, filter: &RecordFilter) -> Result<Option<Model>, ScaleError> {
        Entity::find()
            .filter(filter.condition())
            .order_by_desc(Column::Id)
            .one(&self.db)
            .await
            .map_err(|err| map_db_err("failed to load latest operation record", err))
    }

    /// Move a record to `status`, optionally replacing its detail. Terminal
    /// records never move to a different status here; see [`Self::reset`].
    pub async fn update_status(
        &self,
        id: i64,
        status: RecordStatus,
        detail: Option<String>,
    ) -> Result<Model, ScaleError> {
        let current = self.find(id).await?.ok_or(ScaleError::RecordNotFound(id))?;

        if !current.status.can_transition_to(status) {
            return Err(ScaleError::InvalidTransition {
                id,
                from: current.status,
                to: status,
            });
        }

        let mut active: ActiveModel = current.into();
        active.status = Set(status);
        if let Some(detail) = detail {
            active.detail = Set(detail);
        }
        active.updated_at = Set(Utc::now().fixed_offset());

        let model = active
            .update(&self.db)
            .await
            .map_err(|err| map_db_err("failed to update operation record status", err))?;

        debug!(record_id = id, status = %model.status, "Operation record status updated");
        Ok(model)
    }

    /// Manual reset of a terminal record back to `processing` so the next
    /// reconciliation pass re-reads its job.
    pub async fn reset(&self, id: i64) -> Result<Model, ScaleError> {
        let current = self.find(id).await?.ok_or(ScaleError::RecordNotFound(id))?;

        if current.pipeline_id == 0 {
            return Err(ScaleError::InvalidRequest(format!(
                "record {id} has no job to reconcile and cannot be reset"
            )));
        }

        let previous = current.status;
        let mut active: ActiveModel = current.into();
        active.status = Set(RecordStatus::Processing);
        active.updated_at = Set(Utc::now().fixed_offset());

        let model = active
            .update(&self.db)
            .await
            .map_err(|err| map_db_err("failed to reset operation record", err))?;

        info!(record_id = id, previous = %previous, "Operation record reset to processing");
        Ok(model)
    }

    /// An autoscaler add for the same cluster and the same instance set that
    /// is still in flight or already succeeded inside `window`.
    pub async fn find_duplicate_ess_add(
        &self,
        cluster_name: &str,
        detail: &NodesRecordDetail,
        window: Duration,
    ) -> Result<Option<Model>, ScaleError> {
        let wanted = detail.instance_set();
        if wanted.is_empty() {
            return Ok(None);
        }

        let since = Utc::now()
            .checked_sub_signed(window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let candidates = Entity::find()
            .filter(Column::ClusterName.eq(cluster_name))
            .filter(Column::RecordType.eq(RecordType::AddEssNodes))
            .filter(Column::Status.is_in([
                RecordStatus::Processing,
                RecordStatus::Success,
                RecordStatus::Successed,
            ]))
            .filter(Column::CreatedAt.gte(since.fixed_offset()))
            .order_by_desc(Column::Id)
            .all(&self.db)
            .await
            .map_err(|err| map_db_err("failed to look up duplicate add records", err))?;

        Ok(candidates.into_iter().find(|record| {
            record
                .nodes_detail()
                .map(|d| d.instance_set() == wanted)
                .unwrap_or(false)
        }))
    }

    /// Pipeline ids already recorded for a cluster and record type.
    pub async fn pipeline_ids(
        &self,
        cluster_name: &str,
        record_type: RecordType,
    ) -> Result<Vec<i64>, ScaleError> {
        Entity::find()
            .select_only()
            .column(Column::PipelineId)
            .filter(Column::ClusterName.eq(cluster_name))
            .filter(Column::RecordType.eq(record_type))
            .filter(Column::PipelineId.ne(0))
            .into_tuple::<i64>()
            .all(&self.db)
            .await
            .map_err(|err| map_db_err("failed to load recorded pipeline ids", err))
    }
}
