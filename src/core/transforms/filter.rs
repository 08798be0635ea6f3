use crate::core::transform::{check_cancel, Capabilities, Transform, TransformStats};
use crate::domain::model::Row;
use crate::domain::query::{evaluate_filters, AndOr, Filter, SelectQuery, Sort};
use crate::domain::schema::Schema;
use crate::utils::error::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Keeps the rows matching its filter list. The filters are pushed down when
/// the upstream accepts them and are re-applied regardless.
pub struct FilterTransform {
    primary: Box<dyn Transform>,
    filters: Vec<Filter>,
    stats: TransformStats,
}

impl FilterTransform {
    pub fn new(primary: Box<dyn Transform>, filters: Vec<Filter>) -> Self {
        Self {
            primary,
            filters,
            stats: TransformStats::default(),
        }
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }
}

fn has_or(filters: &[Filter]) -> bool {
    filters.iter().any(|f| f.and_or == AndOr::Or)
}

#[async_trait]
impl Transform for FilterTransform {
    fn name(&self) -> &str {
        "filter"
    }

    fn schema(&self) -> &Schema {
        self.primary.schema()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            requires_sort: false,
            can_lookup_row_direct: false,
            can_push_down_filter: true,
        }
    }

    fn sort_fields(&self) -> Vec<Sort> {
        self.primary.sort_fields()
    }

    async fn open(&mut self, audit_key: i64, query: &SelectQuery, cancel: &CancellationToken) -> Result<()> {
        let mut upstream = query.clone();
        if self.primary.capabilities().can_push_down_filter && !self.filters.is_empty() {
            // Appending to an OR list would change its grouping.
            if !has_or(&upstream.filters) && !has_or(&self.filters) {
                upstream.filters.extend(self.filters.iter().cloned());
            }
        }
        upstream.rows = None;
        self.stats = TransformStats::default();
        self.primary.open(audit_key, &upstream, cancel).await
    }

    async fn read_record(&mut self, cancel: &CancellationToken) -> Result<Option<Row>> {
        loop {
            check_cancel(cancel, "filter")?;
            let Some(row) = self.primary.read_record(cancel).await? else {
                return Ok(None);
            };
            if evaluate_filters(&self.filters, self.primary.schema(), &row)? {
                return Ok(Some(row));
            }
            self.stats.rows_filtered += 1;
        }
    }

    fn stats(&self) -> TransformStats {
        self.stats
    }

    fn primary(&self) -> Option<&dyn Transform> {
        Some(self.primary.as_ref())
    }

    fn reset(&mut self) -> Result<()> {
        self.stats = TransformStats::default();
        self.primary.reset()
    }
}
