use crate::core::transform::{Capabilities, Transform, TransformStats};
use crate::domain::model::{Row, Table};
use crate::domain::query::{compare_rows, evaluate_filters, sort_ordinals, Filter, SelectQuery, Sort};
use crate::domain::schema::Schema;
use crate::utils::error::Result;
use async_trait::async_trait;
use std::cmp::Ordering;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Reads rows held in memory. Applies pushed-down filters and sorts in full.
pub struct MemoryTransform {
    schema: Schema,
    rows: Arc<Vec<Row>>,
    flat_file: bool,
    sorts: Vec<Sort>,
    order: Vec<usize>,
    position: usize,
    stats: TransformStats,
}

impl MemoryTransform {
    pub fn new(schema: Schema, rows: Vec<Row>) -> Self {
        Self::shared(schema, Arc::new(rows))
    }

    pub fn shared(schema: Schema, rows: Arc<Vec<Row>>) -> Self {
        let order = (0..rows.len()).collect();
        Self {
            schema,
            rows,
            flat_file: false,
            sorts: Vec::new(),
            order,
            position: 0,
            stats: TransformStats::default(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Schema::default(), Vec::new())
    }

    pub fn from_table(table: &Table) -> Self {
        Self::new(table.schema.clone(), table.rows.clone())
    }

    /// Behaves like a flat file: the open query is ignored and rows come back
    /// in insertion order.
    pub fn as_flat_file(mut self) -> Self {
        self.flat_file = true;
        self
    }

    fn matching_rows(&self, filters: &[Filter]) -> Result<Vec<usize>> {
        let mut matches = Vec::new();
        for (i, row) in self.rows.iter().enumerate() {
            if evaluate_filters(filters, &self.schema, row)? {
                matches.push(i);
            }
        }
        Ok(matches)
    }
}

#[async_trait]
impl Transform for MemoryTransform {
    fn name(&self) -> &str {
        &self.schema.name
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            requires_sort: false,
            can_lookup_row_direct: true,
            can_push_down_filter: !self.flat_file,
        }
    }

    fn sort_fields(&self) -> Vec<Sort> {
        self.sorts.clone()
    }

    async fn open(&mut self, _audit_key: i64, query: &SelectQuery, _cancel: &CancellationToken) -> Result<()> {
        self.sorts.clear();
        self.position = 0;
        self.stats = TransformStats::default();
        if self.flat_file {
            self.order = (0..self.rows.len()).collect();
            return Ok(());
        }

        let mut order = self.matching_rows(&query.filters)?;
        if !query.sorts.is_empty() {
            let ordinals = sort_ordinals(&self.schema, &query.sorts)?;
            let mut failure = None;
            order.sort_by(|&a, &b| {
                compare_rows(&self.schema, &ordinals, &self.rows[a], &self.rows[b]).unwrap_or_else(|e| {
                    failure.get_or_insert(e);
                    Ordering::Equal
                })
            });
            if let Some(e) = failure {
                return Err(e);
            }
            self.sorts = query.sorts.clone();
        }

        if let Some(limit) = query.rows {
            order.truncate(limit);
        }
        self.order = order;
        Ok(())
    }

    async fn read_record(&mut self, _cancel: &CancellationToken) -> Result<Option<Row>> {
        let Some(&index) = self.order.get(self.position) else {
            return Ok(None);
        };
        self.position += 1;
        self.stats.rows_read_primary += 1;
        Ok(Some(self.rows[index].clone()))
    }

    async fn lookup_row_direct(&mut self, filters: &[Filter], _cancel: &CancellationToken) -> Result<Vec<Row>> {
        Ok(self
            .matching_rows(filters)?
            .into_iter()
            .map(|i| self.rows[i].clone())
            .collect())
    }

    fn stats(&self) -> TransformStats {
        self.stats
    }

    fn reset(&mut self) -> Result<()> {
        self.position = 0;
        self.stats = TransformStats::default();
        Ok(())
    }
}
