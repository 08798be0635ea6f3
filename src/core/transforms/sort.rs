use crate::core::transform::{check_cancel, Transform, TransformStats};
use crate::domain::model::Row;
use crate::domain::query::{compare_rows, sort_ordinals, SelectQuery, Sort};
use crate::domain::schema::Schema;
use crate::utils::error::Result;
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;

/// Materialises the upstream and emits it in sort order (stable).
pub struct SortTransform {
    primary: Box<dyn Transform>,
    sorts: Vec<Sort>,
    primary_opened: bool,
    loaded: bool,
    rows: VecDeque<Row>,
    stats: TransformStats,
}

impl SortTransform {
    pub fn new(primary: Box<dyn Transform>, sorts: Vec<Sort>) -> Self {
        Self {
            primary,
            sorts,
            primary_opened: false,
            loaded: false,
            rows: VecDeque::new(),
            stats: TransformStats::default(),
        }
    }

    /// Wraps an upstream that has already been opened.
    pub(crate) fn over_opened(primary: Box<dyn Transform>, sorts: Vec<Sort>) -> Self {
        let mut sort = Self::new(primary, sorts);
        sort.primary_opened = true;
        sort
    }

    async fn load(&mut self, cancel: &CancellationToken) -> Result<()> {
        let mut rows = Vec::new();
        while let Some(row) = self.primary.read_record(cancel).await? {
            check_cancel(cancel, self.name())?;
            rows.push(row);
        }

        let schema = self.primary.schema();
        let ordinals = sort_ordinals(schema, &self.sorts)?;
        let mut failure = None;
        rows.sort_by(|a, b| {
            compare_rows(schema, &ordinals, a, b).unwrap_or_else(|e| {
                failure.get_or_insert(e);
                Ordering::Equal
            })
        });
        if let Some(e) = failure {
            return Err(e);
        }

        self.stats.rows_sorted += rows.len() as u64;
        self.rows = rows.into();
        self.loaded = true;
        Ok(())
    }
}

#[async_trait]
impl Transform for SortTransform {
    fn name(&self) -> &str {
        "sort"
    }

    fn schema(&self) -> &Schema {
        self.primary.schema()
    }

    fn sort_fields(&self) -> Vec<Sort> {
        self.sorts.clone()
    }

    async fn open(&mut self, audit_key: i64, query: &SelectQuery, cancel: &CancellationToken) -> Result<()> {
        if !self.primary_opened {
            let upstream_query = SelectQuery::filtered(query.filters.clone());
            self.primary.open(audit_key, &upstream_query, cancel).await?;
            self.primary_opened = true;
        }
        self.loaded = false;
        self.rows.clear();
        Ok(())
    }

    async fn read_record(&mut self, cancel: &CancellationToken) -> Result<Option<Row>> {
        if !self.loaded {
            self.load(cancel).await?;
        }
        Ok(self.rows.pop_front())
    }

    fn stats(&self) -> TransformStats {
        self.stats
    }

    fn primary(&self) -> Option<&dyn Transform> {
        Some(self.primary.as_ref())
    }

    fn reset(&mut self) -> Result<()> {
        self.stats = TransformStats::default();
        self.loaded = false;
        self.rows.clear();
        self.primary.reset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transforms::memory::MemoryTransform;
    use crate::domain::model::{DataType, Value};
    use crate::domain::schema::Column;

    #[tokio::test]
    async fn test_sorts_and_is_stable() {
        let cancel = CancellationToken::new();
        let schema = Schema::new(
            "s",
            vec![Column::new("k", DataType::Int), Column::new("v", DataType::String)],
        );
        let source = MemoryTransform::new(
            schema,
            vec![
                vec![2.into(), "x".into()],
                vec![1.into(), "first".into()],
                vec![Value::Null, "null".into()],
                vec![1.into(), "second".into()],
            ],
        );
        let mut sort = SortTransform::new(Box::new(source), vec![Sort::asc("k")]);
        sort.open(0, &SelectQuery::default(), &cancel).await.unwrap();

        let mut seen = Vec::new();
        while let Some(row) = sort.read_record(&cancel).await.unwrap() {
            seen.push(row[1].to_string());
        }
        assert_eq!(seen, vec!["null", "first", "second", "x"]);
        assert_eq!(sort.total_stats().rows_sorted, 4);
        assert_eq!(sort.total_stats().rows_read_primary, 4);
    }

    #[tokio::test]
    async fn test_incompatible_values_raise() {
        let cancel = CancellationToken::new();
        let schema = Schema::new("s", vec![Column::new("k", DataType::String)]);
        let source = MemoryTransform::new(schema, vec![vec![1.into()], vec!["a".into()]]);
        let mut sort = SortTransform::new(Box::new(source.as_flat_file()), vec![Sort::asc("k")]);
        sort.open(0, &SelectQuery::default(), &cancel).await.unwrap();
        assert!(sort.read_record(&cancel).await.is_err());
    }
}
