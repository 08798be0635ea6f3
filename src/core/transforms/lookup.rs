use crate::core::cache::{CachePolicy, CachedTransform};
use crate::core::transform::{check_cancel, Transform, TransformStats};
use crate::core::transforms::join::{reference_columns, JoinKey, NotFoundStrategy};
use crate::domain::model::{format_key, Row, Value};
use crate::domain::query::{Filter, SelectQuery, Sort};
use crate::domain::schema::Schema;
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct LookupConfig {
    pub keys: Vec<JoinKey>,
    pub cache_policy: CachePolicy,
    pub not_found_strategy: NotFoundStrategy,
}

/// Looks up one reference row per primary row through the reference's cache.
///
/// Unlike the join, the primary order is kept and nothing is sorted. With
/// `OnDemandCache` over a source without direct lookups, misses scan the
/// reference forward, so keys should arrive roughly in reference order.
pub struct LookupTransform {
    primary: Box<dyn Transform>,
    reference: CachedTransform,
    config: LookupConfig,
    schema: Schema,
    primary_keys: Vec<usize>,
    stats: TransformStats,
}

impl LookupTransform {
    pub fn new(primary: Box<dyn Transform>, reference: Box<dyn Transform>, config: LookupConfig) -> Self {
        let reference = CachedTransform::new(reference, config.cache_policy);
        Self {
            primary,
            reference,
            config,
            schema: Schema::default(),
            primary_keys: Vec::new(),
            stats: TransformStats::default(),
        }
    }

    fn key_filters(&self, row: &Row) -> Option<Vec<Filter>> {
        let mut filters = Vec::with_capacity(self.config.keys.len());
        for (key, &ordinal) in self.config.keys.iter().zip(&self.primary_keys) {
            let value = &row[ordinal];
            if value.is_null() {
                return None;
            }
            filters.push(Filter::equal(key.reference.clone(), value.clone()));
        }
        Some(filters)
    }
}

#[async_trait]
impl Transform for LookupTransform {
    fn name(&self) -> &str {
        "lookup"
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn sort_fields(&self) -> Vec<Sort> {
        self.primary.sort_fields()
    }

    async fn open(&mut self, audit_key: i64, query: &SelectQuery, cancel: &CancellationToken) -> Result<()> {
        self.primary.open(audit_key, &SelectQuery::sorted(query.sorts.clone()), cancel).await?;
        self.reference.open(audit_key, &SelectQuery::default(), cancel).await?;

        let primary = self.primary.schema();
        let reference = self.reference.schema();
        self.primary_keys = self
            .config
            .keys
            .iter()
            .map(|k| primary.get_ordinal(&k.primary))
            .collect::<Result<_>>()?;
        for key in &self.config.keys {
            reference.get_ordinal(&key.reference)?;
        }

        let mut columns = primary.columns.clone();
        columns.extend(reference_columns(primary, reference));
        self.schema = Schema::new(primary.name.clone(), columns);
        self.stats = TransformStats::default();
        Ok(())
    }

    async fn read_record(&mut self, cancel: &CancellationToken) -> Result<Option<Row>> {
        loop {
            check_cancel(cancel, "lookup")?;
            let Some(mut row) = self.primary.read_record(cancel).await? else {
                return Ok(None);
            };
            let found = match self.key_filters(&row) {
                Some(filters) => self.reference.lookup_row(&filters, cancel).await?,
                None => None,
            };
            match (found, self.config.not_found_strategy) {
                (Some(reference), _) => {
                    self.stats.rows_read_reference += 1;
                    row.extend(reference);
                }
                (None, NotFoundStrategy::NullJoin) => {
                    row.extend(std::iter::repeat(Value::Null).take(self.reference.schema().len()));
                }
                (None, NotFoundStrategy::Filter) => {
                    self.stats.rows_filtered += 1;
                    continue;
                }
                (None, NotFoundStrategy::Abend) => {
                    let key: Vec<Value> = self.primary_keys.iter().map(|&o| row[o].clone()).collect();
                    return Err(EtlError::JoinNotFound {
                        transform: "lookup".to_string(),
                        key: format_key(&key),
                    });
                }
            }
            return Ok(Some(row));
        }
    }

    fn stats(&self) -> TransformStats {
        self.stats
    }

    fn primary(&self) -> Option<&dyn Transform> {
        Some(self.primary.as_ref())
    }

    /// Reads the reference performs to fill its cache count there as primary
    /// reads; rows returned from lookups are counted here.
    fn reference(&self) -> Option<&dyn Transform> {
        Some(&self.reference)
    }

    fn reset(&mut self) -> Result<()> {
        self.stats = TransformStats::default();
        self.primary.reset()?;
        self.reference.reset()
    }
}
