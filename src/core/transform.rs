//! The streaming cursor protocol every source and transform implements.
//!
//! A [`Transform`] is pull-based and forward-only: `open` binds it to its
//! upstreams and derives its output schema, `read_record` yields rows until it
//! returns `None`. Caching and encryption are decorators
//! ([`crate::core::cache::CachedTransform`], [`crate::core::encryption::EncryptTransform`])
//! wrapped around any transform. [`Reader`] is the façade callers iterate with.

use crate::core::transforms::memory::MemoryTransform;
use crate::core::transforms::sort::SortTransform;
use crate::domain::model::{Row, Value};
use crate::domain::query::{sort_satisfies, Filter, SelectQuery, Sort};
use crate::domain::schema::Schema;
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::cmp::Ordering;
use std::ops::AddAssign;
use tokio_util::sync::CancellationToken;

/// Row counters kept by each transform for its own work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransformStats {
    pub rows_read_primary: u64,
    pub rows_read_reference: u64,
    pub rows_sorted: u64,
    pub rows_filtered: u64,
    pub rows_ignored: u64,
    pub rows_rejected: u64,
    pub rows_preserved: u64,
}

impl TransformStats {
    /// Reads counted below a reference input are reference reads for the consumer.
    pub fn as_reference(mut self) -> Self {
        self.rows_read_reference += self.rows_read_primary;
        self.rows_read_primary = 0;
        self
    }

    /// Counters accumulated since `earlier` was taken.
    pub fn since(self, earlier: Self) -> Self {
        Self {
            rows_read_primary: self.rows_read_primary.saturating_sub(earlier.rows_read_primary),
            rows_read_reference: self.rows_read_reference.saturating_sub(earlier.rows_read_reference),
            rows_sorted: self.rows_sorted.saturating_sub(earlier.rows_sorted),
            rows_filtered: self.rows_filtered.saturating_sub(earlier.rows_filtered),
            rows_ignored: self.rows_ignored.saturating_sub(earlier.rows_ignored),
            rows_rejected: self.rows_rejected.saturating_sub(earlier.rows_rejected),
            rows_preserved: self.rows_preserved.saturating_sub(earlier.rows_preserved),
        }
    }
}

impl AddAssign for TransformStats {
    fn add_assign(&mut self, rhs: Self) {
        self.rows_read_primary += rhs.rows_read_primary;
        self.rows_read_reference += rhs.rows_read_reference;
        self.rows_sorted += rhs.rows_sorted;
        self.rows_filtered += rhs.rows_filtered;
        self.rows_ignored += rhs.rows_ignored;
        self.rows_rejected += rhs.rows_rejected;
        self.rows_preserved += rhs.rows_preserved;
    }
}

/// What a transform kind can do, queried instead of inherited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Input must arrive ordered by [`Transform::required_sort_fields`].
    pub requires_sort: bool,
    /// [`Transform::lookup_row_direct`] is implemented.
    pub can_lookup_row_direct: bool,
    /// Filters in the open query are applied by the transform itself.
    pub can_push_down_filter: bool,
}

#[async_trait]
pub trait Transform: Send {
    fn name(&self) -> &str;

    /// Output schema; valid after `open`.
    fn schema(&self) -> &Schema;

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Ordering the primary input must have.
    fn required_sort_fields(&self) -> Vec<Sort> {
        Vec::new()
    }

    /// Ordering the output is known to have.
    fn sort_fields(&self) -> Vec<Sort> {
        Vec::new()
    }

    async fn open(&mut self, audit_key: i64, query: &SelectQuery, cancel: &CancellationToken)
        -> Result<()>;

    /// Next row, or `None` once exhausted (and on every call after that).
    async fn read_record(&mut self, cancel: &CancellationToken) -> Result<Option<Row>>;

    async fn lookup_row_direct(
        &mut self,
        _filters: &[Filter],
        _cancel: &CancellationToken,
    ) -> Result<Vec<Row>> {
        Err(EtlError::ProcessingError {
            message: format!("Transform '{}' does not support direct row lookups", self.name()),
        })
    }

    /// First row matching `filters`, or `None` when nothing matches.
    async fn lookup_row(&mut self, filters: &[Filter], cancel: &CancellationToken) -> Result<Option<Row>> {
        Ok(self.lookup_row_direct(filters, cancel).await?.into_iter().next())
    }

    fn stats(&self) -> TransformStats;

    fn primary(&self) -> Option<&dyn Transform> {
        None
    }

    fn reference(&self) -> Option<&dyn Transform> {
        None
    }

    /// Own counters plus those of the whole upstream chain.
    fn total_stats(&self) -> TransformStats {
        let mut total = self.stats();
        if let Some(primary) = self.primary() {
            total += primary.total_stats();
        }
        if let Some(reference) = self.reference() {
            total += reference.total_stats().as_reference();
        }
        total
    }

    /// Clears counters and state so the next read starts over. Upstreams are
    /// owned, so the reset walk never revisits a transform.
    fn reset(&mut self) -> Result<()>;
}

pub fn check_cancel(cancel: &CancellationToken, transform: &str) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(EtlError::Cancelled {
            transform: transform.to_string(),
        });
    }
    Ok(())
}

/// Opens `slot` asking for `required` ordering. When the opened transform
/// cannot show that ordering, it is wrapped in a [`SortTransform`].
pub(crate) async fn open_sorted(
    slot: &mut Box<dyn Transform>,
    audit_key: i64,
    required: &[Sort],
    cancel: &CancellationToken,
) -> Result<()> {
    let query = SelectQuery::sorted(required.to_vec());
    slot.open(audit_key, &query, cancel).await?;

    if required.is_empty() || sort_satisfies(&slot.sort_fields(), required) {
        return Ok(());
    }

    tracing::debug!(
        "Transform '{}' is not ordered by {:?}, adding a sort",
        slot.name(),
        required.iter().map(|s| s.column.as_str()).collect::<Vec<_>>()
    );
    let inner = std::mem::replace(slot, Box::new(MemoryTransform::empty()));
    let mut sorted = SortTransform::over_opened(inner, required.to_vec());
    sorted.open(audit_key, &SelectQuery::default(), cancel).await?;
    *slot = Box::new(sorted);
    Ok(())
}

/// Forward-only cursor over a transform chain with a current row pointer.
pub struct Reader {
    transform: Box<dyn Transform>,
    current: Option<Row>,
    is_open: bool,
    finished: bool,
    rows_read: u64,
    incremental_ordinal: Option<usize>,
    max_incremental_value: Option<Value>,
}

impl Reader {
    pub fn new(transform: impl Transform + 'static) -> Self {
        Self::from_boxed(Box::new(transform))
    }

    pub fn from_boxed(transform: Box<dyn Transform>) -> Self {
        Self {
            transform,
            current: None,
            is_open: false,
            finished: false,
            rows_read: 0,
            incremental_ordinal: None,
            max_incremental_value: None,
        }
    }

    pub async fn open(&mut self, audit_key: i64, query: &SelectQuery, cancel: &CancellationToken) -> Result<()> {
        self.transform.open(audit_key, query, cancel).await?;
        self.is_open = true;
        self.finished = false;
        self.current = None;
        self.rows_read = 0;
        self.incremental_ordinal = self.transform.schema().incremental_ordinal();
        self.max_incremental_value = None;
        Ok(())
    }

    /// Advances to the next row. Returns false once exhausted, and keeps
    /// returning false without touching the source afterwards.
    pub async fn read(&mut self, cancel: &CancellationToken) -> Result<bool> {
        if !self.is_open {
            return Err(EtlError::ProcessingError {
                message: format!("Transform '{}' was read before it was opened", self.transform.name()),
            });
        }
        if self.finished {
            return Ok(false);
        }
        check_cancel(cancel, self.transform.name())?;

        match self.transform.read_record(cancel).await? {
            Some(row) => {
                self.track_incremental(&row);
                self.rows_read += 1;
                self.current = Some(row);
                Ok(true)
            }
            None => {
                self.finished = true;
                self.current = None;
                Ok(false)
            }
        }
    }

    fn track_incremental(&mut self, row: &Row) {
        let Some(ordinal) = self.incremental_ordinal else {
            return;
        };
        let value = &row[ordinal];
        if value.is_null() {
            return;
        }
        let is_greater = match &self.max_incremental_value {
            None => true,
            Some(max) => value.try_compare(max) == Some(Ordering::Greater),
        };
        if is_greater {
            self.max_incremental_value = Some(value.clone());
        }
    }

    pub fn schema(&self) -> &Schema {
        self.transform.schema()
    }

    pub fn current(&self) -> Option<&Row> {
        self.current.as_ref()
    }

    pub fn take_current(&mut self) -> Option<Row> {
        self.current.take()
    }

    pub fn get(&self, ordinal: usize) -> Result<&Value> {
        let row = self.current.as_ref().ok_or_else(|| EtlError::ProcessingError {
            message: format!("Transform '{}' has no current row", self.transform.name()),
        })?;
        row.get(ordinal).ok_or_else(|| EtlError::MissingColumn {
            transform: self.transform.name().to_string(),
            column: format!("#{}", ordinal),
        })
    }

    pub fn get_by_name(&self, name: &str) -> Result<&Value> {
        let ordinal = self.schema().ordinal(name).ok_or_else(|| EtlError::MissingColumn {
            transform: self.transform.name().to_string(),
            column: name.to_string(),
        })?;
        self.get(ordinal)
    }

    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    /// Largest value seen in the incremental-update column, for resuming loads.
    pub fn max_incremental_value(&self) -> Option<&Value> {
        self.max_incremental_value.as_ref()
    }

    pub async fn lookup_row(&mut self, filters: &[Filter], cancel: &CancellationToken) -> Result<Option<Row>> {
        self.transform.lookup_row(filters, cancel).await
    }

    pub fn transform(&self) -> &dyn Transform {
        self.transform.as_ref()
    }

    pub fn total_stats(&self) -> TransformStats {
        self.transform.total_stats()
    }

    pub fn reset(&mut self) -> Result<()> {
        self.transform.reset()?;
        self.finished = false;
        self.current = None;
        self.rows_read = 0;
        self.max_incremental_value = None;
        Ok(())
    }
}
