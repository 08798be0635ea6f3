use crate::core::audit::RunResult;
use crate::core::transform::Transform;
use crate::domain::model::Value;
use crate::domain::query::{Filter, SelectQuery};
use crate::domain::schema::{Column, Schema};
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Set `values` on the rows matched by `filters`.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateQuery {
    pub filters: Vec<Filter>,
    pub values: Vec<(String, Value)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteQuery {
    pub filters: Vec<Filter>,
}

/// A data store the pipeline reads from and writes to. Implementations
/// serialize the operations issued against a single connection object.
#[async_trait]
pub trait Connection: Send + Sync {
    fn name(&self) -> &str;

    /// Tables are created on demand and never truncated.
    fn dynamic_tables(&self) -> bool {
        false
    }

    /// Opens a cursor over a table, honoring the query where it can.
    async fn get_reader(&self, schema: &Schema, query: &SelectQuery) -> Result<Box<dyn Transform>>;

    async fn insert_bulk(
        &self,
        schema: &Schema,
        source: Box<dyn Transform>,
        cancel: &CancellationToken,
    ) -> Result<()>;

    async fn update(&self, schema: &Schema, updates: Vec<UpdateQuery>) -> Result<()>;

    async fn delete(&self, schema: &Schema, deletes: Vec<DeleteQuery>) -> Result<()>;

    async fn table_exists(&self, schema: &Schema) -> Result<bool>;

    async fn create_table(&self, schema: &Schema, drop_existing: bool) -> Result<()>;

    async fn truncate_table(&self, schema: &Schema) -> Result<()>;

    /// True when the stored table can hold rows of `schema`.
    async fn compare_table(&self, schema: &Schema) -> Result<bool>;

    /// Adapts an in-memory value to what the store can hold natively.
    fn convert_for_write(&self, _column: &Column, value: Value) -> Result<Value> {
        Ok(value)
    }

    /// Current maximum of the surrogate key column (0 for an empty table).
    async fn get_next_key(&self, schema: &Schema, column: &Column) -> Result<i64>;

    /// Called once when a run writing to this connection abends.
    fn on_error(&self, _error: &EtlError) {}
}

/// Receives run status transitions, progress counters and the final snapshot.
pub trait RunObserver: Send + Sync {
    fn on_status(&self, result: &RunResult);

    fn on_progress(&self, _result: &RunResult) {}

    fn on_finish(&self, _result: &RunResult) {}
}
