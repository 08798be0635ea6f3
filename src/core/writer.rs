//! Batches delta output into bulk operations against a target connection.
//!
//! Rows are routed by their operation marker into create, update, delete and
//! reject batches. A full batch is handed to a spawned task and the read loop
//! carries on; each operation kind has one slot holding its in-flight task.
//! Before a flush starts, the slots it depends on are awaited:
//!
//! | flush  | waits for              |
//! |--------|------------------------|
//! | create | create                 |
//! | update | create, update         |
//! | delete | create, update, delete |
//! | reject | reject                 |
//!
//! Unflushed rows of a dependency are flushed first, so an update never
//! reaches the target before the create it refers to.

use crate::core::audit::{RunResult, RunStatus, TracingObserver};
use crate::core::transform::{check_cancel, Transform};
use crate::core::transforms::delta::Operation;
use crate::core::transforms::memory::MemoryTransform;
use crate::core::transforms::validation::STATUS_REJECTED;
use crate::domain::model::{Row, Value};
use crate::domain::ports::{Connection, DeleteQuery, RunObserver, UpdateQuery};
use crate::domain::query::{Filter, Operator, SelectQuery};
use crate::domain::schema::{DeltaType, Schema};
use crate::utils::error::{EtlError, Result};
use crate::utils::logger::run_span;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::Instrument;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub struct WriterConfig {
    /// Rows per bulk operation.
    pub commit_size: usize,
    /// Rows between progress callbacks; 0 disables them.
    pub progress_interval: u64,
    /// Table receiving rejected rows. Rejects are counted and dropped without one.
    pub reject_table: Option<String>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            commit_size: 1000,
            progress_interval: 10_000,
            reject_table: None,
        }
    }
}

const CREATE: usize = 0;
const UPDATE: usize = 1;
const DELETE: usize = 2;
const REJECT: usize = 3;

fn dependencies(slot: usize) -> &'static [usize] {
    match slot {
        CREATE => &[CREATE],
        UPDATE => &[CREATE, UPDATE],
        DELETE => &[CREATE, UPDATE, DELETE],
        _ => &[REJECT],
    }
}

pub struct BufferedWriter {
    connection: Arc<dyn Connection>,
    target: Schema,
    config: WriterConfig,
    observer: Arc<dyn RunObserver>,
}

impl BufferedWriter {
    pub fn new(connection: Arc<dyn Connection>, target: Schema, config: WriterConfig) -> Self {
        Self {
            connection,
            target,
            config,
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Opens `source`, writes every row it yields and returns the final result.
    /// Failures end the run as `Abended` (or `Cancelled`) rather than an `Err`.
    pub async fn run(
        &self,
        run_name: &str,
        audit_key: i64,
        mut source: Box<dyn Transform>,
        cancel: &CancellationToken,
    ) -> RunResult {
        self.run_in_span(run_name, audit_key, source.as_mut(), cancel)
            .instrument(run_span(run_name, audit_key))
            .await
    }

    async fn run_in_span(
        &self,
        run_name: &str,
        audit_key: i64,
        source: &mut dyn Transform,
        cancel: &CancellationToken,
    ) -> RunResult {
        let mut result = RunResult::new(run_name, audit_key);
        self.transition(&mut result, RunStatus::Started, None);

        let mut run = WriteRun::new(self);
        let outcome = run.execute(source, audit_key, &mut result, cancel).await;
        run.abort_in_flight();
        result.absorb_stats(&source.total_stats());

        match outcome {
            Ok(()) if cancel.is_cancelled() => {
                self.transition(&mut result, RunStatus::Cancelled, Some("Run was cancelled".to_string()))
            }
            Ok(()) if result.rows_rejected > 0 => {
                let message = format!("{} rows were rejected", result.rows_rejected);
                self.transition(&mut result, RunStatus::FinishedErrors, Some(message))
            }
            Ok(()) => self.transition(&mut result, RunStatus::Finished, None),
            Err(e) if e.is_cancelled() || cancel.is_cancelled() => {
                self.transition(&mut result, RunStatus::Cancelled, Some(e.to_string()))
            }
            Err(e) => {
                self.connection.on_error(&e);
                result.exception_details = Some(format!("{:?}", e));
                self.transition(&mut result, RunStatus::Abended, Some(e.user_friendly_message()))
            }
        }
        self.observer.on_finish(&result);
        result
    }

    fn transition(&self, result: &mut RunResult, status: RunStatus, message: Option<String>) {
        if result.set_status(status, message) {
            self.observer.on_status(result);
        }
    }
}

/// Per-run state: batches, in-flight slots and column routing.
struct WriteRun<'a> {
    writer: &'a BufferedWriter,
    batches: [Vec<Row>; 4],
    slots: [Option<JoinHandle<Result<()>>>; 4],
    operation_ordinal: Option<usize>,
    status_ordinal: Option<usize>,
    /// Target ordinal to input ordinal.
    target_map: Vec<Option<usize>>,
    key_ordinals: Vec<usize>,
    reject_schema: Schema,
    reject_ready: bool,
    cancel: CancellationToken,
}

impl<'a> WriteRun<'a> {
    fn new(writer: &'a BufferedWriter) -> Self {
        Self {
            writer,
            batches: Default::default(),
            slots: Default::default(),
            operation_ordinal: None,
            status_ordinal: None,
            target_map: Vec::new(),
            key_ordinals: Vec::new(),
            reject_schema: Schema::default(),
            reject_ready: false,
            cancel: CancellationToken::new(),
        }
    }

    fn target(&self) -> &Schema {
        &self.writer.target
    }

    fn bind(&mut self, input: &Schema) {
        let target = &self.writer.target;
        self.operation_ordinal = input.delta_ordinal(DeltaType::DatabaseOperation);
        self.status_ordinal = input.delta_ordinal(DeltaType::ValidationStatus);
        self.target_map = target.columns.iter().map(|c| input.ordinal(&c.name)).collect();
        self.key_ordinals = match target.delta_ordinal(DeltaType::AutoIncrement) {
            Some(o) => vec![o],
            None => target.natural_key_ordinals(),
        };

        let name = self
            .writer
            .config
            .reject_table
            .clone()
            .unwrap_or_else(|| format!("{}_reject", target.name));
        let columns = input
            .columns
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != self.operation_ordinal)
            .map(|(_, c)| c.clone())
            .collect();
        self.reject_schema = Schema::new(name, columns);
    }

    async fn execute(
        &mut self,
        source: &mut dyn Transform,
        audit_key: i64,
        result: &mut RunResult,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.cancel = cancel.child_token();
        source.open(audit_key, &SelectQuery::default(), cancel).await?;
        self.bind(source.schema());
        tracing::debug!(
            "Writing '{}' into '{}' on {}",
            source.name(),
            self.target().name,
            self.writer.connection.name()
        );
        self.writer.transition(result, RunStatus::Running, None);

        loop {
            check_cancel(cancel, "writer")?;
            let Some(row) = source.read_record(cancel).await? else {
                break;
            };
            match self.operation_of(&row)? {
                Operation::Truncate => self.truncate().await?,
                operation => {
                    let slot = match operation {
                        Operation::Create => {
                            result.rows_created += 1;
                            CREATE
                        }
                        Operation::Update => {
                            result.rows_updated += 1;
                            UPDATE
                        }
                        Operation::Delete => {
                            result.rows_deleted += 1;
                            DELETE
                        }
                        _ => {
                            result.rows_rejected += 1;
                            REJECT
                        }
                    };
                    result.rows_total += 1;
                    let row = if slot == REJECT { self.reject_row(row) } else { self.target_row(&row)? };
                    self.batches[slot].push(row);
                    if self.batches[slot].len() >= self.writer.config.commit_size.max(1) {
                        self.flush(slot).await?;
                    }
                    let interval = self.writer.config.progress_interval;
                    if interval > 0 && result.rows_total % interval == 0 {
                        result.absorb_stats(&source.total_stats());
                        self.writer.observer.on_progress(result);
                    }
                }
            }
        }

        for slot in [CREATE, UPDATE, DELETE, REJECT] {
            self.flush(slot).await?;
        }
        for slot in [CREATE, UPDATE, DELETE, REJECT] {
            self.await_slot(slot).await?;
        }
        Ok(())
    }

    fn operation_of(&self, row: &Row) -> Result<Operation> {
        if let Some(o) = self.operation_ordinal {
            return Operation::from_marker(&row[o]).ok_or_else(|| EtlError::ProcessingError {
                message: format!("Unknown operation marker '{}'", row[o]),
            });
        }
        let rejected = self
            .status_ordinal
            .map(|o| row[o].as_str() == Some(STATUS_REJECTED))
            .unwrap_or(false);
        Ok(if rejected { Operation::Reject } else { Operation::Create })
    }

    fn target_row(&self, row: &Row) -> Result<Row> {
        let connection = &self.writer.connection;
        self.target()
            .columns
            .iter()
            .zip(&self.target_map)
            .map(|(column, mapped)| {
                let value = match mapped {
                    Some(o) => row[*o].clone(),
                    None => column.default_or_null(),
                };
                connection.convert_for_write(column, value)
            })
            .collect()
    }

    fn reject_row(&self, row: Row) -> Row {
        row.into_iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != self.operation_ordinal)
            .map(|(_, v)| v)
            .collect()
    }

    async fn await_slot(&mut self, slot: usize) -> Result<()> {
        if let Some(handle) = self.slots[slot].take() {
            handle.await.map_err(|e| EtlError::ProcessingError {
                message: format!("Writer task failed: {}", e),
            })??;
        }
        Ok(())
    }

    async fn flush(&mut self, slot: usize) -> Result<()> {
        for &dependency in dependencies(slot) {
            let waiting = !self.batches[dependency].is_empty();
            if dependency != slot && !waiting {
                continue;
            }
            for &before in dependencies(dependency) {
                self.await_slot(before).await?;
            }
            if waiting {
                self.spawn(dependency).await?;
            }
        }
        Ok(())
    }

    fn key_filters(&self, row: &Row) -> Result<Vec<Filter>> {
        if self.key_ordinals.is_empty() {
            return Err(EtlError::ConfigError {
                message: format!(
                    "Table '{}' has no surrogate or natural key to update or delete by",
                    self.target().name
                ),
            });
        }
        Ok(self
            .key_ordinals
            .iter()
            .map(|&o| {
                let name = self.target().columns[o].name.clone();
                match &row[o] {
                    Value::Null => Filter::new(name, Operator::IsNull, Value::Null),
                    value => Filter::equal(name, value.clone()),
                }
            })
            .collect())
    }

    async fn ensure_reject_table(&mut self) -> Result<()> {
        if self.reject_ready {
            return Ok(());
        }
        let connection = &self.writer.connection;
        let schema = &self.reject_schema;
        if connection.table_exists(schema).await? {
            if !connection.compare_table(schema).await? {
                return Err(EtlError::RejectTableMismatch {
                    table: schema.name.clone(),
                });
            }
        } else {
            tracing::warn!("Creating reject table '{}'", schema.name);
            connection.create_table(schema, false).await?;
        }
        self.reject_ready = true;
        Ok(())
    }

    async fn spawn(&mut self, slot: usize) -> Result<()> {
        let rows = std::mem::take(&mut self.batches[slot]);
        if slot == REJECT {
            if self.writer.config.reject_table.is_none() {
                tracing::warn!("Dropping {} rejected rows, no reject table is configured", rows.len());
                return Ok(());
            }
            self.ensure_reject_table().await?;
        }

        let connection = Arc::clone(&self.writer.connection);
        let cancel = self.cancel.clone();
        let count = rows.len();
        let handle = match slot {
            CREATE | REJECT => {
                let schema = if slot == CREATE { self.target().clone() } else { self.reject_schema.clone() };
                tokio::spawn(async move {
                    let source = Box::new(MemoryTransform::new(schema.clone(), rows));
                    connection
                        .insert_bulk(&schema, source, &cancel)
                        .await
                        .map_err(|e| EtlError::writer("insert", &schema.name, &e))
                })
            }
            UPDATE => {
                let target = self.target().clone();
                let mut updates = Vec::with_capacity(rows.len());
                for row in &rows {
                    let values = target
                        .columns
                        .iter()
                        .enumerate()
                        .filter(|(i, c)| !self.key_ordinals.contains(i) && c.delta_type != DeltaType::AutoIncrement)
                        .map(|(i, c)| (c.name.clone(), row[i].clone()))
                        .collect();
                    updates.push(UpdateQuery {
                        filters: self.key_filters(row)?,
                        values,
                    });
                }
                tokio::spawn(async move {
                    connection
                        .update(&target, updates)
                        .await
                        .map_err(|e| EtlError::writer("update", &target.name, &e))
                })
            }
            _ => {
                let target = self.target().clone();
                let deletes = rows
                    .iter()
                    .map(|row| Ok(DeleteQuery { filters: self.key_filters(row)? }))
                    .collect::<Result<Vec<_>>>()?;
                tokio::spawn(async move {
                    connection
                        .delete(&target, deletes)
                        .await
                        .map_err(|e| EtlError::writer("delete", &target.name, &e))
                })
            }
        };
        tracing::debug!("Flushing {} rows from batch {}", count, slot);
        self.slots[slot] = Some(handle);
        Ok(())
    }

    async fn truncate(&mut self) -> Result<()> {
        for slot in [CREATE, UPDATE, DELETE, REJECT] {
            self.flush(slot).await?;
        }
        for slot in [CREATE, UPDATE, DELETE, REJECT] {
            self.await_slot(slot).await?;
        }
        if self.writer.connection.dynamic_tables() {
            return Ok(());
        }
        let target = self.target();
        tracing::info!("Truncating '{}'", target.name);
        self.writer
            .connection
            .truncate_table(target)
            .await
            .map_err(|e| EtlError::writer("truncate", &target.name, &e))
    }

    /// Stops writes still in flight after a failure or cancellation.
    fn abort_in_flight(&mut self) {
        self.cancel.cancel();
        for handle in self.slots.iter_mut().filter_map(Option::take) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryConnection;
    use crate::core::audit::{ChannelObserver, RunEvent};
    use crate::core::transforms::delta::OPERATION_COLUMN;
    use crate::domain::model::{DataType, Table};
    use crate::domain::schema::Column;
    use std::time::Duration;

    fn target() -> Schema {
        Schema::new(
            "customers",
            vec![
                Column::new("id", DataType::Int).with_delta_type(DeltaType::NaturalKey),
                Column::new("name", DataType::String),
            ],
        )
    }

    fn changes(rows: Vec<(&str, i64, Value)>) -> Box<dyn Transform> {
        let mut columns =
            vec![Column::new(OPERATION_COLUMN, DataType::String).with_delta_type(DeltaType::DatabaseOperation)];
        columns.extend(target().columns);
        let rows = rows
            .into_iter()
            .map(|(op, id, name)| vec![Value::from(op), Value::Int(id), name])
            .collect();
        Box::new(MemoryTransform::new(Schema::new("delta", columns), rows).as_flat_file())
    }

    fn connection() -> MemoryConnection {
        MemoryConnection::new("mem").with_table(Table::new(target(), Vec::new()))
    }

    fn config(commit_size: usize) -> WriterConfig {
        WriterConfig {
            commit_size,
            ..WriterConfig::default()
        }
    }

    #[tokio::test]
    async fn test_updates_wait_for_creates() {
        let connection = Arc::new(connection().with_insert_delay(Duration::from_millis(30)));
        let writer = BufferedWriter::new(connection.clone(), target(), config(1));
        let source = changes(vec![
            ("C", 1, "Ann".into()),
            ("C", 2, "Bob".into()),
            ("U", 1, "Anne".into()),
            ("D", 2, Value::Null),
        ]);
        let result = writer.run("customers", 1, source, &CancellationToken::new()).await;
        assert_eq!(result.status, RunStatus::Finished);

        let log = connection.operations().await;
        let position = |entry: &str| log.iter().position(|e| e == entry).unwrap();
        let last_insert = log.iter().rposition(|e| e == "insert:customers:end").unwrap();
        assert!(position("update:customers:start") > last_insert);
        assert!(position("delete:customers:start") > position("update:customers:end"));

        let table = connection.table("customers").await.unwrap();
        assert_eq!(table.rows, vec![vec![Value::Int(1), Value::from("Anne")]]);
    }

    #[tokio::test]
    async fn test_pending_creates_flush_before_an_update_batch() {
        let connection = Arc::new(connection());
        let writer = BufferedWriter::new(connection.clone(), target(), config(2));
        let source = changes(vec![
            ("C", 1, "Ann".into()),
            ("U", 1, "Anne".into()),
            ("U", 1, "Annie".into()),
        ]);
        let result = writer.run("customers", 1, source, &CancellationToken::new()).await;
        assert_eq!(result.status, RunStatus::Finished);
        let table = connection.table("customers").await.unwrap();
        assert_eq!(table.rows, vec![vec![Value::Int(1), Value::from("Annie")]]);
    }

    #[tokio::test]
    async fn test_statistics_match_rows_written() {
        let connection = Arc::new(connection());
        let writer = BufferedWriter::new(
            connection.clone(),
            target(),
            WriterConfig {
                commit_size: 2,
                progress_interval: 0,
                reject_table: Some("customers_reject".to_string()),
            },
        );
        let source = changes(vec![
            ("C", 1, "Ann".into()),
            ("C", 2, "Bob".into()),
            ("C", 3, "Cy".into()),
            ("R", 4, "".into()),
            ("U", 3, "Cyrus".into()),
            ("D", 1, Value::Null),
        ]);
        let result = writer.run("customers", 9, source, &CancellationToken::new()).await;

        assert_eq!(result.status, RunStatus::FinishedErrors);
        assert_eq!(
            (result.rows_created, result.rows_updated, result.rows_deleted, result.rows_rejected),
            (3, 1, 1, 1)
        );
        assert_eq!(
            result.rows_created + result.rows_updated + result.rows_deleted + result.rows_rejected,
            result.rows_total
        );
        assert_eq!(result.rows_read_primary, 6);

        let rejects = connection.table("customers_reject").await.unwrap();
        assert_eq!(rejects.schema.column_names(), vec!["id", "name"]);
        assert_eq!(rejects.rows, vec![vec![Value::Int(4), Value::from("")]]);
        assert_eq!(connection.table("customers").await.unwrap().rows.len(), 2);
    }

    #[tokio::test]
    async fn test_incompatible_reject_table_abends() {
        let existing = Schema::new("customers_reject", vec![Column::new("id", DataType::String)]);
        let connection = Arc::new(connection().with_table(Table::new(existing, Vec::new())));
        let writer = BufferedWriter::new(
            connection.clone(),
            target(),
            WriterConfig {
                reject_table: Some("customers_reject".to_string()),
                ..config(10)
            },
        );
        let result = writer
            .run("customers", 1, changes(vec![("R", 4, "x".into())]), &CancellationToken::new())
            .await;
        assert_eq!(result.status, RunStatus::Abended);
        assert!(result.exception_details.unwrap().contains("RejectTableMismatch"));
        assert_eq!(connection.errors().len(), 1);
    }

    #[tokio::test]
    async fn test_truncate_marker_clears_target() {
        let existing = Table::new(target(), vec![vec![Value::Int(5), Value::from("Old")]]);
        let connection = Arc::new(MemoryConnection::new("mem").with_table(existing));
        let writer = BufferedWriter::new(connection.clone(), target(), config(10));
        let source = changes(vec![("T", 0, Value::Null), ("C", 1, "Ann".into())]);
        let result = writer.run("customers", 1, source, &CancellationToken::new()).await;

        assert_eq!(result.rows_total, 1);
        let table = connection.table("customers").await.unwrap();
        assert_eq!(table.rows, vec![vec![Value::Int(1), Value::from("Ann")]]);
    }

    #[tokio::test]
    async fn test_dynamic_tables_are_not_truncated() {
        let existing = Table::new(target(), vec![vec![Value::Int(5), Value::from("Old")]]);
        let connection = Arc::new(MemoryConnection::new("mem").with_table(existing).with_dynamic_tables());
        let writer = BufferedWriter::new(connection.clone(), target(), config(10));
        let source = changes(vec![("T", 0, Value::Null), ("C", 1, "Ann".into())]);
        writer.run("customers", 1, source, &CancellationToken::new()).await;
        assert_eq!(connection.table("customers").await.unwrap().rows.len(), 2);
    }

    #[tokio::test]
    async fn test_connection_failure_abends_run() {
        let connection = Arc::new(connection().with_failure("update"));
        let writer = BufferedWriter::new(connection.clone(), target(), config(10));
        let source = changes(vec![("C", 1, "Ann".into()), ("U", 1, "Anne".into())]);
        let result = writer.run("customers", 1, source, &CancellationToken::new()).await;

        assert_eq!(result.status, RunStatus::Abended);
        assert!(result.message.unwrap().contains("update"));
        assert!(result.finished_at.is_some());
        assert_eq!(connection.errors().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_run() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let connection = Arc::new(connection());
        let writer = BufferedWriter::new(connection.clone(), target(), config(10));
        let result = writer.run("customers", 1, changes(vec![("C", 1, "Ann".into())]), &cancel).await;
        assert_eq!(result.status, RunStatus::Cancelled);
        assert!(connection.table("customers").await.unwrap().rows.is_empty());
    }

    #[tokio::test]
    async fn test_rows_without_operation_are_created_or_rejected() {
        let schema = Schema::new(
            "validated",
            vec![
                Column::new("id", DataType::Int),
                Column::new("name", DataType::String),
                Column::new("validation_status", DataType::String).with_delta_type(DeltaType::ValidationStatus),
            ],
        );
        let source = MemoryTransform::new(
            schema,
            vec![
                vec![1.into(), "Ann".into(), "passed".into()],
                vec![2.into(), Value::Null, "rejected".into()],
            ],
        );
        let connection = Arc::new(connection());
        let writer = BufferedWriter::new(connection.clone(), target(), config(10));
        let result = writer.run("customers", 1, Box::new(source), &CancellationToken::new()).await;

        assert_eq!((result.rows_created, result.rows_rejected), (1, 1));
        assert_eq!(result.status, RunStatus::FinishedErrors);
        assert_eq!(connection.table("customers").await.unwrap().rows.len(), 1);
    }

    #[tokio::test]
    async fn test_observer_sees_every_transition() {
        let (observer, mut rx) = ChannelObserver::new();
        let writer = BufferedWriter::new(Arc::new(connection()), target(), WriterConfig {
            commit_size: 10,
            progress_interval: 1,
            reject_table: None,
        })
        .with_observer(Arc::new(observer));
        writer
            .run("customers", 1, changes(vec![("C", 1, "Ann".into())]), &CancellationToken::new())
            .await;

        let mut statuses = Vec::new();
        let mut progress = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                RunEvent::Status(r) => statuses.push(r.status),
                RunEvent::Progress(_) => progress += 1,
                RunEvent::Finished(r) => assert_eq!(r.rows_created, 1),
            }
        }
        assert_eq!(statuses, vec![RunStatus::Started, RunStatus::Running, RunStatus::Finished]);
        assert_eq!(progress, 1);
    }
}
