use crate::core::transform::Transform;
use crate::core::transforms::memory::MemoryTransform;
use crate::domain::model::{Row, Table, Value};
use crate::domain::ports::{Connection, DeleteQuery, UpdateQuery};
use crate::domain::query::{evaluate_filters, SelectQuery};
use crate::domain::schema::{Column, Schema};
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Tables held in memory behind one lock.
///
/// Every operation is appended to a log (`insert:customers:start`, ...) so
/// tests can assert the order writes reached the store in. An optional delay
/// is spent before an insert takes the lock, which lets a later operation
/// overtake it unless the caller waits.
pub struct MemoryConnection {
    name: String,
    tables: Mutex<HashMap<String, Table>>,
    log: Mutex<Vec<String>>,
    errors: std::sync::Mutex<Vec<String>>,
    insert_delay: Option<Duration>,
    failing_operation: Option<String>,
    dynamic_tables: bool,
}

impl MemoryConnection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
            errors: std::sync::Mutex::new(Vec::new()),
            insert_delay: None,
            failing_operation: None,
            dynamic_tables: false,
        }
    }

    pub fn with_table(mut self, table: Table) -> Self {
        self.tables.get_mut().insert(table.schema.name.clone(), table);
        self
    }

    pub fn with_insert_delay(mut self, delay: Duration) -> Self {
        self.insert_delay = Some(delay);
        self
    }

    /// Makes every call of `operation` ("insert", "update", "delete",
    /// "truncate") fail.
    pub fn with_failure(mut self, operation: impl Into<String>) -> Self {
        self.failing_operation = Some(operation.into());
        self
    }

    pub fn with_dynamic_tables(mut self) -> Self {
        self.dynamic_tables = true;
        self
    }

    pub async fn table(&self, name: &str) -> Option<Table> {
        self.tables.lock().await.get(name).cloned()
    }

    pub async fn operations(&self) -> Vec<String> {
        self.log.lock().await.clone()
    }

    /// Messages passed to [`Connection::on_error`].
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().map(|e| e.clone()).unwrap_or_default()
    }

    async fn record(&self, operation: &str, table: &str, phase: &str) {
        self.log.lock().await.push(format!("{}:{}:{}", operation, table, phase));
    }

    fn check_failure(&self, operation: &str, table: &str) -> Result<()> {
        if self.failing_operation.as_deref() == Some(operation) {
            return Err(EtlError::ProcessingError {
                message: format!("{} on '{}' rejected by connection '{}'", operation, table, self.name),
            });
        }
        Ok(())
    }

    fn missing(&self, table: &str) -> EtlError {
        EtlError::ProcessingError {
            message: format!("Table '{}' does not exist on connection '{}'", table, self.name),
        }
    }
}

/// Ordinals in `stored` where each value of `incoming` lands.
fn column_positions(stored: &Schema, incoming: &Schema) -> Vec<Option<usize>> {
    incoming.columns.iter().map(|c| stored.ordinal(&c.name)).collect()
}

#[async_trait]
impl Connection for MemoryConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn dynamic_tables(&self) -> bool {
        self.dynamic_tables
    }

    async fn get_reader(&self, schema: &Schema, _query: &SelectQuery) -> Result<Box<dyn Transform>> {
        let tables = self.tables.lock().await;
        let table = tables.get(&schema.name).ok_or_else(|| self.missing(&schema.name))?;
        Ok(Box::new(MemoryTransform::from_table(table)))
    }

    async fn insert_bulk(
        &self,
        schema: &Schema,
        mut source: Box<dyn Transform>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.record("insert", &schema.name, "start").await;
        if let Some(delay) = self.insert_delay {
            tokio::time::sleep(delay).await;
        }
        self.check_failure("insert", &schema.name)?;

        source.open(0, &SelectQuery::default(), cancel).await?;
        let mut rows = Vec::new();
        while let Some(row) = source.read_record(cancel).await? {
            rows.push(row);
        }

        let mut tables = self.tables.lock().await;
        if !tables.contains_key(&schema.name) && self.dynamic_tables {
            tables.insert(schema.name.clone(), Table::new(schema.clone(), Vec::new()));
        }
        let table = tables.get_mut(&schema.name).ok_or_else(|| self.missing(&schema.name))?;
        let positions = column_positions(&table.schema, source.schema());
        for row in rows {
            let mut stored: Row = table.schema.default_row();
            for (value, position) in row.into_iter().zip(&positions) {
                if let Some(p) = position {
                    stored[*p] = value;
                }
            }
            table.rows.push(stored);
        }
        drop(tables);
        self.record("insert", &schema.name, "end").await;
        Ok(())
    }

    async fn update(&self, schema: &Schema, updates: Vec<UpdateQuery>) -> Result<()> {
        self.record("update", &schema.name, "start").await;
        self.check_failure("update", &schema.name)?;
        let mut tables = self.tables.lock().await;
        let table = tables.get_mut(&schema.name).ok_or_else(|| self.missing(&schema.name))?;
        for update in updates {
            let assignments = update
                .values
                .into_iter()
                .map(|(name, value)| Ok((table.schema.get_ordinal(&name)?, value)))
                .collect::<Result<Vec<(usize, Value)>>>()?;
            for row in table.rows.iter_mut() {
                if evaluate_filters(&update.filters, &table.schema, row)? {
                    for (ordinal, value) in &assignments {
                        row[*ordinal] = value.clone();
                    }
                }
            }
        }
        drop(tables);
        self.record("update", &schema.name, "end").await;
        Ok(())
    }

    async fn delete(&self, schema: &Schema, deletes: Vec<DeleteQuery>) -> Result<()> {
        self.record("delete", &schema.name, "start").await;
        self.check_failure("delete", &schema.name)?;
        let mut tables = self.tables.lock().await;
        let table = tables.get_mut(&schema.name).ok_or_else(|| self.missing(&schema.name))?;
        for delete in deletes {
            let mut kept = Vec::with_capacity(table.rows.len());
            for row in std::mem::take(&mut table.rows) {
                if !evaluate_filters(&delete.filters, &table.schema, &row)? {
                    kept.push(row);
                }
            }
            table.rows = kept;
        }
        drop(tables);
        self.record("delete", &schema.name, "end").await;
        Ok(())
    }

    async fn table_exists(&self, schema: &Schema) -> Result<bool> {
        Ok(self.tables.lock().await.contains_key(&schema.name))
    }

    async fn create_table(&self, schema: &Schema, drop_existing: bool) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if drop_existing || !tables.contains_key(&schema.name) {
            tables.insert(schema.name.clone(), Table::new(schema.clone(), Vec::new()));
        }
        drop(tables);
        self.record("create", &schema.name, "end").await;
        Ok(())
    }

    async fn truncate_table(&self, schema: &Schema) -> Result<()> {
        self.check_failure("truncate", &schema.name)?;
        let mut tables = self.tables.lock().await;
        let table = tables.get_mut(&schema.name).ok_or_else(|| self.missing(&schema.name))?;
        table.rows.clear();
        drop(tables);
        self.record("truncate", &schema.name, "end").await;
        Ok(())
    }

    async fn compare_table(&self, schema: &Schema) -> Result<bool> {
        let tables = self.tables.lock().await;
        Ok(tables
            .get(&schema.name)
            .map(|t| schema.is_compatible_with(&t.schema))
            .unwrap_or(false))
    }

    async fn get_next_key(&self, schema: &Schema, column: &Column) -> Result<i64> {
        let tables = self.tables.lock().await;
        let Some(table) = tables.get(&schema.name) else {
            return Ok(0);
        };
        let ordinal = table.schema.get_ordinal(&column.name)?;
        Ok(table
            .rows
            .iter()
            .filter_map(|row| row[ordinal].as_i64())
            .max()
            .unwrap_or(0))
    }

    fn on_error(&self, error: &EtlError) {
        if let Ok(mut errors) = self.errors.lock() {
            errors.push(error.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::DataType;
    use crate::domain::query::Filter;
    use crate::domain::schema::DeltaType;

    fn customers() -> Table {
        let schema = Schema::new(
            "customers",
            vec![
                Column::new("id", DataType::Int).with_delta_type(DeltaType::NaturalKey),
                Column::new("name", DataType::String),
            ],
        );
        Table::new(schema, vec![vec![1.into(), "Ann".into()], vec![7.into(), "Bob".into()]])
    }

    #[tokio::test]
    async fn test_update_and_delete_by_filter() {
        let connection = MemoryConnection::new("mem").with_table(customers());
        let schema = customers().schema;
        connection
            .update(
                &schema,
                vec![UpdateQuery {
                    filters: vec![Filter::equal("id", 7)],
                    values: vec![("name".to_string(), "Robert".into())],
                }],
            )
            .await
            .unwrap();
        connection
            .delete(&schema, vec![DeleteQuery { filters: vec![Filter::equal("id", 1)] }])
            .await
            .unwrap();

        let table = connection.table("customers").await.unwrap();
        assert_eq!(table.rows, vec![vec![Value::Int(7), Value::from("Robert")]]);
        assert_eq!(
            connection.operations().await,
            vec!["update:customers:start", "update:customers:end", "delete:customers:start", "delete:customers:end"]
        );
    }

    #[tokio::test]
    async fn test_insert_maps_columns_by_name() {
        let connection = MemoryConnection::new("mem").with_table(customers());
        let incoming = Schema::new(
            "customers",
            vec![Column::new("name", DataType::String), Column::new("id", DataType::Int)],
        );
        let source = MemoryTransform::new(incoming.clone(), vec![vec!["Cy".into(), 9.into()]]);
        connection
            .insert_bulk(&incoming, Box::new(source), &CancellationToken::new())
            .await
            .unwrap();

        let table = connection.table("customers").await.unwrap();
        assert_eq!(table.rows[2], vec![Value::Int(9), Value::from("Cy")]);
        let id = table.schema.columns[0].clone();
        assert_eq!(connection.get_next_key(&table.schema, &id).await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_missing_table_and_injected_failure() {
        let connection = MemoryConnection::new("mem").with_failure("truncate");
        let schema = customers().schema;
        assert!(!connection.table_exists(&schema).await.unwrap());
        assert!(connection.get_reader(&schema, &SelectQuery::default()).await.is_err());
        assert!(!connection.compare_table(&schema).await.unwrap());

        connection.create_table(&schema, false).await.unwrap();
        assert!(connection.compare_table(&schema).await.unwrap());
        assert!(connection.truncate_table(&schema).await.is_err());
    }
}
