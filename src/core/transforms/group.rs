use crate::core::transform::{check_cancel, open_sorted, Capabilities, Transform, TransformStats};
use crate::core::transforms::aggregate::{AggregateFunction, AggregateKind};
use crate::domain::model::{DataType, Row, Value};
use crate::domain::query::{SelectQuery, Sort};
use crate::domain::schema::{Column, Schema};
use crate::utils::error::Result;
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;

/// One aggregate output column.
pub struct AggregateColumn {
    /// Input column; `None` feeds a null per row (e.g. count of rows).
    pub source: Option<String>,
    pub target: String,
    pub function: Box<dyn AggregateFunction>,
}

impl AggregateColumn {
    pub fn new(kind: AggregateKind, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::custom(kind.create(), Some(source.into()), target)
    }

    /// Row count of the group.
    pub fn count_rows(target: impl Into<String>) -> Self {
        Self {
            source: None,
            target: target.into(),
            function: Box::new(RowCount(0)),
        }
    }

    pub fn custom(function: Box<dyn AggregateFunction>, source: Option<String>, target: impl Into<String>) -> Self {
        Self {
            source,
            target: target.into(),
            function,
        }
    }
}

struct RowCount(i64);

impl AggregateFunction for RowCount {
    fn name(&self) -> &str {
        "count"
    }

    fn result_type(&self, _input: Option<DataType>) -> DataType {
        DataType::Int
    }

    fn accumulate(&mut self, _value: &Value, _transform: &str, _column: &str) -> Result<()> {
        self.0 += 1;
        Ok(())
    }

    fn results(&self) -> Vec<Value> {
        vec![Value::Int(self.0)]
    }

    fn reset(&mut self) {
        self.0 = 0;
    }
}

pub struct GroupConfig {
    pub group_columns: Vec<String>,
    pub aggregates: Vec<AggregateColumn>,
    /// Emit every input row with its group's aggregates appended, instead of
    /// one row per group.
    pub pass_through: bool,
}

/// Collapses runs of rows sharing a group key. Input must be sorted by the
/// group columns; an unsorted upstream gets a sort injected at open.
pub struct GroupTransform {
    primary: Box<dyn Transform>,
    config: GroupConfig,
    schema: Schema,
    key_ordinals: Vec<usize>,
    source_ordinals: Vec<Option<usize>>,
    current_key: Option<Vec<Value>>,
    pending: Vec<Row>,
    output: VecDeque<Row>,
    seen_rows: bool,
    finished: bool,
    stats: TransformStats,
}

impl GroupTransform {
    pub fn new(primary: Box<dyn Transform>, config: GroupConfig) -> Self {
        Self {
            primary,
            config,
            schema: Schema::default(),
            key_ordinals: Vec::new(),
            source_ordinals: Vec::new(),
            current_key: None,
            pending: Vec::new(),
            output: VecDeque::new(),
            seen_rows: false,
            finished: false,
            stats: TransformStats::default(),
        }
    }

    fn clear_state(&mut self) {
        self.current_key = None;
        self.pending.clear();
        self.output.clear();
        self.seen_rows = false;
        self.finished = false;
        for aggregate in &mut self.config.aggregates {
            aggregate.function.reset();
        }
    }

    fn same_group(&self, key: &[Value]) -> Result<bool> {
        let Some(current) = &self.current_key else {
            return Ok(true);
        };
        let schema = self.primary.schema();
        for ((a, b), &ordinal) in current.iter().zip(key).zip(&self.key_ordinals) {
            if a.compare(b, "group", &schema.columns[ordinal].name)? != Ordering::Equal {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn accumulate(&mut self, row: &Row) -> Result<()> {
        let schema = self.primary.schema();
        for (aggregate, ordinal) in self.config.aggregates.iter_mut().zip(&self.source_ordinals) {
            match ordinal {
                Some(o) => aggregate
                    .function
                    .accumulate(&row[*o], "group", &schema.columns[*o].name)?,
                None => aggregate.function.accumulate(&Value::Null, "group", &aggregate.target)?,
            }
        }
        Ok(())
    }

    /// Emits the rows for the group that just closed and starts a fresh one.
    fn close_group(&mut self) {
        let results: Vec<Vec<Value>> = self
            .config
            .aggregates
            .iter()
            .map(|a| a.function.results())
            .collect();

        if self.config.pass_through {
            if !self.seen_rows {
                let width = self.schema.len() - self.config.aggregates.len();
                self.pending.push(vec![Value::Null; width]);
            }
            for mut row in self.pending.drain(..) {
                row.extend(results.iter().map(|r| r.first().cloned().unwrap_or(Value::Null)));
                self.output.push_back(row);
            }
        } else {
            let key = self
                .current_key
                .clone()
                .unwrap_or_else(|| vec![Value::Null; self.key_ordinals.len()]);
            let rows = results.iter().map(Vec::len).max().unwrap_or(1).max(1);
            for i in 0..rows {
                let mut row = key.clone();
                row.extend(results.iter().map(|r| match r.len() {
                    1 => r[0].clone(),
                    _ => r.get(i).cloned().unwrap_or(Value::Null),
                }));
                self.output.push_back(row);
            }
        }

        for aggregate in &mut self.config.aggregates {
            aggregate.function.reset();
        }
    }
}

#[async_trait]
impl Transform for GroupTransform {
    fn name(&self) -> &str {
        "group"
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            requires_sort: !self.config.group_columns.is_empty(),
            ..Capabilities::default()
        }
    }

    fn required_sort_fields(&self) -> Vec<Sort> {
        self.config.group_columns.iter().map(Sort::asc).collect()
    }

    fn sort_fields(&self) -> Vec<Sort> {
        self.required_sort_fields()
    }

    async fn open(&mut self, audit_key: i64, _query: &SelectQuery, cancel: &CancellationToken) -> Result<()> {
        let required = self.required_sort_fields();
        open_sorted(&mut self.primary, audit_key, &required, cancel).await?;

        let input = self.primary.schema();
        self.key_ordinals = self
            .config
            .group_columns
            .iter()
            .map(|c| input.get_ordinal(c))
            .collect::<Result<_>>()?;
        self.source_ordinals = self
            .config
            .aggregates
            .iter()
            .map(|a| a.source.as_deref().map(|s| input.get_ordinal(s)).transpose())
            .collect::<Result<_>>()?;

        let mut columns: Vec<Column> = if self.config.pass_through {
            input.columns.clone()
        } else {
            self.key_ordinals.iter().map(|&o| input.columns[o].clone()).collect()
        };
        for (aggregate, ordinal) in self.config.aggregates.iter().zip(&self.source_ordinals) {
            let input_type = ordinal.map(|o| input.columns[o].data_type);
            columns.push(Column::new(
                aggregate.target.clone(),
                aggregate.function.result_type(input_type),
            ));
        }
        self.schema = Schema::new(input.name.clone(), columns);

        self.clear_state();
        self.stats = TransformStats::default();
        tracing::debug!(
            "Group opened on {:?} with {} aggregates",
            self.config.group_columns,
            self.config.aggregates.len()
        );
        Ok(())
    }

    async fn read_record(&mut self, cancel: &CancellationToken) -> Result<Option<Row>> {
        while self.output.is_empty() && !self.finished {
            check_cancel(cancel, "group")?;
            match self.primary.read_record(cancel).await? {
                Some(row) => {
                    let key: Vec<Value> = self.key_ordinals.iter().map(|&o| row[o].clone()).collect();
                    if !self.same_group(&key)? {
                        self.close_group();
                    }
                    self.accumulate(&row)?;
                    if self.config.pass_through {
                        self.pending.push(row);
                    }
                    self.current_key = Some(key);
                    self.seen_rows = true;
                }
                None => {
                    // An empty input still yields one all-null row carrying the
                    // initial aggregate state.
                    self.close_group();
                    self.finished = true;
                }
            }
        }
        Ok(self.output.pop_front())
    }

    fn stats(&self) -> TransformStats {
        self.stats
    }

    fn primary(&self) -> Option<&dyn Transform> {
        Some(self.primary.as_ref())
    }

    fn reset(&mut self) -> Result<()> {
        self.clear_state();
        self.stats = TransformStats::default();
        self.primary.reset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transforms::memory::MemoryTransform;

    fn sales(rows: Vec<Row>) -> MemoryTransform {
        let schema = Schema::new(
            "sales",
            vec![Column::new("region", DataType::String), Column::new("amount", DataType::Int)],
        );
        MemoryTransform::new(schema, rows).as_flat_file()
    }

    async fn drain(t: &mut GroupTransform) -> Vec<Row> {
        let cancel = CancellationToken::new();
        let mut rows = Vec::new();
        while let Some(row) = t.read_record(&cancel).await.unwrap() {
            rows.push(row);
        }
        rows
    }

    fn sum_by_region(pass_through: bool) -> GroupConfig {
        GroupConfig {
            group_columns: vec!["region".to_string()],
            aggregates: vec![
                AggregateColumn::new(AggregateKind::Sum, "amount", "total"),
                AggregateColumn::count_rows("rows"),
            ],
            pass_through,
        }
    }

    #[tokio::test]
    async fn test_sums_per_group_after_implicit_sort() {
        let cancel = CancellationToken::new();
        let source = sales(vec![
            vec!["B".into(), 3.into()],
            vec!["A".into(), 1.into()],
            vec!["A".into(), 2.into()],
        ]);
        let mut t = GroupTransform::new(Box::new(source), sum_by_region(false));
        t.open(0, &SelectQuery::default(), &cancel).await.unwrap();
        assert_eq!(t.schema().column_names(), vec!["region", "total", "rows"]);
        assert_eq!(
            drain(&mut t).await,
            vec![
                vec![Value::from("A"), Value::Int(3), Value::Int(2)],
                vec![Value::from("B"), Value::Int(3), Value::Int(1)],
            ]
        );
        assert_eq!(t.total_stats().rows_sorted, 3);
    }

    #[tokio::test]
    async fn test_pass_through_backfills_group_totals() {
        let cancel = CancellationToken::new();
        let source = sales(vec![
            vec!["A".into(), 1.into()],
            vec!["A".into(), 2.into()],
            vec!["B".into(), 3.into()],
        ]);
        let mut t = GroupTransform::new(Box::new(source), sum_by_region(true));
        t.open(0, &SelectQuery::default(), &cancel).await.unwrap();
        let rows = drain(&mut t).await;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], vec![Value::from("A"), Value::Int(1), Value::Int(3), Value::Int(2)]);
        assert_eq!(rows[1][2], Value::Int(3));
        assert_eq!(rows[2], vec![Value::from("B"), Value::Int(3), Value::Int(3), Value::Int(1)]);
    }

    #[tokio::test]
    async fn test_empty_input_emits_initial_state() {
        let cancel = CancellationToken::new();
        let mut t = GroupTransform::new(Box::new(sales(Vec::new())), sum_by_region(false));
        t.open(0, &SelectQuery::default(), &cancel).await.unwrap();
        assert_eq!(drain(&mut t).await, vec![vec![Value::Null, Value::Null, Value::Int(0)]]);

        let mut t = GroupTransform::new(Box::new(sales(Vec::new())), sum_by_region(true));
        t.open(0, &SelectQuery::default(), &cancel).await.unwrap();
        assert_eq!(
            drain(&mut t).await,
            vec![vec![Value::Null, Value::Null, Value::Null, Value::Int(0)]]
        );
    }

    #[tokio::test]
    async fn test_projecting_aggregate_emits_extra_rows() {
        let cancel = CancellationToken::new();
        let source = sales(vec![
            vec!["A".into(), 1.into()],
            vec!["A".into(), 2.into()],
            vec!["A".into(), 1.into()],
            vec!["B".into(), 5.into()],
        ]);
        let config = GroupConfig {
            group_columns: vec!["region".to_string()],
            aggregates: vec![
                AggregateColumn::new(AggregateKind::Distinct, "amount", "amounts"),
                AggregateColumn::new(AggregateKind::Sum, "amount", "total"),
            ],
            pass_through: false,
        };
        let mut t = GroupTransform::new(Box::new(source), config);
        t.open(0, &SelectQuery::default(), &cancel).await.unwrap();
        assert_eq!(
            drain(&mut t).await,
            vec![
                vec![Value::from("A"), Value::Int(1), Value::Int(4)],
                vec![Value::from("A"), Value::Int(2), Value::Int(4)],
                vec![Value::from("B"), Value::Int(5), Value::Int(5)],
            ]
        );
    }

    #[tokio::test]
    async fn test_reset_regroups_from_start() {
        let cancel = CancellationToken::new();
        let source = sales(vec![vec!["A".into(), 1.into()], vec!["A".into(), 2.into()]]);
        let mut t = GroupTransform::new(Box::new(source), sum_by_region(false));
        t.open(0, &SelectQuery::default(), &cancel).await.unwrap();
        let first = drain(&mut t).await;
        t.reset().unwrap();
        assert_eq!(drain(&mut t).await, first);
    }
}
