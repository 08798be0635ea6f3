//! Gap filling over an ordered series axis.
//!
//! Rows are grouped by the group columns and collapsed to one point per
//! distinct series value. Missing steps between points are filled, the series
//! is extended back to `start` and forward to `finish` (or `projection_steps`
//! past the last point), the series functions run over the filled sequence
//! and the output is trimmed to `[start, finish]`.

use crate::core::transform::{check_cancel, open_sorted, Capabilities, Transform, TransformStats};
use crate::core::transforms::aggregate::{integer_overflow, AggregateFunction, AggregateKind, BuiltinAggregate};
use crate::domain::model::{DataType, Row, Value};
use crate::domain::query::{SelectQuery, Sort};
use crate::domain::schema::{Column, Schema};
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use chrono::{Duration, Months};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Upper bound on the steps any single fill may take.
pub const MAX_FILL_STEPS: usize = 10_000;

pub type NextValueFn = Arc<dyn Fn(&Value) -> Result<Value> + Send + Sync>;

/// How to get from one series value to the next.
#[derive(Clone)]
pub enum SeriesStep {
    Days(i64),
    Hours(i64),
    Minutes(i64),
    Months(u32),
    Integer(i64),
    Number(f64),
    Custom(NextValueFn),
}

impl std::fmt::Debug for SeriesStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SeriesStep::Days(n) => write!(f, "Days({})", n),
            SeriesStep::Hours(n) => write!(f, "Hours({})", n),
            SeriesStep::Minutes(n) => write!(f, "Minutes({})", n),
            SeriesStep::Months(n) => write!(f, "Months({})", n),
            SeriesStep::Integer(n) => write!(f, "Integer({})", n),
            SeriesStep::Number(n) => write!(f, "Number({})", n),
            SeriesStep::Custom(_) => f.write_str("Custom"),
        }
    }
}

impl SeriesStep {
    pub fn next(&self, column: &str, value: &Value) -> Result<Value> {
        let fail = || EtlError::Conversion {
            column: column.to_string(),
            value: value.to_string(),
            data_type: value.type_name().to_string(),
            reason: format!("cannot step {:?}", self),
        };
        let duration = match self {
            SeriesStep::Days(n) => Some(Duration::days(*n)),
            SeriesStep::Hours(n) => Some(Duration::hours(*n)),
            SeriesStep::Minutes(n) => Some(Duration::minutes(*n)),
            _ => None,
        };
        match (self, value) {
            (SeriesStep::Custom(next), v) => next(v),
            (SeriesStep::Days(_), Value::Date(d)) => d
                .checked_add_signed(duration.ok_or_else(fail)?)
                .map(Value::Date)
                .ok_or_else(fail),
            (SeriesStep::Days(_) | SeriesStep::Hours(_) | SeriesStep::Minutes(_), Value::DateTime(dt)) => dt
                .checked_add_signed(duration.ok_or_else(fail)?)
                .map(Value::DateTime)
                .ok_or_else(fail),
            (SeriesStep::Months(n), Value::Date(d)) => d.checked_add_months(Months::new(*n)).map(Value::Date).ok_or_else(fail),
            (SeriesStep::Months(n), Value::DateTime(dt)) => {
                dt.checked_add_months(Months::new(*n)).map(Value::DateTime).ok_or_else(fail)
            }
            (SeriesStep::Integer(n), Value::Int(i)) => i.checked_add(*n).map(Value::Int).ok_or_else(fail),
            (SeriesStep::Number(n), v) => v.as_f64().map(|f| Value::Double(f + n)).ok_or_else(fail),
            _ => Err(fail()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SeriesFunction {
    /// Aggregate of the rows observed at the point.
    Aggregate(AggregateKind),
    /// Running total of point sums; null until the first value.
    CumulativeSum,
    /// Average of the point sums in the last `window` points, skipping gaps.
    MovingAverage(usize),
    /// The previous point's sum.
    Previous,
}

#[derive(Debug, Clone)]
pub struct SeriesColumn {
    pub function: SeriesFunction,
    pub source: String,
    pub target: String,
}

impl SeriesColumn {
    pub fn new(function: SeriesFunction, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            function,
            source: source.into(),
            target: target.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SeriesConfig {
    pub group_columns: Vec<String>,
    pub series_column: String,
    pub step: SeriesStep,
    pub start: Option<Value>,
    pub finish: Option<Value>,
    pub projection_steps: usize,
    pub columns: Vec<SeriesColumn>,
}

impl SeriesConfig {
    pub fn new(series_column: impl Into<String>, step: SeriesStep) -> Self {
        Self {
            group_columns: Vec::new(),
            series_column: series_column.into(),
            step,
            start: None,
            finish: None,
            projection_steps: 0,
            columns: Vec::new(),
        }
    }
}

struct Point {
    value: Value,
    rows: Vec<Row>,
}

pub struct SeriesTransform {
    primary: Box<dyn Transform>,
    config: SeriesConfig,
    schema: Schema,
    group_ordinals: Vec<usize>,
    series_ordinal: usize,
    source_ordinals: Vec<usize>,
    group_key: Option<Vec<Value>>,
    group_rows: Vec<Row>,
    output: VecDeque<Row>,
    finished: bool,
    stats: TransformStats,
}

fn add_numbers(a: &Value, b: &Value, column: &str) -> Result<Value> {
    Ok(match (a, b) {
        (Value::Null, v) | (v, Value::Null) => v.clone(),
        (Value::Int(x), Value::Int(y)) => {
            Value::Int(x.checked_add(*y).ok_or_else(|| integer_overflow("series", column))?)
        }
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => Value::Double(x + y),
            _ => Value::Null,
        },
    })
}

impl SeriesTransform {
    pub fn new(primary: Box<dyn Transform>, config: SeriesConfig) -> Self {
        Self {
            primary,
            config,
            schema: Schema::default(),
            group_ordinals: Vec::new(),
            series_ordinal: 0,
            source_ordinals: Vec::new(),
            group_key: None,
            group_rows: Vec::new(),
            output: VecDeque::new(),
            finished: false,
            stats: TransformStats::default(),
        }
    }

    fn column(&self) -> &str {
        &self.config.series_column
    }

    fn compare(&self, a: &Value, b: &Value) -> Result<Ordering> {
        a.compare(b, "series", self.column())
    }

    fn limit_error(&self, from: &Value, to: &Value) -> EtlError {
        EtlError::SeriesFillLimit {
            column: self.column().to_string(),
            from: from.to_string(),
            to: to.to_string(),
            limit: MAX_FILL_STEPS,
        }
    }

    /// Pushes filler points from `from` while below `end` (or up to it when
    /// `inclusive`). Returns the first value not pushed.
    fn fill(&self, from: Value, end: &Value, inclusive: bool, points: &mut Vec<Point>) -> Result<Value> {
        let mut value = from.clone();
        let mut steps = 0;
        loop {
            let ordering = self.compare(&value, end)?;
            let keep = ordering == Ordering::Less || (inclusive && ordering == Ordering::Equal);
            if !keep {
                return Ok(value);
            }
            steps += 1;
            if steps > MAX_FILL_STEPS {
                return Err(self.limit_error(&from, end));
            }
            let next = self.config.step.next(self.column(), &value)?;
            points.push(Point {
                value,
                rows: Vec::new(),
            });
            value = next;
        }
    }

    /// Fills one group's observed points into the full sequence.
    fn fill_group(&self, observed: Vec<Point>) -> Result<Vec<Point>> {
        let mut points = Vec::new();
        let Some(first) = observed.first() else {
            return Ok(points);
        };
        if let Some(start) = &self.config.start {
            if !start.is_null() {
                self.fill(start.clone(), &first.value.clone(), false, &mut points)?;
            }
        }

        let last_value = observed.last().map(|p| p.value.clone()).unwrap_or(Value::Null);
        let mut observed = observed.into_iter().peekable();
        while let Some(point) = observed.next() {
            let next = self.config.step.next(self.column(), &point.value)?;
            let following = observed.peek().map(|p| p.value.clone());
            points.push(point);
            if let Some(following) = following {
                self.fill(next, &following, false, &mut points)?;
            }
        }

        if self.config.projection_steps > MAX_FILL_STEPS {
            return Err(self.limit_error(&last_value, &last_value));
        }
        let mut end = last_value.clone();
        for _ in 0..self.config.projection_steps {
            end = self.config.step.next(self.column(), &end)?;
        }
        if let Some(finish) = &self.config.finish {
            if !finish.is_null() && self.compare(finish, &end)? == Ordering::Greater {
                end = finish.clone();
            }
        }
        let next = self.config.step.next(self.column(), &last_value)?;
        self.fill(next, &end, true, &mut points)?;
        Ok(points)
    }

    fn in_bounds(&self, value: &Value) -> Result<bool> {
        if let Some(start) = self.config.start.as_ref().filter(|v| !v.is_null()) {
            if self.compare(value, start)? == Ordering::Less {
                return Ok(false);
            }
        }
        if let Some(finish) = self.config.finish.as_ref().filter(|v| !v.is_null()) {
            if self.compare(value, finish)? == Ordering::Greater {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn point_sum(&self, point: &Point, ordinal: usize) -> Result<Value> {
        let mut sum = BuiltinAggregate::new(AggregateKind::Sum);
        let column = &self.primary.schema().columns[ordinal].name;
        for row in &point.rows {
            sum.accumulate(&row[ordinal], "series", column)?;
        }
        Ok(sum.results().into_iter().next().unwrap_or(Value::Null))
    }

    /// Values of one series column over the whole filled sequence.
    fn evaluate(&self, spec: &SeriesColumn, ordinal: usize, points: &[Point]) -> Result<Vec<Value>> {
        let mut values = Vec::with_capacity(points.len());
        match spec.function {
            SeriesFunction::Aggregate(kind) => {
                let column = &self.primary.schema().columns[ordinal].name;
                let mut aggregate = kind.create();
                for point in points {
                    aggregate.reset();
                    for row in &point.rows {
                        aggregate.accumulate(&row[ordinal], "series", column)?;
                    }
                    values.push(aggregate.results().into_iter().next().unwrap_or(Value::Null));
                }
            }
            SeriesFunction::CumulativeSum => {
                let column = &self.primary.schema().columns[ordinal].name;
                let mut running = Value::Null;
                for point in points {
                    running = add_numbers(&running, &self.point_sum(point, ordinal)?, column)?;
                    values.push(running.clone());
                }
            }
            SeriesFunction::MovingAverage(window) => {
                let mut recent: VecDeque<Option<f64>> = VecDeque::new();
                for point in points {
                    recent.push_back(self.point_sum(point, ordinal)?.as_f64());
                    if recent.len() > window.max(1) {
                        recent.pop_front();
                    }
                    let present: Vec<f64> = recent.iter().flatten().copied().collect();
                    values.push(if present.is_empty() {
                        Value::Null
                    } else {
                        Value::Double(present.iter().sum::<f64>() / present.len() as f64)
                    });
                }
            }
            SeriesFunction::Previous => {
                let mut previous = Value::Null;
                for point in points {
                    values.push(previous);
                    previous = self.point_sum(point, ordinal)?;
                }
            }
        }
        Ok(values)
    }

    fn close_group(&mut self) -> Result<()> {
        let rows = std::mem::take(&mut self.group_rows);
        let Some(key) = self.group_key.take() else {
            return Ok(());
        };

        let mut observed: Vec<Point> = Vec::new();
        for row in rows {
            let value = row[self.series_ordinal].clone();
            if value.is_null() {
                self.stats.rows_ignored += 1;
                continue;
            }
            match observed.last_mut() {
                Some(point) if self.compare(&point.value, &value)? == Ordering::Equal => point.rows.push(row),
                _ => observed.push(Point {
                    value,
                    rows: vec![row],
                }),
            }
        }

        let points = self.fill_group(observed)?;
        let columns = self
            .config
            .columns
            .iter()
            .zip(&self.source_ordinals)
            .map(|(spec, &ordinal)| self.evaluate(spec, ordinal, &points))
            .collect::<Result<Vec<_>>>()?;

        for (i, point) in points.iter().enumerate() {
            if !self.in_bounds(&point.value)? {
                continue;
            }
            let mut row = key.clone();
            row.push(point.value.clone());
            row.extend(columns.iter().map(|c| c[i].clone()));
            self.output.push_back(row);
        }
        Ok(())
    }

    fn result_type(&self, spec: &SeriesColumn, input: DataType) -> DataType {
        match spec.function {
            SeriesFunction::Aggregate(kind) => kind.create().result_type(Some(input)),
            SeriesFunction::MovingAverage(_) => DataType::Double,
            SeriesFunction::CumulativeSum | SeriesFunction::Previous => match input {
                DataType::Int => DataType::Int,
                _ => DataType::Double,
            },
        }
    }
}

#[async_trait]
impl Transform for SeriesTransform {
    fn name(&self) -> &str {
        "series"
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            requires_sort: true,
            ..Capabilities::default()
        }
    }

    fn required_sort_fields(&self) -> Vec<Sort> {
        let mut sorts: Vec<Sort> = self.config.group_columns.iter().map(Sort::asc).collect();
        sorts.push(Sort::asc(self.config.series_column.clone()));
        sorts
    }

    fn sort_fields(&self) -> Vec<Sort> {
        self.required_sort_fields()
    }

    async fn open(&mut self, audit_key: i64, _query: &SelectQuery, cancel: &CancellationToken) -> Result<()> {
        let required = self.required_sort_fields();
        open_sorted(&mut self.primary, audit_key, &required, cancel).await?;

        let input = self.primary.schema();
        self.group_ordinals = self
            .config
            .group_columns
            .iter()
            .map(|c| input.get_ordinal(c))
            .collect::<Result<_>>()?;
        self.series_ordinal = input.get_ordinal(&self.config.series_column)?;
        self.source_ordinals = self
            .config
            .columns
            .iter()
            .map(|c| input.get_ordinal(&c.source))
            .collect::<Result<_>>()?;

        let series_type = input.columns[self.series_ordinal].data_type;
        for bound in [&mut self.config.start, &mut self.config.finish].into_iter().flatten() {
            *bound = series_type.convert(&self.config.series_column, bound)?;
        }

        let mut columns: Vec<Column> = self.group_ordinals.iter().map(|&o| input.columns[o].clone()).collect();
        columns.push(input.columns[self.series_ordinal].clone());
        for (spec, &ordinal) in self.config.columns.iter().zip(&self.source_ordinals) {
            let data_type = self.result_type(spec, input.columns[ordinal].data_type);
            columns.push(Column::new(spec.target.clone(), data_type));
        }
        self.schema = Schema::new(input.name.clone(), columns);

        self.group_key = None;
        self.group_rows.clear();
        self.output.clear();
        self.finished = false;
        self.stats = TransformStats::default();
        Ok(())
    }

    async fn read_record(&mut self, cancel: &CancellationToken) -> Result<Option<Row>> {
        while self.output.is_empty() && !self.finished {
            check_cancel(cancel, "series")?;
            match self.primary.read_record(cancel).await? {
                Some(row) => {
                    let key: Vec<Value> = self.group_ordinals.iter().map(|&o| row[o].clone()).collect();
                    let same = match &self.group_key {
                        None => true,
                        Some(current) => current
                            .iter()
                            .zip(&key)
                            .all(|(a, b)| a.try_compare(b) == Some(Ordering::Equal)),
                    };
                    if !same {
                        self.close_group()?;
                    }
                    self.group_key = Some(key);
                    self.group_rows.push(row);
                }
                None => {
                    self.close_group()?;
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
        self.group_key = None;
        self.group_rows.clear();
        self.output.clear();
        self.finished = false;
        self.stats = TransformStats::default();
        self.primary.reset()
    }
}
