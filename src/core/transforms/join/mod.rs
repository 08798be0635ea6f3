//! Joins a primary stream to a reference stream on equal keys.
//!
//! When both inputs report the join key ordering the join is a sorted merge
//! that walks the reference one key group at a time. Otherwise the reference
//! is loaded into an ordered map on the first read and each primary row is a
//! map lookup.

pub mod interval;

use crate::core::transform::{check_cancel, Transform, TransformStats};
use crate::core::transforms::filter::FilterTransform;
use crate::domain::model::{format_key, Row, Table, Value};
use crate::domain::query::{sort_satisfies, Filter, Operator, SelectQuery, Sort};
use crate::domain::schema::{Column, DeltaType, Schema};
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use interval::{merge_valid_dates, Interval};
use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicateStrategy {
    #[default]
    Abend,
    First,
    Last,
    /// One output row per matching reference row.
    All,
    /// Reference rows are versions over time; the primary row is split along
    /// their valid-date intervals.
    MergeValidDates,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotFoundStrategy {
    /// Emit the primary row with null reference columns.
    #[default]
    NullJoin,
    Abend,
    /// Drop the primary row.
    Filter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinSide {
    Primary,
    Reference,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinKey {
    pub primary: String,
    pub reference: String,
}

impl JoinKey {
    pub fn new(primary: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            reference: reference.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JoinOperand {
    Column(JoinSide, String),
    Value(Value),
}

/// Extra join condition beside the key equality.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinFilter {
    pub side: JoinSide,
    pub column: String,
    pub operator: Operator,
    pub operand: JoinOperand,
}

impl JoinFilter {
    pub fn value(side: JoinSide, column: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            side,
            column: column.into(),
            operator,
            operand: JoinOperand::Value(value.into()),
        }
    }

    /// A condition between a primary column and a reference column.
    pub fn across(primary: impl Into<String>, operator: Operator, reference: impl Into<String>) -> Self {
        Self {
            side: JoinSide::Primary,
            column: primary.into(),
            operator,
            operand: JoinOperand::Column(JoinSide::Reference, reference.into()),
        }
    }

    fn single_side(&self) -> Option<JoinSide> {
        match &self.operand {
            JoinOperand::Value(_) => Some(self.side),
            JoinOperand::Column(side, _) if *side == self.side => Some(self.side),
            JoinOperand::Column(..) => None,
        }
    }

    fn to_filter(&self) -> Filter {
        match &self.operand {
            JoinOperand::Value(value) => Filter::new(self.column.clone(), self.operator, value.clone()),
            JoinOperand::Column(_, other) => Filter::columns(self.column.clone(), self.operator, other.clone()),
        }
    }
}

/// Column names of the valid-date interval on each side. Columns tagged
/// `ValidFromDate`/`ValidToDate` are used when unset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidDateColumns {
    pub primary_from: Option<String>,
    pub primary_to: Option<String>,
    pub reference_from: Option<String>,
    pub reference_to: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct JoinConfig {
    pub keys: Vec<JoinKey>,
    pub filters: Vec<JoinFilter>,
    pub duplicate_strategy: DuplicateStrategy,
    pub not_found_strategy: NotFoundStrategy,
    /// Emit the matching reference rows as one table-valued column instead of
    /// flattening them.
    pub node_column: Option<String>,
    pub valid_dates: ValidDateColumns,
}

/// Resolved cross-side condition.
struct CrossFilter {
    left: (JoinSide, usize),
    operator: Operator,
    right: ResolvedOperand,
    column: String,
}

enum ResolvedOperand {
    Column(JoinSide, usize),
    Value(Value),
}

struct DateOrdinals {
    primary_from: usize,
    primary_to: usize,
    reference_from: usize,
    reference_to: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Algorithm {
    SortedMerge,
    Hash,
}

/// The reference key group the merge is positioned on.
#[derive(Default)]
struct MergeState {
    group_key: Option<Vec<Value>>,
    group: Vec<Row>,
    lookahead: Option<Row>,
    reference_done: bool,
}

/// Reference columns as they appear after the primary columns. Names taken
/// by the primary are prefixed with the reference schema name.
pub(crate) fn reference_columns(primary: &Schema, reference: &Schema) -> Vec<Column> {
    reference
        .columns
        .iter()
        .map(|column| {
            let mut column = column.clone();
            if primary.ordinal(&column.name).is_some() {
                column.name = format!("{}_{}", reference.name, column.name);
            }
            column.delta_type = DeltaType::TrackingField;
            column.is_incremental_update = false;
            column
        })
        .collect()
}

pub struct JoinTransform {
    primary: Box<dyn Transform>,
    reference: Box<dyn Transform>,
    config: JoinConfig,
    cross_filters: Vec<CrossFilter>,
    schema: Schema,
    primary_keys: Vec<usize>,
    reference_keys: Vec<usize>,
    dates: Option<DateOrdinals>,
    algorithm: Algorithm,
    merge: MergeState,
    hash: Option<BTreeMap<Vec<Value>, Vec<Row>>>,
    output: VecDeque<Row>,
    stats: TransformStats,
}

impl JoinTransform {
    /// Conditions naming only one side are split off into filters on that input.
    pub fn new(primary: Box<dyn Transform>, reference: Box<dyn Transform>, config: JoinConfig) -> Self {
        let pick = |side: JoinSide| -> Vec<Filter> {
            config
                .filters
                .iter()
                .filter(|f| f.single_side() == Some(side))
                .map(JoinFilter::to_filter)
                .collect()
        };
        let primary_filters = pick(JoinSide::Primary);
        let reference_filters = pick(JoinSide::Reference);

        let primary: Box<dyn Transform> = if primary_filters.is_empty() {
            primary
        } else {
            Box::new(FilterTransform::new(primary, primary_filters))
        };
        let reference: Box<dyn Transform> = if reference_filters.is_empty() {
            reference
        } else {
            Box::new(FilterTransform::new(reference, reference_filters))
        };

        Self {
            primary,
            reference,
            config,
            cross_filters: Vec::new(),
            schema: Schema::default(),
            primary_keys: Vec::new(),
            reference_keys: Vec::new(),
            dates: None,
            algorithm: Algorithm::Hash,
            merge: MergeState::default(),
            hash: None,
            output: VecDeque::new(),
            stats: TransformStats::default(),
        }
    }

    /// True once open picked the sorted-merge algorithm.
    pub fn is_sorted_merge(&self) -> bool {
        self.algorithm == Algorithm::SortedMerge
    }

    fn primary_sorts(&self) -> Vec<Sort> {
        self.config.keys.iter().map(|k| Sort::asc(k.primary.clone())).collect()
    }

    fn reference_sorts(&self) -> Vec<Sort> {
        self.config.keys.iter().map(|k| Sort::asc(k.reference.clone())).collect()
    }

    fn build_schema(&self) -> Schema {
        let primary = self.primary.schema();
        let reference = self.reference.schema();
        let mut columns = primary.columns.clone();

        if let Some(node) = &self.config.node_column {
            columns.push(Column::node(node.clone(), reference.clone()));
        } else {
            columns.extend(reference_columns(primary, reference));
        }
        Schema::new(primary.name.clone(), columns)
    }

    fn resolve_cross_filters(&self) -> Result<Vec<CrossFilter>> {
        let ordinal = |side: JoinSide, column: &str| match side {
            JoinSide::Primary => self.primary.schema().get_ordinal(column),
            JoinSide::Reference => self.reference.schema().get_ordinal(column),
        };
        self.config
            .filters
            .iter()
            .filter(|f| f.single_side().is_none())
            .map(|f| {
                Ok(CrossFilter {
                    left: (f.side, ordinal(f.side, &f.column)?),
                    operator: f.operator,
                    right: match &f.operand {
                        JoinOperand::Column(side, column) => ResolvedOperand::Column(*side, ordinal(*side, column)?),
                        JoinOperand::Value(value) => ResolvedOperand::Value(value.clone()),
                    },
                    column: f.column.clone(),
                })
            })
            .collect()
    }

    fn resolve_dates(&self) -> Result<DateOrdinals> {
        let primary = self.primary.schema();
        let reference = self.reference.schema();
        let find = |schema: &Schema, name: &Option<String>, delta: DeltaType, field: &str| -> Result<usize> {
            match name {
                Some(name) => schema.get_ordinal(name),
                None => schema.delta_ordinal(delta).ok_or_else(|| EtlError::ConfigError {
                    message: format!(
                        "Join on '{}' merges valid dates but has no {} column",
                        schema.name, field
                    ),
                }),
            }
        };
        let dates = &self.config.valid_dates;
        Ok(DateOrdinals {
            primary_from: find(primary, &dates.primary_from, DeltaType::ValidFromDate, "valid from")?,
            primary_to: find(primary, &dates.primary_to, DeltaType::ValidToDate, "valid to")?,
            reference_from: find(reference, &dates.reference_from, DeltaType::ValidFromDate, "valid from")?,
            reference_to: find(reference, &dates.reference_to, DeltaType::ValidToDate, "valid to")?,
        })
    }

    fn key_of(row: &Row, ordinals: &[usize]) -> Option<Vec<Value>> {
        let key: Vec<Value> = ordinals.iter().map(|&o| row[o].clone()).collect();
        if key.iter().any(Value::is_null) {
            None
        } else {
            Some(key)
        }
    }

    fn compare_keys(&self, reference: &[Value], primary: &[Value]) -> Result<Ordering> {
        for (i, (r, p)) in reference.iter().zip(primary).enumerate() {
            let ordering = r.compare(p, "join", &self.config.keys[i].primary)?;
            if ordering != Ordering::Equal {
                return Ok(ordering);
            }
        }
        Ok(Ordering::Equal)
    }

    /// Reference keys are converted to the primary key types so equal values
    /// land on the same map entry.
    fn normalise_reference_key(&self, key: Vec<Value>) -> Result<Vec<Value>> {
        let primary = self.primary.schema();
        key.into_iter()
            .zip(&self.primary_keys)
            .map(|(value, &o)| {
                let column = &primary.columns[o];
                column.data_type.convert(&column.name, &value)
            })
            .collect()
    }

    async fn load_hash(&mut self, cancel: &CancellationToken) -> Result<BTreeMap<Vec<Value>, Vec<Row>>> {
        let mut map: BTreeMap<Vec<Value>, Vec<Row>> = BTreeMap::new();
        while let Some(row) = self.reference.read_record(cancel).await? {
            check_cancel(cancel, "join")?;
            if let Some(key) = Self::key_of(&row, &self.reference_keys) {
                let key = self.normalise_reference_key(key)?;
                map.entry(key).or_default().push(row);
            }
        }
        tracing::debug!("Join loaded {} reference keys", map.len());
        Ok(map)
    }

    /// Moves to the next run of reference rows sharing a key. False once the
    /// reference is exhausted.
    async fn advance_group(&mut self, cancel: &CancellationToken) -> Result<bool> {
        self.merge.group_key = None;
        self.merge.group.clear();
        let first = match self.merge.lookahead.take() {
            Some(row) => row,
            None if self.merge.reference_done => return Ok(false),
            None => match self.reference.read_record(cancel).await? {
                Some(row) => row,
                None => {
                    self.merge.reference_done = true;
                    return Ok(false);
                }
            },
        };

        let key: Vec<Value> = self.reference_keys.iter().map(|&o| first[o].clone()).collect();
        let mut group = vec![first];
        loop {
            check_cancel(cancel, "join")?;
            let Some(row) = self.reference.read_record(cancel).await? else {
                self.merge.reference_done = true;
                break;
            };
            let next: Vec<Value> = self.reference_keys.iter().map(|&o| row[o].clone()).collect();
            if self.compare_keys(&next, &key)? == Ordering::Equal {
                group.push(row);
            } else {
                self.merge.lookahead = Some(row);
                break;
            }
        }
        self.merge.group_key = Some(key);
        self.merge.group = group;
        Ok(true)
    }

    /// Reference rows for `key`, advancing the reference while its key is smaller.
    async fn merge_matches(&mut self, key: &[Value], cancel: &CancellationToken) -> Result<Vec<Row>> {
        loop {
            let ordering = match &self.merge.group_key {
                Some(group_key) => self.compare_keys(group_key, key)?,
                None => {
                    if !self.advance_group(cancel).await? {
                        return Ok(Vec::new());
                    }
                    continue;
                }
            };
            match ordering {
                Ordering::Less => self.merge.group_key = None,
                Ordering::Equal => return Ok(self.merge.group.clone()),
                Ordering::Greater => return Ok(Vec::new()),
            }
        }
    }

    fn passes_cross_filters(&self, primary: &Row, reference: &Row) -> Result<bool> {
        let pick = |side: JoinSide, ordinal: usize| match side {
            JoinSide::Primary => &primary[ordinal],
            JoinSide::Reference => &reference[ordinal],
        };
        for filter in &self.cross_filters {
            let left = pick(filter.left.0, filter.left.1);
            let right = match &filter.right {
                ResolvedOperand::Column(side, ordinal) => pick(*side, *ordinal),
                ResolvedOperand::Value(value) => value,
            };
            if !filter.operator.evaluate(left, right, "join", &filter.column)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn joined(&self, primary: &Row, reference: Option<&Row>) -> Row {
        let mut row = primary.clone();
        match reference {
            Some(reference) => row.extend(reference.iter().cloned()),
            None => row.extend(std::iter::repeat(Value::Null).take(self.reference.schema().len())),
        }
        row
    }

    /// Queues the output rows for one primary row and its candidate reference rows.
    fn emit(&mut self, primary: Row, key: Option<Vec<Value>>, candidates: Vec<Row>) -> Result<()> {
        let mut matches = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if self.passes_cross_filters(&primary, &candidate)? {
                matches.push(candidate);
            }
        }

        if matches.is_empty() {
            match self.config.not_found_strategy {
                NotFoundStrategy::Abend => {
                    return Err(EtlError::JoinNotFound {
                        transform: self.schema.name.clone(),
                        key: format_key(&key.unwrap_or_default()),
                    })
                }
                NotFoundStrategy::Filter => {
                    self.stats.rows_filtered += 1;
                    return Ok(());
                }
                NotFoundStrategy::NullJoin => {}
            }
        }

        if self.config.node_column.is_some() {
            let table = Table::new(self.reference.schema().clone(), matches);
            let mut row = primary;
            row.push(Value::Node(Arc::new(table)));
            self.output.push_back(row);
            return Ok(());
        }

        if matches.is_empty() {
            let row = self.joined(&primary, None);
            self.output.push_back(row);
            return Ok(());
        }

        match self.config.duplicate_strategy {
            DuplicateStrategy::MergeValidDates => self.emit_valid_dates(&primary, &matches)?,
            _ if matches.len() == 1 => {
                let row = self.joined(&primary, matches.first());
                self.output.push_back(row);
            }
            DuplicateStrategy::Abend => {
                return Err(EtlError::DuplicateJoinKey {
                    transform: self.schema.name.clone(),
                    key: format_key(&key.unwrap_or_default()),
                })
            }
            DuplicateStrategy::First => {
                let row = self.joined(&primary, matches.first());
                self.output.push_back(row);
            }
            DuplicateStrategy::Last => {
                let row = self.joined(&primary, matches.last());
                self.output.push_back(row);
            }
            DuplicateStrategy::All => {
                for reference in &matches {
                    let row = self.joined(&primary, Some(reference));
                    self.output.push_back(row);
                }
            }
        }
        Ok(())
    }

    fn emit_valid_dates(&mut self, primary: &Row, matches: &[Row]) -> Result<()> {
        let Some(dates) = &self.dates else {
            return Ok(());
        };
        let column = self.primary.schema().columns[dates.primary_from].name.clone();
        let primary_interval = Interval {
            from: primary[dates.primary_from].clone(),
            to: primary[dates.primary_to].clone(),
        };
        let references: Vec<Interval> = matches
            .iter()
            .map(|r| Interval {
                from: r[dates.reference_from].clone(),
                to: r[dates.reference_to].clone(),
            })
            .collect();

        let (from_ordinal, to_ordinal) = (dates.primary_from, dates.primary_to);
        for fragment in merge_valid_dates(&primary_interval, &references, &column)? {
            let mut row = self.joined(primary, fragment.reference.map(|i| &matches[i]));
            row[from_ordinal] = fragment.interval.from;
            row[to_ordinal] = fragment.interval.to;
            self.output.push_back(row);
        }
        Ok(())
    }
}

#[async_trait]
impl Transform for JoinTransform {
    fn name(&self) -> &str {
        "join"
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn sort_fields(&self) -> Vec<Sort> {
        self.primary.sort_fields()
    }

    async fn open(&mut self, audit_key: i64, _query: &SelectQuery, cancel: &CancellationToken) -> Result<()> {
        if self.config.keys.is_empty() {
            return Err(EtlError::ConfigError {
                message: "Join requires at least one key column pair".to_string(),
            });
        }

        let primary_sorts = self.primary_sorts();
        let reference_sorts = self.reference_sorts();
        self.primary
            .open(audit_key, &SelectQuery::sorted(primary_sorts.clone()), cancel)
            .await?;
        self.reference
            .open(audit_key, &SelectQuery::sorted(reference_sorts.clone()), cancel)
            .await?;

        let primary = self.primary.schema();
        let reference = self.reference.schema();
        self.primary_keys = self
            .config
            .keys
            .iter()
            .map(|k| primary.get_ordinal(&k.primary))
            .collect::<Result<_>>()?;
        self.reference_keys = self
            .config
            .keys
            .iter()
            .map(|k| reference.get_ordinal(&k.reference))
            .collect::<Result<_>>()?;

        self.cross_filters = self.resolve_cross_filters()?;
        self.dates = match self.config.duplicate_strategy {
            DuplicateStrategy::MergeValidDates if self.config.node_column.is_none() => Some(self.resolve_dates()?),
            _ => None,
        };
        self.schema = self.build_schema();

        let sorted = sort_satisfies(&self.primary.sort_fields(), &primary_sorts)
            && sort_satisfies(&self.reference.sort_fields(), &reference_sorts);
        self.algorithm = if sorted {
            Algorithm::SortedMerge
        } else {
            Algorithm::Hash
        };
        self.merge = MergeState::default();
        self.hash = None;
        self.output.clear();
        self.stats = TransformStats::default();

        tracing::debug!(
            "Join '{}' to '{}' using {}",
            self.primary.schema().name,
            self.reference.schema().name,
            if sorted { "sorted merge" } else { "hash lookup" }
        );
        Ok(())
    }

    async fn read_record(&mut self, cancel: &CancellationToken) -> Result<Option<Row>> {
        while self.output.is_empty() {
            check_cancel(cancel, "join")?;
            let Some(row) = self.primary.read_record(cancel).await? else {
                return Ok(None);
            };
            let key = Self::key_of(&row, &self.primary_keys);

            let candidates = match (&key, self.algorithm) {
                (None, _) => Vec::new(),
                (Some(key), Algorithm::SortedMerge) => self.merge_matches(key, cancel).await?,
                (Some(key), Algorithm::Hash) => {
                    if self.hash.is_none() {
                        self.hash = Some(self.load_hash(cancel).await?);
                    }
                    self.hash
                        .as_ref()
                        .and_then(|map| map.get(key))
                        .cloned()
                        .unwrap_or_default()
                }
            };
            self.emit(row, key, candidates)?;
        }
        Ok(self.output.pop_front())
    }

    fn stats(&self) -> TransformStats {
        self.stats
    }

    fn primary(&self) -> Option<&dyn Transform> {
        Some(self.primary.as_ref())
    }

    fn reference(&self) -> Option<&dyn Transform> {
        Some(self.reference.as_ref())
    }

    fn reset(&mut self) -> Result<()> {
        self.output.clear();
        self.stats = TransformStats::default();
        self.merge = MergeState::default();
        self.hash = None;
        self.primary.reset()?;
        self.reference.reset()
    }
}

#[cfg(test)]
mod tests;
