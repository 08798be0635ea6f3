//! Change detection against a target table (SCD / CDC).
//!
//! The primary input is merged with the current rows of the target on the
//! natural key. Each output row starts with an operation marker column
//! ([`OPERATION_COLUMN`]) followed by the target's columns, and is routed by
//! the buffered writer.

use crate::core::cache::{CachePolicy, CachedTransform};
use crate::core::encryption::ValueCipher;
use crate::core::transform::{check_cancel, open_sorted, Capabilities, Transform, TransformStats};
use crate::core::transforms::memory::MemoryTransform;
use crate::core::transforms::validation::STATUS_REJECTED;
use crate::domain::model::{format_key, DataType, Row, Value};
use crate::domain::query::{Filter, Operator, SelectQuery, Sort};
use crate::domain::schema::{Column, DeltaType, Schema, SecurityFlag};
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const OPERATION_COLUMN: &str = "operation";

/// Surrogate key of the synthetic default row.
pub const DEFAULT_ROW_KEY: i64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
    Delete,
    Reject,
    Truncate,
}

impl Operation {
    pub fn marker(self) -> &'static str {
        match self {
            Operation::Create => "C",
            Operation::Update => "U",
            Operation::Delete => "D",
            Operation::Reject => "R",
            Operation::Truncate => "T",
        }
    }

    pub fn from_marker(value: &Value) -> Option<Self> {
        match value.as_str()? {
            "C" => Some(Operation::Create),
            "U" => Some(Operation::Update),
            "D" => Some(Operation::Delete),
            "R" => Some(Operation::Reject),
            "T" => Some(Operation::Truncate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateStrategy {
    /// Every row is created, nothing is compared.
    #[default]
    Append,
    /// Truncate the target, then create every row.
    Reload,
    AppendUpdate,
    AppendUpdateDelete,
    /// Changes expire the current version and create a new one.
    AppendUpdatePreserve,
    AppendUpdateDeletePreserve,
}

impl UpdateStrategy {
    pub fn parse_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().replace(['_', '-'], "").as_str() {
            "append" => Some(UpdateStrategy::Append),
            "reload" => Some(UpdateStrategy::Reload),
            "appendupdate" => Some(UpdateStrategy::AppendUpdate),
            "appendupdatedelete" => Some(UpdateStrategy::AppendUpdateDelete),
            "appendupdatepreserve" => Some(UpdateStrategy::AppendUpdatePreserve),
            "appendupdatedeletepreserve" => Some(UpdateStrategy::AppendUpdateDeletePreserve),
            _ => None,
        }
    }

    pub fn do_update(self) -> bool {
        !matches!(self, UpdateStrategy::Append | UpdateStrategy::Reload)
    }

    pub fn do_delete(self) -> bool {
        matches!(
            self,
            UpdateStrategy::AppendUpdateDelete | UpdateStrategy::AppendUpdateDeletePreserve
        )
    }

    pub fn do_preserve(self) -> bool {
        matches!(
            self,
            UpdateStrategy::AppendUpdatePreserve | UpdateStrategy::AppendUpdateDeletePreserve
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeltaConfig {
    pub update_strategy: UpdateStrategy,
    /// Current maximum surrogate key of the target; new keys count up from here.
    pub surrogate_key_seed: i64,
    pub add_default_row: bool,
    /// Emit a truncate marker first even when the strategy is not `Reload`.
    pub truncate_target: bool,
    /// Timestamp stamped on audit dates and expired versions. Defaults to now.
    pub run_time: Option<NaiveDateTime>,
    /// Decrypts encrypted and hashes one-way target columns before comparing.
    pub cipher: Option<Arc<ValueCipher>>,
}

impl DeltaConfig {
    pub fn new(update_strategy: UpdateStrategy) -> Self {
        Self {
            update_strategy,
            ..Self::default()
        }
    }

    pub fn with_surrogate_key_seed(mut self, seed: i64) -> Self {
        self.surrogate_key_seed = seed;
        self
    }
}

/// Target ordinals of the columns with a managed role.
#[derive(Debug, Default)]
struct Roles {
    natural_keys: Vec<usize>,
    primary_keys: Vec<usize>,
    surrogate: Option<usize>,
    valid_from: Option<usize>,
    valid_to: Option<usize>,
    is_current: Option<usize>,
    version: Option<usize>,
    create_audit: Option<usize>,
    update_audit: Option<usize>,
    create_date: Option<usize>,
    update_date: Option<usize>,
    tracking: Vec<usize>,
    primary_status: Option<usize>,
}

fn is_managed(delta_type: DeltaType) -> bool {
    matches!(
        delta_type,
        DeltaType::AutoIncrement
            | DeltaType::CreateAuditKey
            | DeltaType::UpdateAuditKey
            | DeltaType::CreateDate
            | DeltaType::UpdateDate
            | DeltaType::IsCurrentField
            | DeltaType::Version
            | DeltaType::DatabaseOperation
    )
}

pub struct DeltaTransform {
    primary: Box<dyn Transform>,
    reference: Box<dyn Transform>,
    config: DeltaConfig,
    schema: Schema,
    target: Schema,
    /// Target ordinal to primary ordinal, by column name.
    mapping: Vec<Option<usize>>,
    /// Primary reject columns carried after the target columns.
    extras: Vec<usize>,
    roles: Roles,
    audit_key: i64,
    run_time: NaiveDateTime,
    next_surrogate: i64,
    pending: VecDeque<Row>,
    started: bool,
    finished: bool,
    reference_peek: Option<Row>,
    reference_done: bool,
    /// Natural key and stored version of the previous primary row.
    last: Option<(Vec<Value>, Row)>,
    default_key: Option<Vec<Value>>,
    stats: TransformStats,
}

impl DeltaTransform {
    /// `reference` reads the target table; its schema is the output schema
    /// after the operation column.
    pub fn new(primary: Box<dyn Transform>, reference: Box<dyn Transform>, config: DeltaConfig) -> Self {
        Self {
            primary,
            reference,
            config,
            schema: Schema::default(),
            target: Schema::default(),
            mapping: Vec::new(),
            extras: Vec::new(),
            roles: Roles::default(),
            audit_key: 0,
            run_time: NaiveDateTime::MIN,
            next_surrogate: 0,
            pending: VecDeque::new(),
            started: false,
            finished: false,
            reference_peek: None,
            reference_done: false,
            last: None,
            default_key: None,
            stats: TransformStats::default(),
        }
    }

    pub fn target_schema(&self) -> &Schema {
        &self.target
    }

    fn strategy(&self) -> UpdateStrategy {
        self.config.update_strategy
    }

    fn resolve_roles(&mut self) -> Result<()> {
        let target = &self.target;
        let input = self.primary.schema();
        let natural_keys = target.natural_key_ordinals();
        if natural_keys.is_empty() && self.config.update_strategy.do_update() {
            return Err(EtlError::ConfigError {
                message: format!(
                    "Target table '{}' has no natural key column, which the {:?} strategy requires",
                    target.name, self.config.update_strategy
                ),
            });
        }
        let primary_keys = natural_keys
            .iter()
            .map(|&o| input.get_ordinal(&target.columns[o].name))
            .collect::<Result<Vec<_>>>()?;

        self.mapping = target
            .columns
            .iter()
            .map(|c| if is_managed(c.delta_type) { None } else { input.ordinal(&c.name) })
            .collect();
        let tracking = target
            .columns
            .iter()
            .enumerate()
            .filter(|(i, c)| c.delta_type == DeltaType::TrackingField && self.mapping[*i].is_some())
            .map(|(i, _)| i)
            .collect();
        self.extras = input
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| {
                matches!(c.delta_type, DeltaType::RejectedReason | DeltaType::ValidationStatus)
                    && target.ordinal(&c.name).is_none()
            })
            .map(|(i, _)| i)
            .collect();

        self.roles = Roles {
            natural_keys,
            primary_keys,
            surrogate: target.delta_ordinal(DeltaType::AutoIncrement),
            valid_from: target.delta_ordinal(DeltaType::ValidFromDate),
            valid_to: target.delta_ordinal(DeltaType::ValidToDate),
            is_current: target.delta_ordinal(DeltaType::IsCurrentField),
            version: target.delta_ordinal(DeltaType::Version),
            create_audit: target.delta_ordinal(DeltaType::CreateAuditKey),
            update_audit: target.delta_ordinal(DeltaType::UpdateAuditKey),
            create_date: target.delta_ordinal(DeltaType::CreateDate),
            update_date: target.delta_ordinal(DeltaType::UpdateDate),
            tracking,
            primary_status: input.delta_ordinal(DeltaType::ValidationStatus),
        };
        Ok(())
    }

    fn build_schema(&mut self) {
        let mut columns = vec![Column::new(OPERATION_COLUMN, DataType::String).with_delta_type(DeltaType::DatabaseOperation)];
        columns.extend(self.target.columns.iter().cloned());
        let input = self.primary.schema();
        columns.extend(self.extras.iter().map(|&o| input.columns[o].clone()));
        self.schema = Schema::new(self.target.name.clone(), columns);
    }

    fn run_time_as(&self, ordinal: usize) -> Result<Value> {
        let column = &self.target.columns[ordinal];
        column.data_type.convert(&column.name, &Value::DateTime(self.run_time))
    }

    fn set(row: &mut Row, ordinal: Option<usize>, value: Value) {
        if let Some(o) = ordinal {
            row[o] = value;
        }
    }

    /// Primary values in target shape; unmapped columns take their defaults.
    fn from_primary(&self, primary: &Row) -> Result<Row> {
        let mut row = Vec::with_capacity(self.target.len());
        for (column, mapped) in self.target.columns.iter().zip(&self.mapping) {
            let value = match mapped {
                Some(o) => column.data_type.convert(&column.name, &primary[*o])?,
                None => column.default_or_null(),
            };
            row.push(match &self.config.cipher {
                Some(cipher) if mapped.is_some() => cipher.protect(column, &value)?,
                _ => value,
            });
        }
        Ok(row)
    }

    /// Rejected rows keep values that fail conversion as they arrived.
    fn reject_row(&self, primary: &Row) -> Result<Row> {
        self.target
            .columns
            .iter()
            .zip(&self.mapping)
            .map(|(column, mapped)| match mapped {
                Some(o) => {
                    let value = column
                        .data_type
                        .convert(&column.name, &primary[*o])
                        .unwrap_or_else(|_| primary[*o].clone());
                    match &self.config.cipher {
                        Some(cipher) => cipher.protect(column, &value),
                        None => Ok(value),
                    }
                }
                None => Ok(column.default_or_null()),
            })
            .collect()
    }

    fn primary_key(&self, primary: &Row) -> Result<Vec<Value>> {
        self.roles
            .natural_keys
            .iter()
            .zip(&self.roles.primary_keys)
            .map(|(&t, &p)| {
                let column = &self.target.columns[t];
                column.data_type.convert(&column.name, &primary[p])
            })
            .collect()
    }

    fn target_key(&self, row: &Row) -> Vec<Value> {
        self.roles.natural_keys.iter().map(|&o| row[o].clone()).collect()
    }

    fn compare_keys(&self, a: &[Value], b: &[Value]) -> Result<Ordering> {
        for (i, (x, y)) in a.iter().zip(b).enumerate() {
            let column = &self.target.columns[self.roles.natural_keys[i]].name;
            match x.compare(y, "delta", column)? {
                Ordering::Equal => continue,
                unequal => return Ok(unequal),
            }
        }
        Ok(Ordering::Equal)
    }

    fn allocate_surrogate(&mut self) -> Value {
        self.next_surrogate += 1;
        Value::Int(self.next_surrogate)
    }

    fn output(&self, operation: Operation, row: Row, primary: Option<&Row>) -> Row {
        let mut out = Vec::with_capacity(self.schema.len());
        out.push(Value::from(operation.marker()));
        out.extend(row);
        out.extend(
            self.extras
                .iter()
                .map(|&o| primary.map(|p| p[o].clone()).unwrap_or(Value::Null)),
        );
        out
    }

    fn emit(&mut self, operation: Operation, row: Row, primary: Option<&Row>) {
        let out = self.output(operation, row, primary);
        self.pending.push_back(out);
    }

    /// A new version built from a primary row with a fresh surrogate key.
    fn new_version(&mut self, primary: &Row) -> Result<Row> {
        let mut row = self.from_primary(primary)?;
        let surrogate = self.allocate_surrogate();
        Self::set(&mut row, self.roles.surrogate, surrogate);
        self.stamp_created(&mut row)?;
        if let Some(o) = self.roles.valid_from {
            if row[o].is_null() {
                row[o] = self.run_time_as(o)?;
            }
        }
        Ok(row)
    }

    fn stamp_created(&self, row: &mut Row) -> Result<()> {
        Self::set(row, self.roles.create_audit, Value::Int(self.audit_key));
        Self::set(row, self.roles.update_audit, Value::Int(self.audit_key));
        for ordinal in [self.roles.create_date, self.roles.update_date].into_iter().flatten() {
            row[ordinal] = self.run_time_as(ordinal)?;
        }
        Self::set(row, self.roles.is_current, Value::Boolean(true));
        Self::set(row, self.roles.version, Value::Int(1));
        Ok(())
    }

    fn stamp_updated(&self, row: &mut Row) -> Result<()> {
        Self::set(row, self.roles.update_audit, Value::Int(self.audit_key));
        if let Some(o) = self.roles.update_date {
            row[o] = self.run_time_as(o)?;
        }
        Ok(())
    }

    /// True when a tracking column differs between the stored row and the
    /// incoming values.
    fn has_changed(&self, stored: &Row, incoming: &Row) -> Result<bool> {
        for &t in &self.roles.tracking {
            let column = &self.target.columns[t];
            let (old, new) = match (&self.config.cipher, column.security_flag) {
                (Some(_), SecurityFlag::Hide) => continue,
                (Some(cipher), SecurityFlag::Encrypt) => (
                    cipher.decrypt(&column.name, &stored[t], column.data_type)?,
                    cipher.decrypt(&column.name, &incoming[t], column.data_type)?,
                ),
                _ => (stored[t].clone(), incoming[t].clone()),
            };
            if new.compare(&old, "delta", &column.name)? != Ordering::Equal {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn is_history(&self, row: &Row) -> bool {
        self.roles
            .is_current
            .map(|o| row[o] == Value::Boolean(false))
            .unwrap_or(false)
    }

    fn is_default_row(&self, row: &Row) -> Result<bool> {
        let Some(default_key) = &self.default_key else {
            return Ok(false);
        };
        match self.roles.surrogate {
            Some(o) => Ok(row[o] == Value::Int(DEFAULT_ROW_KEY)),
            None => Ok(self.compare_keys(&self.target_key(row), default_key)? == Ordering::Equal),
        }
    }

    async fn next_reference(&mut self, cancel: &CancellationToken) -> Result<Option<Row>> {
        if let Some(row) = self.reference_peek.take() {
            return Ok(Some(row));
        }
        while !self.reference_done {
            match self.reference.read_record(cancel).await? {
                Some(row) if self.is_history(&row) || self.is_default_row(&row)? => continue,
                Some(row) => return Ok(Some(row)),
                None => self.reference_done = true,
            }
        }
        Ok(None)
    }

    /// Moves the reference past every key below `key`, handling those rows as
    /// missing from the input. Returns the current stored row for `key`.
    async fn advance_reference(&mut self, key: &[Value], cancel: &CancellationToken) -> Result<Option<Row>> {
        loop {
            let Some(row) = self.next_reference(cancel).await? else {
                return Ok(None);
            };
            let reference_key = self.target_key(&row);
            match self.compare_keys(&reference_key, key)? {
                Ordering::Less => self.handle_missing(row)?,
                Ordering::Equal => {
                    // Later rows for the key are older versions.
                    while let Some(next) = self.next_reference(cancel).await? {
                        if self.compare_keys(&self.target_key(&next), key)? != Ordering::Equal {
                            self.reference_peek = Some(next);
                            break;
                        }
                    }
                    return Ok(Some(row));
                }
                Ordering::Greater => {
                    self.reference_peek = Some(row);
                    return Ok(None);
                }
            }
        }
    }

    /// A stored row with no counterpart in the input.
    fn handle_missing(&mut self, stored: Row) -> Result<()> {
        if !self.strategy().do_delete() {
            return Ok(());
        }
        if self.strategy().do_preserve() {
            let mut expired = stored;
            if let Some(o) = self.roles.valid_to {
                expired[o] = self.run_time_as(o)?;
            }
            Self::set(&mut expired, self.roles.is_current, Value::Boolean(false));
            self.stamp_updated(&mut expired)?;
            self.emit(Operation::Update, expired, None);
        } else {
            self.emit(Operation::Delete, stored, None);
        }
        Ok(())
    }

    /// Compares an input row against the stored version of its key.
    fn apply_change(&mut self, key: Vec<Value>, stored: Row, primary: &Row) -> Result<()> {
        let incoming = self.from_primary(primary)?;
        if !self.has_changed(&stored, &incoming)? {
            self.stats.rows_ignored += 1;
            self.last = Some((key, stored));
            return Ok(());
        }

        if self.strategy().do_preserve() {
            let valid_from = match self.roles.valid_from {
                Some(o) if !incoming[o].is_null() => incoming[o].clone(),
                Some(o) => self.run_time_as(o)?,
                None => Value::DateTime(self.run_time),
            };
            let mut expired = stored.clone();
            Self::set(&mut expired, self.roles.valid_to, valid_from.clone());
            Self::set(&mut expired, self.roles.is_current, Value::Boolean(false));
            self.stamp_updated(&mut expired)?;
            self.emit(Operation::Update, expired, Some(primary));
            self.stats.rows_preserved += 1;

            let mut version = self.new_version(primary)?;
            Self::set(&mut version, self.roles.valid_from, valid_from);
            if let Some(o) = self.roles.version {
                version[o] = Value::Int(stored[o].as_i64().unwrap_or(0) + 1);
            }
            self.emit(Operation::Create, version.clone(), Some(primary));
            self.last = Some((key, version));
        } else {
            let mut updated = stored;
            for (o, column) in self.target.columns.iter().enumerate() {
                if self.mapping[o].is_some() && column.delta_type != DeltaType::IgnoreField {
                    updated[o] = incoming[o].clone();
                }
            }
            self.stamp_updated(&mut updated)?;
            self.emit(Operation::Update, updated.clone(), Some(primary));
            self.last = Some((key, updated));
        }
        Ok(())
    }

    fn is_rejected(&self, primary: &Row) -> bool {
        self.roles
            .primary_status
            .map(|o| primary[o].as_str() == Some(STATUS_REJECTED))
            .unwrap_or(false)
    }

    async fn process(&mut self, primary: Row, cancel: &CancellationToken) -> Result<()> {
        if self.is_rejected(&primary) {
            let row = self.reject_row(&primary)?;
            self.emit(Operation::Reject, row, Some(&primary));
            return Ok(());
        }
        if !self.strategy().do_update() {
            let row = self.new_version(&primary)?;
            self.emit(Operation::Create, row, Some(&primary));
            return Ok(());
        }

        let key = self.primary_key(&primary)?;
        let previous = match &self.last {
            Some((last_key, stored)) if self.compare_keys(last_key, &key)? == Ordering::Equal => Some(stored.clone()),
            _ => None,
        };
        let stored = match previous {
            Some(stored) => Some(stored),
            None => self.advance_reference(&key, cancel).await?,
        };
        match stored {
            Some(stored) => self.apply_change(key, stored, &primary),
            None => {
                let row = self.new_version(&primary)?;
                self.emit(Operation::Create, row.clone(), Some(&primary));
                self.last = Some((key, row));
                Ok(())
            }
        }
    }

    async fn start(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.started = true;
        if self.config.truncate_target || self.strategy() == UpdateStrategy::Reload {
            let row = self.target.null_row();
            self.emit(Operation::Truncate, row, None);
        }
        if self.config.add_default_row {
            self.emit_default_row(cancel).await?;
        }
        Ok(())
    }

    async fn emit_default_row(&mut self, cancel: &CancellationToken) -> Result<()> {
        let mut row = self.target.default_row();
        Self::set(&mut row, self.roles.surrogate, Value::Int(DEFAULT_ROW_KEY));
        self.stamp_created(&mut row)?;
        let key = self.target_key(&row);

        let filters: Vec<Filter> = match self.roles.surrogate {
            Some(o) => vec![Filter::equal(self.target.columns[o].name.clone(), DEFAULT_ROW_KEY)],
            None => self
                .roles
                .natural_keys
                .iter()
                .map(|&o| {
                    let name = self.target.columns[o].name.clone();
                    if row[o].is_null() {
                        Filter::new(name, Operator::IsNull, Value::Null)
                    } else {
                        Filter::equal(name, row[o].clone())
                    }
                })
                .collect(),
        };
        let existing = if self.strategy() == UpdateStrategy::Reload {
            None
        } else {
            self.reference.lookup_row(&filters, cancel).await?
        };
        self.default_key = Some(key);

        match existing {
            None => self.emit(Operation::Create, row, None),
            Some(stored) if self.has_changed(&stored, &row)? => {
                let mut updated = stored;
                for &t in &self.roles.tracking {
                    updated[t] = row[t].clone();
                }
                self.stamp_updated(&mut updated)?;
                self.emit(Operation::Update, updated, None);
            }
            Some(_) => self.stats.rows_ignored += 1,
        }
        Ok(())
    }

    async fn finish(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.strategy().do_delete() {
            while let Some(row) = self.next_reference(cancel).await? {
                check_cancel(cancel, "delta")?;
                self.handle_missing(row)?;
            }
        }
        self.finished = true;
        Ok(())
    }
}

#[async_trait]
impl Transform for DeltaTransform {
    fn name(&self) -> &str {
        "delta"
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            requires_sort: self.strategy().do_update(),
            ..Capabilities::default()
        }
    }

    fn required_sort_fields(&self) -> Vec<Sort> {
        self.roles
            .natural_keys
            .iter()
            .map(|&o| Sort::asc(self.target.columns[o].name.clone()))
            .collect()
    }

    async fn open(&mut self, audit_key: i64, _query: &SelectQuery, cancel: &CancellationToken) -> Result<()> {
        self.audit_key = audit_key;
        self.run_time = self
            .config
            .run_time
            .unwrap_or_else(|| chrono::Local::now().naive_local());
        self.next_surrogate = self.config.surrogate_key_seed;

        // The target decides the sort, so it is opened first.
        self.reference.open(audit_key, &SelectQuery::default(), cancel).await?;
        self.target = self.reference.schema().clone();
        let key_sorts: Vec<Sort> = self
            .target
            .natural_key_ordinals()
            .into_iter()
            .map(|o| Sort::asc(self.target.columns[o].name.clone()))
            .collect();

        if self.strategy().do_update() {
            let mut reference_sorts = key_sorts.clone();
            if let Some(o) = self.target.delta_ordinal(DeltaType::ValidFromDate) {
                reference_sorts.push(Sort::desc(self.target.columns[o].name.clone()));
            }
            open_sorted(&mut self.reference, audit_key, &reference_sorts, cancel).await?;
            open_sorted(&mut self.primary, audit_key, &key_sorts, cancel).await?;
        } else {
            self.primary.open(audit_key, &SelectQuery::default(), cancel).await?;
        }

        self.resolve_roles()?;
        self.build_schema();

        if self.config.add_default_row && !self.reference.capabilities().can_lookup_row_direct {
            let inner = std::mem::replace(&mut self.reference, Box::new(MemoryTransform::empty()));
            self.reference = Box::new(CachedTransform::new(inner, CachePolicy::PreLoadCache));
        }

        self.pending.clear();
        self.started = false;
        self.finished = false;
        self.reference_peek = None;
        self.reference_done = !self.strategy().do_update();
        self.last = None;
        self.default_key = None;
        self.stats = TransformStats::default();
        tracing::debug!(
            "Delta on '{}' opened with {:?}, surrogate seed {}",
            self.target.name,
            self.strategy(),
            self.next_surrogate
        );
        Ok(())
    }

    async fn read_record(&mut self, cancel: &CancellationToken) -> Result<Option<Row>> {
        loop {
            if let Some(row) = self.pending.pop_front() {
                return Ok(Some(row));
            }
            if self.finished {
                return Ok(None);
            }
            check_cancel(cancel, "delta")?;
            if !self.started {
                self.start(cancel).await?;
                continue;
            }
            match self.primary.read_record(cancel).await? {
                Some(row) => self.process(row, cancel).await?,
                None => self.finish(cancel).await?,
            }
        }
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
        self.pending.clear();
        self.started = false;
        self.finished = false;
        self.reference_peek = None;
        self.reference_done = !self.strategy().do_update();
        self.last = None;
        self.default_key = None;
        self.next_surrogate = self.config.surrogate_key_seed;
        self.stats = TransformStats::default();
        self.primary.reset()?;
        self.reference.reset()
    }
}

impl std::fmt::Debug for DeltaTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaTransform")
            .field("target", &self.target.name)
            .field("strategy", &self.config.update_strategy)
            .field("last_key", &self.last.as_ref().map(|(k, _)| format_key(k)))
            .finish_non_exhaustive()
    }
}
