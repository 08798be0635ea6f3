use crate::core::transform::{check_cancel, Transform, TransformStats};
use crate::domain::model::{DataType, Row, Value};
use crate::domain::query::{SelectQuery, Sort};
use crate::domain::schema::{Column, DeltaType, Schema};
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use regex::Regex;
use std::cmp::Ordering;
use tokio_util::sync::CancellationToken;

pub const STATUS_PASSED: &str = "passed";
pub const STATUS_CLEANED: &str = "cleaned";
pub const STATUS_REJECTED: &str = "rejected";

#[derive(Debug, Clone)]
pub enum ValidationRule {
    NotNull,
    /// The value must convert to the type; passing values are stored converted.
    DataType(DataType),
    MaxLength(usize),
    Range { min: Option<Value>, max: Option<Value> },
    Pattern(Regex),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationAction {
    /// Keep the row, marked rejected with a reason.
    Reject,
    /// Replace the failing value and keep the row.
    Clean(Value),
    /// Drop the row.
    Discard,
    /// Stop the run.
    Abend,
}

#[derive(Debug, Clone)]
pub struct ColumnValidation {
    pub column: String,
    pub rule: ValidationRule,
    pub action: ValidationAction,
}

impl ColumnValidation {
    pub fn new(column: impl Into<String>, rule: ValidationRule, action: ValidationAction) -> Self {
        Self {
            column: column.into(),
            rule,
            action,
        }
    }
}

impl ValidationRule {
    fn name(&self) -> &'static str {
        match self {
            ValidationRule::NotNull => "not null",
            ValidationRule::DataType(_) => "data type",
            ValidationRule::MaxLength(_) => "max length",
            ValidationRule::Range { .. } => "range",
            ValidationRule::Pattern(_) => "pattern",
        }
    }

    /// Returns the value to keep, or the failure reason. Comparison and
    /// conversion errors are failures, not errors.
    fn check(&self, transform: &str, column: &str, value: &Value) -> std::result::Result<Option<Value>, String> {
        match self {
            ValidationRule::NotNull if value.is_null() => Err(format!("{} is null", column)),
            ValidationRule::NotNull => Ok(None),
            _ if value.is_null() => Ok(None),
            ValidationRule::DataType(data_type) => data_type
                .convert(column, value)
                .map(Some)
                .map_err(|e| e.to_string()),
            ValidationRule::MaxLength(max) => {
                let len = value.to_string().chars().count();
                if len > *max {
                    Err(format!("{} length {} exceeds {}", column, len, max))
                } else {
                    Ok(None)
                }
            }
            ValidationRule::Range { min, max } => {
                if let Some(min) = min {
                    let ordering = value.compare(min, transform, column).map_err(|e| e.to_string())?;
                    if ordering == Ordering::Less {
                        return Err(format!("{} value {} is below {}", column, value, min));
                    }
                }
                if let Some(max) = max {
                    let ordering = value.compare(max, transform, column).map_err(|e| e.to_string())?;
                    if ordering == Ordering::Greater {
                        return Err(format!("{} value {} is above {}", column, value, max));
                    }
                }
                Ok(None)
            }
            ValidationRule::Pattern(pattern) => {
                if pattern.is_match(&value.to_string()) {
                    Ok(None)
                } else {
                    Err(format!("{} value {} does not match {}", column, value, pattern.as_str()))
                }
            }
        }
    }
}

/// Applies column rules to each row and appends `rejected_reason` and
/// `validation_status` columns.
pub struct ValidationTransform {
    primary: Box<dyn Transform>,
    validations: Vec<ColumnValidation>,
    ordinals: Vec<usize>,
    schema: Schema,
    reason_ordinal: usize,
    status_ordinal: usize,
    stats: TransformStats,
}

impl ValidationTransform {
    pub fn new(primary: Box<dyn Transform>, validations: Vec<ColumnValidation>) -> Self {
        Self {
            primary,
            validations,
            ordinals: Vec::new(),
            schema: Schema::default(),
            reason_ordinal: 0,
            status_ordinal: 0,
            stats: TransformStats::default(),
        }
    }

    fn validate(&mut self, mut row: Row) -> Result<Option<Row>> {
        row.resize(self.schema.len(), Value::Null);
        let mut reasons = Vec::new();
        let mut cleaned = false;

        for (validation, &ordinal) in self.validations.iter().zip(&self.ordinals) {
            let outcome = validation
                .rule
                .check(&self.schema.name, &validation.column, &row[ordinal]);
            match outcome {
                Ok(Some(converted)) => row[ordinal] = converted,
                Ok(None) => {}
                Err(reason) => match &validation.action {
                    ValidationAction::Reject => reasons.push(reason),
                    ValidationAction::Clean(value) => {
                        row[ordinal] = value.clone();
                        cleaned = true;
                    }
                    ValidationAction::Discard => {
                        self.stats.rows_filtered += 1;
                        return Ok(None);
                    }
                    ValidationAction::Abend => {
                        return Err(EtlError::ValidationError {
                            message: format!("{} rule failed: {}", validation.rule.name(), reason),
                        })
                    }
                },
            }
        }

        let status = if !reasons.is_empty() {
            self.stats.rows_rejected += 1;
            row[self.reason_ordinal] = Value::String(reasons.join("; "));
            STATUS_REJECTED
        } else if cleaned {
            STATUS_CLEANED
        } else {
            STATUS_PASSED
        };
        row[self.status_ordinal] = Value::from(status);
        Ok(Some(row))
    }
}

#[async_trait]
impl Transform for ValidationTransform {
    fn name(&self) -> &str {
        "validation"
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn sort_fields(&self) -> Vec<Sort> {
        self.primary.sort_fields()
    }

    async fn open(&mut self, audit_key: i64, query: &SelectQuery, cancel: &CancellationToken) -> Result<()> {
        self.primary.open(audit_key, query, cancel).await?;

        let mut schema = self.primary.schema().clone();
        let reason_ordinal = match schema.delta_ordinal(DeltaType::RejectedReason) {
            Some(ordinal) => ordinal,
            None => {
                schema.push(Column::new("rejected_reason", DataType::String).with_delta_type(DeltaType::RejectedReason));
                schema.len() - 1
            }
        };
        let status_ordinal = match schema.delta_ordinal(DeltaType::ValidationStatus) {
            Some(ordinal) => ordinal,
            None => {
                schema.push(
                    Column::new("validation_status", DataType::String).with_delta_type(DeltaType::ValidationStatus),
                );
                schema.len() - 1
            }
        };

        self.ordinals = self
            .validations
            .iter()
            .map(|v| schema.get_ordinal(&v.column))
            .collect::<Result<_>>()?;
        self.schema = schema;
        self.reason_ordinal = reason_ordinal;
        self.status_ordinal = status_ordinal;
        self.stats = TransformStats::default();
        tracing::debug!(
            "Validation opened with {} rules over '{}'",
            self.validations.len(),
            self.primary.name()
        );
        Ok(())
    }

    async fn read_record(&mut self, cancel: &CancellationToken) -> Result<Option<Row>> {
        loop {
            check_cancel(cancel, "validation")?;
            let Some(row) = self.primary.read_record(cancel).await? else {
                return Ok(None);
            };
            if let Some(row) = self.validate(row)? {
                return Ok(Some(row));
            }
        }
    }

    fn stats(&self) -> TransformStats {
        self.stats
    }

    fn primary(&self) -> Option<&dyn Transform> {
        Some(self.primary.as_ref())
    }

    fn reset(&mut self) -> Result<()> {
        self.stats = TransformStats::default();
        self.primary.reset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transforms::memory::MemoryTransform;
    use tokio_test::assert_err;

    fn signups() -> MemoryTransform {
        let schema = Schema::new(
            "signups",
            vec![
                Column::new("email", DataType::String),
                Column::new("age", DataType::String),
                Column::new("country", DataType::String),
            ],
        );
        MemoryTransform::new(
            schema,
            vec![
                vec!["a@x.io".into(), "34".into(), "NZ".into()],
                vec!["broken".into(), "20".into(), "AU".into()],
                vec!["c@x.io".into(), "old".into(), "Australia".into()],
                vec![Value::Null, "50".into(), "NZ".into()],
            ],
        )
    }

    fn rules() -> Vec<ColumnValidation> {
        vec![
            ColumnValidation::new("email", ValidationRule::NotNull, ValidationAction::Discard),
            ColumnValidation::new(
                "email",
                ValidationRule::Pattern(Regex::new(r"^[^@]+@[^@]+$").unwrap()),
                ValidationAction::Reject,
            ),
            ColumnValidation::new("age", ValidationRule::DataType(DataType::Int), ValidationAction::Reject),
            ColumnValidation::new(
                "age",
                ValidationRule::Range {
                    min: Some(Value::Int(18)),
                    max: None,
                },
                ValidationAction::Reject,
            ),
            ColumnValidation::new("country", ValidationRule::MaxLength(2), ValidationAction::Clean("??".into())),
        ]
    }

    #[tokio::test]
    async fn test_reject_clean_and_discard() {
        let cancel = CancellationToken::new();
        let mut t = ValidationTransform::new(Box::new(signups()), rules());
        t.open(0, &SelectQuery::default(), &cancel).await.unwrap();
        assert_eq!(t.schema().len(), 5);
        let status = t.schema().get_ordinal("validation_status").unwrap();
        let reason = t.schema().get_ordinal("rejected_reason").unwrap();

        let mut rows = Vec::new();
        while let Some(row) = t.read_record(&cancel).await.unwrap() {
            rows.push(row);
        }
        assert_eq!(rows.len(), 3);

        assert_eq!(rows[0][1], Value::Int(34));
        assert_eq!(rows[0][status], Value::from(STATUS_PASSED));

        assert_eq!(rows[1][status], Value::from(STATUS_REJECTED));
        assert!(rows[1][reason].to_string().contains("does not match"));

        // The failed conversion leaves a string that the range check cannot
        // compare, which is another reject reason rather than an error.
        assert_eq!(rows[2][status], Value::from(STATUS_REJECTED));
        assert_eq!(rows[2][2], Value::from("??"));
        assert_eq!(rows[2][reason].to_string().matches("; ").count(), 1);

        let stats = t.total_stats();
        assert_eq!(stats.rows_rejected, 2);
        assert_eq!(stats.rows_filtered, 1);
    }

    #[tokio::test]
    async fn test_abend_stops_the_stream() {
        let cancel = CancellationToken::new();
        let mut t = ValidationTransform::new(
            Box::new(signups()),
            vec![ColumnValidation::new("email", ValidationRule::NotNull, ValidationAction::Abend)],
        );
        t.open(0, &SelectQuery::default(), &cancel).await.unwrap();
        for _ in 0..3 {
            assert!(t.read_record(&cancel).await.unwrap().is_some());
        }
        assert_err!(t.read_record(&cancel).await);
    }

    #[tokio::test]
    async fn test_unknown_column_fails_open() {
        let cancel = CancellationToken::new();
        let mut t = ValidationTransform::new(
            Box::new(signups()),
            vec![ColumnValidation::new("phone", ValidationRule::NotNull, ValidationAction::Reject)],
        );
        assert!(matches!(
            t.open(0, &SelectQuery::default(), &cancel).await,
            Err(EtlError::MissingColumn { .. })
        ));
    }
}
