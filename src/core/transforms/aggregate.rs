//! Aggregate functions used by the group and series transforms.

use crate::domain::model::{DataType, Value};
use crate::utils::error::{EtlError, Result};
use std::cmp::Ordering;

/// Accumulates values for one group at a time.
///
/// `results` usually returns a single value. A function returning several
/// values asks the group to emit that many rows ("project" semantics); an
/// empty result reads as null.
pub trait AggregateFunction: Send {
    fn name(&self) -> &str;

    /// Output type given the type of the input column (`None` for no input).
    fn result_type(&self, input: Option<DataType>) -> DataType;

    fn accumulate(&mut self, value: &Value, transform: &str, column: &str) -> Result<()>;

    fn results(&self) -> Vec<Value>;

    /// Forget the current group.
    fn reset(&mut self);
}

pub(crate) fn integer_overflow(transform: &str, column: &str) -> EtlError {
    EtlError::Function {
        transform: transform.to_string(),
        function: "sum".to_string(),
        message: format!("integer sum of '{}' overflows", column),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    Sum,
    /// Non-null values.
    Count,
    Min,
    Max,
    Average,
    First,
    Last,
    /// One result row per distinct non-null value, in first-seen order.
    Distinct,
}

impl AggregateKind {
    pub fn parse_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sum" => Some(AggregateKind::Sum),
            "count" => Some(AggregateKind::Count),
            "min" => Some(AggregateKind::Min),
            "max" => Some(AggregateKind::Max),
            "avg" | "average" => Some(AggregateKind::Average),
            "first" => Some(AggregateKind::First),
            "last" => Some(AggregateKind::Last),
            "distinct" => Some(AggregateKind::Distinct),
            _ => None,
        }
    }

    pub fn create(self) -> Box<dyn AggregateFunction> {
        Box::new(BuiltinAggregate::new(self))
    }
}

#[derive(Debug, Clone)]
pub struct BuiltinAggregate {
    kind: AggregateKind,
    count: u64,
    int_sum: i64,
    float_sum: f64,
    saw_double: bool,
    selected: Option<Value>,
    first: Option<Value>,
    distinct: Vec<Value>,
}

impl BuiltinAggregate {
    pub fn new(kind: AggregateKind) -> Self {
        Self {
            kind,
            count: 0,
            int_sum: 0,
            float_sum: 0.0,
            saw_double: false,
            selected: None,
            first: None,
            distinct: Vec::new(),
        }
    }

    fn add_number(&mut self, value: &Value, transform: &str, column: &str) -> Result<()> {
        match value {
            Value::Int(i) => {
                if self.kind == AggregateKind::Sum && !self.saw_double {
                    self.int_sum = self
                        .int_sum
                        .checked_add(*i)
                        .ok_or_else(|| integer_overflow(transform, column))?;
                }
                self.float_sum += *i as f64;
            }
            Value::Double(d) => {
                self.saw_double = true;
                self.float_sum += d;
            }
            other => {
                return Err(EtlError::Conversion {
                    column: column.to_string(),
                    value: other.to_string(),
                    data_type: DataType::Double.as_str().to_string(),
                    reason: format!("{} cannot be summed", other.type_name()),
                })
            }
        }
        Ok(())
    }

    fn keep_if(&mut self, value: &Value, wanted: Ordering, transform: &str, column: &str) -> Result<()> {
        let replace = match &self.selected {
            None => true,
            Some(current) => value.compare(current, transform, column)? == wanted,
        };
        if replace {
            self.selected = Some(value.clone());
        }
        Ok(())
    }
}

impl AggregateFunction for BuiltinAggregate {
    fn name(&self) -> &str {
        match self.kind {
            AggregateKind::Sum => "sum",
            AggregateKind::Count => "count",
            AggregateKind::Min => "min",
            AggregateKind::Max => "max",
            AggregateKind::Average => "average",
            AggregateKind::First => "first",
            AggregateKind::Last => "last",
            AggregateKind::Distinct => "distinct",
        }
    }

    fn result_type(&self, input: Option<DataType>) -> DataType {
        match self.kind {
            AggregateKind::Count => DataType::Int,
            AggregateKind::Average => DataType::Double,
            AggregateKind::Sum => match input {
                Some(DataType::Int) => DataType::Int,
                _ => DataType::Double,
            },
            _ => input.unwrap_or(DataType::String),
        }
    }

    fn accumulate(&mut self, value: &Value, transform: &str, column: &str) -> Result<()> {
        if self.kind == AggregateKind::First {
            if self.first.is_none() {
                self.first = Some(value.clone());
            }
            return Ok(());
        }
        if self.kind == AggregateKind::Last {
            self.selected = Some(value.clone());
            return Ok(());
        }
        if value.is_null() {
            return Ok(());
        }
        self.count += 1;
        match self.kind {
            AggregateKind::Sum | AggregateKind::Average => self.add_number(value, transform, column)?,
            AggregateKind::Min => self.keep_if(value, Ordering::Less, transform, column)?,
            AggregateKind::Max => self.keep_if(value, Ordering::Greater, transform, column)?,
            AggregateKind::Distinct => {
                if !self.distinct.contains(value) {
                    self.distinct.push(value.clone());
                }
            }
            AggregateKind::Count | AggregateKind::First | AggregateKind::Last => {}
        }
        Ok(())
    }

    fn results(&self) -> Vec<Value> {
        let value = match self.kind {
            AggregateKind::Count => Value::Int(self.count as i64),
            AggregateKind::Sum if self.count == 0 => Value::Null,
            AggregateKind::Sum if self.saw_double => Value::Double(self.float_sum),
            AggregateKind::Sum => Value::Int(self.int_sum),
            AggregateKind::Average if self.count == 0 => Value::Null,
            AggregateKind::Average => Value::Double(self.float_sum / self.count as f64),
            AggregateKind::First => self.first.clone().unwrap_or(Value::Null),
            AggregateKind::Min | AggregateKind::Max | AggregateKind::Last => {
                self.selected.clone().unwrap_or(Value::Null)
            }
            AggregateKind::Distinct => return self.distinct.clone(),
        };
        vec![value]
    }

    fn reset(&mut self) {
        *self = Self::new(self.kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(kind: AggregateKind, values: &[Value]) -> Vec<Value> {
        let mut f = kind.create();
        for v in values {
            f.accumulate(v, "group", "amount").unwrap();
        }
        f.results()
    }

    #[test]
    fn test_builtin_results() {
        let values = [Value::Int(4), Value::Null, Value::Int(1), Value::Int(4)];
        assert_eq!(run(AggregateKind::Sum, &values), vec![Value::Int(9)]);
        assert_eq!(run(AggregateKind::Count, &values), vec![Value::Int(3)]);
        assert_eq!(run(AggregateKind::Min, &values), vec![Value::Int(1)]);
        assert_eq!(run(AggregateKind::Max, &values), vec![Value::Int(4)]);
        assert_eq!(run(AggregateKind::Average, &values), vec![Value::Double(3.0)]);
        assert_eq!(run(AggregateKind::First, &values), vec![Value::Int(4)]);
        assert_eq!(run(AggregateKind::Last, &values), vec![Value::Int(4)]);
        assert_eq!(run(AggregateKind::Distinct, &values), vec![Value::Int(4), Value::Int(1)]);
    }

    #[test]
    fn test_empty_group_and_mixed_numbers() {
        assert_eq!(run(AggregateKind::Sum, &[]), vec![Value::Null]);
        assert_eq!(run(AggregateKind::Count, &[]), vec![Value::Int(0)]);
        assert!(run(AggregateKind::Distinct, &[]).is_empty());
        assert_eq!(
            run(AggregateKind::Sum, &[Value::Int(1), Value::Double(0.5)]),
            vec![Value::Double(1.5)]
        );
    }

    #[test]
    fn test_incomparable_values_raise() {
        let mut f = AggregateKind::Max.create();
        f.accumulate(&Value::Int(1), "group", "amount").unwrap();
        assert!(f.accumulate(&Value::from("x"), "group", "amount").is_err());
        let mut f = AggregateKind::Sum.create();
        assert!(f.accumulate(&Value::from("x"), "group", "amount").is_err());
    }

    #[test]
    fn test_integer_sum_overflow_raises() {
        let mut f = AggregateKind::Sum.create();
        f.accumulate(&Value::Int(i64::MAX), "group", "amount").unwrap();
        let err = f.accumulate(&Value::Int(1), "group", "amount").unwrap_err();
        assert!(matches!(err, EtlError::Function { .. }));
        assert!(err.to_string().contains("amount"));

        // Averages accumulate in floating point and do not overflow.
        assert_eq!(
            run(AggregateKind::Average, &[Value::Int(i64::MAX), Value::Int(i64::MAX)]),
            vec![Value::Double(i64::MAX as f64)]
        );
    }

    #[test]
    fn test_reset_forgets_group() {
        let mut f = AggregateKind::Sum.create();
        f.accumulate(&Value::Int(5), "group", "amount").unwrap();
        f.reset();
        f.accumulate(&Value::Int(2), "group", "amount").unwrap();
        assert_eq!(f.results(), vec![Value::Int(2)]);
    }
}
