use crate::domain::model::{Row, Value};
use crate::domain::schema::Schema;
use crate::utils::error::Result;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equal,
    NotEqual,
    LessThan,
    LessThanEqual,
    GreaterThan,
    GreaterThanEqual,
    IsNull,
    IsNotNull,
}

impl Operator {
    pub fn parse_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().replace(['_', '-', ' '], "").as_str() {
            "=" | "==" | "equal" | "eq" => Some(Operator::Equal),
            "!=" | "<>" | "notequal" | "ne" => Some(Operator::NotEqual),
            "<" | "lessthan" | "lt" => Some(Operator::LessThan),
            "<=" | "lessthanequal" | "le" => Some(Operator::LessThanEqual),
            ">" | "greaterthan" | "gt" => Some(Operator::GreaterThan),
            ">=" | "greaterthanequal" | "ge" => Some(Operator::GreaterThanEqual),
            "isnull" => Some(Operator::IsNull),
            "isnotnull" => Some(Operator::IsNotNull),
            _ => None,
        }
    }

    pub fn evaluate(&self, left: &Value, right: &Value, transform: &str, column: &str) -> Result<bool> {
        Ok(match self {
            Operator::IsNull => left.is_null(),
            Operator::IsNotNull => !left.is_null(),
            // Comparisons against null never match.
            _ if left.is_null() || right.is_null() => false,
            Operator::Equal => left.compare(right, transform, column)? == Ordering::Equal,
            Operator::NotEqual => left.compare(right, transform, column)? != Ordering::Equal,
            Operator::LessThan => left.compare(right, transform, column)? == Ordering::Less,
            Operator::LessThanEqual => left.compare(right, transform, column)? != Ordering::Greater,
            Operator::GreaterThan => left.compare(right, transform, column)? == Ordering::Greater,
            Operator::GreaterThanEqual => left.compare(right, transform, column)? != Ordering::Less,
        })
    }
}

/// Right hand side of a filter.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Column(String),
    Value(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AndOr {
    #[default]
    And,
    Or,
}

/// `column <operator> operand`, joined to the previous filter by `and_or`.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub operator: Operator,
    pub operand: Operand,
    pub and_or: AndOr,
}

impl Filter {
    pub fn new(column: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            operator,
            operand: Operand::Value(value.into()),
            and_or: AndOr::And,
        }
    }

    pub fn equal(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, Operator::Equal, value)
    }

    pub fn columns(column: impl Into<String>, operator: Operator, other: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            operator,
            operand: Operand::Column(other.into()),
            and_or: AndOr::And,
        }
    }

    pub fn or(mut self) -> Self {
        self.and_or = AndOr::Or;
        self
    }

    /// Every column named by this filter.
    pub fn referenced_columns(&self) -> Vec<&str> {
        match &self.operand {
            Operand::Column(other) => vec![self.column.as_str(), other.as_str()],
            Operand::Value(_) => vec![self.column.as_str()],
        }
    }

    pub fn evaluate(&self, schema: &Schema, row: &Row) -> Result<bool> {
        let left = &row[schema.get_ordinal(&self.column)?];
        let right = match &self.operand {
            Operand::Column(other) => &row[schema.get_ordinal(other)?],
            Operand::Value(value) => value,
        };
        self.operator.evaluate(left, right, &schema.name, &self.column)
    }
}

/// Evaluates `a AND b OR c AND d` as `(a AND b) OR (c AND d)`. An empty list matches.
pub fn evaluate_filters(filters: &[Filter], schema: &Schema, row: &Row) -> Result<bool> {
    let mut any_group = false;
    let mut group = true;
    for (i, filter) in filters.iter().enumerate() {
        if i > 0 && filter.and_or == AndOr::Or {
            any_group |= group;
            group = true;
        }
        if group {
            group = filter.evaluate(schema, row)?;
        }
    }
    Ok(any_group || group)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
    pub column: String,
    pub direction: SortDirection,
}

impl Sort {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Ascending,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Descending,
        }
    }
}

/// True when rows ordered by `actual` are also ordered by `required`.
pub fn sort_satisfies(actual: &[Sort], required: &[Sort]) -> bool {
    required.len() <= actual.len() && actual.iter().zip(required).all(|(a, r)| a == r)
}

/// Compares two rows of the same schema by a list of sort ordinals.
pub fn compare_rows(
    schema: &Schema,
    sorts: &[(usize, SortDirection)],
    left: &Row,
    right: &Row,
) -> Result<Ordering> {
    for &(ordinal, direction) in sorts {
        let column = &schema.columns[ordinal].name;
        let ordering = left[ordinal].compare(&right[ordinal], &schema.name, column)?;
        let ordering = match direction {
            SortDirection::Ascending => ordering,
            SortDirection::Descending => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return Ok(ordering);
        }
    }
    Ok(Ordering::Equal)
}

/// Resolves sort column names to ordinals against a schema.
pub fn sort_ordinals(schema: &Schema, sorts: &[Sort]) -> Result<Vec<(usize, SortDirection)>> {
    sorts
        .iter()
        .map(|s| Ok((schema.get_ordinal(&s.column)?, s.direction)))
        .collect()
}

/// Filters and ordering requested from a cursor at open. Cursors honor these
/// on a best-effort basis; callers verify with [`sort_satisfies`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectQuery {
    pub filters: Vec<Filter>,
    pub sorts: Vec<Sort>,
    pub rows: Option<usize>,
}

impl SelectQuery {
    pub fn sorted(sorts: Vec<Sort>) -> Self {
        Self {
            sorts,
            ..Default::default()
        }
    }

    pub fn filtered(filters: Vec<Filter>) -> Self {
        Self {
            filters,
            ..Default::default()
        }
    }
}
