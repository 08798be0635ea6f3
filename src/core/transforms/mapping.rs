use crate::core::transform::{check_cancel, Transform, TransformStats};
use crate::domain::model::{DataType, Row, Value};
use crate::domain::query::{SelectQuery, Sort};
use crate::domain::schema::{Column, Schema};
use crate::utils::error::{EtlError, Result};
use crate::utils::validation::validate_unique_names;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A row-level function over the named input columns. Returning
/// [`EtlError::IgnoreRow`] drops the row.
pub type MappingFunction = Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;

#[derive(Clone)]
pub enum Mapping {
    Column {
        source: String,
        target: String,
    },
    Constant {
        target: String,
        value: Value,
        data_type: DataType,
    },
    Function {
        name: String,
        inputs: Vec<String>,
        target: String,
        data_type: DataType,
        function: MappingFunction,
    },
}

impl Mapping {
    pub fn column(source: impl Into<String>, target: impl Into<String>) -> Self {
        Mapping::Column {
            source: source.into(),
            target: target.into(),
        }
    }

    pub fn constant(target: impl Into<String>, value: impl Into<Value>, data_type: DataType) -> Self {
        Mapping::Constant {
            target: target.into(),
            value: value.into(),
            data_type,
        }
    }

    pub fn function<F>(name: impl Into<String>, inputs: &[&str], target: impl Into<String>, data_type: DataType, f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        Mapping::Function {
            name: name.into(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            target: target.into(),
            data_type,
            function: Arc::new(f),
        }
    }

    pub fn target(&self) -> &str {
        match self {
            Mapping::Column { target, .. }
            | Mapping::Constant { target, .. }
            | Mapping::Function { target, .. } => target,
        }
    }
}

enum Resolved {
    Ordinal(usize),
    Constant(Value),
    Function {
        name: String,
        ordinals: Vec<usize>,
        function: MappingFunction,
    },
}

pub struct MappingTransform {
    primary: Box<dyn Transform>,
    mappings: Vec<Mapping>,
    pass_through: bool,
    resolved: Vec<Resolved>,
    schema: Schema,
    stats: TransformStats,
}

impl MappingTransform {
    pub fn new(primary: Box<dyn Transform>, mappings: Vec<Mapping>) -> Self {
        Self {
            primary,
            mappings,
            pass_through: false,
            resolved: Vec::new(),
            schema: Schema::default(),
            stats: TransformStats::default(),
        }
    }

    /// Also emit every upstream column no mapping targets.
    pub fn with_pass_through(mut self) -> Self {
        self.pass_through = true;
        self
    }

    fn map_row(&self, row: &Row, input: &mut Vec<Value>) -> Result<Row> {
        let mut out = Vec::with_capacity(self.resolved.len());
        for resolved in &self.resolved {
            let value = match resolved {
                Resolved::Ordinal(ordinal) => row[*ordinal].clone(),
                Resolved::Constant(value) => value.clone(),
                Resolved::Function {
                    name,
                    ordinals,
                    function,
                } => {
                    input.clear();
                    input.extend(ordinals.iter().map(|&o| row[o].clone()));
                    function(input.as_slice()).map_err(|e| match e {
                        EtlError::IgnoreRow => EtlError::IgnoreRow,
                        other => EtlError::Function {
                            transform: "mapping".to_string(),
                            function: name.clone(),
                            message: other.to_string(),
                        },
                    })?
                }
            };
            out.push(value);
        }
        Ok(out)
    }
}

#[async_trait]
impl Transform for MappingTransform {
    fn name(&self) -> &str {
        "mapping"
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Upstream ordering, renamed, for as long as the sort columns survive the mapping.
    fn sort_fields(&self) -> Vec<Sort> {
        let mut sorts = Vec::new();
        for sort in self.primary.sort_fields() {
            let target = self.mappings.iter().find_map(|m| match m {
                Mapping::Column { source, target } if *source == sort.column => Some(target.clone()),
                _ => None,
            });
            let target = target.or_else(|| {
                let passed = self.pass_through && self.mappings.iter().all(|m| m.target() != sort.column);
                passed.then(|| sort.column.clone())
            });
            match target {
                Some(column) => sorts.push(Sort {
                    column,
                    direction: sort.direction,
                }),
                None => break,
            }
        }
        sorts
    }

    async fn open(&mut self, audit_key: i64, query: &SelectQuery, cancel: &CancellationToken) -> Result<()> {
        // Query columns name outputs, which may not exist upstream.
        self.primary.open(audit_key, &SelectQuery::default(), cancel).await?;
        let input = self.primary.schema();

        let mut columns = Vec::new();
        let mut resolved = Vec::new();
        for mapping in &self.mappings {
            match mapping {
                Mapping::Column { source, target } => {
                    let ordinal = input.get_ordinal(source)?;
                    let mut column = input.columns[ordinal].clone();
                    column.name = target.clone();
                    columns.push(column);
                    resolved.push(Resolved::Ordinal(ordinal));
                }
                Mapping::Constant {
                    target,
                    value,
                    data_type,
                } => {
                    columns.push(Column::new(target.clone(), *data_type));
                    resolved.push(Resolved::Constant(data_type.convert(target, value)?));
                }
                Mapping::Function {
                    name,
                    inputs,
                    target,
                    data_type,
                    function,
                } => {
                    let ordinals = inputs.iter().map(|c| input.get_ordinal(c)).collect::<Result<_>>()?;
                    columns.push(Column::new(target.clone(), *data_type));
                    resolved.push(Resolved::Function {
                        name: name.clone(),
                        ordinals,
                        function: function.clone(),
                    });
                }
            }
        }

        if self.pass_through {
            for (ordinal, column) in input.columns.iter().enumerate() {
                if columns.iter().all(|c: &Column| c.name != column.name) {
                    columns.push(column.clone());
                    resolved.push(Resolved::Ordinal(ordinal));
                }
            }
        }

        validate_unique_names("mapping", columns.iter().map(|c| c.name.as_str()))?;

        self.schema = Schema::new(input.name.clone(), columns);
        self.resolved = resolved;
        self.stats = TransformStats::default();
        if !query.filters.is_empty() || !query.sorts.is_empty() {
            tracing::warn!("Mapping over '{}' does not apply pushed-down queries", self.schema.name);
        }
        Ok(())
    }

    async fn read_record(&mut self, cancel: &CancellationToken) -> Result<Option<Row>> {
        let mut input = Vec::new();
        loop {
            check_cancel(cancel, "mapping")?;
            let Some(row) = self.primary.read_record(cancel).await? else {
                return Ok(None);
            };
            match self.map_row(&row, &mut input) {
                Ok(mapped) => return Ok(Some(mapped)),
                Err(EtlError::IgnoreRow) => self.stats.rows_ignored += 1,
                Err(e) => return Err(e),
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
    use crate::core::transforms::sort::SortTransform;

    fn orders() -> MemoryTransform {
        let schema = Schema::new(
            "orders",
            vec![
                Column::new("id", DataType::Int),
                Column::new("qty", DataType::Int),
                Column::new("price", DataType::Double),
            ],
        );
        MemoryTransform::new(
            schema,
            vec![
                vec![1.into(), 2.into(), 2.5.into()],
                vec![2.into(), 0.into(), 9.0.into()],
                vec![3.into(), 4.into(), 1.0.into()],
            ],
        )
    }

    fn total(values: &[Value]) -> Result<Value> {
        match (values[0].as_f64(), values[1].as_f64()) {
            (Some(q), _) if q == 0.0 => Err(EtlError::IgnoreRow),
            (Some(q), Some(p)) => Ok(Value::Double(q * p)),
            _ => Ok(Value::Null),
        }
    }

    #[tokio::test]
    async fn test_column_constant_and_function_mappings() {
        let cancel = CancellationToken::new();
        let mut t = MappingTransform::new(
            Box::new(orders()),
            vec![
                Mapping::column("id", "order_id"),
                Mapping::constant("source", "web", DataType::String),
                Mapping::function("total", &["qty", "price"], "total", DataType::Double, total),
            ],
        );
        t.open(0, &SelectQuery::default(), &cancel).await.unwrap();
        assert_eq!(t.schema().column_names(), vec!["order_id", "source", "total"]);

        let first = t.read_record(&cancel).await.unwrap().unwrap();
        assert_eq!(first, vec![Value::Int(1), Value::from("web"), Value::Double(5.0)]);
        let second = t.read_record(&cancel).await.unwrap().unwrap();
        assert_eq!(second[0], Value::Int(3));
        assert!(t.read_record(&cancel).await.unwrap().is_none());
        assert_eq!(t.total_stats().rows_ignored, 1);
    }

    #[tokio::test]
    async fn test_pass_through_and_sort_renames() {
        let cancel = CancellationToken::new();
        let mut t = MappingTransform::new(
            Box::new(SortTransform::new(Box::new(orders()), vec![Sort::asc("id")])),
            vec![Mapping::column("id", "order_id")],
        )
        .with_pass_through();
        t.open(0, &SelectQuery::default(), &cancel).await.unwrap();
        assert_eq!(t.schema().column_names(), vec!["order_id", "id", "qty", "price"]);
        assert_eq!(t.sort_fields(), vec![Sort::asc("order_id")]);
    }

    #[tokio::test]
    async fn test_function_errors_name_the_function() {
        let cancel = CancellationToken::new();
        let mut t = MappingTransform::new(
            Box::new(orders()),
            vec![Mapping::function("explode", &["id"], "x", DataType::Int, |_| {
                Err(EtlError::ProcessingError {
                    message: "boom".to_string(),
                })
            })],
        );
        t.open(0, &SelectQuery::default(), &cancel).await.unwrap();
        match t.read_record(&cancel).await {
            Err(EtlError::Function { function, message, .. }) => {
                assert_eq!(function, "explode");
                assert!(message.contains("boom"));
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }
}
