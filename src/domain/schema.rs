use crate::domain::model::{DataType, Row, Value};
use crate::utils::error::{EtlError, Result};
use serde::{Deserialize, Serialize};

/// The role a column plays when rows are compared and written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaType {
    /// Plain field; a change triggers an update.
    #[default]
    TrackingField,
    /// Copied on update, but a change alone does not trigger one.
    NonTrackingField,
    NaturalKey,
    IgnoreField,
    AutoIncrement,
    ValidFromDate,
    ValidToDate,
    IsCurrentField,
    Version,
    CreateAuditKey,
    UpdateAuditKey,
    CreateDate,
    UpdateDate,
    DatabaseOperation,
    RejectedReason,
    ValidationStatus,
    PartitionKey,
}

impl DeltaType {
    pub fn parse_name(name: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(name.to_string())).ok()
    }
}

/// Per-column protection applied by the encryption decorator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityFlag {
    #[default]
    None,
    Encrypt,
    OneWayHash,
    Hide,
}

impl SecurityFlag {
    pub fn parse_name(name: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(name.to_string())).ok()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub allow_null: bool,
    pub delta_type: DeltaType,
    /// 0 for scalars, >0 for arrays.
    pub rank: u8,
    pub default_value: Option<Value>,
    pub security_flag: SecurityFlag,
    pub is_incremental_update: bool,
    /// Structure of the rows held by a node column.
    pub child: Option<Schema>,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            allow_null: true,
            delta_type: DeltaType::TrackingField,
            rank: 0,
            default_value: None,
            security_flag: SecurityFlag::None,
            is_incremental_update: false,
            child: None,
        }
    }

    pub fn with_delta_type(mut self, delta_type: DeltaType) -> Self {
        self.delta_type = delta_type;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    pub fn with_security(mut self, flag: SecurityFlag) -> Self {
        self.security_flag = flag;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.allow_null = false;
        self
    }

    pub fn incremental(mut self) -> Self {
        self.is_incremental_update = true;
        self
    }

    pub fn node(name: impl Into<String>, child: Schema) -> Self {
        let mut column = Column::new(name, DataType::Node);
        column.child = Some(child);
        column
    }

    pub fn default_or_null(&self) -> Value {
        self.default_value.clone().unwrap_or(Value::Null)
    }
}

/// Ordered list of uniquely named columns. Immutable for the life of an open cursor.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Schema {
    pub name: String,
    pub columns: Vec<Column>,
}

impl Schema {
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Case-sensitive name lookup.
    pub fn ordinal(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn get_ordinal(&self, name: &str) -> Result<usize> {
        self.ordinal(name).ok_or_else(|| EtlError::MissingColumn {
            transform: self.name.clone(),
            column: name.to_string(),
        })
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// First column with the delta type, for roles that are singular
    /// (auto-increment, is-current, valid-from, ...).
    pub fn delta_ordinal(&self, delta_type: DeltaType) -> Option<usize> {
        self.columns.iter().position(|c| c.delta_type == delta_type)
    }

    pub fn delta_ordinals(&self, delta_type: DeltaType) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.delta_type == delta_type)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn natural_key_ordinals(&self) -> Vec<usize> {
        self.delta_ordinals(DeltaType::NaturalKey)
    }

    pub fn incremental_ordinal(&self) -> Option<usize> {
        self.columns.iter().position(|c| c.is_incremental_update)
    }

    pub fn push(&mut self, column: Column) {
        self.columns.push(column);
    }

    /// A row holding each column's default value.
    pub fn default_row(&self) -> Row {
        self.columns.iter().map(Column::default_or_null).collect()
    }

    pub fn null_row(&self) -> Row {
        vec![Value::Null; self.columns.len()]
    }

    /// Same columns under a new name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: self.columns.clone(),
        }
    }

    /// Every column of `self` exists in `other` with the same data type.
    pub fn is_compatible_with(&self, other: &Schema) -> bool {
        self.columns.iter().all(|c| {
            other
                .column(&c.name)
                .map(|o| o.data_type == c.data_type)
                .unwrap_or(false)
        })
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn customers() -> Schema {
        Schema::new(
            "customers",
            vec![
                Column::new("sk", DataType::Int).with_delta_type(DeltaType::AutoIncrement),
                Column::new("code", DataType::String).with_delta_type(DeltaType::NaturalKey),
                Column::new("name", DataType::String).with_default("unknown"),
            ],
        )
    }

    #[test]
    fn test_ordinal_lookup_is_case_sensitive() {
        let schema = customers();
        assert_eq!(schema.ordinal("code"), Some(1));
        assert_eq!(schema.ordinal("Code"), None);
        assert!(matches!(
            schema.get_ordinal("missing"),
            Err(EtlError::MissingColumn { .. })
        ));
    }

    #[test]
    fn test_delta_type_lookup() {
        let schema = customers();
        assert_eq!(schema.delta_ordinal(DeltaType::AutoIncrement), Some(0));
        assert_eq!(schema.natural_key_ordinals(), vec![1]);
        assert_eq!(schema.delta_ordinal(DeltaType::IsCurrentField), None);
        assert_eq!(DeltaType::parse_name("natural_key"), Some(DeltaType::NaturalKey));
        assert_eq!(DeltaType::parse_name("bogus"), None);
    }

    #[test]
    fn test_default_row_and_compatibility() {
        let schema = customers();
        assert_eq!(
            schema.default_row(),
            vec![Value::Null, Value::Null, Value::from("unknown")]
        );
        let narrower = Schema::new("n", vec![Column::new("code", DataType::String)]);
        assert!(narrower.is_compatible_with(&schema));
        assert!(!schema.is_compatible_with(&narrower));
    }
}
