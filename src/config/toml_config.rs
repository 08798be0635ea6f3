use crate::core::transforms::delta::UpdateStrategy;
use crate::core::transforms::mapping::Mapping;
use crate::core::transforms::validation::{ColumnValidation, ValidationAction, ValidationRule};
use crate::core::writer::WriterConfig;
use crate::domain::model::{DataType, Value};
use crate::domain::query::{Filter, Operator};
use crate::domain::schema::{Column, DeltaType, Schema, SecurityFlag};
use crate::utils::error::{EtlError, Result};
use crate::utils::validation::{
    validate_file_extension, validate_non_empty_string, validate_path, validate_positive_number,
    validate_unique_names, Validate,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A CSV-to-CSV delta sync pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TomlConfig {
    pub pipeline: PipelineConfig,
    pub source: SourceConfig,
    pub target: TargetConfig,
    pub columns: Vec<ColumnConfig>,
    pub writer: Option<WriterSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub path: String,
    pub filters: Option<Vec<FilterConfig>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Source column name.
    pub column: String,
    pub operator: String,
    /// Parsed with the column's data type; omitted for null checks.
    pub value: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub path: String,
    /// Table name; defaults to the pipeline name.
    pub table: Option<String>,
    pub update_strategy: Option<String>,
    pub add_default_row: Option<bool>,
    pub truncate: Option<bool>,
    pub reject_path: Option<String>,
    pub encryption_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnConfig {
    pub name: String,
    pub data_type: String,
    pub delta_type: Option<String>,
    /// Source column feeding this one; defaults to `name`.
    pub source: Option<String>,
    pub default: Option<String>,
    pub allow_null: Option<bool>,
    pub security: Option<String>,
    pub max_length: Option<usize>,
    pub pattern: Option<String>,
    pub min: Option<String>,
    pub max: Option<String>,
    /// reject (default), discard, abend or clean.
    pub on_invalid: Option<String>,
    /// Replacement used by `on_invalid = "clean"`.
    pub clean_value: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterSettings {
    pub commit_size: Option<usize>,
    pub progress_interval: Option<u64>,
}

/// Columns the pipeline fills itself rather than reading from the source.
fn is_generated(delta_type: DeltaType) -> bool {
    matches!(
        delta_type,
        DeltaType::AutoIncrement
            | DeltaType::ValidToDate
            | DeltaType::IsCurrentField
            | DeltaType::Version
            | DeltaType::CreateAuditKey
            | DeltaType::UpdateAuditKey
            | DeltaType::CreateDate
            | DeltaType::UpdateDate
            | DeltaType::DatabaseOperation
            | DeltaType::RejectedReason
            | DeltaType::ValidationStatus
    )
}

impl ColumnConfig {
    fn field(&self, attribute: &str) -> String {
        format!("columns.{}.{}", self.name, attribute)
    }

    pub fn data_type(&self) -> Result<DataType> {
        DataType::parse_name(&self.data_type).ok_or_else(|| EtlError::InvalidConfigValueError {
            field: self.field("data_type"),
            value: self.data_type.clone(),
            reason: "Unknown data type".to_string(),
        })
    }

    pub fn delta_type(&self) -> Result<DeltaType> {
        match &self.delta_type {
            None => Ok(DeltaType::TrackingField),
            Some(name) => DeltaType::parse_name(name).ok_or_else(|| EtlError::InvalidConfigValueError {
                field: self.field("delta_type"),
                value: name.clone(),
                reason: "Unknown delta type".to_string(),
            }),
        }
    }

    pub fn source_name(&self) -> &str {
        self.source.as_deref().unwrap_or(&self.name)
    }

    fn parse_value(&self, attribute: &str, text: &str) -> Result<Value> {
        let data_type = self.data_type()?;
        data_type.parse(&self.field(attribute), text)
    }

    pub fn to_column(&self) -> Result<Column> {
        let mut column = Column::new(self.name.clone(), self.data_type()?).with_delta_type(self.delta_type()?);
        if let Some(default) = &self.default {
            column = column.with_default(self.parse_value("default", default)?);
        }
        if self.allow_null == Some(false) {
            column = column.not_null();
        }
        if let Some(security) = &self.security {
            let flag = SecurityFlag::parse_name(security).ok_or_else(|| EtlError::InvalidConfigValueError {
                field: self.field("security"),
                value: security.clone(),
                reason: "Expected none, encrypt, one_way_hash or hide".to_string(),
            })?;
            column = column.with_security(flag);
        }
        Ok(column)
    }

    fn action(&self) -> Result<ValidationAction> {
        match self.on_invalid.as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("reject") => Ok(ValidationAction::Reject),
            Some("discard") => Ok(ValidationAction::Discard),
            Some("abend") => Ok(ValidationAction::Abend),
            Some("clean") => {
                let value = match &self.clean_value {
                    Some(text) => self.parse_value("clean_value", text)?,
                    None => Value::Null,
                };
                Ok(ValidationAction::Clean(value))
            }
            Some(other) => Err(EtlError::InvalidConfigValueError {
                field: self.field("on_invalid"),
                value: other.to_string(),
                reason: "Expected reject, discard, abend or clean".to_string(),
            }),
        }
    }

    pub fn validations(&self) -> Result<Vec<ColumnValidation>> {
        let mut rules = Vec::new();
        if self.allow_null == Some(false) {
            rules.push(ValidationRule::NotNull);
        }
        if let Some(length) = self.max_length {
            rules.push(ValidationRule::MaxLength(length));
        }
        if let Some(pattern) = &self.pattern {
            let regex = Regex::new(pattern).map_err(|e| EtlError::InvalidConfigValueError {
                field: self.field("pattern"),
                value: pattern.clone(),
                reason: e.to_string(),
            })?;
            rules.push(ValidationRule::Pattern(regex));
        }
        if self.min.is_some() || self.max.is_some() {
            let min = self.min.as_deref().map(|t| self.parse_value("min", t)).transpose()?;
            let max = self.max.as_deref().map(|t| self.parse_value("max", t)).transpose()?;
            rules.push(ValidationRule::Range { min, max });
        }
        if rules.is_empty() {
            return Ok(Vec::new());
        }
        let action = self.action()?;
        Ok(rules
            .into_iter()
            .map(|rule| ColumnValidation::new(self.name.clone(), rule, action.clone()))
            .collect())
    }
}

impl TomlConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(EtlError::IoError)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = Self::substitute_env_vars(content)?;
        Ok(toml::from_str(&processed_content)?)
    }

    /// Replaces `${VAR}` with the environment variable; unset variables are left as written.
    fn substitute_env_vars(content: &str) -> Result<String> {
        let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| EtlError::ConfigError {
            message: e.to_string(),
        })?;
        let result = re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
        });
        Ok(result.to_string())
    }

    pub fn table_name(&self) -> &str {
        self.target.table.as_deref().unwrap_or(&self.pipeline.name)
    }

    pub fn update_strategy(&self) -> Result<UpdateStrategy> {
        match &self.target.update_strategy {
            None => Ok(UpdateStrategy::default()),
            Some(name) => UpdateStrategy::parse_name(name).ok_or_else(|| EtlError::InvalidConfigValueError {
                field: "target.update_strategy".to_string(),
                value: name.clone(),
                reason: "Expected append, reload, append_update, append_update_delete, \
                         append_update_preserve or append_update_delete_preserve"
                    .to_string(),
            }),
        }
    }

    pub fn target_schema(&self) -> Result<Schema> {
        let columns = self.columns.iter().map(ColumnConfig::to_column).collect::<Result<_>>()?;
        Ok(Schema::new(self.table_name(), columns))
    }

    fn source_columns(&self) -> impl Iterator<Item = &ColumnConfig> {
        self.columns
            .iter()
            .filter(|c| c.delta_type().map(|d| !is_generated(d)).unwrap_or(true))
    }

    /// Columns read from the source file, under their source names.
    pub fn source_schema(&self) -> Result<Schema> {
        let columns = self
            .source_columns()
            .map(|c| Ok(Column::new(c.source_name(), c.data_type()?)))
            .collect::<Result<_>>()?;
        Ok(Schema::new(format!("{}_source", self.table_name()), columns))
    }

    /// Renames source columns to their target names.
    pub fn mappings(&self) -> Vec<Mapping> {
        self.source_columns()
            .map(|c| Mapping::column(c.source_name(), c.name.clone()))
            .collect()
    }

    pub fn filters(&self) -> Result<Vec<Filter>> {
        let mut filters = Vec::new();
        for (i, filter) in self.source.filters.iter().flatten().enumerate() {
            let field = format!("source.filters[{}]", i);
            let operator = Operator::parse_name(&filter.operator).ok_or_else(|| EtlError::InvalidConfigValueError {
                field: format!("{}.operator", field),
                value: filter.operator.clone(),
                reason: "Unknown operator".to_string(),
            })?;
            let column = self
                .source_columns()
                .find(|c| c.source_name() == filter.column)
                .ok_or_else(|| EtlError::InvalidConfigValueError {
                    field: format!("{}.column", field),
                    value: filter.column.clone(),
                    reason: "Not a source column".to_string(),
                })?;
            let value = match &filter.value {
                Some(text) => column.parse_value("filter", text)?,
                None => Value::Null,
            };
            filters.push(Filter::new(filter.column.clone(), operator, value));
        }
        Ok(filters)
    }

    pub fn validations(&self) -> Result<Vec<ColumnValidation>> {
        let mut validations = Vec::new();
        for column in self.source_columns() {
            validations.extend(column.validations()?);
        }
        Ok(validations)
    }

    pub fn writer_config(&self) -> WriterConfig {
        let defaults = WriterConfig::default();
        let settings = self.writer.as_ref();
        WriterConfig {
            commit_size: settings.and_then(|w| w.commit_size).unwrap_or(defaults.commit_size),
            progress_interval: settings
                .and_then(|w| w.progress_interval)
                .unwrap_or(defaults.progress_interval),
            reject_table: self
                .target
                .reject_path
                .as_ref()
                .map(|_| format!("{}_reject", self.table_name())),
        }
    }

    pub fn validate_config(&self) -> Result<()> {
        validate_non_empty_string("pipeline.name", &self.pipeline.name)?;
        validate_path("source.path", &self.source.path)?;
        validate_file_extension("source.path", &self.source.path, &["csv"])?;
        validate_path("target.path", &self.target.path)?;
        validate_file_extension("target.path", &self.target.path, &["csv"])?;
        if let Some(reject_path) = &self.target.reject_path {
            validate_file_extension("target.reject_path", reject_path, &["csv"])?;
        }
        if let Some(commit_size) = self.writer.as_ref().and_then(|w| w.commit_size) {
            validate_positive_number("writer.commit_size", commit_size, 1)?;
        }

        if self.columns.is_empty() {
            return Err(EtlError::MissingConfigError {
                field: "columns".to_string(),
            });
        }
        validate_unique_names("columns", self.columns.iter().map(|c| c.name.as_str()))?;
        for column in &self.columns {
            column.to_column()?;
            column.validations()?;
        }

        let strategy = self.update_strategy()?;
        let has_key = self
            .columns
            .iter()
            .any(|c| matches!(c.delta_type(), Ok(DeltaType::NaturalKey)));
        if strategy.do_update() && !has_key {
            return Err(EtlError::ConfigValidationError {
                field: "columns".to_string(),
                message: format!("Update strategy {:?} needs a natural_key column", strategy),
            });
        }
        self.filters()?;
        Ok(())
    }
}

impl Validate for TomlConfig {
    fn validate(&self) -> Result<()> {
        self.validate_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const BASIC: &str = r#"
[pipeline]
name = "customers"

[source]
path = "in/customers.csv"
filters = [{ column = "customer_id", operator = "greater_than", value = "0" }]

[target]
path = "out/dim_customers.csv"
update_strategy = "append_update_delete_preserve"
reject_path = "out/rejects.csv"

[[columns]]
name = "customer_key"
data_type = "int"
delta_type = "auto_increment"

[[columns]]
name = "id"
source = "customer_id"
data_type = "int"
delta_type = "natural_key"

[[columns]]
name = "email"
data_type = "string"
allow_null = false
max_length = 40

[[columns]]
name = "is_current"
data_type = "boolean"
delta_type = "is_current_field"

[writer]
commit_size = 250
"#;

    #[test]
    fn test_parse_pipeline_definition() {
        let config = TomlConfig::from_toml_str(BASIC).unwrap();
        config.validate().unwrap();

        assert_eq!(config.table_name(), "customers");
        assert_eq!(config.update_strategy().unwrap(), UpdateStrategy::AppendUpdateDeletePreserve);

        let target = config.target_schema().unwrap();
        assert_eq!(target.column_names(), vec!["customer_key", "id", "email", "is_current"]);
        assert_eq!(target.natural_key_ordinals(), vec![1]);

        let source = config.source_schema().unwrap();
        assert_eq!(source.column_names(), vec!["customer_id", "email"]);
        assert_eq!(config.mappings().len(), 2);
        assert_eq!(config.validations().unwrap().len(), 2);
        assert_eq!(config.filters().unwrap(), vec![Filter::new("customer_id", Operator::GreaterThan, 0)]);

        let writer = config.writer_config();
        assert_eq!(writer.commit_size, 250);
        assert_eq!(writer.reject_table.as_deref(), Some("customers_reject"));
    }

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("FLOW_ETL_TEST_SOURCE", "in/from_env.csv");
        let content = BASIC.replace("in/customers.csv", "${FLOW_ETL_TEST_SOURCE}");
        let config = TomlConfig::from_toml_str(&content).unwrap();
        assert_eq!(config.source.path, "in/from_env.csv");
        std::env::remove_var("FLOW_ETL_TEST_SOURCE");
    }

    #[test]
    fn test_invalid_definitions() {
        let wrong_extension = BASIC.replace("out/dim_customers.csv", "out/dim_customers.json");
        assert!(TomlConfig::from_toml_str(&wrong_extension).unwrap().validate().is_err());

        let unknown_type = BASIC.replace("data_type = \"boolean\"", "data_type = \"money\"");
        let err = TomlConfig::from_toml_str(&unknown_type).unwrap().validate().unwrap_err();
        assert!(err.to_string().contains("columns.is_current.data_type"));

        let no_key = BASIC.replace("delta_type = \"natural_key\"", "delta_type = \"tracking_field\"");
        assert!(TomlConfig::from_toml_str(&no_key).unwrap().validate().is_err());

        let zero_commit = BASIC.replace("commit_size = 250", "commit_size = 0");
        assert!(TomlConfig::from_toml_str(&zero_commit).unwrap().validate().is_err());

        let bad_strategy = BASIC.replace("append_update_delete_preserve", "merge");
        assert!(TomlConfig::from_toml_str(&bad_strategy).unwrap().validate().is_err());

        assert!(TomlConfig::from_toml_str("[pipeline]\nname = 1").is_err());
    }

    #[test]
    fn test_config_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(BASIC.as_bytes()).unwrap();
        let config = TomlConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(config.pipeline.name, "customers");
    }
}
