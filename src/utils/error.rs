use thiserror::Error;

#[derive(Error, Debug)]
pub enum EtlError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("CSV processing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Configuration validation failed for '{field}': {message}")]
    ConfigValidationError { field: String, message: String },

    #[error("Missing required configuration field: {field}")]
    MissingConfigError { field: String },

    #[error("Invalid value '{value}' for '{field}': {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Transform '{transform}' could not find column '{column}'")]
    MissingColumn { transform: String, column: String },

    #[error("Transform '{transform}' cannot compare column '{column}' values '{left}' and '{right}'")]
    ValueComparison {
        transform: String,
        column: String,
        left: String,
        right: String,
    },

    #[error("Cannot convert value '{value}' of column '{column}' to {data_type}: {reason}")]
    Conversion {
        column: String,
        value: String,
        data_type: String,
        reason: String,
    },

    #[error("Transform '{transform}' function '{function}' failed: {message}")]
    Function {
        transform: String,
        function: String,
        message: String,
    },

    #[error("Transform '{transform}' found duplicate join rows for key {key}")]
    DuplicateJoinKey { transform: String, key: String },

    #[error("Transform '{transform}' found no join row for key {key}")]
    JoinNotFound { transform: String, key: String },

    #[error("Series '{column}' could not fill from {from} to {to} within {limit} steps")]
    SeriesFillLimit {
        column: String,
        from: String,
        to: String,
        limit: usize,
    },

    #[error("Writer {operation} on table '{table}' failed: {message}")]
    Writer {
        operation: String,
        table: String,
        message: String,
    },

    #[error("Reject table '{table}' is not compatible with the rows being rejected")]
    RejectTableMismatch { table: String },

    #[error("Row ignored")]
    IgnoreRow,

    #[error("Transform '{transform}' was cancelled")]
    Cancelled { transform: String },

    #[error("Data processing error: {message}")]
    ProcessingError { message: String },

    #[error("Validation error: {message}")]
    ValidationError { message: String },
}

pub type Result<T> = std::result::Result<T, EtlError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Data,
    Integrity,
    Storage,
    Cancellation,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl EtlError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            EtlError::ConfigError { .. }
            | EtlError::ConfigValidationError { .. }
            | EtlError::MissingConfigError { .. }
            | EtlError::InvalidConfigValueError { .. } => ErrorCategory::Configuration,
            EtlError::MissingColumn { .. }
            | EtlError::ValueComparison { .. }
            | EtlError::Conversion { .. }
            | EtlError::Function { .. }
            | EtlError::SeriesFillLimit { .. }
            | EtlError::IgnoreRow
            | EtlError::ProcessingError { .. }
            | EtlError::ValidationError { .. } => ErrorCategory::Data,
            EtlError::DuplicateJoinKey { .. } | EtlError::JoinNotFound { .. } => {
                ErrorCategory::Integrity
            }
            EtlError::Writer { .. }
            | EtlError::RejectTableMismatch { .. }
            | EtlError::CsvError(_) => ErrorCategory::Storage,
            EtlError::Cancelled { .. } => ErrorCategory::Cancellation,
            EtlError::IoError(_) | EtlError::SerializationError(_) => ErrorCategory::System,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self.category() {
            ErrorCategory::Cancellation => ErrorSeverity::Low,
            ErrorCategory::Data | ErrorCategory::Integrity => ErrorSeverity::Medium,
            ErrorCategory::Configuration | ErrorCategory::Storage => ErrorSeverity::High,
            ErrorCategory::System => ErrorSeverity::Critical,
        }
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            EtlError::MissingColumn { .. } => {
                "Check that the source and target column names match the pipeline definition"
            }
            EtlError::ValueComparison { .. } | EtlError::Conversion { .. } => {
                "Check the data types declared for the column against the data being loaded"
            }
            EtlError::DuplicateJoinKey { .. } => {
                "Choose a join duplicate strategy other than abend, or de-duplicate the reference data"
            }
            EtlError::JoinNotFound { .. } => {
                "Use the filter or null-join not-found strategy, or complete the reference data"
            }
            EtlError::SeriesFillLimit { .. } => {
                "Check the series start/finish bounds and that the step function moves forward"
            }
            EtlError::Writer { .. } | EtlError::RejectTableMismatch { .. } => {
                "Check the target table structure and connection, then rerun the pipeline"
            }
            EtlError::Cancelled { .. } => "The run was cancelled; rerun it when ready",
            _ => match self.category() {
                ErrorCategory::Configuration => "Review the pipeline configuration file",
                ErrorCategory::System => "Check file permissions and available disk space",
                _ => "Inspect the failing rows and rerun the pipeline",
            },
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self.category() {
            ErrorCategory::Configuration => format!("Configuration problem: {}", self),
            ErrorCategory::Data => format!("Data problem: {}", self),
            ErrorCategory::Integrity => format!("Reference data problem: {}", self),
            ErrorCategory::Storage => format!("Target store problem: {}", self),
            ErrorCategory::Cancellation => "The pipeline was cancelled".to_string(),
            ErrorCategory::System => format!("System problem: {}", self),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EtlError::Cancelled { .. })
    }

    pub fn is_ignore_row(&self) -> bool {
        matches!(self, EtlError::IgnoreRow)
    }

    /// Wraps a connection failure with the operation and table it was issued for.
    pub fn writer(operation: &str, table: &str, source: &EtlError) -> Self {
        EtlError::Writer {
            operation: operation.to_string(),
            table: table.to_string(),
            message: source.to_string(),
        }
    }
}

impl From<toml::de::Error> for EtlError {
    fn from(e: toml::de::Error) -> Self {
        EtlError::ConfigValidationError {
            field: "toml_parsing".to_string(),
            message: format!("TOML parsing error: {}", e),
        }
    }
}
