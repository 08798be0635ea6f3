use crate::adapters::csv_file::{read_table, write_table};
use crate::adapters::memory::MemoryConnection;
use crate::config::toml_config::TomlConfig;
use crate::core::audit::{RunResult, TracingObserver};
use crate::core::encryption::ValueCipher;
use crate::core::transform::Transform;
use crate::core::transforms::{
    DeltaConfig, DeltaTransform, FilterTransform, MappingTransform, MemoryTransform, ValidationTransform,
};
use crate::core::writer::BufferedWriter;
use crate::domain::model::Table;
use crate::domain::ports::{Connection, RunObserver};
use crate::domain::query::SelectQuery;
use crate::domain::schema::{DeltaType, Schema};
use crate::utils::error::Result;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Syncs a source CSV into a target CSV table.
///
/// The target file is loaded into a [`MemoryConnection`], the delta between
/// source and target is written through the [`BufferedWriter`], and the
/// resulting target (and reject table) are saved back unless the run is a dry
/// run or did not succeed.
pub struct SyncPipeline {
    config: TomlConfig,
    dry_run: bool,
    observer: Arc<dyn RunObserver>,
}

impl SyncPipeline {
    pub fn new(config: TomlConfig) -> Self {
        Self {
            config,
            dry_run: false,
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    fn load_target(&self, schema: &Schema) -> Result<Table> {
        let path = Path::new(&self.config.target.path);
        if path.exists() {
            read_table(path, schema)
        } else {
            tracing::info!("Target {} does not exist yet, starting empty", path.display());
            Ok(Table::new(schema.clone(), Vec::new()))
        }
    }

    fn build_source(&self) -> Result<Box<dyn Transform>> {
        let schema = self.config.source_schema()?;
        let table = read_table(&self.config.source.path, &schema)?;
        tracing::info!("📥 Read {} source rows from {}", table.rows.len(), self.config.source.path);

        let mut source: Box<dyn Transform> = Box::new(MemoryTransform::from_table(&table).as_flat_file());
        let filters = self.config.filters()?;
        if !filters.is_empty() {
            source = Box::new(FilterTransform::new(source, filters));
        }
        source = Box::new(MappingTransform::new(source, self.config.mappings()));
        let validations = self.config.validations()?;
        if !validations.is_empty() {
            source = Box::new(ValidationTransform::new(source, validations));
        }
        Ok(source)
    }

    async fn delta_config(&self, connection: &MemoryConnection, target: &Schema) -> Result<DeltaConfig> {
        let mut config = DeltaConfig::new(self.config.update_strategy()?);
        if let Some(o) = target.delta_ordinal(DeltaType::AutoIncrement) {
            config.surrogate_key_seed = connection.get_next_key(target, &target.columns[o]).await?;
        }
        config.add_default_row = self.config.target.add_default_row.unwrap_or(false);
        config.truncate_target = self.config.target.truncate.unwrap_or(false);
        config.cipher = self
            .config
            .target
            .encryption_key
            .as_ref()
            .map(|key| Arc::new(ValueCipher::new(key)));
        Ok(config)
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<RunResult> {
        let name = self.config.pipeline.name.clone();
        let target = self.config.target_schema()?;
        let connection = Arc::new(MemoryConnection::new("csv").with_table(self.load_target(&target)?));

        let source = self.build_source()?;
        let reference = connection.get_reader(&target, &SelectQuery::default()).await?;
        let delta = DeltaTransform::new(source, reference, self.delta_config(&connection, &target).await?);

        let writer_config = self.config.writer_config();
        let reject_table = writer_config.reject_table.clone();
        let writer = BufferedWriter::new(connection.clone(), target.clone(), writer_config)
            .with_observer(Arc::clone(&self.observer));
        let audit_key = chrono::Local::now().timestamp();
        let result = writer.run(&name, audit_key, Box::new(delta), cancel).await;

        if !result.status.is_success() {
            return Ok(result);
        }
        if self.dry_run {
            tracing::info!("🧪 Dry run, {} left unchanged", self.config.target.path);
            return Ok(result);
        }

        if let Some(table) = connection.table(&target.name).await {
            write_table(&self.config.target.path, &table)?;
            tracing::info!("💾 Saved {} rows to {}", table.rows.len(), self.config.target.path);
        }
        if let (Some(reject_table), Some(reject_path)) = (reject_table, &self.config.target.reject_path) {
            if let Some(table) = connection.table(&reject_table).await {
                write_table(reject_path, &table)?;
                tracing::info!("💾 Saved {} rejected rows to {}", table.rows.len(), reject_path);
            }
        }
        Ok(result)
    }
}
