pub mod adapters;
pub mod app;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::CliArgs;
pub use config::TomlConfig;

pub use adapters::MemoryConnection;
pub use app::SyncPipeline;
pub use core::audit::{RunResult, RunStatus};
pub use core::writer::{BufferedWriter, WriterConfig};
pub use core::{Reader, Transform, TransformStats};
pub use utils::error::{EtlError, Result};
