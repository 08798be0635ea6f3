use anyhow::Context;
use clap::Parser;
use flow_etl::utils::error::ErrorSeverity;
use flow_etl::utils::logger::{self, LogFormat};
use flow_etl::utils::validation::Validate;
use flow_etl::{CliArgs, RunStatus, SyncPipeline, TomlConfig};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    logger::init_logger(LogFormat::from_flag(args.json_log), args.verbose);

    tracing::info!("Starting flow-etl with {}", args.config.display());
    if args.verbose {
        tracing::debug!("CLI args: {:?}", args);
    }

    let config = match TomlConfig::from_file(&args.config).and_then(|c| c.validate().map(|_| c)) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("❌ Configuration validation failed: {}", e);
            tracing::error!("💡 Suggestion: {}", e.recovery_suggestion());
            eprintln!("❌ {}", e.user_friendly_message());
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling run");
            ctrl_c.cancel();
        }
    });

    let pipeline = SyncPipeline::new(config).dry_run(args.dry_run);
    match pipeline.run(&cancel).await {
        Ok(result) => {
            if let Some(path) = &args.result {
                let json = serde_json::to_string_pretty(&result)?;
                std::fs::write(path, json)
                    .with_context(|| format!("Failed to write run result to {}", path.display()))?;
            }
            match result.status {
                RunStatus::Finished | RunStatus::FinishedErrors => {
                    println!("✅ Run '{}' {}", result.run_name, result.status);
                    println!(
                        "📊 {} created, {} updated, {} deleted, {} rejected, {} unchanged",
                        result.rows_created,
                        result.rows_updated,
                        result.rows_deleted,
                        result.rows_rejected,
                        result.rows_ignored
                    );
                }
                RunStatus::Cancelled => {
                    eprintln!("⚠️ Run '{}' was cancelled", result.run_name);
                    std::process::exit(130);
                }
                _ => {
                    eprintln!(
                        "❌ Run '{}' {}: {}",
                        result.run_name,
                        result.status,
                        result.message.as_deref().unwrap_or("no message")
                    );
                    std::process::exit(1);
                }
            }
        }
        Err(e) => {
            tracing::error!(
                "❌ Pipeline failed: {} (Category: {:?}, Severity: {:?})",
                e,
                e.category(),
                e.severity()
            );
            tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());
            eprintln!("❌ {}", e.user_friendly_message());

            let exit_code = match e.severity() {
                ErrorSeverity::Low => 0,
                ErrorSeverity::Medium => 2,
                ErrorSeverity::High => 1,
                ErrorSeverity::Critical => 3,
            };
            if exit_code > 0 {
                std::process::exit(exit_code);
            }
        }
    }

    Ok(())
}
