use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "flow-etl")]
#[command(about = "Delta-syncs a CSV source into a CSV target table")]
pub struct CliArgs {
    /// Pipeline definition (TOML).
    #[arg(short, long)]
    pub config: PathBuf,

    #[arg(long, help = "Enable verbose output")]
    pub verbose: bool,

    #[arg(long, help = "Log as JSON lines")]
    pub json_log: bool,

    #[arg(long, help = "Run the pipeline without saving the target")]
    pub dry_run: bool,

    /// Write the final run result as JSON to this file.
    #[arg(long)]
    pub result: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arguments() {
        let args = CliArgs::try_parse_from([
            "flow-etl",
            "--config",
            "pipeline.toml",
            "--dry-run",
            "--result",
            "run.json",
        ])
        .unwrap();
        assert_eq!(args.config, PathBuf::from("pipeline.toml"));
        assert!(args.dry_run);
        assert!(!args.verbose);
        assert_eq!(args.result, Some(PathBuf::from("run.json")));
    }

    #[test]
    fn test_config_is_required() {
        assert!(CliArgs::try_parse_from(["flow-etl", "--verbose"]).is_err());
    }
}
