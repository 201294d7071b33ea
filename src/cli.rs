use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::ConfigOverrides;

#[derive(Debug, Clone, Parser)]
#[command(name = "perspective-eye")]
#[command(about = "Instrument JVM class files and jars to log the latency of a lifecycle method")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[command(flatten)]
    pub engine: EngineArgs,

    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Debug, Clone, Default, Args)]
pub struct EngineArgs {
    /// JSON config file (defaults to $PERSPECTIVE_CONFIG)
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Copy inputs through without instrumenting
    #[arg(long, global = true)]
    pub disable: bool,

    /// Treat every run as a full run
    #[arg(long, global = true)]
    pub no_incremental: bool,

    #[arg(long, value_name = "NAME", global = true)]
    pub target_method: Option<String>,

    #[arg(long, value_name = "TAG", global = true)]
    pub tag: Option<String>,

    #[arg(long, value_name = "N", global = true)]
    pub threads: Option<usize>,
}

impl EngineArgs {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            config: self.config.clone(),
            disable: self.disable,
            no_incremental: self.no_incremental,
            target_method: self.target_method.clone(),
            tag: self.tag.clone(),
            threads: self.threads,
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Run a batch transform described by a JSON manifest
    Transform {
        #[arg(value_name = "MANIFEST")]
        manifest: PathBuf,
    },
    /// Instrument a single class file
    Instrument {
        #[arg(value_name = "CLASS")]
        class_file: PathBuf,

        /// Output file (defaults to rewriting CLASS in place)
        #[arg(short = 'o', long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// Rewrite a single archive
    Rewrite {
        #[arg(value_name = "ARCHIVE")]
        archive: PathBuf,

        #[arg(short = 'o', long, value_name = "FILE")]
        output: PathBuf,
    },
    /// Print the decoded structure of a class file as JSON
    Inspect {
        #[arg(value_name = "CLASS")]
        class_file: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_flags_are_accepted_after_the_subcommand() {
        let cli = Cli::parse_from([
            "perspective-eye",
            "instrument",
            "A.class",
            "--tag",
            "perf",
            "--threads",
            "3",
            "-vv",
        ]);
        assert_eq!(cli.verbose, 2);
        let o = cli.engine.overrides();
        assert_eq!(o.tag.as_deref(), Some("perf"));
        assert_eq!(o.threads, Some(3));
        assert!(!o.disable);
        match cli.command {
            Commands::Instrument { class_file, output } => {
                assert_eq!(class_file, PathBuf::from("A.class"));
                assert!(output.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rewrite_requires_an_output() {
        assert!(Cli::try_parse_from(["perspective-eye", "rewrite", "a.jar"]).is_err());
        let cli =
            Cli::try_parse_from(["perspective-eye", "--disable", "rewrite", "a.jar", "-o", "b.jar"])
                .unwrap();
        assert!(cli.engine.disable);
    }
}
