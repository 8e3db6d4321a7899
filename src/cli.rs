//! Command-line options for the spmd daemon

use clap::{ArgAction, Parser};
use std::path::PathBuf;

/// Secure file-exchange daemon
#[derive(Clone, Debug, Parser)]
#[command(name = "spmd", version)]
pub struct DaemonOpts {
    /// Bind address (host:port)
    #[arg(long)]
    pub bind: Option<String>,

    /// Store directory (objects and catalog)
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Append finished transfers to this JSONL journal
    #[arg(long)]
    pub journal: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl DaemonOpts {
    /// Default tracing filter when RUST_LOG is unset.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_verbosity() {
        let opts = DaemonOpts::parse_from(["spmd"]);
        assert!(opts.bind.is_none());
        assert_eq!(opts.log_filter(), "info");

        let opts = DaemonOpts::parse_from(["spmd", "-vv", "--bind", "127.0.0.1:1"]);
        assert_eq!(opts.bind.as_deref(), Some("127.0.0.1:1"));
        assert_eq!(opts.log_filter(), "trace");
    }
}
