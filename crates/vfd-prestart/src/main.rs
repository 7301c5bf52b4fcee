//! vfd-prestart - binds SR-IOV devices to their declared drivers
//!
//! Entry point, typically run from the VF daemon's `ExecStartPre=` hook.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vfd_common::shell::DPDK_DEVBIND_CMD;
use vfd_common::VfdError;
use vfd_prestart::vendor::is_valid_vendor;
use vfd_prestart::{
    load_config, Reconciler, ReconcilerConfig, RunSummary, SysfsHost, DEFAULT_ALLOWED_VENDORS,
    DEFAULT_BIND_CONCURRENCY, DEFAULT_CALL_TIMEOUT, DEFAULT_CONFIG_PATH,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Bind SR-IOV PFs and VFs to the drivers declared in vfd.cfg
#[derive(Parser, Debug)]
#[command(name = "vfd-prestart")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// VF daemon parameter file
    #[arg(short = 'c', long, env = "VFD_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// VF unbind/bind operations in flight per batch
    #[arg(long, default_value_t = DEFAULT_BIND_CONCURRENCY, value_parser = parse_concurrency)]
    bind_concurrency: usize,

    /// Per-call limit for external tools in seconds (0 disables)
    #[arg(long, default_value_t = DEFAULT_CALL_TIMEOUT.as_secs())]
    call_timeout_secs: u64,

    /// Allowed PCI vendor id (repeatable, replaces the default list)
    #[arg(long = "allow-vendor", value_parser = parse_vendor)]
    allow_vendor: Vec<String>,

    /// Device bind tool
    #[arg(long, default_value = DPDK_DEVBIND_CMD)]
    devbind: String,

    /// sysfs mount point
    #[arg(long, default_value = "/sys")]
    sysfs_root: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn parse_concurrency(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

fn parse_vendor(s: &str) -> Result<String, String> {
    if is_valid_vendor(s) {
        Ok(s.trim().trim_start_matches("0x").to_ascii_lowercase())
    } else {
        Err(format!("'{}' is not a 4-digit hex vendor id", s))
    }
}

/// Initializes tracing/logging subsystem
fn init_logging(log_level: &str, format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().with_target(true).json())
            .try_init(),
    };
    result.map_err(|e| anyhow!("failed to set tracing subscriber: {}", e))
}

async fn run(args: &Args) -> anyhow::Result<RunSummary> {
    let specs = load_config(&args.config)
        .await
        .with_context(|| format!("loading {}", args.config.display()))?;
    info!(devices = specs.len(), config = %args.config.display(), "Loaded configuration");

    let timeout = match args.call_timeout_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };
    let host = SysfsHost::new(&args.sysfs_root)
        .with_devbind(&args.devbind)
        .with_timeout(timeout);

    let allowed_vendors = if args.allow_vendor.is_empty() {
        DEFAULT_ALLOWED_VENDORS.iter().map(|v| v.to_string()).collect()
    } else {
        args.allow_vendor.clone()
    };
    let config = ReconcilerConfig {
        bind_concurrency: args.bind_concurrency,
        allowed_vendors,
    };

    Ok(Reconciler::new(&host, config).run(&specs).await?)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_logging(&args.log_level, args.log_format) {
        eprintln!("vfd-prestart: {:#}", e);
        return ExitCode::FAILURE;
    }

    info!("--- Starting vfd-prestart ---");

    match run(&args).await {
        Ok(summary) => {
            if summary.is_noop() {
                info!("All devices already in the declared state");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            match e.downcast_ref::<VfdError>() {
                Some(err) => error!(
                    device = err.device().unwrap_or("-"),
                    action = err.action(),
                    error = %err,
                    "vfd-prestart failed"
                ),
                None => error!(error = %format!("{:#}", e), "vfd-prestart failed"),
            }
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["vfd-prestart"]);
        assert_eq!(args.bind_concurrency, DEFAULT_BIND_CONCURRENCY);
        assert_eq!(args.call_timeout_secs, DEFAULT_CALL_TIMEOUT.as_secs());
        assert!(args.allow_vendor.is_empty());
        assert_eq!(args.log_format, LogFormat::Text);
        assert_eq!(args.sysfs_root, PathBuf::from("/sys"));
    }

    #[test]
    fn test_args_overrides() {
        let args = Args::parse_from([
            "vfd-prestart",
            "--config",
            "/tmp/vfd.cfg",
            "--bind-concurrency",
            "2",
            "--allow-vendor",
            "0x1AF4",
            "--allow-vendor",
            "8086",
            "--log-format",
            "json",
        ]);
        assert_eq!(args.config, PathBuf::from("/tmp/vfd.cfg"));
        assert_eq!(args.bind_concurrency, 2);
        assert_eq!(args.allow_vendor, vec!["1af4", "8086"]);
        assert_eq!(args.log_format, LogFormat::Json);
    }

    #[test]
    fn test_args_rejects_bad_values() {
        assert!(Args::try_parse_from(["vfd-prestart", "--bind-concurrency", "0"]).is_err());
        assert!(Args::try_parse_from(["vfd-prestart", "--allow-vendor", "intel"]).is_err());
    }
}
