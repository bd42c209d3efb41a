mod startup;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use client::{BackupDriver, BackupOptions, ClientOptions, TlsOptions};

use crate::startup::{setup_logger, setup_panic_hook};

/// Stream a consistent snapshot of a live cluster into a local archive.
#[derive(Parser, Debug)]
#[command(name = "bitgrid-backup", version, about)]
struct Args {
    /// Directory to write the archive into; must not exist yet.
    #[arg(long, short = 'o')]
    output_dir: PathBuf,

    /// Any node of the cluster to back up.
    #[arg(long)]
    host: String,

    /// Back up a single index instead of the whole cluster.
    #[arg(long)]
    index: Option<String>,

    /// Parallel shard and partition fetches.
    #[arg(long, default_value_t = 1)]
    concurrency: usize,

    /// How long to retry transient request failures.
    #[arg(long, default_value = "60s", value_parser = parse_duration)]
    retry_period: Duration,

    /// Connection and response-header timeout.
    #[arg(long, default_value = "3s", value_parser = parse_duration)]
    header_timeout: Duration,

    /// Skip all fsync calls. Faster, but the archive may not survive a
    /// crash of the machine writing it.
    #[arg(long)]
    no_sync: bool,

    /// PEM CA certificate to verify the cluster against.
    #[arg(long)]
    tls_ca_cert: Option<PathBuf>,

    /// PEM client certificate for mutual TLS.
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// PEM client key for mutual TLS.
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Skip server certificate verification.
    #[arg(long)]
    tls_skip_verify: bool,

    /// Bearer token sent with every request.
    #[arg(long)]
    auth_token: Option<String>,

    /// Log level filter, e.g. `info` or `debug,hyper=warn`.
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn tls_options(&self) -> Option<TlsOptions> {
        if self.tls_ca_cert.is_none()
            && self.tls_cert.is_none()
            && self.tls_key.is_none()
            && !self.tls_skip_verify
        {
            return None;
        }
        Some(TlsOptions {
            ca_cert_path: self.tls_ca_cert.clone(),
            cert_path: self.tls_cert.clone(),
            key_path: self.tls_key.clone(),
            skip_verify: self.tls_skip_verify,
        })
    }
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let (number, unit) = match value.find(|c: char| !c.is_ascii_digit()) {
        Some(at) => value.split_at(at),
        None => (value, "s"),
    };
    let count: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration {value:?}"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(count)),
        "s" => Ok(Duration::from_secs(count)),
        "m" => Ok(Duration::from_secs(count * 60)),
        "h" => Ok(Duration::from_secs(count * 3600)),
        _ => Err(format!("invalid duration {value:?}")),
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let options = BackupOptions {
        output_dir: args.output_dir.clone(),
        host: args.host.clone(),
        index: args.index.clone(),
        concurrency: args.concurrency,
        no_sync: args.no_sync,
        client: ClientOptions {
            header_timeout: args.header_timeout,
            retry_period: args.retry_period,
            tls: args.tls_options(),
            auth_token: args.auth_token.clone(),
        },
    };

    let driver = BackupDriver::new(options).context("configuring backup")?;
    driver.run().await.context("running backup")?;
    log::info!("backup complete: {}", args.output_dir.display());
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    setup_logger(&args.log_level);
    setup_panic_hook();

    if let Err(err) = run(args).await {
        log::error!("backup failed: {err:#}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("60s").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("sixty").is_err());
        assert!(parse_duration("10d").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_args_require_host_and_output() {
        use clap::CommandFactory;
        Args::command().debug_assert();

        let args = Args::try_parse_from([
            "bitgrid-backup",
            "--output-dir",
            "/tmp/backup",
            "--host",
            "localhost:10101",
        ])
        .unwrap();
        assert_eq!(args.concurrency, 1);
        assert_eq!(args.retry_period, Duration::from_secs(60));
        assert_eq!(args.header_timeout, Duration::from_secs(3));
        assert!(!args.no_sync);
        assert!(args.tls_options().is_none());

        assert!(Args::try_parse_from(["bitgrid-backup", "--host", "h"]).is_err());
    }
}
