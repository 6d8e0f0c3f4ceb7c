//! Daemon options.
//!
//! Sources in order of increasing precedence: built-in defaults,
//! `SLUICE_*` environment variables, the `-f` option file (key=value,
//! loaded into the environment), command line flags.

use crate::cli::Cli;
use crate::error::{DaemonError, DaemonResult};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Fully resolved daemon options.
#[derive(Debug, Clone)]
pub struct Options {
    /// Cluster name
    pub cluster: String,
    /// Connection info for the local database
    pub conninfo: String,
    /// Log verbosity 1..4
    pub log_level: u8,
    /// SYNC generator interval
    pub sync_interval: Duration,
    /// Generate a keepalive SYNC after this long without one (0 = never)
    pub sync_interval_timeout: Duration,
    /// Target apply time steering adaptive group sizing
    pub desired_sync_time: Duration,
    /// Hard cap on SYNC group size
    pub sync_group_maxsize: u32,
    /// Cleanup cycles between vacuums
    pub vac_frequency: u32,
    /// Cleanup cycle period
    pub cleanup_interval: Duration,
    /// Rows in the active log partition before a SWITCH_LOG is considered
    pub switch_threshold: i64,
    /// Event fetch batch size per worker iteration
    pub fetch_batch_size: i64,
    /// Pid file, written at startup and removed at exit
    pub pid_file: Option<PathBuf>,
    /// Per-SYNC-group archive directory
    pub archive_dir: Option<PathBuf>,
    /// Statement run on every new connection
    pub sql_on_connection: Option<String>,
}

impl Options {
    /// Resolve options from the parsed command line plus environment.
    pub fn load(cli: &Cli) -> DaemonResult<Self> {
        // The option file and .env both feed the environment; explicit
        // file first so it wins over a stray .env
        if let Some(file) = &cli.config_file {
            dotenvy::from_path_override(file).map_err(|e| {
                DaemonError::Config(format!("cannot read config file {}: {e}", file.display()))
            })?;
        }
        let _ = dotenvy::dotenv();

        let cluster = cli
            .cluster_name
            .clone()
            .or_else(|| env::var("SLUICE_CLUSTER").ok())
            .ok_or_else(|| DaemonError::Config("cluster name is required".into()))?;
        let conninfo = cli
            .conninfo
            .clone()
            .or_else(|| env::var("SLUICE_CONNINFO").ok())
            .ok_or_else(|| DaemonError::Config("conninfo is required".into()))?;

        let log_level = cli
            .log_level
            .or_else(|| env_parse("SLUICE_LOG_LEVEL"))
            .unwrap_or(2)
            .clamp(1, 4);

        let sync_interval_ms: u64 = cli
            .sync_interval
            .or_else(|| env_parse("SLUICE_SYNC_INTERVAL"))
            .unwrap_or(10_000);
        let mut sync_timeout_ms: u64 = cli
            .sync_interval_timeout
            .or_else(|| env_parse("SLUICE_SYNC_INTERVAL_TIMEOUT"))
            .unwrap_or(60_000);

        // The keepalive must not fire faster than the generator runs
        if sync_timeout_ms != 0 && sync_timeout_ms <= sync_interval_ms {
            sync_timeout_ms = sync_interval_ms * 2;
        }

        let options = Self {
            cluster,
            conninfo,
            log_level,
            sync_interval: Duration::from_millis(sync_interval_ms),
            sync_interval_timeout: Duration::from_millis(sync_timeout_ms),
            desired_sync_time: Duration::from_millis(
                cli.desired_sync_time
                    .or_else(|| env_parse("SLUICE_DESIRED_SYNC_TIME"))
                    .unwrap_or(60_000),
            ),
            sync_group_maxsize: cli
                .sync_group_maxsize
                .or_else(|| env_parse("SLUICE_SYNC_GROUP_MAXSIZE"))
                .unwrap_or(6)
                .max(1),
            vac_frequency: cli
                .vac_frequency
                .or_else(|| env_parse("SLUICE_VAC_FREQUENCY"))
                .unwrap_or(3),
            cleanup_interval: Duration::from_secs(
                env_parse("SLUICE_CLEANUP_INTERVAL").unwrap_or(600),
            ),
            switch_threshold: env_parse("SLUICE_SWITCH_THRESHOLD").unwrap_or(10_000),
            fetch_batch_size: env_parse("SLUICE_FETCH_BATCH").unwrap_or(100),
            pid_file: cli
                .pid_file
                .clone()
                .or_else(|| env::var("SLUICE_PID_FILE").ok().map(PathBuf::from)),
            archive_dir: cli
                .archive_dir
                .clone()
                .or_else(|| env::var("SLUICE_ARCHIVE_DIR").ok().map(PathBuf::from)),
            sql_on_connection: env::var("SLUICE_SQL_ON_CONNECTION").ok(),
        };
        Ok(options)
    }

    /// The tracing filter directive for the configured verbosity.
    pub fn env_filter_directive(&self) -> &'static str {
        match self.log_level {
            1 => "sluiced=warn,sluice_capture=warn,sluice_config=warn,sluice_db=warn",
            2 => "sluiced=info,sluice_capture=info,sluice_config=info,sluice_db=info",
            3 => "sluiced=debug,sluice_capture=debug,sluice_config=debug,sluice_db=debug",
            _ => "sluiced=trace,sluice_capture=trace,sluice_config=trace,sluice_db=trace",
        }
    }

    /// Options for a test run against a throwaway database.
    pub fn test(cluster: &str, conninfo: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            conninfo: conninfo.to_string(),
            log_level: 4,
            sync_interval: Duration::from_millis(100),
            sync_interval_timeout: Duration::from_millis(200),
            desired_sync_time: Duration::from_millis(60_000),
            sync_group_maxsize: 6,
            vac_frequency: 3,
            cleanup_interval: Duration::from_millis(500),
            switch_threshold: 100,
            fetch_batch_size: 100,
            pid_file: None,
            archive_dir: None,
            sql_on_connection: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, raw, "Ignoring unparsable environment value");
            None
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(cluster: &str, conninfo: &str) -> Cli {
        Cli {
            cluster_name: Some(cluster.to_string()),
            conninfo: Some(conninfo.to_string()),
            ..Cli::default()
        }
    }

    #[test]
    fn test_defaults() {
        let options = Options::load(&cli("payroll", "dbname=pay")).unwrap();
        assert_eq!(options.sync_interval, Duration::from_millis(10_000));
        assert_eq!(options.sync_interval_timeout, Duration::from_millis(60_000));
        assert_eq!(options.sync_group_maxsize, 6);
        assert_eq!(options.vac_frequency, 3);
        assert_eq!(options.log_level, 2);
    }

    #[test]
    fn test_missing_cluster_is_config_error() {
        let parsed = Cli {
            conninfo: Some("dbname=pay".to_string()),
            ..Cli::default()
        };
        assert!(matches!(
            Options::load(&parsed),
            Err(DaemonError::Config(_))
        ));
    }

    #[test]
    fn test_sync_timeout_clamped_to_twice_interval() {
        let mut parsed = cli("payroll", "dbname=pay");
        parsed.sync_interval = Some(30_000);
        parsed.sync_interval_timeout = Some(10_000);
        let options = Options::load(&parsed).unwrap();
        assert_eq!(options.sync_interval_timeout, Duration::from_millis(60_000));
    }

    #[test]
    fn test_sync_timeout_zero_disables_keepalive() {
        let mut parsed = cli("payroll", "dbname=pay");
        parsed.sync_interval_timeout = Some(0);
        let options = Options::load(&parsed).unwrap();
        assert_eq!(options.sync_interval_timeout, Duration::ZERO);
    }

    #[test]
    fn test_group_size_floor() {
        let mut parsed = cli("payroll", "dbname=pay");
        parsed.sync_group_maxsize = Some(0);
        let options = Options::load(&parsed).unwrap();
        assert_eq!(options.sync_group_maxsize, 1);
    }

    #[test]
    fn test_log_level_clamped() {
        let mut parsed = cli("payroll", "dbname=pay");
        parsed.log_level = Some(9);
        let options = Options::load(&parsed).unwrap();
        assert_eq!(options.log_level, 4);
        assert!(options.env_filter_directive().contains("trace"));
    }
}
