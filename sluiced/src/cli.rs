//! Command line interface.
//!
//! `sluiced [options] <cluster_name> <conninfo>`. The flag set is stable
//! operator surface; `-v` exits 0, `-h` and any parse failure exit
//! non-zero with the usage text.

use clap::Parser;
use std::path::PathBuf;

/// The parsed command line.
#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "sluiced",
    disable_help_flag = true,
    disable_version_flag = true
)]
pub struct Cli {
    /// Read configuration from this file
    #[arg(short = 'f', value_name = "FILE")]
    pub config_file: Option<PathBuf>,

    /// Directory to store SYNC archive files
    #[arg(short = 'a', value_name = "DIR")]
    pub archive_dir: Option<PathBuf>,

    /// Log verbosity 1..4
    #[arg(short = 'd', value_name = "LEVEL")]
    pub log_level: Option<u8>,

    /// SYNC check interval in milliseconds
    #[arg(short = 's', value_name = "MS")]
    pub sync_interval: Option<u64>,

    /// SYNC keepalive timeout in milliseconds
    #[arg(short = 't', value_name = "MS")]
    pub sync_interval_timeout: Option<u64>,

    /// Desired per-subscriber SYNC apply time in milliseconds
    #[arg(short = 'o', value_name = "MS")]
    pub desired_sync_time: Option<u64>,

    /// Maximum SYNC group size
    #[arg(short = 'g', value_name = "NUM")]
    pub sync_group_maxsize: Option<u32>,

    /// Cleanup cycles between vacuums
    #[arg(short = 'c', value_name = "NUM")]
    pub vac_frequency: Option<u32>,

    /// Pid file path
    #[arg(short = 'p', value_name = "FILE")]
    pub pid_file: Option<PathBuf>,

    /// Print version and exit
    #[arg(short = 'v')]
    pub version: bool,

    /// Print usage and exit
    #[arg(short = 'h')]
    pub help: bool,

    /// Cluster name
    pub cluster_name: Option<String>,

    /// Connection info for the local database
    pub conninfo: Option<String>,
}

/// The usage text printed for `-h` and argument errors.
pub fn usage() -> String {
    let mut out = String::new();
    out.push_str("usage: sluiced [options] clustername conninfo\n\n");
    out.push_str("Options:\n");
    out.push_str("    -d <level>        verbosity of logging (1..4)\n");
    out.push_str("    -s <milliseconds> SYNC check interval (default 10000)\n");
    out.push_str("    -t <milliseconds> SYNC interval timeout (default 60000)\n");
    out.push_str("    -o <milliseconds> desired subscriber SYNC processing time\n");
    out.push_str("    -g <num>          maximum SYNC group size (default 6)\n");
    out.push_str("    -c <num>          how often to vacuum in cleanup cycles\n");
    out.push_str("    -p <filename>     daemon pid file\n");
    out.push_str("    -f <filename>     daemon configuration file\n");
    out.push_str("    -a <directory>    directory to store SYNC archive files\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("sluiced").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_positional_args() {
        let cli = parse(&["payroll", "host=localhost dbname=pay"]);
        assert_eq!(cli.cluster_name.as_deref(), Some("payroll"));
        assert_eq!(cli.conninfo.as_deref(), Some("host=localhost dbname=pay"));
    }

    #[test]
    fn test_all_flags() {
        let cli = parse(&[
            "-f", "/etc/sluiced.conf",
            "-a", "/var/lib/sluice/archive",
            "-d", "3",
            "-s", "5000",
            "-t", "20000",
            "-o", "30000",
            "-g", "12",
            "-c", "5",
            "-p", "/run/sluiced.pid",
            "payroll",
            "dbname=pay",
        ]);
        assert_eq!(cli.log_level, Some(3));
        assert_eq!(cli.sync_interval, Some(5000));
        assert_eq!(cli.sync_interval_timeout, Some(20000));
        assert_eq!(cli.desired_sync_time, Some(30000));
        assert_eq!(cli.sync_group_maxsize, Some(12));
        assert_eq!(cli.vac_frequency, Some(5));
        assert!(cli.pid_file.is_some());
        assert!(cli.archive_dir.is_some());
        assert!(cli.config_file.is_some());
    }

    #[test]
    fn test_version_and_help_flags() {
        assert!(parse(&["-v"]).version);
        assert!(parse(&["-h"]).help);
    }

    #[test]
    fn test_unknown_flag_rejected() {
        assert!(Cli::try_parse_from(["sluiced", "-z", "x"]).is_err());
    }

    #[test]
    fn test_usage_names_every_flag() {
        let text = usage();
        for flag in ["-d", "-s", "-t", "-o", "-g", "-c", "-p", "-f", "-a"] {
            assert!(text.contains(flag), "usage missing {flag}");
        }
    }
}
