//! sluiced entry point.
//!
//! ```bash
//! sluiced [options] <cluster_name> <conninfo>
//!
//! # Examples
//! sluiced payroll "host=db1 dbname=payroll user=replication"
//! sluiced -d 3 -s 2000 -g 12 payroll "dbname=payroll"
//! ```
//!
//! Exit codes: 0 after a clean shutdown, 255 for any startup or fatal
//! runtime failure, 1 for `-h`.

use clap::Parser;
use sluiced::cli::{usage, Cli};
use sluiced::{Daemon, Options};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("{e}");
            eprint!("{}", usage());
            std::process::exit(255);
        }
    };

    if cli.version {
        println!("sluiced version {}", env!("CARGO_PKG_VERSION"));
        std::process::exit(0);
    }
    if cli.help {
        eprint!("{}", usage());
        std::process::exit(1);
    }

    let options = match Options::load(&cli) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("sluiced: {e}");
            eprint!("{}", usage());
            std::process::exit(255);
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.env_filter_directive()));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let code = run(options);
    std::process::exit(code);
}

fn run(options: Options) -> i32 {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("sluiced: cannot start runtime: {e}");
            return 255;
        }
    };

    match runtime.block_on(Daemon::new(options).run()) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("sluiced: {e}");
            255
        }
    }
}
