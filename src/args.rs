use std::{process, time::Duration};

use anyhow::Result;
use pico_args::Arguments;

#[derive(Default, Debug)]
pub struct Args {
    pub proxy: String,
    pub endpoint: String,
    pub timeout: Duration,
    pub debug: bool,
}

impl Args {
    pub fn parse() -> Result<Self> {
        const DEFAULT_TIMEOUT_SECS: u64 = 30;

        let mut parser = Arguments::from_env();
        if parser.contains("-h") || parser.contains("--help") {
            eprintln!(include_str!("usage"));
            process::exit(0);
        }

        if parser.contains("-V") || parser.contains("--version") {
            eprintln!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            process::exit(0);
        }

        let args = Self {
            debug: parser.contains("-d") || parser.contains("--debug"),
            timeout: Duration::from_secs(
                parser
                    .opt_value_from_str("--timeout")?
                    .unwrap_or(DEFAULT_TIMEOUT_SECS),
            ),
            proxy: parser.value_from_str(["-x", "--proxy"])?,
            endpoint: parser.free_from_str()?,
        };

        Ok(args)
    }
}
