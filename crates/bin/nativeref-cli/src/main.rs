//! Command line driver for **nativeref**.
//!
//! Runs reference management scenarios against the in-memory host and prints
//! what the array cache and the host counters look like afterwards.

use clap::Parser;
use nativeref::{log, utils::error::ReportableError};
use nativeref_cli::{Args, run};

#[cfg(not(target_arch = "wasm32"))]
use mimalloc::MiMalloc;

#[cfg(not(target_arch = "wasm32"))]
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if cfg!(debug_assertions) | cfg!(test) {
        colog::default_builder()
            .filter_level(log::LevelFilter::Trace)
            .init();
    } else {
        colog::default_builder().init();
    }

    let args = Args::parse();
    let reports = run(&args)
        .inspect_err(|e| log::error!("{}: {}", e.get_site(), e.get_message()))?;
    for report in reports {
        print!("{report}");
    }
    Ok(())
}
