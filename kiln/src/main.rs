#![forbid(unsafe_code)]

use std::io::Write;
use std::process;

use log::LevelFilter;
use structopt::clap::ErrorKind;
use structopt::StructOpt;

use crate::commands::{CommonFlags, Directive};

mod commands;
mod ui;

/// Bulk package builder for a source-based ports tree
///
/// Kiln resolves the requested ports into a dependency graph, builds each
/// port from source inside disposable sandboxes across parallel worker
/// slots, and maintains the binary package repository.
#[derive(Debug, StructOpt)]
#[structopt(name = "kiln")]
struct Opt {
    #[structopt(flatten)]
    flags: CommonFlags,
    #[structopt(subcommand)]
    directive: Option<Directive>,
}

fn main() {
    // SIGPIPE is already ignored process-wide by the runtime; worker pipes
    // surface as plain I/O errors instead of killing us.
    let opt = match Opt::from_iter_safe(std::env::args()) {
        Ok(opt) => opt,
        Err(err) => match err.kind {
            ErrorKind::HelpDisplayed | ErrorKind::VersionDisplayed => {
                let _ = writeln!(std::io::stdout(), "{}", err.message);
                process::exit(1);
            }
            _ => {
                eprintln!("{}", err.message);
                process::exit(2);
            }
        },
    };

    if opt.flags.version {
        println!("kiln {}", env!("CARGO_PKG_VERSION"));
        process::exit(0);
    }

    let directive = match opt.directive {
        Some(directive) => directive,
        None => {
            eprintln!("Missing directive; run 'kiln help' for usage");
            process::exit(1);
        }
    };

    let level = if opt.flags.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    match directive.run(opt.flags) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("kiln: {}", err);
            process::exit(1);
        }
    }
}
