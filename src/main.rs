use std::process::ExitCode;

use clap::Parser;
use log::LevelFilter;

use cinetile::{cli, logger};

fn main() -> ExitCode {
    let args = cli::CliArgs::parse();

    // The session log records debug and up; the terminal gets warnings, or
    // info and up with --verbose.
    let echo = if args.verbose { LevelFilter::Info } else { LevelFilter::Warn };
    logger::init(LevelFilter::Debug, echo);

    cli::run(args)
}
