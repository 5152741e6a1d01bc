//! CLI parse tests.


use super::{Cli, CliCommand};
use clap::Parser;

/// Parse argv into the subcommand, panicking on parse errors.
pub(crate) fn parse(args: &[&str]) -> CliCommand {
    Cli::parse_from(args.iter().copied()).command
}
