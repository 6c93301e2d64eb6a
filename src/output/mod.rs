//! Report rendering
//!
//! Live reports are always text. The end-of-run report is text by default
//! or a JSON document with `--json`.

pub mod json;
pub mod text;

use crate::error::FailureCode;
use crate::stats::aggregator::AggregateStats;
use crate::Result;

/// Format of the end-of-run report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Print a live report
pub fn print_periodic(stats: &AggregateStats) {
    print!("{}", text::format_report(stats));
}

/// Print the report that ends a run
pub fn print_final(format: OutputFormat, stats: &AggregateStats, result: Option<FailureCode>) -> Result<()> {
    match format {
        OutputFormat::Text => print!("{}", text::format_final(stats)),
        OutputFormat::Json => println!("{}", json::format_final(stats, result)?),
    }
    Ok(())
}
