//! Human-readable report tables
//!
//! Rows keep the classic fixed-width layout so existing log scrapers keep
//! working:
//!
//! ```text
//!  Job: Malloc0 (Core 0)
//!  Malloc0             :   41321.55 IOPS     161.41 MiB/s
//!  =====================================================
//!  Total               :   41321.55 IOPS     161.41 MiB/s
//! ```

use crate::stats::aggregator::AggregateStats;
use crate::stats::JobReport;
use std::fmt::Write;

const SEPARATOR: &str = "=====================================================";

fn write_rates(out: &mut String, label: &str, io_per_second: f64, mb_per_second: f64) {
    let _ = writeln!(out, "\r {:<20}: {:10.2} IOPS {:10.2} MiB/s", label, io_per_second, mb_per_second);
}

fn write_failures(out: &mut String, label: &str, failed_per_second: f64, timeout_per_second: f64) {
    let _ = writeln!(
        out,
        "\r {:<20}: {:10.2} Fail/s {:8.2} TO/s",
        label, failed_per_second, timeout_per_second
    );
}

/// Job rows only show failures; timeouts alone appear in the total
fn write_job(out: &mut String, job: &JobReport) {
    let _ = writeln!(out, "\r Job: {} (Core {})", job.name, job.core);
    write_rates(out, &job.name, job.io_per_second, job.mb_per_second);
    if job.failed_per_second != 0.0 {
        write_failures(out, "", job.failed_per_second, job.timeout_per_second);
    }
}

/// Per-job rows followed by the grand total
pub fn format_report(stats: &AggregateStats) -> String {
    let mut out = String::new();
    for job in &stats.jobs {
        write_job(&mut out, job);
    }
    let _ = writeln!(out, "\r {}", SEPARATOR);
    write_rates(&mut out, "Total", stats.total_io_per_second, stats.total_mb_per_second);
    if stats.total_failed_per_second != 0.0 || stats.total_timeout_per_second != 0.0 {
        write_failures(
            &mut out,
            "Total",
            stats.total_failed_per_second,
            stats.total_timeout_per_second,
        );
    }
    out
}

/// End-of-run report; a run with no measurable duration has no rates
pub fn format_final(stats: &AggregateStats) -> String {
    if stats.window.io_time_usec == 0 {
        return "Job run time less than one microsecond, no performance data will be shown\n".to_string();
    }
    format_report(stats)
}
