//! JSON end-of-run report and control replies

use crate::error::{FailureCode, PerfError};
use crate::stats::aggregator::AggregateStats;
use crate::stats::JobReport;
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Machine-readable summary of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalReport {
    /// 0 on success, otherwise the first recorded failure code
    pub result: i32,
    pub io_time_usec: u64,
    pub jobs: Vec<JobReport>,
    pub total: Totals,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    pub io_per_second: f64,
    pub mb_per_second: f64,
    pub failed_per_second: f64,
    pub timeout_per_second: f64,
}

impl FinalReport {
    pub fn new(stats: &AggregateStats, result: Option<FailureCode>) -> Self {
        FinalReport {
            result: result.map_or(0, |code| code.0),
            io_time_usec: stats.window.io_time_usec,
            jobs: stats.jobs.clone(),
            total: Totals {
                io_per_second: stats.total_io_per_second,
                mb_per_second: stats.total_mb_per_second,
                failed_per_second: stats.total_failed_per_second,
                timeout_per_second: stats.total_timeout_per_second,
            },
        }
    }
}

/// Pretty-printed [`FinalReport`]
pub fn format_final(stats: &AggregateStats, result: Option<FailureCode>) -> Result<String> {
    Ok(serde_json::to_string_pretty(&FinalReport::new(stats, result))?)
}

/// Reply to a `perform_tests` request
///
/// Success is `{"result":0}`; a failure carries its code and message.
pub fn control_reply(outcome: &std::result::Result<(), PerfError>) -> Value {
    match outcome {
        Ok(()) => json!({ "result": 0 }),
        Err(err) => json!({
            "error": {
                "code": err.code().0,
                "message": err.to_string(),
            }
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::SampleWindow;

    #[test]
    fn test_final_report() {
        let mut stats = AggregateStats::new(SampleWindow {
            io_time_usec: 2_000_000,
            ema_period: 0,
            period_usec: 0,
        });
        stats.accumulate(JobReport {
            name: "Malloc0".into(),
            core: 0,
            io_per_second: 100.0,
            mb_per_second: 0.5,
            failed_per_second: 0.0,
            timeout_per_second: 0.0,
        });

        let text = format_final(&stats, Some(FailureCode::GENERIC)).unwrap();
        let report: FinalReport = serde_json::from_str(&text).unwrap();
        assert_eq!(report.result, -1);
        assert_eq!(report.io_time_usec, 2_000_000);
        assert_eq!(report.jobs[0].name, "Malloc0");
        assert_eq!(report.total.io_per_second, 100.0);

        let value: Value = serde_json::from_str(&format_final(&stats, None).unwrap()).unwrap();
        assert_eq!(value["result"], 0);
    }

    #[test]
    fn test_control_reply() {
        assert_eq!(control_reply(&Ok(())).to_string(), r#"{"result":0}"#);

        let reply = control_reply(&Err(PerfError::RunFailed(FailureCode::GENERIC)));
        assert_eq!(reply["error"]["code"], -1);
        assert_eq!(
            reply["error"]["message"],
            "bdevperf failed with error Operation not permitted"
        );

        let reply = control_reply(&Err(PerfError::InProgress));
        assert_eq!(reply["error"]["code"], -libc::EINPROGRESS);
    }
}
