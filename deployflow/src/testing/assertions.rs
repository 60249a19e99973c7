//! Assertions over pipeline run reports.

use crate::core::StageStatus;
use crate::pipeline::RunReport;

/// Asserts the run's stages, in order, have the given names and statuses.
///
/// # Panics
///
/// Panics if they differ.
pub fn assert_stage_statuses(report: &RunReport, expected: &[(&str, StageStatus)]) {
    let actual: Vec<(&str, StageStatus)> = report
        .stages
        .iter()
        .map(|s| (s.name.as_str(), s.status))
        .collect();
    assert_eq!(actual, expected, "stage statuses differ for run {}", report.run_id);
}
