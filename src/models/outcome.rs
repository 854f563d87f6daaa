//! Results that escape the pipeline: one outcome per job, one result per pass.

use serde::Serialize;

/// Terminal result of one verified upload.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "tag")]
pub enum UploadOutcome {
    Success,
    /// The object store could not be reached or the protocol broke down.
    UploadFailed,
    /// The upload went through but the stored bytes do not match a re-read.
    ChecksumInvalid,
}

impl UploadOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// An outcome tagged with the key it was produced for.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct JobReport {
    pub key: String,
    pub outcome: UploadOutcome,
}

/// Aggregate over one backup pass.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "tag")]
pub enum BackupRunResult {
    Success,
    /// At least one job did not succeed. `details` lists every job in order.
    UploadFailed { details: Vec<JobReport> },
}

impl BackupRunResult {
    /// Reduce per-job reports: success iff every job succeeded.
    pub fn from_reports(details: Vec<JobReport>) -> Self {
        if details.iter().all(|report| report.outcome.is_success()) {
            Self::Success
        } else {
            Self::UploadFailed { details }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(key: &str, outcome: UploadOutcome) -> JobReport {
        JobReport {
            key: key.into(),
            outcome,
        }
    }

    #[test]
    fn empty_pass_is_success() {
        assert_eq!(BackupRunResult::from_reports(vec![]), BackupRunResult::Success);
    }

    #[test]
    fn one_failure_fails_the_pass_and_keeps_every_report() {
        let result = BackupRunResult::from_reports(vec![
            report("a", UploadOutcome::Success),
            report("b", UploadOutcome::ChecksumInvalid),
            report("c", UploadOutcome::Success),
        ]);

        let BackupRunResult::UploadFailed { details } = result else {
            panic!("expected a failed pass");
        };
        assert_eq!(details.len(), 3);
        assert_eq!(details[1].outcome, UploadOutcome::ChecksumInvalid);
    }
}
