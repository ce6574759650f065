use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tokio::fs;
use uuid::Uuid;

use crate::history::ArchiveSummary;
use crate::matcher::MatchSummary;
use crate::reconcile::ReconcileSummary;
use crate::rules::RulesOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct DayReport {
    pub date: NaiveDate,
    pub url: String,
    pub dropped_entries: usize,
    pub rules: RulesOutcome,
    pub reconcile: ReconcileSummary,
    pub archived_document: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub days: Vec<DayReport>,
    pub matching: Option<MatchSummary>,
    pub archive: Option<ArchiveSummary>,
    pub error: Option<String>,
}

impl RunReport {
    pub fn started(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: None,
            status: RunStatus::Completed,
            days: Vec::new(),
            matching: None,
            archive: None,
            error: None,
        }
    }

    pub fn finish(&mut self, finished_at: DateTime<Utc>, error: Option<&anyhow::Error>) {
        self.finished_at = Some(finished_at);
        if let Some(err) = error {
            self.status = RunStatus::Failed;
            self.error = Some(format!("{err:#}"));
        }
    }

    pub fn daily_brief(&self) -> String {
        let status = match self.status {
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        let mut brief = format!(
            "# filmtv daily brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Status: {}\n",
            self.run_id,
            self.started_at,
            self.finished_at
                .map(|t| t.to_string())
                .unwrap_or_else(|| "-".to_string()),
            status,
        );
        if let Some(err) = &self.error {
            let _ = writeln!(brief, "- Error: {err}");
        }

        brief.push_str("\n## Guide\n");
        if self.days.is_empty() {
            brief.push_str("- no days synced\n");
        }
        for day in &self.days {
            let r = &day.reconcile;
            let _ = writeln!(
                brief,
                "- {}: {} inserted, {} updated, {} removed, {} ignored, {} dropped",
                day.date, r.inserted, r.updated, r.removed, day.rules.ignored, day.dropped_entries
            );
        }

        if let Some(m) = &self.matching {
            let _ = write!(
                brief,
                "\n## Matching\n- Refreshed: {}\n- Matched per stage: {:?}\n- Unmatched: {}\n- Certifications checked: {}\n",
                m.refreshed, m.matched_by_stage, m.unmatched, m.certifications_checked
            );
        }
        if let Some(a) = &self.archive {
            let _ = write!(
                brief,
                "\n## History\n- Channels: {}\n- Pruned: {}\n- Archived: {}\n",
                a.channels, a.pruned, a.archived
            );
        }
        brief
    }

    /// Writes `run_summary.json` and `daily_brief.md` under `<reports_dir>/<run_id>`.
    pub async fn write(&self, reports_dir: &Path) -> Result<PathBuf> {
        let run_dir = reports_dir.join(self.run_id.to_string());
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating {}", run_dir.display()))?;

        let summary = serde_json::to_vec_pretty(self).context("serializing run summary")?;
        fs::write(run_dir.join("run_summary.json"), summary)
            .await
            .context("writing run_summary.json")?;
        fs::write(run_dir.join("daily_brief.md"), self.daily_brief())
            .await
            .context("writing daily_brief.md")?;

        Ok(run_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn day() -> DayReport {
        let date = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();
        DayReport {
            date,
            url: "http://guide.example/2026-10-16/full".into(),
            dropped_entries: 1,
            rules: RulesOutcome { ignored: 2, transformed: 0 },
            reconcile: ReconcileSummary {
                date,
                trimmed: 0,
                channels: 2,
                removed: 1,
                updated: 3,
                inserted: 4,
            },
            archived_document: None,
        }
    }

    #[tokio::test]
    async fn writes_summary_and_brief() {
        let dir = tempdir().unwrap();
        let mut report = RunReport::started(Uuid::new_v4(), Utc::now());
        report.days.push(day());
        report.matching = Some(MatchSummary {
            refreshed: 1,
            matched_by_stage: [2, 0, 1, 0],
            unmatched: 5,
            certifications_checked: 3,
        });
        report.finish(Utc::now(), None);

        let run_dir = report.write(dir.path()).await.unwrap();

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(run_dir.join("run_summary.json")).unwrap()).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["days"][0]["reconcile"]["inserted"], 4);
        assert_eq!(json["matching"]["matched_by_stage"], serde_json::json!([2, 0, 1, 0]));
        let brief = std::fs::read_to_string(run_dir.join("daily_brief.md")).unwrap();
        assert!(brief.contains("2026-10-16: 4 inserted, 3 updated, 1 removed, 2 ignored, 1 dropped"));
        assert!(brief.contains("- Unmatched: 5"));
    }

    #[test]
    fn failure_records_error_chain() {
        let mut report = RunReport::started(Uuid::new_v4(), Utc::now());
        let err = anyhow::anyhow!("http status 500").context("syncing guide for 2026-10-17");
        report.finish(Utc::now(), Some(&err));

        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(
            report.error.as_deref(),
            Some("syncing guide for 2026-10-17: http status 500")
        );
        assert!(report.daily_brief().contains("- Status: failed"));
    }
}
