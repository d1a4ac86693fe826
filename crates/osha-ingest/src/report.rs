//! End-of-run summary report

use chrono::{DateTime, Utc};
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Table};
use std::fmt::Write as _;
use std::path::Path;

use crate::error::Result;
use crate::framework::{LoadOptions, LoadStats, LoadStatus};
use crate::loaders::{FileOutcome, LoaderRun};

/// Failures listed individually before the rest are summarized
pub const MAX_LISTED_FAILURES: usize = 20;

#[derive(Debug, Clone)]
pub struct LoadReport {
    pub loader: String,
    pub options: LoadOptions,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub files: Vec<FileOutcome>,
    pub tables: Vec<LoadStats>,
    pub notes: Vec<String>,
}

impl LoadReport {
    pub fn new(loader: impl Into<String>, options: LoadOptions, started_at: DateTime<Utc>, run: LoaderRun) -> Self {
        Self {
            loader: loader.into(),
            options,
            started_at,
            finished_at: Utc::now(),
            files: run.files,
            tables: run.tables,
            notes: run.notes,
        }
    }

    pub fn total(&self) -> LoadStats {
        LoadStats::total("Total", &self.tables)
    }

    pub fn total_failed(&self) -> u64 {
        self.tables.iter().map(|t| t.failed).sum()
    }

    /// Whether the run failed more records than `max_failures` allows
    pub fn exceeds(&self, max_failures: Option<u64>) -> bool {
        max_failures.is_some_and(|max| self.total_failed() > max)
    }

    fn stats_table(&self) -> Table {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_header(vec![
                "Table",
                "Inserted",
                "New versions",
                "Updated",
                "Skipped",
                "Failed",
                "Rows written",
            ]);

        let row = |s: &LoadStats| {
            vec![
                s.table.clone(),
                s.inserted.to_string(),
                s.versioned.to_string(),
                s.updated.to_string(),
                s.skipped.to_string(),
                s.failed.to_string(),
                s.rows_affected.to_string(),
            ]
        };
        for stats in &self.tables {
            table.add_row(row(stats));
        }
        if self.tables.len() > 1 {
            table.add_row(row(&self.total()));
        }
        table
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let elapsed = self.finished_at - self.started_at;

        let _ = writeln!(out, "{} load ({} mode)", self.loader, self.options.mode);
        if self.options.dry_run {
            let _ = writeln!(out, "DRY RUN: all changes were rolled back");
        }
        if self.options.force {
            let _ = writeln!(out, "Forced update of unchanged records");
        }
        let _ = writeln!(
            out,
            "Started {}, took {:.1}s",
            self.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
            elapsed.num_milliseconds() as f64 / 1000.0
        );
        let _ = writeln!(out);
        let _ = writeln!(out, "{}", self.stats_table());

        if !self.files.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "Files:");
            for file in &self.files {
                let name = file
                    .source
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| file.source.display().to_string());
                let load_id = file
                    .load_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "not recorded".to_string());
                let _ = writeln!(
                    out,
                    "  {name}: {} (load {load_id}, {} loaded, {} skipped, {} failed)",
                    file.status,
                    file.stats.loaded(),
                    file.stats.skipped,
                    file.stats.failed
                );
                if let Some(previous) = &file.previous {
                    let when = previous
                        .completed_at
                        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "unknown time".to_string());
                    let _ = writeln!(out, "    identical file already loaded as {} ({when})", previous.load_id);
                }
            }
        }

        let failures: Vec<_> = self.tables.iter().flat_map(|t| &t.failures).collect();
        if !failures.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "Failed records ({}):", failures.len());
            for failure in failures.iter().take(MAX_LISTED_FAILURES) {
                let _ = writeln!(out, "  {}: {}", failure.key, failure.message);
            }
            if failures.len() > MAX_LISTED_FAILURES {
                let _ = writeln!(out, "  ... and {} more", failures.len() - MAX_LISTED_FAILURES);
            }
        }

        if !self.notes.is_empty() {
            let _ = writeln!(out);
            for note in &self.notes {
                let _ = writeln!(out, "Note: {note}");
            }
        }

        let failed_files = self
            .files
            .iter()
            .filter(|f| f.status == LoadStatus::Failed)
            .count();
        if failed_files > 0 {
            let _ = writeln!(out);
            let _ = writeln!(out, "{failed_files} file(s) marked failed");
        }
        out
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.render())?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::framework::{LoadMode, RecordFailure};
    use std::path::PathBuf;
    use uuid::Uuid;

    fn stats(table: &str, inserted: u64, failed: u64) -> LoadStats {
        LoadStats {
            table: table.to_string(),
            documents: inserted + failed,
            inserted,
            failed,
            rows_affected: inserted,
            failures: (0..failed)
                .map(|i| RecordFailure {
                    key: format!("{table}-{i}"),
                    message: "bad row".to_string(),
                })
                .collect(),
            ..Default::default()
        }
    }

    fn report(tables: Vec<LoadStats>, dry_run: bool) -> LoadReport {
        let options = LoadOptions {
            mode: LoadMode::Incremental,
            dry_run,
            force: false,
        };
        let file = FileOutcome {
            source: PathBuf::from("/data/summary_2023.csv"),
            load_id: (!dry_run).then(Uuid::new_v4),
            status: LoadStatus::Completed,
            previous: None,
            stats: LoadStats::total("ita", &tables),
        };
        let run = LoaderRun {
            tables,
            files: vec![file],
            notes: vec!["establishments on record: 4".to_string()],
        };
        LoadReport::new("ita", options, Utc::now(), run)
    }

    #[test]
    fn test_render_lists_tables_and_totals() {
        let report = report(vec![stats("summary_300a_data", 3, 1), stats("case_detail_data", 5, 0)], false);
        let text = report.render();
        assert!(text.contains("ita load (incremental mode)"));
        assert!(text.contains("summary_300a_data"));
        assert!(text.contains("case_detail_data"));
        assert!(text.contains("Total"));
        assert!(text.contains("summary_300a_data-0: bad row"));
        assert!(text.contains("Note: establishments on record: 4"));
        assert!(!text.contains("DRY RUN"));
    }

    #[test]
    fn test_dry_run_is_flagged() {
        let text = report(vec![stats("regulations", 2, 0)], true).render();
        assert!(text.contains("DRY RUN"));
        assert!(text.contains("not recorded"));
        assert!(!text.contains("Total"));
    }

    #[test]
    fn test_failure_listing_is_capped() {
        let text = report(vec![stats("cfr_content", 0, 25)], false).render();
        assert!(text.contains("Failed records (25)"));
        assert!(text.contains("... and 5 more"));
    }

    #[test]
    fn test_threshold() {
        let report = report(vec![stats("regulations", 1, 3)], false);
        assert_eq!(report.total_failed(), 3);
        assert!(report.exceeds(Some(2)));
        assert!(!report.exceeds(Some(3)));
        assert!(!report.exceeds(None));
    }

    #[test]
    fn test_write_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.txt");
        report(vec![stats("regulations", 1, 0)], false).write_to(&path).unwrap();
        assert!(std::fs::read_to_string(path).unwrap().contains("regulations"));
    }
}
