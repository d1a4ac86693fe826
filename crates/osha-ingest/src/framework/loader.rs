//! Loader driver
//!
//! Documents are processed strictly one after another. A failing document
//! rolls back its own transaction and is counted; only fatal errors
//! (structural, connectivity) stop the run.

use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use super::mode::{decide_action, Action, LoadMode};
use super::store::{Document, VersionStore};
use crate::error::{IngestError, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    pub mode: LoadMode,
    /// Run every statement, then roll back instead of committing
    pub dry_run: bool,
    /// Treat unchanged documents as changed
    pub force: bool,
}

impl LoadOptions {
    /// Whether anything outside a document transaction may be written
    pub fn persists(&self) -> bool {
        self.mode.writes() && !self.dry_run
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordFailure {
    pub key: String,
    pub message: String,
}

/// Counts for one versioned table
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadStats {
    pub table: String,
    pub documents: u64,
    pub inserted: u64,
    pub versioned: u64,
    pub updated: u64,
    pub skipped: u64,
    pub failed: u64,
    pub rows_affected: u64,
    pub failures: Vec<RecordFailure>,
}

impl LoadStats {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Default::default()
        }
    }

    /// Documents that produced a new row
    pub fn loaded(&self) -> u64 {
        self.inserted + self.versioned
    }

    pub fn absorb(&mut self, other: &LoadStats) {
        self.documents += other.documents;
        self.inserted += other.inserted;
        self.versioned += other.versioned;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.rows_affected += other.rows_affected;
        self.failures.extend(other.failures.iter().cloned());
    }

    /// Sum of several tables' counts
    pub fn total<'a>(label: &str, stats: impl IntoIterator<Item = &'a LoadStats>) -> LoadStats {
        let mut total = LoadStats::new(label);
        for s in stats {
            total.absorb(s);
        }
        total
    }

    fn count(&mut self, action: Action) {
        match action {
            Action::Skip { .. } => self.skipped += 1,
            Action::InsertNewVersion { supersedes: None } => self.inserted += 1,
            Action::InsertNewVersion { supersedes: Some(_) } => self.versioned += 1,
            Action::UpdateInPlace { .. } => self.updated += 1,
        }
    }

    fn fail(&mut self, key: &str, message: String) {
        self.failed += 1;
        self.failures.push(RecordFailure {
            key: key.to_string(),
            message,
        });
    }
}

/// Drives documents through decide/apply for one versioned table
pub struct VersionedLoader<S: VersionStore> {
    store: S,
    options: LoadOptions,
    truncated: bool,
    seen_keys: HashSet<String>,
    run_stats: LoadStats,
    file_stats: LoadStats,
}

impl<S: VersionStore> VersionedLoader<S> {
    pub fn new(store: S, options: LoadOptions) -> Self {
        let table = store.table();
        Self {
            store,
            options,
            truncated: false,
            seen_keys: HashSet::new(),
            run_stats: LoadStats::new(table),
            file_stats: LoadStats::new(table),
        }
    }

    pub fn options(&self) -> LoadOptions {
        self.options
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Counts accumulated over the whole run
    pub fn stats(&self) -> &LoadStats {
        &self.run_stats
    }

    /// Counts since the previous call, for per-file audit rows
    pub fn finish_file(&mut self) -> LoadStats {
        let table = self.store.table();
        std::mem::replace(&mut self.file_stats, LoadStats::new(table))
    }

    pub fn into_stats(self) -> LoadStats {
        self.run_stats
    }

    /// Truncate once per run when the mode asks for it
    ///
    /// Drivers call this before the first file so that a run whose rows are
    /// all rejected still clears the table; later calls do nothing.
    pub async fn prepare(&mut self) -> Result<()> {
        if self.options.mode != LoadMode::TruncateLoad || self.truncated {
            return Ok(());
        }
        if self.options.dry_run {
            info!(table = self.store.table(), "Dry run: truncate skipped");
        } else {
            self.store.truncate().await?;
        }
        self.truncated = true;
        Ok(())
    }

    /// Version one document
    ///
    /// Returns the action taken, `None` when the document failed and was
    /// counted, or an error when the failure is fatal.
    pub async fn load_document(&mut self, doc: Document<S::Record>) -> Result<Option<Action>> {
        self.prepare().await?;
        self.run_stats.documents += 1;
        self.file_stats.documents += 1;

        if !self.seen_keys.insert(doc.logical_key.clone()) {
            let err = IngestError::record(&doc.logical_key, "duplicate logical key in this load");
            return self.record_failure(&doc.logical_key, err).map(|_| None);
        }

        match self.process(&doc).await {
            Ok(action) => {
                self.run_stats.count(action);
                self.file_stats.count(action);
                Ok(Some(action))
            },
            Err(err) => self.record_failure(&doc.logical_key, err).map(|_| None),
        }
    }

    /// Count a per-record failure, or hand back a fatal one
    ///
    /// Also used for rows that fail to map before they become documents.
    pub fn record_failure(&mut self, key: &str, err: IngestError) -> Result<()> {
        if err.is_fatal() {
            return Err(err);
        }
        warn!(table = self.store.table(), key, error = %err, "Record failed, skipping");
        let message = err.to_string();
        self.run_stats.fail(key, message.clone());
        self.file_stats.fail(key, message);
        Ok(())
    }

    /// Count a row that never became a document (e.g. unmappable spreadsheet row)
    pub fn reject(&mut self, key: &str, err: IngestError) -> Result<()> {
        self.run_stats.documents += 1;
        self.file_stats.documents += 1;
        self.record_failure(key, err)
    }

    async fn process(&mut self, doc: &Document<S::Record>) -> Result<Action> {
        let existing = self.store.resolve_existing(&doc.logical_key).await?;
        let action = decide_action(
            self.options.mode,
            existing.as_ref(),
            &doc.content_hash,
            self.options.force,
        );

        if !self.options.mode.writes() {
            debug!(key = %doc.logical_key, action = action.label(), "Validate only: would apply");
            return Ok(action);
        }

        if let Action::Skip { .. } = action {
            debug!(key = %doc.logical_key, "Unchanged, skipping");
            return Ok(action);
        }

        let outcome = self.store.apply(action, doc, !self.options.dry_run).await?;
        self.run_stats.rows_affected += outcome.rows_affected;
        self.file_stats.rows_affected += outcome.rows_affected;
        debug!(
            key = %doc.logical_key,
            action = action.label(),
            record_id = outcome.record_id,
            rows = outcome.rows_affected,
            "Document applied"
        );
        Ok(action)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::framework::mode::ExistingVersion;
    use crate::framework::store::ApplyOutcome;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    struct Row {
        id: i64,
        key: String,
        hash: String,
        is_current: bool,
        body: String,
    }

    /// In-memory versioned table with the same semantics as the Postgres store
    #[derive(Default)]
    struct MemoryStore {
        rows: Mutex<Vec<Row>>,
        next_id: Mutex<i64>,
        truncations: Mutex<u32>,
    }

    impl MemoryStore {
        fn rows(&self) -> Vec<Row> {
            self.rows.lock().unwrap().clone()
        }

        fn current(&self, key: &str) -> Vec<Row> {
            self.rows()
                .into_iter()
                .filter(|r| r.key == key && r.is_current)
                .collect()
        }
    }

    #[async_trait]
    impl VersionStore for MemoryStore {
        type Record = String;

        fn table(&self) -> &'static str {
            "memory_rows"
        }

        async fn truncate(&self) -> Result<()> {
            self.rows.lock().unwrap().clear();
            *self.truncations.lock().unwrap() += 1;
            Ok(())
        }

        async fn resolve_existing(&self, key: &str) -> Result<Option<ExistingVersion>> {
            let rows = self.rows.lock().unwrap();
            let mut matching: Vec<&Row> = rows.iter().filter(|r| r.key == key).collect();
            matching.sort_by_key(|r| (r.is_current, r.id));
            Ok(matching.last().map(|r| ExistingVersion {
                id: r.id,
                content_hash: r.hash.clone(),
                is_current: r.is_current,
            }))
        }

        async fn apply(
            &self,
            action: Action,
            doc: &Document<String>,
            commit: bool,
        ) -> Result<ApplyOutcome> {
            if doc.record == "connection lost" {
                return Err(IngestError::Connectivity("server closed the connection".into()));
            }
            if doc.record.starts_with("bad") {
                return Err(IngestError::record(&doc.logical_key, "value out of range"));
            }

            let mut staged = self.rows.lock().unwrap().clone();
            let record_id = match action {
                Action::Skip { id } => id,
                Action::InsertNewVersion { .. } => {
                    for row in staged.iter_mut().filter(|r| r.key == doc.logical_key) {
                        row.is_current = false;
                    }
                    let mut next = self.next_id.lock().unwrap();
                    *next += 1;
                    staged.push(Row {
                        id: *next,
                        key: doc.logical_key.clone(),
                        hash: doc.content_hash.clone(),
                        is_current: true,
                        body: doc.record.clone(),
                    });
                    *next
                },
                Action::UpdateInPlace { id } => {
                    for row in staged.iter_mut().filter(|r| r.key == doc.logical_key) {
                        row.is_current = row.id == id;
                        if row.id == id {
                            row.hash = doc.content_hash.clone();
                            row.body = doc.record.clone();
                        }
                    }
                    id
                },
            };
            if commit {
                *self.rows.lock().unwrap() = staged;
            }
            Ok(ApplyOutcome {
                record_id,
                rows_affected: 1,
            })
        }
    }

    fn doc(key: &str, body: &str) -> Document<String> {
        let raw: Value = json!({ "key": key, "body": body });
        Document::new(key, &raw, body.to_string())
    }

    fn options(mode: LoadMode) -> LoadOptions {
        LoadOptions {
            mode,
            ..Default::default()
        }
    }

    async fn load_all(loader: &mut VersionedLoader<MemoryStore>, docs: &[(&str, &str)]) {
        loader.seen_keys.clear();
        for (key, body) in docs {
            loader.load_document(doc(key, body)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_incremental_is_idempotent() {
        let mut loader = VersionedLoader::new(MemoryStore::default(), options(LoadMode::Incremental));
        let input = [("a", "one"), ("b", "two")];

        load_all(&mut loader, &input).await;
        let after_first = loader.store().rows().len();
        load_all(&mut loader, &input).await;

        assert_eq!(loader.store().rows().len(), after_first);
        assert_eq!(loader.stats().inserted, 2);
        assert_eq!(loader.stats().skipped, 2);
    }

    #[tokio::test]
    async fn test_changed_document_gets_new_version() {
        let mut loader = VersionedLoader::new(MemoryStore::default(), options(LoadMode::Incremental));
        load_all(&mut loader, &[("a", "one")]).await;
        load_all(&mut loader, &[("a", "one, amended")]).await;

        let rows = loader.store().rows();
        assert_eq!(rows.len(), 2);
        let current = loader.store().current("a");
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].body, "one, amended");
        assert_eq!(loader.stats().versioned, 1);
    }

    #[tokio::test]
    async fn test_update_existing_keeps_identity() {
        let store = MemoryStore::default();
        let mut loader = VersionedLoader::new(store, options(LoadMode::Incremental));
        load_all(&mut loader, &[("a", "one")]).await;
        let original_id = loader.store().current("a")[0].id;

        loader.options.mode = LoadMode::UpdateExisting;
        load_all(&mut loader, &[("a", "one, corrected")]).await;

        let current = loader.store().current("a");
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].id, original_id);
        assert_eq!(current[0].body, "one, corrected");
        assert_eq!(loader.store().rows().len(), 1);
    }

    #[tokio::test]
    async fn test_truncate_load_twice_same_count() {
        let mut loader = VersionedLoader::new(MemoryStore::default(), options(LoadMode::TruncateLoad));
        load_all(&mut loader, &[("a", "one"), ("b", "two"), ("c", "three")]).await;
        let first = loader.store().rows().len();

        let store = loader.into_store_for_test();
        let mut loader = VersionedLoader::new(store, options(LoadMode::TruncateLoad));
        load_all(&mut loader, &[("a", "one"), ("b", "two"), ("c", "three")]).await;

        assert_eq!(loader.store().rows().len(), first);
        assert_eq!(*loader.store().truncations.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_truncate_load_clears_table_when_every_row_is_rejected() {
        let mut loader = VersionedLoader::new(MemoryStore::default(), options(LoadMode::Incremental));
        load_all(&mut loader, &[("stale", "old row")]).await;
        let store = loader.into_store_for_test();
        assert_eq!(store.rows().len(), 1);

        let mut loader = VersionedLoader::new(store, options(LoadMode::TruncateLoad));
        loader.prepare().await.unwrap();
        loader
            .reject("row-1", IngestError::record("row-1", "no establishment identity"))
            .unwrap();
        loader.prepare().await.unwrap();

        assert!(loader.store().rows().is_empty());
        assert_eq!(*loader.store().truncations.lock().unwrap(), 1);
        assert_eq!(loader.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_failed_record_does_not_stop_batch() {
        let mut loader = VersionedLoader::new(MemoryStore::default(), options(LoadMode::Incremental));
        load_all(&mut loader, &[("a", "one"), ("b", "bad value"), ("c", "three")]).await;

        assert_eq!(loader.stats().inserted, 2);
        assert_eq!(loader.stats().failed, 1);
        assert_eq!(loader.stats().failures[0].key, "b");
        assert!(loader.store().current("b").is_empty());
    }

    #[tokio::test]
    async fn test_connectivity_failure_aborts() {
        let mut loader = VersionedLoader::new(MemoryStore::default(), options(LoadMode::Incremental));
        let result = loader.load_document(doc("a", "connection lost")).await;
        assert!(matches!(result, Err(IngestError::Connectivity(_))));
    }

    #[tokio::test]
    async fn test_validate_only_never_writes() {
        let mut loader = VersionedLoader::new(MemoryStore::default(), options(LoadMode::ValidateOnly));
        load_all(&mut loader, &[("a", "one"), ("b", "two")]).await;

        assert!(loader.store().rows().is_empty());
        assert_eq!(loader.stats().inserted, 2);
    }

    #[tokio::test]
    async fn test_dry_run_rolls_back() {
        let mut loader = VersionedLoader::new(
            MemoryStore::default(),
            LoadOptions {
                mode: LoadMode::TruncateLoad,
                dry_run: true,
                force: false,
            },
        );
        load_all(&mut loader, &[("a", "one")]).await;

        assert!(loader.store().rows().is_empty());
        assert_eq!(*loader.store().truncations.lock().unwrap(), 0);
        assert_eq!(loader.stats().inserted, 1);
    }

    #[tokio::test]
    async fn test_duplicate_key_in_one_load_is_rejected() {
        let mut loader = VersionedLoader::new(MemoryStore::default(), options(LoadMode::Incremental));
        load_all(&mut loader, &[("a", "one"), ("a", "other")]).await;

        assert_eq!(loader.stats().inserted, 1);
        assert_eq!(loader.stats().failed, 1);
        assert_eq!(loader.store().current("a")[0].body, "one");
    }

    #[tokio::test]
    async fn test_truncate_incremental_update_scenario() {
        let v1 = [("a", "one"), ("b", "two")];
        let v2 = [("a", "one"), ("b", "two, revised")];

        let mut loader = VersionedLoader::new(MemoryStore::default(), options(LoadMode::TruncateLoad));
        load_all(&mut loader, &v1).await;
        let store = loader.into_store_for_test();

        let mut loader = VersionedLoader::new(store, options(LoadMode::Incremental));
        load_all(&mut loader, &v1).await;
        assert_eq!(loader.stats().skipped, 2);
        let store = loader.into_store_for_test();

        let mut loader = VersionedLoader::new(store, options(LoadMode::UpdateExisting));
        load_all(&mut loader, &v2).await;
        assert_eq!(loader.stats().skipped, 1);
        assert_eq!(loader.stats().updated, 1);
        assert_eq!(loader.store().rows().len(), 2);
        assert_eq!(loader.store().current("b")[0].body, "two, revised");
    }

    #[test]
    fn test_finish_file_resets_file_counts() {
        let mut loader = VersionedLoader::new(MemoryStore::default(), options(LoadMode::Incremental));
        loader
            .reject("row 4", IngestError::record("row 4", "no establishment identity"))
            .unwrap();

        let file = loader.finish_file();
        assert_eq!(file.failed, 1);
        assert_eq!(file.table, "memory_rows");
        assert_eq!(loader.finish_file().failed, 0);
        assert_eq!(loader.stats().failed, 1);
    }

    impl VersionedLoader<MemoryStore> {
        fn into_store_for_test(self) -> MemoryStore {
            self.store
        }
    }
}
