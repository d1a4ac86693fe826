//! Shared helpers for loader integration tests
//!
//! Database tests run through `#[sqlx::test]`, which creates a scratch
//! database per test from `DATABASE_URL` and applies the workspace
//! migrations. They are ignored by default; run them with
//! `cargo test -- --ignored` against a disposable PostgreSQL server.

#![allow(dead_code)]

use osha_ingest::framework::{LoadMode, LoadOptions};
use osha_ingest::loaders::LoadContext;
use sqlx::PgPool;
use std::path::{Path, PathBuf};

pub const CREATED_BY: &str = "osha-load-tests";

pub fn fixtures() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests").join("fixtures")
}

pub fn fixture(relative: &str) -> PathBuf {
    fixtures().join(relative)
}

pub fn options(mode: LoadMode) -> LoadOptions {
    LoadOptions {
        mode,
        dry_run: false,
        force: false,
    }
}

pub fn context(pool: &PgPool, options: LoadOptions) -> LoadContext {
    LoadContext::new(pool.clone(), options, CREATED_BY, None)
}

pub async fn count(pool: &PgPool, sql: &str) -> i64 {
    let (n,): (i64,) = sqlx::query_as(sql)
        .fetch_one(pool)
        .await
        .expect("count query failed");
    n
}

/// Copy a fixture into `dir` after applying `edit` to its JSON
pub fn edited_copy(relative: &str, dir: &Path, edit: impl FnOnce(&mut serde_json::Value)) -> PathBuf {
    let text = std::fs::read_to_string(fixture(relative)).expect("fixture readable");
    let mut value: serde_json::Value = serde_json::from_str(&text).expect("fixture is JSON");
    edit(&mut value);
    let name = Path::new(relative).file_name().expect("fixture file name");
    let path = dir.join(name);
    std::fs::write(&path, serde_json::to_vec_pretty(&value).expect("serializable"))
        .expect("writable temp dir");
    path
}
