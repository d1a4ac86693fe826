//! OSHA ETL loaders
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Idempotent, versioned loading of OSHA regulatory and injury data into
//! PostgreSQL.
//!
//! # Overview
//!
//! - **Framework**: content hashing, load modes, per-document transactions
//!   and the `data_loads` audit trail ([`framework`])
//! - **Loaders**: construction regulations, CFR content items, the 29 CFR
//!   1904 recordkeeping rules (as JSONB or relational tables), ITA injury
//!   extracts and the companies workbook ([`loaders`])
//! - **Sources**: JSON, CSV and workbook readers ([`source`]) with value
//!   coercion ([`coerce`])
//! - **Reporting**: end-of-run summary ([`report`])
//!
//! Every document is hashed from a canonical JSON form. Re-loading unchanged
//! input is a no-op; changed input becomes a new current version (or an
//! in-place update), and failing documents roll back alone.

pub mod coerce;
pub mod config;
pub mod db;
pub mod error;
pub mod framework;
pub mod loaders;
pub mod report;
pub mod source;

pub use error::{IngestError, Result};

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::framework::{LoadMode, LoadOptions};

/// OSHA ETL - versioned loader for OSHA regulatory and injury data
#[derive(Parser, Debug)]
#[command(name = "osha-load")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load construction regulation JSON (one subpart per file)
    Regulation(LoadArgs),

    /// Load extracted CFR content items
    CfrContent(LoadArgs),

    /// Load the 29 CFR 1904 recordkeeping document as JSONB
    Recordkeeping(LoadArgs),

    /// Load the 29 CFR 1904 recordkeeping document into relational tables
    #[command(name = "cfr-1904")]
    Cfr1904(LoadArgs),

    /// Load the companies workbook (details and regulation mappings)
    Companies(LoadArgs),

    /// Load ITA 300A summary and case detail extracts
    Ita {
        #[command(flatten)]
        load: LoadArgs,

        /// Data year for every file (defaults to the year in the path)
        #[arg(long)]
        year: Option<i32>,

        /// Only read files directly inside PATH
        #[arg(long)]
        no_recursive: bool,
    },

    /// Apply pending schema migrations
    Migrate,
}

/// Options shared by every loader
#[derive(Args, Debug, Clone)]
pub struct LoadArgs {
    /// Input file or directory
    pub path: PathBuf,

    /// How existing records are treated
    #[arg(long, value_enum, default_value_t = LoadMode::Incremental)]
    pub mode: LoadMode,

    /// Run every statement but roll back instead of committing
    #[arg(long)]
    pub dry_run: bool,

    /// Treat unchanged records as changed
    #[arg(long)]
    pub force_update: bool,

    /// Exit non-zero when more records than this fail (overrides LOAD_MAX_FAILURES)
    #[arg(long)]
    pub max_failures: Option<u64>,

    /// Also write the summary report to this file
    #[arg(long)]
    pub report_file: Option<PathBuf>,
}

impl LoadArgs {
    pub fn options(&self) -> LoadOptions {
        LoadOptions {
            mode: self.mode,
            dry_run: self.dry_run,
            force: self.force_update,
        }
    }
}
