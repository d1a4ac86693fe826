//! osha-load - Main entry point

use chrono::Utc;
use clap::Parser;
use osha_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use osha_ingest::config::LoaderConfig;
use osha_ingest::loaders::{self, ita::ItaOptions, LoadContext, LoaderRun};
use osha_ingest::report::LoadReport;
use osha_ingest::{db, Cli, Commands, LoadArgs};
use std::process;
use tracing::{error, info};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Info })
        .output(LogOutput::Console)
        .log_file_prefix("osha-load")
        .build();

    // LOG_* variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);
    let guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Warning: logging unavailable: {e:#}");
            None
        },
    };

    let code = match execute_command(&cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Load failed");
            eprintln!("Error: {e:#}");
            1
        },
    };

    drop(guard);
    process::exit(code);
}

/// Execute the CLI command, returning the process exit code
async fn execute_command(cli: &Cli) -> anyhow::Result<i32> {
    let (name, args) = match &cli.command {
        Commands::Migrate => {
            let config = LoaderConfig::from_env()?;
            let pool = db::connect(&config.database).await?;
            let result = db::migrate(&pool).await;
            pool.close().await;
            result?;
            return Ok(0);
        },
        Commands::Regulation(args) => (loaders::regulation::LOAD_TYPE, args),
        Commands::CfrContent(args) => (loaders::cfr_content::LOAD_TYPE, args),
        Commands::Recordkeeping(args) => (loaders::recordkeeping::LOAD_TYPE, args),
        Commands::Cfr1904(args) => (loaders::cfr_1904::LOAD_TYPE, args),
        Commands::Companies(args) => (loaders::companies::LOAD_TYPE, args),
        Commands::Ita { load, .. } => (loaders::ita::LOAD_TYPE, load),
    };

    let config = LoaderConfig::from_env()?.with_max_failures(args.max_failures);
    let options = args.options();
    let started_at = Utc::now();
    info!(loader = name, mode = %options.mode, dry_run = options.dry_run, force = options.force, path = %args.path.display(), "Starting load");

    let pool = db::connect(&config.database).await?;
    let mut ctx = LoadContext::new(pool.clone(), options, &config.created_by, config.max_failures);
    let result = run_loader(&cli.command, &mut ctx, args).await;
    pool.close().await;
    let run = result?;

    let report = LoadReport::new(name, options, started_at, run);
    println!("{}", report.render());
    if let Some(path) = &args.report_file {
        report.write_to(path)?;
        info!(path = %path.display(), "Report written");
    }

    if report.exceeds(config.max_failures) {
        error!(
            failed = report.total_failed(),
            max_failures = ?config.max_failures,
            "Failure threshold exceeded"
        );
        return Ok(1);
    }
    Ok(0)
}

async fn run_loader(command: &Commands, ctx: &mut LoadContext, args: &LoadArgs) -> osha_ingest::Result<LoaderRun> {
    match command {
        Commands::Regulation(_) => loaders::regulation::run(ctx, &args.path).await,
        Commands::CfrContent(_) => loaders::cfr_content::run(ctx, &args.path).await,
        Commands::Recordkeeping(_) => loaders::recordkeeping::run(ctx, &args.path).await,
        Commands::Cfr1904(_) => loaders::cfr_1904::run(ctx, &args.path).await,
        Commands::Companies(_) => loaders::companies::run(ctx, &args.path).await,
        Commands::Ita { year, no_recursive, .. } => {
            let options = ItaOptions {
                year: *year,
                recursive: !no_recursive,
            };
            loaders::ita::run(ctx, &args.path, options).await
        },
        Commands::Migrate => Ok(LoaderRun::default()),
    }
}
