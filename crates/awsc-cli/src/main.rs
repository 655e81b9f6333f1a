//! 🚀 awsc-cli — the front door, the bouncer, the maitre d' of awsc.
//!
//! 🎬 *[narrator voice]* "It all started with a simple main() function..."
//! 📦 Thin wrapper: parse args, set up logging, load config, hand off to the
//! `Connector`, and print what happened. Like a manager. 🦆

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use awsc::progress::render_summary;
use awsc::{AppConfig, Connector, OperationReport, Payload, TableRef, TransferResult, WarehouseUpload};
use clap::{Parser, Subcommand};
use comfy_table::{Table, presets::UTF8_FULL_CONDENSED};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_FILE: &str = "awsc.toml";

/// 🪣 Move CSVs into S3 and Redshift without babysitting SSO tokens.
#[derive(Debug, Parser)]
#[command(name = "awsc", version, about)]
struct Cli {
    /// TOML config file. Defaults to ./awsc.toml when it exists; env vars apply either way.
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Print a JSON report instead of tables.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Upload a file to the configured bucket and directory.
    Upload {
        path: PathBuf,
        /// Object name under the directory. Defaults to the file name.
        #[arg(long)]
        name: Option<String>,
    },
    /// COPY an object that's already in the bucket into a table.
    Load {
        /// Object name, relative to the configured directory.
        object: String,
        /// `[database.]schema.table`
        #[arg(long)]
        table: String,
        #[arg(long)]
        create_sql: Option<String>,
        /// Empty the table inside the same transaction before COPY.
        #[arg(long)]
        truncate: bool,
    },
    /// Upload a file, then COPY it into a table.
    Push {
        path: PathBuf,
        #[arg(long)]
        table: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        create_sql: Option<String>,
        #[arg(long)]
        truncate: bool,
    },
    /// Make sure there's a valid SSO session and show it.
    Sso {
        /// Drop the cached session first, forcing a refresh.
        #[arg(long)]
        force: bool,
    },
}

/// 🚀 main() — where it all begins. The genesis. The big bang.
/// The "I pressed F5 and held my breath" moment.
#[tokio::main]
async fn main() -> ExitCode {
    // 📡 RUST_LOG wins; otherwise info, because silence at 3am is not golden
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let the_cli = Cli::parse();
    match run(the_cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("💀 error: {err}");
            // -- 🧅 peel the onion of sadness, one tear-jerking layer at a time
            for cause in err.chain().skip(1) {
                error!("⚠️  cause: {cause}");
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let the_config = load(cli.config.as_deref())?;
    let the_connector = Connector::from_config(&the_config)
        .await
        .context("💀 couldn't build the connector. Check the config, then check it again.")?;

    match cli.command {
        Command::Upload { path, name } => {
            let the_result = match name {
                Some(name) => {
                    let the_job = the_connector.job(Payload::File(path), &name)?;
                    the_connector.upload(&the_job).await
                }
                None => the_connector.upload_file(&path).await?,
            };
            print_transfer(&the_result, cli.json)?;
            ensure_success(&OperationReport::from(&the_result))
        }
        Command::Load {
            object,
            table,
            create_sql,
            truncate,
        } => {
            let the_table = table_ref(&table, &the_config)?;
            let the_truncate = truncate.then(|| truncate_statement(&the_table));
            let the_result = the_connector
                .load_from_storage(&object, &the_table, create_sql.as_deref(), the_truncate.as_deref())
                .await;
            let the_report = OperationReport::from(&the_result);
            print_report(&the_report, cli.json)?;
            ensure_success(&the_report)
        }
        Command::Push {
            path,
            table,
            name,
            create_sql,
            truncate,
        } => {
            let the_table = table_ref(&table, &the_config)?;
            let mut the_item = WarehouseUpload::new(Payload::File(path), the_table.clone());
            the_item.object_name = name;
            the_item.create_table_statement = create_sql;
            if truncate {
                the_item.truncate_statement = Some(truncate_statement(&the_table));
            }
            let the_result = the_connector.push(the_item).await;
            if let Ok(outcome) = &the_result
                && !cli.json
            {
                println!("{}", render_summary(&outcome.transfer));
            }
            let the_report = OperationReport::from(&the_result);
            print_report(&the_report, cli.json)?;
            ensure_success(&the_report)
        }
        Command::Sso { force } => {
            if force {
                the_connector.refresher().invalidate();
            }
            let the_session = the_connector.ensure_session().await?;
            let the_last_refresh = the_connector.refresher().last_refresh().await;
            if cli.json {
                println!(
                    "{}",
                    serde_json::json!({
                        "principal": the_session.principal(),
                        "issued_at": the_session.issued_at(),
                        "expires_at": the_session.expires_at(),
                        "last_refresh": the_last_refresh,
                    })
                );
            } else {
                let mut the_table = Table::new();
                the_table.load_preset(UTF8_FULL_CONDENSED);
                the_table.add_row(vec!["principal".to_string(), the_session.principal().to_string()]);
                the_table.add_row(vec!["issued at".to_string(), the_session.issued_at().to_rfc3339()]);
                the_table.add_row(vec!["expires at".to_string(), the_session.expires_at().to_rfc3339()]);
                the_table.add_row(vec![
                    "last refresh".to_string(),
                    the_last_refresh.map(|at| at.to_rfc3339()).unwrap_or_else(|| "never".to_string()),
                ]);
                println!("{the_table}");
            }
            Ok(())
        }
    }
}

/// 🔧 Explicit path must exist; the default file is optional.
fn load(explicit: Option<&Path>) -> Result<AppConfig> {
    let the_file = match explicit {
        Some(path) => {
            let the_exists = path.try_exists().with_context(|| {
                format!(
                    "💀 couldn't check whether '{}' exists. If it's a relative path, try an absolute one.",
                    path.display()
                )
            })?;
            if !the_exists {
                bail!("💀 config file '{}' does not exist", path.display());
            }
            Some(path.to_path_buf())
        }
        None => Some(PathBuf::from(DEFAULT_CONFIG_FILE)).filter(|path| path.exists()),
    };
    let the_config = awsc::load_config(the_file.as_deref())
        .context("💀 couldn't load the configuration. Make sure you didn't forget something obvious.")?;
    the_config.validate().context("💀 the configuration loaded but doesn't hold up")?;
    info!("✅ configuration loaded");
    Ok(the_config)
}

fn table_ref(raw: &str, config: &AppConfig) -> Result<TableRef> {
    let the_database = config.warehouse.as_ref().map(|w| w.database.as_str());
    Ok(TableRef::parse(raw)?.in_database(the_database))
}

fn truncate_statement(table: &TableRef) -> String {
    format!("TRUNCATE TABLE {table}")
}

fn print_transfer(result: &TransferResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
    } else {
        println!("{}", render_summary(result));
    }
    Ok(())
}

fn print_report(report: &OperationReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else if report.success {
        println!("✅ {}", report.message);
    } else {
        println!("💀 {}", report.message);
    }
    Ok(())
}

fn ensure_success(report: &OperationReport) -> Result<()> {
    if !report.success {
        bail!("{}", report.message);
    }
    Ok(())
}
