use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use studio_sync::compat::NotionPropertyType;
use studio_sync::config::{self, Config, ConflictPolicy};
use studio_sync::db;
use studio_sync::mapping::{
    self, check_against_schema, effective_mappings, MappingStore, SqliteMappingStore,
};
use studio_sync::notion::{NotionClient, NotionSource};
use studio_sync::store::{resolve_related, ContentStore, FileContentStore};
use studio_sync::sync::{SyncOptions, SyncOrchestrator};
use studio_sync::transform::transform;

#[derive(Debug, Parser)]
#[command(author, version, about = "Sync case studies from a Notion database")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one import and print the report
    Import {
        /// Override notion.database_id
        #[arg(long)]
        database_id: Option<String>,
        /// Report differing records without overwriting them
        #[arg(long)]
        manual: bool,
    },
    /// Inspect or replace the field mappings
    Mappings {
        #[command(subcommand)]
        action: MappingsAction,
    },
    /// List stored case studies
    List,
    /// Show the version history of a case study
    Versions { slug: String },
    /// Make a previous version current
    Restore { slug: String, version: u32 },
    /// Show recent sync runs
    Runs {
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
    /// Print the stored report of one sync run
    Report { run_id: String },
    /// Fetch one page and show the case study it would produce
    Preview { page_id: String },
}

#[derive(Debug, Subcommand)]
enum MappingsAction {
    /// Print the stored mapping set
    Show,
    /// Print stored mappings merged with defaults for the live schema
    Effective,
    /// Replace the mapping set from a JSON file
    Set {
        file: PathBuf,
        /// Reject mappings whose properties are missing or incompatible
        #[arg(long)]
        check_schema: bool,
    },
    /// Write the stored mapping set to a JSON file
    Export { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.app.database_url()).await?;
    db::run_migrations(&pool).await?;
    let store = FileContentStore::open(cfg.app.content_dir(), cfg.sync.restore_mode).await?;
    let mappings = SqliteMappingStore::new(pool.clone());

    match args.command {
        Command::Import { database_id, manual } => {
            let database_id = database_id.unwrap_or_else(|| cfg.notion.database_id.clone());
            let mut options = SyncOptions::from(&cfg.sync);
            if manual {
                options.conflict_policy = ConflictPolicy::Manual;
            }
            let orchestrator = SyncOrchestrator::new(
                Arc::new(NotionClient::from_config(&cfg)?),
                Arc::new(store),
                Arc::new(mappings),
                options,
            );
            let cancel = orchestrator.cancel_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; stopping after the current step");
                    cancel.cancel();
                }
            });

            let report = orchestrator.run_import(&database_id).await;
            if let Err(err) = db::insert_sync_run(&pool, &report).await {
                warn!(?err, "failed to record sync run");
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.success {
                bail!("sync run {} failed", report.run_id);
            }
        }
        Command::Mappings { action } => run_mappings(&cfg, &mappings, action).await?,
        Command::List => {
            for (slug, entry) in store.summaries().await {
                println!(
                    "{}\t{}\t{}\tv{}/{}",
                    slug,
                    entry.status.as_str(),
                    entry.title,
                    entry.current_version,
                    entry.latest_version
                );
            }
        }
        Command::Versions { slug } => {
            for doc in store.get_versions(&slug).await? {
                println!(
                    "v{}\t{}\t{}",
                    doc.version,
                    doc.created_at.to_rfc3339(),
                    doc.payload.title
                );
            }
        }
        Command::Restore { slug, version } => {
            let restored = store.restore_version(&slug, version).await?;
            info!(slug = %restored.slug, version, "restored");
            println!("{}", serde_json::to_string_pretty(&restored)?);
        }
        Command::Runs { limit } => {
            for run in db::recent_sync_runs(&pool, limit).await? {
                println!(
                    "{}\t{}\t{}\timported={} skipped={} errors={} conflicts={}",
                    run.id,
                    run.started_at.to_rfc3339(),
                    if run.success { "ok" } else { "failed" },
                    run.imported,
                    run.skipped,
                    run.errors,
                    run.conflicts
                );
            }
        }
        Command::Report { run_id } => match db::get_sync_report(&pool, &run_id).await? {
            Some(report) => println!("{}", serde_json::to_string_pretty(&report)?),
            None => bail!("no sync run with id {}", run_id),
        },
        Command::Preview { page_id } => {
            let client = NotionClient::from_config(&cfg)?;
            let page = client.fetch_page(&page_id).await?;
            let stored = mappings.get_mappings().await?;
            let effective = effective_mappings(&stored, |name| page.properties.contains_key(name));
            match transform(&page, &effective) {
                Ok(out) => {
                    let related = resolve_related(&store, &out.case_study).await?;
                    println!("{}", serde_json::to_string_pretty(&out.case_study)?);
                    println!("related slugs: [{}]", related.join(", "));
                    for warning in out.warnings {
                        eprintln!("warning: {}", warning);
                    }
                }
                Err(errors) => {
                    for err in &errors {
                        eprintln!("error: {}", err);
                    }
                    bail!("page {} does not produce a case study", page_id);
                }
            }
        }
    }
    Ok(())
}

async fn run_mappings(
    cfg: &Config,
    store: &SqliteMappingStore,
    action: MappingsAction,
) -> Result<()> {
    match action {
        MappingsAction::Show => {
            let stored = store.get_mappings().await?;
            println!("{}", mapping::mappings_to_json(&stored)?);
        }
        MappingsAction::Effective => {
            let schema = live_schema(cfg).await?;
            let stored = store.get_mappings().await?;
            let effective = effective_mappings(&stored, |name| schema.contains_key(name));
            println!("{}", mapping::mappings_to_json(&effective)?);
        }
        MappingsAction::Set { file, check_schema } => {
            let raw = fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let incoming = mapping::parse_mappings_json(&raw)?;
            if check_schema {
                let schema = live_schema(cfg).await?;
                let issues = check_against_schema(&incoming, &schema);
                if !issues.is_empty() {
                    for issue in &issues {
                        eprintln!("{}", issue);
                    }
                    bail!("{} mapping(s) do not fit the database schema", issues.len());
                }
            }
            store.save_mappings(&incoming).await?;
            println!("saved {} mapping(s)", incoming.len());
        }
        MappingsAction::Export { file } => {
            let stored = store.get_mappings().await?;
            fs::write(&file, mapping::mappings_to_json(&stored)?)
                .with_context(|| format!("failed to write {}", file.display()))?;
        }
    }
    Ok(())
}

async fn live_schema(cfg: &Config) -> Result<BTreeMap<String, NotionPropertyType>> {
    let client = NotionClient::from_config(cfg)?;
    let db = client.retrieve_database(&cfg.notion.database_id).await?;
    Ok(db
        .properties
        .into_iter()
        .map(|(name, prop)| {
            let typ = prop.property_type();
            (name, typ)
        })
        .collect())
}
