use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use studio_sync::compat;
use studio_sync::config;
use studio_sync::notion::NotionClient;

#[derive(Parser, Debug)]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Database ID to inspect (defaults to notion.database_id)
    #[arg(long)]
    db_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let cfg = config::load(Some(&args.config))?;
    let client = NotionClient::from_config(&cfg)?;
    let db_id = args.db_id.unwrap_or_else(|| cfg.notion.database_id.clone());

    let db = client.retrieve_database(&db_id).await?;
    println!("Database ID: {}", db.id);
    println!("Properties:");
    for (name, prop) in db.properties {
        let fields: Vec<&str> = compat::fields_fed_by(prop.property_type())
            .into_iter()
            .map(|f| f.as_str())
            .collect();
        println!(
            "  {} -> {{ id: {}, type: {} }} feeds [{}]",
            name,
            prop.id,
            prop.typ,
            fields.join(", ")
        );
    }
    Ok(())
}
