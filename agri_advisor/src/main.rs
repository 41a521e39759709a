//! Main entry point for the agricultural advisory CLI.

use agri_advisor::{
    cli,
    orchestrator::{Query, Supervisor, SynthesizedAnswer},
    services::Services,
    settings::{Settings, SettingsHandle},
    telemetry,
};
use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;

fn print_answer(answer: &SynthesizedAnswer) {
    println!("{}\n", answer.response);
    let mut intent = answer.intent.primary_intent.to_string();
    if let Some(secondary) = answer.intent.secondary_intent {
        intent = format!("{intent} + {secondary}");
    }
    println!("intent: {intent} (confidence {:.2})", answer.intent.confidence);
    if !answer.sources.is_empty() {
        let sources: Vec<&str> = answer.sources.iter().map(String::as_str).collect();
        println!("sources: {}", sources.join(", "));
    }
}

fn query_for(text: String, farmer: &cli::FarmerArgs) -> Query {
    let query = Query::new(text, farmer.user.clone());
    match &farmer.location {
        Some(location) => query.with_location(location.clone()),
        None => query,
    }
}

async fn chat(supervisor: &Supervisor, farmer: &cli::FarmerArgs) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        stdout.write_all(b"farmer> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text.eq_ignore_ascii_case("quit") || text.eq_ignore_ascii_case("exit") {
            break;
        }
        let answer = supervisor.process_query(query_for(text.to_string(), farmer)).await;
        print_answer(&answer);
        println!();
    }
    supervisor.flush_background().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = cli::Cli::parse();

    // Load settings
    let settings = Settings::load()?;

    // Initialize telemetry
    telemetry::init(&settings.logging)?;

    let handle = SettingsHandle::new(settings);
    let supervisor = Supervisor::from_settings(handle.clone(), Services::default()).await?;

    match args.command {
        cli::Commands::Ask { query, farmer, json } => {
            let answer = supervisor.process_query(query_for(query, &farmer)).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&answer)?);
            } else {
                print_answer(&answer);
            }
            supervisor.flush_background().await;
        }
        cli::Commands::Chat { farmer } => chat(&supervisor, &farmer).await?,
        cli::Commands::Ingest { dir } => {
            let retriever = supervisor.retriever();
            let ingested = retriever
                .ingest_directory(&dir)
                .await
                .with_context(|| format!("failed to ingest {}", dir.display()))?;
            for (collection, count) in &ingested {
                println!("{collection}: {count} documents");
            }
            match handle.read(|s| s.retrieval.snapshot_path.clone()) {
                Some(path) => {
                    retriever.save_snapshot(&path).await?;
                    info!(path = %path.display(), "Snapshot written");
                }
                None => println!("no snapshot_path configured; ingested documents are not persisted"),
            }
        }
        cli::Commands::Collections => {
            for stats in supervisor.retriever().collection_stats() {
                println!("{:<20} {}", stats.name, stats.documents);
            }
        }
    }

    Ok(())
}
