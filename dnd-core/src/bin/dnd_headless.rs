//! Line-oriented front end: one JSON command envelope per stdin line, one
//! JSON result per stdout line. Logs go to stderr.
//!
//! Environment:
//! - `DND_CONFIG`: optional JSON config file, overridden by `DND_*` variables
//! - `DND_CHARACTERS`: optional JSON array of character snapshots
//! - `RUST_LOG`: log filter, default `dnd_core=info,agent_bus=info`

use dnd_core::character::{CharacterSnapshot, InMemoryCharacterStore};
use dnd_core::{CommandEnvelope, CommandError, CommandResult, Conductor, CorrelationId, EngineConfig};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

async fn load_config() -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let config = match std::env::var("DND_CONFIG") {
        Ok(path) => EngineConfig::load_json(path).await?.apply_env()?,
        Err(_) => EngineConfig::from_env()?,
    };
    Ok(config)
}

async fn load_characters() -> Result<InMemoryCharacterStore, Box<dyn std::error::Error>> {
    let store = InMemoryCharacterStore::new();
    if let Ok(path) = std::env::var("DND_CHARACTERS") {
        let content = tokio::fs::read_to_string(&path).await?;
        let characters: Vec<CharacterSnapshot> = serde_json::from_str(&content)?;
        tracing::info!(path = %path, count = characters.len(), "Loaded characters");
        for character in characters {
            store.insert(character);
        }
    }
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dnd_core=info,agent_bus=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let conductor = Conductor::builder()
        .with_config(load_config().await?)
        .with_characters(Arc::new(load_characters().await?))
        .build()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let result = match serde_json::from_str::<CommandEnvelope>(&line) {
            Ok(envelope) => conductor.handle_command(envelope).await,
            Err(err) => {
                tracing::warn!(error = %err, "Unreadable command line");
                CommandResult::failed(
                    CorrelationId::new(),
                    "",
                    &CommandError::InvalidCommand(err.to_string()),
                )
            }
        };
        let mut out = serde_json::to_string(&result)?;
        out.push('\n');
        stdout.write_all(out.as_bytes()).await?;
        stdout.flush().await?;
    }

    let report = conductor.shutdown().await;
    tracing::info!(
        aborted_sagas = report.aborted_sagas.len(),
        forced = report.forced.len(),
        "Input closed, engine stopped"
    );
    Ok(())
}
