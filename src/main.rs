use anyhow::{bail, Context, Result};
use procgraph::graph::memory::InMemoryGraphStore;
use procgraph::{EngineConfig, MonitoringConfig, ProcessEngine};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Deploy a definition into an in-memory engine and run one instance of it.
///
/// Usage: procgraph <definition.json> [client-id]
#[tokio::main]
async fn main() -> Result<()> {
    let monitoring = MonitoringConfig::from_env();
    procgraph::init_logging(&monitoring).context("Failed to initialize logging")?;

    let mut args = std::env::args().skip(1);
    let path = match args.next() {
        Some(path) => PathBuf::from(path),
        None => bail!("usage: procgraph <definition.json> [client-id]"),
    };
    let client_id = args.next().unwrap_or_else(|| "local".to_string());

    let definition = procgraph::load_definition(&path)?;
    let config = EngineConfig::load().context("Failed to load configuration")?;
    let engine = ProcessEngine::new(config, Arc::new(InMemoryGraphStore::new()))?;
    let logger = procgraph::spawn_transition_logger(engine.subscribe());

    let roots = engine.deploy(&client_id, &definition).await?;
    let (instance_id, commit) = engine.start_instance(&roots.process_id, None).await?;
    info!(
        process_id = %roots.process_id,
        instance_id = %instance_id,
        ok = commit.ok,
        "Instance started"
    );
    println!("{}", serde_json::to_string_pretty(&commit)?);

    engine.teardown(&roots.process_id).await;
    drop(engine);
    let transitions = logger.await.context("Transition logger panicked")?;
    info!(transitions, "Done");

    if !commit.ok {
        bail!("instance failed: {:?}", commit.error);
    }
    Ok(())
}
