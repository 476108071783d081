//! Operator CLI: one-shot or interactive syncs against the same library
//! `syncd` embeds, without running the scheduler or webhook processor.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dialoguer::{theme::ColorfulTheme, Confirm, MultiSelect, Select};

use sync_core::chunked::run_entity_to_completion;
use sync_core::connector::Connector;
use sync_core::crypto::AesCbcSecretCipher;
use sync_core::executor::{live_collection_name, SyncContext};
use sync_core::gateway::ConfigStoreGateway;
use sync_core::id::Id;
use sync_core::model::{Destination, SyncMode};
use sync_core::pool::{ConnectInfo, ConnectionPool, PoolContext, PoolKey};
use sync_core::Config;

/// Run a sync against one connector/destination outside of the scheduler.
#[derive(Parser, Debug)]
#[command(name = "synccli")]
struct Cli {
    /// Connector id to sync from.
    #[arg(short = 's', long = "connector")]
    connector_id: Option<Id>,

    /// Destination id to sync into.
    #[arg(short = 'd', long = "destination")]
    destination_id: Option<Id>,

    /// Entity to sync; repeatable. Omit (or pass in interactive mode) for all.
    #[arg(short = 'e', long = "entity")]
    entities: Vec<String>,

    /// Incremental sync instead of the default full sync.
    #[arg(long)]
    incremental: bool,

    /// Prompt for every choice instead of reading flags.
    #[arg(short = 'i', long = "interactive")]
    interactive: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    sync_core::connector::init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => Ok(()),
        Err(e) => {
            log::error!("sync failed: {e}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let (client, connection) = tokio_postgres::connect(&config.database_url, tokio_postgres::NoTls).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            log::error!("control-plane connection closed: {e}");
        }
    });
    let cipher = Arc::new(AesCbcSecretCipher::from_slice(&config.encryption_key)?);
    let gateway = ConfigStoreGateway::new(Arc::new(client), cipher);
    let pool = ConnectionPool::new();

    let (connector_id, destination_id, entities, sync_mode) = if cli.interactive {
        prompt_selections(&gateway).await?
    } else {
        let connector_id = cli.connector_id.ok_or_else(|| anyhow::anyhow!("-s/--connector is required outside interactive mode"))?;
        let destination_id = cli.destination_id.ok_or_else(|| anyhow::anyhow!("-d/--destination is required outside interactive mode"))?;
        let mode = if cli.incremental { SyncMode::Incremental } else { SyncMode::Full };
        (connector_id, destination_id, cli.entities, mode)
    };

    let connector_config = gateway.get_connector(connector_id).await?;
    let destination = gateway.get_destination(destination_id).await?;
    let connector = sync_core::connector::registry().get_connector(&connector_config)?;

    let validation = connector.validate_config();
    if !validation.valid {
        anyhow::bail!("connector config is invalid: {}", validation.errors.join("; "));
    }

    let test = connector.test_connection().await;
    if !test.success {
        anyhow::bail!("connector test-connection failed: {}", test.message);
    }
    log::info!("connector test-connection ok: {}", test.message);

    let handle = pool
        .get(PoolKey::new(PoolContext::Destination, destination.id.to_string()), || async {
            Ok::<_, String>(ConnectInfo {
                connection_string: destination.connection.connection_string.clone(),
                database: destination.connection.database.clone(),
            })
        })
        .await?;

    let entities = if entities.is_empty() {
        connector.get_available_entities()
    } else {
        entities
    };

    let ctx = SyncContext {
        connector: connector.as_ref(),
        connector_id: connector_config.id,
        connector_name: connector_config.name.clone(),
        destination_client: handle.client.clone(),
        sync_mode,
        batch_size: connector_config.settings.batch_size,
        rate_limit_delay: Duration::from_millis(connector_config.settings.rate_limit_delay_ms),
        max_retries: connector_config.settings.max_retries,
    };

    for entity in &entities {
        log::info!("syncing entity `{entity}` into `{}`", live_collection_name(&ctx.connector_name, entity));
        run_entity_to_completion(&ctx, entity).await?;
    }

    log::info!("sync complete");
    Ok(())
}

async fn prompt_selections(gateway: &ConfigStoreGateway) -> anyhow::Result<(Id, Id, Vec<String>, SyncMode)> {
    let theme = ColorfulTheme::default();

    let workspaces = gateway.list_workspaces().await?;
    if workspaces.is_empty() {
        anyhow::bail!("no workspaces configured");
    }
    let ws_idx = Select::with_theme(&theme)
        .with_prompt("Workspace")
        .items(&workspaces.iter().map(|w| w.name.clone()).collect::<Vec<_>>())
        .default(0)
        .interact()?;
    let workspace = &workspaces[ws_idx];

    let connectors = gateway.list_active_connectors(Some(workspace.id)).await?;
    if connectors.is_empty() {
        anyhow::bail!("no active connectors in workspace `{}`", workspace.name);
    }
    let connector_idx = Select::with_theme(&theme)
        .with_prompt("Connector")
        .items(&connectors.iter().map(|c| format!("{} ({})", c.name, c.kind)).collect::<Vec<_>>())
        .default(0)
        .interact()?;
    let connector_config = &connectors[connector_idx];

    let destinations: Vec<Destination> = gateway.list_destinations(workspace.id).await?;
    if destinations.is_empty() {
        anyhow::bail!("no destinations in workspace `{}`", workspace.name);
    }
    let dest_idx = Select::with_theme(&theme)
        .with_prompt("Destination")
        .items(&destinations.iter().map(|d| d.name.clone()).collect::<Vec<_>>())
        .default(0)
        .interact()?;
    let destination = &destinations[dest_idx];

    let connector = sync_core::connector::registry().get_connector(connector_config)?;
    let mut available = connector.get_available_entities();
    available.insert(0, "ALL".to_string());
    let selected_idxs = MultiSelect::with_theme(&theme)
        .with_prompt("Entities (space to toggle, ALL for everything)")
        .items(&available)
        .interact()?;
    let entities = if selected_idxs.is_empty() || selected_idxs.contains(&0) {
        Vec::new()
    } else {
        selected_idxs.into_iter().map(|i| available[i].clone()).collect()
    };

    let mode_idx = Select::with_theme(&theme)
        .with_prompt("Sync mode")
        .items(&["full", "incremental"])
        .default(0)
        .interact()?;
    let mode = if mode_idx == 0 { SyncMode::Full } else { SyncMode::Incremental };

    if !Confirm::with_theme(&theme).with_prompt("Proceed?").default(true).interact()? {
        anyhow::bail!("aborted by operator");
    }

    Ok((connector_config.id, destination.id, entities, mode))
}
