mod face;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use dotenvy::dotenv;
use page_agent::chrome::{BrowserSession, SessionOptions};
use page_agent::store::save_api_key;
use page_agent::{
    Agent, AgentConfig, AgentEvent, AgentHandle, ConfigLoader, JsonFileStore, KeyValueStore,
    OpenAiOracle, Page,
};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "agent", about = "Drive a web page toward a goal with an LLM")]
struct Args {
    /// YAML config file (default: ./page-agent.yaml, then ~/.page-agent/config.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Page to open once the browser is up
    #[arg(long)]
    start_url: Option<String>,

    #[arg(long)]
    headless: bool,

    /// Where snapshots and the saved API key are kept
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// First port tried for the web UI
    #[arg(short, long, default_value_t = 3000)]
    port: u16,

    /// Attach to a Chrome already listening on this DevTools port
    #[arg(long, default_value_t = 9222)]
    debug_port: u16,

    /// Store an OpenAI API key and exit
    #[arg(long, value_name = "KEY")]
    save_key: Option<String>,
}

async fn load_config(args: &Args) -> Result<AgentConfig> {
    let mut config = match &args.config {
        Some(path) => ConfigLoader::load_from(path)
            .await
            .with_context(|| format!("loading {}", path.display()))?,
        None => ConfigLoader::load_default().await?,
    };
    if let Some(path) = &args.state_file {
        config.state_file = Some(path.clone());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args).await?;
    let kv: Arc<dyn KeyValueStore> = Arc::new(JsonFileStore::new(config.state_file()));

    if let Some(key) = &args.save_key {
        if !save_api_key(kv.as_ref(), key)? {
            bail!("API key must start with \"sk-\" and be longer than 20 characters");
        }
        info!(path = %config.state_file().display(), "API key saved");
        return Ok(());
    }

    info!("starting page agent");

    // Web UI first, so the user sees something while Chrome starts.
    let (event_tx, _) = broadcast::channel::<AgentEvent>(64);
    let handle = AgentHandle::default();
    let mut cmd_rx = face::start_server(args.port, handle.clone(), event_tx.clone()).await?;

    let options = SessionOptions {
        headless: args.headless,
        debug_port: args.debug_port,
        ..SessionOptions::default()
    };
    let start_url = args.start_url.clone();
    let session = tokio::task::spawn_blocking(move || {
        let session = BrowserSession::launch(&options)?;
        if let Some(url) = start_url {
            session.navigate(&url)?;
        }
        Ok::<_, page_agent::PageError>(session)
    })
    .await
    .context("browser launch panicked")??;
    info!("browser ready");

    let oracle = OpenAiOracle::new(config.oracle.clone(), kv.clone())?;
    let mut agent = Agent::new(session.page(), oracle, config, kv, event_tx.clone())
        .with_handle(handle.clone());

    match interruptible(&handle, agent.resume()).await {
        Some(Some(exit)) => info!(?exit, "resumed task ended"),
        Some(None) => {}
        None => return shut_down(&agent),
    }
    let _ = event_tx.send(AgentEvent::Ready);
    info!("waiting for commands");

    while let Some(command) = interruptible(&handle, cmd_rx.recv()).await {
        let Some(command) = command else {
            warn!("command channel closed");
            break;
        };
        let Some(exit) = interruptible(&handle, agent.run(&command)).await else {
            break;
        };
        info!(?exit, "command finished");
    }

    shut_down(&agent)
}

/// Race `work` against Ctrl-C. An interrupt stops the agent, which also
/// discards its snapshot so the next launch does not resume the task.
async fn interruptible<T>(handle: &AgentHandle, work: impl Future<Output = T>) -> Option<T> {
    tokio::select! {
        out = work => Some(out),
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            handle.request_stop();
            None
        }
    }
}

fn shut_down<P: Page>(agent: &Agent<P, OpenAiOracle>) -> Result<()> {
    info!(api_calls = agent.oracle().api_calls(), "shutting down");
    Ok(())
}
