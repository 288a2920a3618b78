use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tether::client::{ChatSession, ChatUpdate, ClientStore};
use tether::config::{self, Config};
use tether::credentials::{FileTokenStore, StaticToken};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Tether: relay between WebSocket clients and a gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Run the relay (HTTP + WebSocket). Connects to the gateway and bridges clients onto it.
    Relay {
        /// Config file path (default: TETHER_CONFIG_PATH or ~/.tether/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// WebSocket and HTTP port (default from config or 3100)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Send one request through the relay and print the response.
    Call {
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Method name, e.g. `agents.list`.
        method: String,

        /// JSON params.
        params: Option<String>,
    },

    /// Print gateway events as they arrive.
    Watch {
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Event name to watch (default: all).
        #[arg(long, short, default_value = "*")]
        event: String,
    },

    /// Chat through the relay (interactive). `/abort` stops the running turn.
    Chat {
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Session key to chat in.
        #[arg(long, default_value = "main")]
        session: String,
    },

    /// Store the client credential used by call, watch and chat.
    Login {
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        token: String,
    },

    /// Remove the stored client credential.
    Logout {
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Version) => {
            println!("tether {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::Relay { config, port }) => run_relay(config, port).await,
        Some(Commands::Call {
            config,
            method,
            params,
        }) => run_call(config, method, params).await,
        Some(Commands::Watch { config, event }) => run_watch(config, event).await,
        Some(Commands::Chat { config, session }) => run_chat(config, session).await,
        Some(Commands::Login { config, token }) => run_login(config, token),
        Some(Commands::Logout { config }) => run_logout(config),
        None => {
            println!("Run with --help for usage");
            Ok(())
        }
    };
    if let Err(e) = result {
        log::error!("{:#}", e);
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run_relay(config_path: Option<PathBuf>, port: Option<u16>) -> anyhow::Result<()> {
    let (mut config, path) = config::load_config(config_path)?;
    if let Some(p) = port {
        config.relay.port = p;
    }
    log::info!(
        "starting relay on {}:{} (config {})",
        config.relay.bind,
        config.relay.port,
        path.display()
    );
    tether::relay::run_relay(config).await
}

/// Client store using the env/config credential if set, else the stored login.
fn open_store(config: &Config) -> ClientStore {
    match config::resolve_ui_token(config) {
        Some(token) => ClientStore::new(config.client.clone(), StaticToken(Some(token))),
        None => ClientStore::new(
            config.client.clone(),
            FileTokenStore::new(config::resolve_token_path(config)),
        ),
    }
}

async fn connected_store(config: &Config) -> anyhow::Result<ClientStore> {
    let store = open_store(config);
    store.connect()?;
    if let Err(e) = store.wait_connected(CONNECT_TIMEOUT).await {
        let reason = store.snapshot().error.unwrap_or_else(|| e.to_string());
        anyhow::bail!("could not connect to {}: {}", config.client.relay_url, reason);
    }
    Ok(store)
}

async fn run_call(
    config_path: Option<PathBuf>,
    method: String,
    params: Option<String>,
) -> anyhow::Result<()> {
    let (config, _) = config::load_config(config_path)?;
    let params: Option<serde_json::Value> = params
        .map(|p| serde_json::from_str(&p))
        .transpose()
        .map_err(|e| anyhow::anyhow!("params must be JSON: {}", e))?;
    let store = connected_store(&config).await?;
    let result = store.request(&method, params).await;
    store.disconnect();
    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}

async fn run_watch(config_path: Option<PathBuf>, event: String) -> anyhow::Result<()> {
    let (config, _) = config::load_config(config_path)?;
    let store = connected_store(&config).await?;
    let _subscription = store.on(&event, move |payload| println!("{}", payload));
    tokio::signal::ctrl_c().await?;
    store.disconnect();
    Ok(())
}

async fn run_chat(config_path: Option<PathBuf>, session: String) -> anyhow::Result<()> {
    let (config, _) = config::load_config(config_path)?;
    let store = connected_store(&config).await?;
    let (chat, mut updates) = ChatSession::new(store.clone(), config.client.delta_mode);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut shown = 0usize;
    prompt(&mut stdout).await?;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let input = line.trim();
                if input.is_empty() {
                    prompt(&mut stdout).await?;
                    continue;
                }
                if input.eq_ignore_ascii_case("/exit") || input.eq_ignore_ascii_case("/quit") {
                    break;
                }
                let sent = if input.eq_ignore_ascii_case("/abort") {
                    chat.abort(&session).await
                } else {
                    chat.send(&session, input).await
                };
                if let Err(e) = sent {
                    eprintln!("chat error: {}", e);
                    prompt(&mut stdout).await?;
                }
            }
            Some(update) = updates.recv() => {
                match update {
                    ChatUpdate::Delta { session_key, text } if session_key == session => {
                        // Print only the part not shown yet.
                        if let Some(rest) = text.get(shown..) {
                            stdout.write_all(rest.as_bytes()).await?;
                            stdout.flush().await?;
                        }
                        shown = text.len();
                    }
                    ChatUpdate::Final { session_key, text } | ChatUpdate::Aborted { session_key, text }
                        if session_key == session =>
                    {
                        if let Some(rest) = text.get(shown..) {
                            stdout.write_all(rest.as_bytes()).await?;
                        }
                        stdout.write_all(b"\n").await?;
                        shown = 0;
                        prompt(&mut stdout).await?;
                    }
                    ChatUpdate::Error { session_key, message } if session_key == session => {
                        eprintln!("\nchat error: {}", message);
                        shown = 0;
                        prompt(&mut stdout).await?;
                    }
                    _ => {}
                }
            }
        }
    }

    store.disconnect();
    Ok(())
}

async fn prompt(stdout: &mut tokio::io::Stdout) -> anyhow::Result<()> {
    stdout.write_all(b"> ").await?;
    stdout.flush().await?;
    Ok(())
}

fn run_login(config_path: Option<PathBuf>, token: String) -> anyhow::Result<()> {
    let (config, _) = config::load_config(config_path)?;
    let store = FileTokenStore::new(config::resolve_token_path(&config));
    store.save(&token)?;
    println!("credential saved to {}", store.path().display());
    Ok(())
}

fn run_logout(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (config, _) = config::load_config(config_path)?;
    let store = FileTokenStore::new(config::resolve_token_path(&config));
    store.clear()?;
    println!("credential removed from {}", store.path().display());
    Ok(())
}
