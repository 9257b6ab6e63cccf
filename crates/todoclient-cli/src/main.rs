//! todoclient - command-line client for the to-do service.
//!
//! Sessions persist between invocations: the access token and profile live
//! in the data directory, the refresh credential in the OS keychain (or a
//! file when configured). Expired access tokens are refreshed transparently.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use todoclient_core::auth::{FileStorage, KeyringStorage, Storage};
use todoclient_core::config::{RefreshStore, APP_NAME};
use todoclient_core::{
    ApiClient, ClientConfig, CredentialStore, LoginCredentials, RegisterRequest, SessionController,
    SessionOptions, SessionState, TodoUpdate,
};

/// Session file name in the data directory
const SESSION_FILE: &str = "storage.json";

/// Refresh credential file name when the keychain is not used
const COOKIE_FILE: &str = "cookies.json";

#[derive(Parser, Debug)]
#[command(name = "todoclient", version, about = "Command-line client for the to-do service")]
struct Cli {
    /// Override the service base URL
    #[arg(long, global = true)]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in and store the session
    Login {
        email: String,
        /// Password; prompted for when omitted
        #[arg(long)]
        password: Option<String>,
    },
    /// End the session on the server and locally
    Logout,
    /// Create a new account
    Register {
        name: String,
        email: String,
        /// Password; prompted for when omitted
        #[arg(long)]
        password: Option<String>,
    },
    /// Show the logged-in user
    Whoami,
    /// Show session state and cache age
    Status,
    /// List to-do items
    List,
    /// Add a to-do item
    Add {
        task: String,
    },
    /// Change the text of a to-do item
    Update {
        id: String,
        task: String,
    },
    /// Delete a to-do item
    Delete {
        id: String,
    },
}

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // RUST_LOG controls the level (e.g., RUST_LOG=todoclient_core=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

fn load_config(base_url: Option<String>) -> Result<ClientConfig> {
    let mut config = ClientConfig::load().context("Failed to load configuration")?;
    if let Some(url) = base_url {
        config.base_url = url;
        config.validate().context("Invalid --base-url")?;
    }
    Ok(config)
}

fn build_controller(config: &ClientConfig) -> Result<SessionController> {
    let data_dir = config.data_dir()?;
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

    let session: Arc<dyn Storage> = Arc::new(FileStorage::new(data_dir.join(SESSION_FILE)));
    let cookies: Arc<dyn Storage> = match config.refresh_store {
        RefreshStore::Keyring => Arc::new(KeyringStorage::new(APP_NAME)),
        RefreshStore::File => Arc::new(FileStorage::new(data_dir.join(COOKIE_FILE))),
    };

    let credentials = Arc::new(
        CredentialStore::new(session, cookies)
            .with_cookie_options(config.cookie_options())
            .allow_insecure_cookie(config.allow_insecure_refresh_cookie),
    );
    let api = ApiClient::from_config(config, credentials)?;
    Ok(SessionController::new(api, SessionOptions::from(config)))
}

fn password_or_prompt(password: Option<String>) -> Result<String> {
    if let Some(password) = password {
        return Ok(password);
    }
    io::stdout().flush()?;
    let password = rpassword::prompt_password("Password: ")?;
    Ok(password)
}

async fn require_login(controller: &SessionController) -> Result<()> {
    if controller.initialize().await != SessionState::Authenticated {
        anyhow::bail!("Not logged in. Run `todoclient login <email>` first.");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    init_tracing();
    let cli = Cli::parse();

    let config = load_config(cli.base_url)?;
    if !config.is_secure_channel() && !config.allow_insecure_refresh_cookie {
        warn!(
            base_url = %config.base_url,
            "Service is not on HTTPS; the refresh credential will not be stored"
        );
    }

    let controller = build_controller(&config)?;
    info!(base_url = %config.base_url, "todoclient starting");

    match cli.command {
        Command::Login { email, password } => {
            let password = password_or_prompt(password)?;
            let outcome = controller.login(&LoginCredentials::new(email, password)).await?;
            println!("Logged in as {}", outcome.user.display_name());
            let count = controller.resources().await.len();
            println!("{} item(s) on your list", count);
        }
        Command::Logout => {
            controller.initialize().await;
            controller.logout().await;
            println!("Logged out");
        }
        Command::Register { name, email, password } => {
            let password = password_or_prompt(password)?;
            let response = controller
                .api()
                .register(&RegisterRequest { name, email, password })
                .await?;
            match response.message {
                Some(message) => println!("{}", message),
                None => println!("Account created"),
            }
        }
        Command::Whoami => {
            require_login(&controller).await?;
            match controller.user().await {
                Some(user) => {
                    println!("{}", user.display_name());
                    if let Some(email) = user.email {
                        println!("  email: {}", email);
                    }
                    if let Some(role) = user.role {
                        println!("  role:  {}", role);
                    }
                }
                None => println!("Logged in (no profile available)"),
            }
        }
        Command::Status => {
            let state = controller.initialize().await;
            println!("Server:  {}", config.base_url);
            println!("Session: {:?}", state);
            let session = controller.snapshot().await;
            if let Some(cached) = session.resources {
                let stale = if cached.is_stale(config.resource_stale_minutes) {
                    " (stale)"
                } else {
                    ""
                };
                println!("Items:   {} loaded {}{}", cached.data.len(), cached.age_display(), stale);
            }
        }
        Command::List => {
            require_login(&controller).await?;
            let items = controller.fetch_resources().await?;
            if items.is_empty() {
                println!("Nothing to do");
            }
            for item in items {
                let mark = if item.completed { "x" } else { " " };
                println!("[{}] {}  {}", mark, item.id, item.task);
            }
        }
        Command::Add { task } => {
            require_login(&controller).await?;
            let item = controller.add_todo(&task).await?;
            println!("Added {} ({})", item.task, item.id);
        }
        Command::Update { id, task } => {
            require_login(&controller).await?;
            match controller.update_todo(&id, &task).await? {
                TodoUpdate::Updated(item) => println!("Updated: {}", item.task),
                TodoUpdate::Message(message) => println!("{}", message),
            }
        }
        Command::Delete { id } => {
            require_login(&controller).await?;
            let message = controller.delete_todo(&id).await?;
            println!("{}", message);
        }
    }

    Ok(())
}
