use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use todoshare::auth::AuthStore;
use todoshare::session::{ApiRequest, FileTokenStorage, SessionError, SessionGuard};
use todoshare::store::{ResourceStore, SharedResource, SqliteStore, TodoList};
use todoshare::todo::ListService;
use todoshare::{AccessResolver, Config};

#[derive(Parser)]
#[command(name = "todoshare", version)]
#[command(about = "Shared to-do lists: server and command-line client")]
struct Cli {
    /// Path to the configuration file (default: ~/.todoshare/config.toml)
    #[arg(short, long, global = true, env = "TODOSHARE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP gateway
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Manage user accounts on this server
    User {
        #[command(subcommand)]
        command: UserCommand,
    },
    /// Sign in to the API and store the session tokens
    Login { username: String },
    /// Sign out and forget the stored tokens
    Logout,
    /// Show your lists
    Lists,
    /// Show lists and tasks shared with you
    Shared,
}

#[derive(Subcommand)]
enum UserCommand {
    /// Register a new user (prompts for the password)
    Add {
        username: String,
        /// Email address others can use to share tasks with this user
        #[arg(long)]
        email: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log.filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            todoshare::gateway::run_gateway(&config).await
        }
        Command::User {
            command: UserCommand::Add { username, email },
        } => add_user(&config, &username, email.as_deref()).await,
        Command::Login { username } => {
            let guard = client(&config)?;
            let password = dialoguer::Password::new()
                .with_prompt("Password")
                .interact()?;
            guard.login(&username, &password).await?;
            println!("Signed in as {username}");
            Ok(())
        }
        Command::Logout => {
            client(&config)?.logout().await;
            println!("Signed out");
            Ok(())
        }
        Command::Lists => {
            let guard = client(&config)?;
            let lists: Vec<TodoList> =
                call(&guard, guard.send_json(&ApiRequest::get("/lists")).await)?;
            if lists.is_empty() {
                println!("No lists yet");
            }
            for list in lists {
                let marker = if list.is_system { " (system)" } else { "" };
                println!("{}  {}{marker}", list.id, list.name);
            }
            Ok(())
        }
        Command::Shared => {
            let guard = client(&config)?;
            let shared: Vec<SharedResource> =
                call(&guard, guard.send_json(&ApiRequest::get("/shared")).await)?;
            if shared.is_empty() {
                println!("Nothing shared with you");
            }
            for entry in shared {
                println!(
                    "{:<5} {}  {}  [{}]",
                    entry.resource.kind(),
                    entry.resource.id(),
                    entry.resource.owner_id(),
                    entry.role
                );
            }
            Ok(())
        }
    }
}

async fn add_user(config: &Config, username: &str, email: Option<&str>) -> Result<()> {
    let db_path = config.database_path();
    let auth = AuthStore::new(
        &db_path.with_extension("auth.db"),
        Some(config.auth.access_ttl_secs),
        Some(config.auth.refresh_ttl_secs),
    )?;

    let password = dialoguer::Password::new()
        .with_prompt("Password")
        .with_confirmation("Confirm password", "Passwords do not match")
        .interact()?;
    let user_id = auth.register(username, &password)?;
    if let Some(email) = email {
        auth.set_email(&user_id, email)?;
    }

    let store: Arc<dyn ResourceStore> = Arc::new(SqliteStore::open(&db_path)?);
    let lists = ListService::new(store.clone(), AccessResolver::new(store));
    lists
        .ensure_finished_list(&user_id)
        .await
        .context("Failed to create the Finished Tasks list")?;

    println!("Created user {username} ({user_id})");
    Ok(())
}

fn client(config: &Config) -> Result<SessionGuard> {
    let storage = Arc::new(FileTokenStorage::open(config.token_path())?);
    SessionGuard::new(
        &config.client.base_url,
        Duration::from_secs(config.client.timeout_secs),
        storage,
    )
}

/// Unwrap a client result, turning auth failures into a sign-in hint.
fn call<T>(guard: &SessionGuard, result: Result<T, SessionError>) -> Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(e) if e.is_auth_error() || guard.is_session_expired() => {
            bail!("{e}. Run `todoshare login <username>` to sign in again")
        }
        Err(e) => Err(e.into()),
    }
}
