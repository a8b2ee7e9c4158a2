use clap::{Parser, Subcommand};
use memcas::{Client, Config};
use std::time::Duration;
use tracing::{debug, info};
use tracing_appender::non_blocking;

static LOG_GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
    std::sync::OnceLock::new();

#[derive(Parser)]
#[command(name = "memcas")]
#[command(about = "Memcached binary protocol client with CAS support")]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Server address, overrides the configuration file
    #[arg(short, long)]
    server: Option<String>,

    #[arg(short, long, requires = "password")]
    username: Option<String>,

    #[arg(short, long, requires = "username")]
    password: Option<String>,

    /// Per-request socket timeout in milliseconds
    #[arg(long)]
    socket_timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Print the value stored under KEY
    Get { key: String },
    /// Print the value, flags and CAS token stored under KEY
    Gets { key: String },
    /// Store VALUE under KEY
    Set {
        key: String,
        value: String,
        #[arg(short, long, default_value_t = 0)]
        expiration: u32,
    },
    /// Store VALUE under KEY if the CAS token still matches
    Cas {
        key: String,
        value: String,
        cas: u64,
        #[arg(short, long, default_value_t = 0)]
        expiration: u32,
    },
    /// Delete KEY, optionally only if the CAS token matches
    Delete {
        key: String,
        #[arg(long)]
        cas: Option<u64>,
    },
    /// Print the server version
    Version,
}

fn init_logging() {
    let (non_blocking_writer, guard) = non_blocking(std::io::stderr());
    // Keep guard alive for the program lifetime to avoid log loss
    let _ = LOG_GUARD.set(guard);

    let fmt = tracing_subscriber::fmt()
        .with_writer(non_blocking_writer)
        .with_ansi(true)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_level(true)
        .compact();

    // RUST_LOG names a single max level; anything else falls back to warn
    let level = match std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "warn".to_string())
        .to_lowercase()
        .as_str()
    {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::WARN,
    };

    let _ = fmt.with_max_level(level).try_init();
}

async fn load_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => Config::from_yaml_file(path).await?,
        None => Config::new(args.server.as_deref().unwrap_or("127.0.0.1:11211")),
    };

    if let Some(server) = &args.server {
        config.server = server.clone();
    }
    if let (Some(username), Some(password)) = (&args.username, &args.password) {
        config = config.with_credentials(username.as_str(), password.as_str());
    }
    if let Some(ms) = args.socket_timeout_ms {
        config = config.with_socket_timeout(Some(Duration::from_millis(ms)));
    }

    config.validate()?;
    Ok(config)
}

/// Run one command and return the text to print
async fn run(client: &Client, command: Command) -> Result<String, Box<dyn std::error::Error>> {
    debug!("Running {:?}", command);
    let output = match command {
        Command::Get { key } => match client.get(&key).await? {
            Some(value) => String::from_utf8_lossy(&value).into_owned(),
            None => "NOT FOUND".to_string(),
        },
        Command::Gets { key } => match client.gets(&key).await? {
            Some(item) => format!(
                "{} flags={} cas={}",
                String::from_utf8_lossy(&item.value),
                item.flags,
                item.cas
            ),
            None => "NOT FOUND".to_string(),
        },
        Command::Set {
            key,
            value,
            expiration,
        } => stored(client.set(&key, &value, expiration).await?),
        Command::Cas {
            key,
            value,
            cas,
            expiration,
        } => stored(client.cas(&key, &value, cas, expiration).await?),
        Command::Delete { key, cas } => {
            let deleted = match cas {
                Some(cas) => client.delete_cas(&key, cas).await?,
                None => client.delete(&key).await?,
            };
            let text = if deleted { "DELETED" } else { "NOT DELETED" };
            text.to_string()
        }
        Command::Version => client.version().await?,
    };
    Ok(output)
}

fn stored(ok: bool) -> String {
    let text = if ok { "STORED" } else { "NOT STORED" };
    text.to_string()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let args = Args::parse();
    let config = load_config(&args).await?;
    info!("Using server {}", config.server);

    let client = Client::new(config)?;
    let output = run(&client, args.command).await;
    client.disconnect_all();

    println!("{}", output?);
    Ok(())
}
