//! iproto-cli - Command-line interface for IProto servers
//!
//! Provides both a REPL and one-shot command execution.

mod commands;
mod repl;

use clap::{Parser, Subcommand};
use colored::Colorize;
use iproto_client::{Client, ConnectionConfig, TlsClientConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "iproto-cli")]
#[command(about = "Command-line interface for IProto (Tarantool binary protocol) servers")]
#[command(version)]
struct Cli {
    /// Server address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:3301")]
    server: String,

    /// YAML connection config; command-line options override it
    #[arg(short, long, env = "IPROTO_CONFIG")]
    config: Option<PathBuf>,

    /// User to authenticate as
    #[arg(short, long, env = "IPROTO_USER")]
    user: Option<String>,

    /// Password for --user
    #[arg(short, long, env = "IPROTO_PASSWORD")]
    password: Option<String>,

    /// Request timeout in milliseconds (0 waits forever)
    #[arg(long)]
    timeout_ms: Option<u64>,

    // ===== TLS Options =====
    /// Enable TLS connection
    #[arg(long, env = "IPROTO_TLS")]
    tls: bool,

    /// Path to CA certificate for server verification
    #[arg(long, env = "IPROTO_CA_CERT")]
    ca_cert: Option<PathBuf>,

    /// Path to client certificate (for mTLS)
    #[arg(long, env = "IPROTO_CLIENT_CERT")]
    client_cert: Option<PathBuf>,

    /// Path to client private key (for mTLS)
    #[arg(long, env = "IPROTO_CLIENT_KEY")]
    client_key: Option<PathBuf>,

    /// Skip server certificate verification (INSECURE)
    #[arg(long, short = 'k')]
    insecure: bool,

    /// Server name for TLS SNI (defaults to server hostname)
    #[arg(long)]
    server_name: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start interactive REPL
    Repl,

    /// Ping the server
    Ping,

    /// Show the greeting and negotiated features
    Info,

    /// Evaluate a Lua expression
    Eval {
        /// Expression
        expr: String,

        /// Arguments as JSON values
        args: Vec<String>,
    },

    /// Call a stored function
    Call {
        /// Function name
        function: String,

        /// Arguments as JSON values
        args: Vec<String>,
    },

    /// Select tuples from a space
    Select {
        /// Space id or name
        space: String,

        /// Key as a JSON array
        #[arg(default_value = "[]")]
        key: String,

        /// Index id or name
        #[arg(short, long, default_value = "0")]
        index: String,

        /// Maximum tuples to return
        #[arg(short, long, default_value = "100")]
        limit: u32,

        /// Tuples to skip
        #[arg(short, long, default_value = "0")]
        offset: u32,
    },

    /// Execute an SQL statement
    Execute {
        /// SQL text
        sql: String,

        /// Bind parameters as JSON values
        binds: Vec<String>,
    },

    /// Watch a key and print every change until Ctrl+C
    Watch {
        /// Watcher key
        key: String,
    },

    /// Print the current value of a watcher key
    WatchOnce {
        /// Watcher key
        key: String,
    },

    /// Compute a chap-sha1 scramble (no server connection)
    Scramble {
        /// Base64 salt from the greeting
        salt: String,

        /// Password
        password: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    // Handle scramble locally (no server connection needed)
    if let Some(Commands::Scramble { salt, password }) = &cli.command {
        println!("{}", commands::scramble(salt, password)?);
        return Ok(());
    }

    let config = build_config(&cli)?;
    let addr = config.addr.clone();
    tracing::debug!(
        "Using server {} (tls: {}, user: {:?})",
        addr,
        config.tls.as_ref().is_some_and(|tls| tls.enabled),
        config.user
    );
    let client = Client::new(config);

    // Handle commands
    match cli.command {
        Some(Commands::Repl) | None => {
            repl::run(client, &addr).await?;
        }
        Some(Commands::Scramble { .. }) => unreachable!(), // Already handled above
        Some(Commands::Watch { key }) => {
            connect(&client).await?;

            let mut stream = match client.watch(&key).await {
                Ok(stream) => stream,
                Err(e) => {
                    eprintln!("{}: {}", "Error".red(), e);
                    std::process::exit(1);
                }
            };
            eprintln!("{} {}", "Watching".green(), key.cyan());
            eprintln!("{}", "Press Ctrl+C to stop...".dimmed());

            let conn = client.connection();
            loop {
                tokio::select! {
                    event = stream.recv() => {
                        match event {
                            Some(event) => println!("{}", commands::format_value(&event.data)),
                            None => {
                                eprintln!("{}", "Watch ended".red());
                                break;
                            }
                        }
                    }
                    cause = conn.closed() => {
                        eprintln!("{}", format!("Connection closed by {}", cause).red());
                        break;
                    }
                    _ = tokio::signal::ctrl_c() => {
                        eprintln!("\n{}", "Stopping watch...".dimmed());
                        let _ = client.unwatch(&key).await;
                        break;
                    }
                }
            }

            client.close().await;
        }
        Some(cmd) => {
            connect(&client).await?;

            match commands::execute(&client, cmd).await {
                Ok(output) => {
                    println!("{}", output);
                }
                Err(e) => {
                    eprintln!("{}: {}", "Error".red(), e);
                    std::process::exit(1);
                }
            }

            client.close().await;
        }
    }

    Ok(())
}

fn build_config(cli: &Cli) -> Result<ConnectionConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => ConnectionConfig::from_file(path)?,
        None => ConnectionConfig::new(cli.server.clone()),
    };
    if cli.config.is_none() || cli.server != "127.0.0.1:3301" {
        config.addr = cli.server.clone();
    }

    if let Some(user) = &cli.user {
        config = config.with_credentials(user, cli.password.clone().unwrap_or_default());
    }
    if let Some(ms) = cli.timeout_ms {
        let timeout = (ms > 0).then(|| Duration::from_millis(ms));
        config = config.with_request_timeout(timeout);
    }

    // Build TLS config if any TLS option is set
    if cli.tls || cli.ca_cert.is_some() || cli.client_cert.is_some() || cli.insecure {
        let mut tls = TlsClientConfig::new();
        tls.enabled = true;

        if let Some(ref path) = cli.ca_cert {
            tls.ca_cert_path = Some(path.clone());
        }
        if let (Some(cert), Some(key)) = (&cli.client_cert, &cli.client_key) {
            tls.client_cert_path = Some(cert.clone());
            tls.client_key_path = Some(key.clone());
        } else if cli.client_cert.is_some() || cli.client_key.is_some() {
            eprintln!(
                "{}: --client-cert and --client-key must be used together",
                "Error".red()
            );
            std::process::exit(1);
        }
        tls.insecure = cli.insecure;
        tls.server_name = cli.server_name.clone();

        config = config.with_tls(tls);
    }

    Ok(config)
}

async fn connect(client: &Client) -> Result<(), Box<dyn std::error::Error>> {
    client.connect().await.map_err(|e| {
        eprintln!("{}: {}", "Connection failed".red(), e);
        e
    })?;
    Ok(())
}
