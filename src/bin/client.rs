//! KV client binary
//!
//! Runs the protocol engine against an in-process simulated cluster.
//!
//! Run with: cargo run --bin kv-client -- --help

use anyhow::Result;
use clap::{Parser, Subcommand};
use rdma_kv_client::client::{ClientConfig, KvClient};
use rdma_kv_client::transport::mock::MockCluster;
use rdma_kv_client::KvError;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "kv-client")]
#[command(about = "Sharded RDMA key-value store client")]
struct Args {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bootstrap node address (defaults to the first simulated node)
    #[arg(long)]
    bootstrap: Option<String>,

    /// Per-request timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Attempts per operation
    #[arg(long)]
    attempts: Option<u32>,

    /// Number of nodes in the simulated cluster
    #[arg(long, default_value = "3")]
    shards: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Store a value
    Put {
        key: String,
        value: String,
    },
    /// Fetch a value
    Get {
        key: String,
    },
    /// Delete a key
    Del {
        key: String,
    },
    /// Check whether a key exists
    Contains {
        key: String,
    },
    /// Print the server-side digest of a value
    Hash {
        key: String,
    },
    /// List every value on every shard
    List,
    /// Print the shard a key resolves to
    Shard {
        key: String,
    },
    /// Run interactive REPL
    Repl,
}

fn load_config(args: &Args, cluster: &MockCluster) -> Result<ClientConfig> {
    let mut config = match &args.config {
        Some(path) => ClientConfig::from_json_file(path)?,
        None => ClientConfig {
            bootstrap_addr: cluster.bootstrap_address(),
            ..Default::default()
        },
    };
    if let Some(bootstrap) = &args.bootstrap {
        config.bootstrap_addr = bootstrap.clone();
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.request_timeout_ms = timeout_ms;
    }
    if let Some(attempts) = args.attempts {
        config.default_attempts = attempts;
    }
    Ok(config)
}

fn print_value(value: &[u8]) {
    match std::str::from_utf8(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!("{:?}", value),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Run one command. Key-level failures are reported, not fatal.
async fn run_command(client: &mut KvClient, command: &Commands) -> Result<()> {
    let attempts = client.config().default_attempts;
    let outcome = match command {
        Commands::Put { key, value } => client
            .put(key, value.as_bytes(), attempts)
            .await
            .map(|()| println!("OK")),
        Commands::Get { key } => client.get(key, attempts).await.map(|v| print_value(&v)),
        Commands::Del { key } => client.del(key, attempts).await.map(|()| println!("Deleted")),
        Commands::Contains { key } => client
            .contains(key, attempts)
            .await
            .map(|found| println!("{}", found)),
        Commands::Hash { key } => client
            .hash(key, attempts)
            .await
            .map(|digest| println!("{}", hex(&digest))),
        Commands::List => client.list(attempts).await.map(|values| {
            for value in &values {
                print_value(value);
            }
            println!("({} values)", values.len());
        }),
        Commands::Shard { key } => {
            println!("{}", client.shard_for(key));
            Ok(())
        }
        Commands::Repl => Ok(()),
    };

    match outcome {
        Ok(()) => Ok(()),
        Err(e @ (KvError::KeyNotFound(_) | KvError::DuplicateKey(_))) => {
            eprintln!("Error: {}", e);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn cmd_repl(client: &mut KvClient) -> Result<()> {
    use std::io::{self, BufRead, Write};

    println!("KV REPL - Commands: put <key> <value>, get <key>, del <key>, contains <key>, hash <key>, list, shard <key>, quit");
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("> ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        let command = match parts.as_slice() {
            [] => continue,
            ["quit" | "exit" | "q"] => {
                println!("Bye!");
                break;
            }
            ["put", key, value] => Commands::Put {
                key: key.to_string(),
                value: value.to_string(),
            },
            ["get", key] => Commands::Get { key: key.to_string() },
            ["del" | "delete", key] => Commands::Del { key: key.to_string() },
            ["contains", key] => Commands::Contains { key: key.to_string() },
            ["hash", key] => Commands::Hash { key: key.to_string() },
            ["shard", key] => Commands::Shard { key: key.to_string() },
            ["list"] => Commands::List,
            _ => {
                println!("Unknown command: {}", line.trim());
                continue;
            }
        };
        if let Err(e) = run_command(client, &command).await {
            eprintln!("Error: {}", e);
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    let cluster = MockCluster::new(args.shards);
    let config = load_config(&args, &cluster)?;
    tracing::info!("Bootstrapping against {} ({} simulated shards)", config.bootstrap_addr, args.shards);

    let attempts = config.default_attempts;
    let mut client = KvClient::new(config, cluster.context())?;
    client.initialize(attempts).await?;

    match &args.command {
        Commands::Repl => cmd_repl(&mut client).await?,
        command => run_command(&mut client, command).await?,
    }

    client.close_connection(attempts).await?;
    Ok(())
}
