//! Remote table engine example client - main entry point
//!
//! Starts a transient worker, generates a small table on it and prints a
//! local snapshot. Given a query and table name, it also attaches to that
//! persistent query and prints the tail of the table.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use table_engine_client::config::ClientConfig;
use table_engine_client::engine::{Credential, ServerConfig, SessionFactory};
use table_engine_client::logging::init_logging;
use table_engine_client::pipeline;
use tracing::info;

const PROGRAM: &str = env!("CARGO_PKG_NAME");

#[derive(Parser, Debug)]
#[command(name = PROGRAM, version, about)]
struct Cli {
    /// <server URL> <username>:<password>|<private-key-path> [query name] [table name]
    #[arg(value_name = "ARGS")]
    args: Vec<String>,

    /// Debug-level diagnostics on stderr
    #[arg(short, long)]
    verbose: bool,

    /// JSON settings file
    #[arg(long, env = "ENGINE_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(long)]
    worker_name: Option<String>,

    #[arg(long)]
    heap_mb: Option<u32>,

    #[arg(long)]
    start_timeout_ms: Option<u64>,

    #[arg(long)]
    operation_timeout_ms: Option<u64>,

    /// Rows to keep from the end of the persistent query's table
    #[arg(long)]
    tail_rows: Option<u64>,
}

impl Cli {
    /// Defaults, then the settings file, then `ENGINE_*` variables, then flags
    fn client_config(&self) -> anyhow::Result<ClientConfig> {
        let config = match &self.config {
            Some(path) => ClientConfig::from_file(path)?,
            None => ClientConfig::default(),
        };
        let mut config = config.with_env()?;

        if let Some(name) = &self.worker_name {
            config.worker_name = name.clone();
        }
        if let Some(heap_mb) = self.heap_mb {
            config.heap_mb = heap_mb;
        }
        if let Some(ms) = self.start_timeout_ms {
            config.start_timeout_ms = ms;
        }
        if let Some(ms) = self.operation_timeout_ms {
            config.operation_timeout_ms = ms;
        }
        if let Some(rows) = self.tail_rows {
            config.tail_rows = rows;
        }
        Ok(config)
    }
}

fn usage() -> String {
    format!(
        "Usage:\n\
         {p} <server URL> <username>:<password> [query name] [table name]\n\
         {p} <server URL> <private-key-path> [query name] [table name]\n\
         \n\
         Examples:\n\
         {p} https://deephaven.mycompany.net:8123 iris:iris\n\
         {p} https://deephaven.mycompany.net:8123 /home/myusername/my-dh-private-key.txt \n\
         {p} https://deephaven.mycompany.net:8123 iris:iris MyPersistentQuery my_example_table",
        p = PROGRAM
    )
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if cli.args.len() != 2 && cli.args.len() != 4 {
        println!("{}", usage());
        std::process::exit(1);
    }

    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("✗ {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.client_config()?;
    let server_url = &cli.args[0];

    let server = ServerConfig::fetch(server_url, config.connect_timeout())
        .await
        .with_context(|| format!("Cannot load connection settings from {}", server_url))?;

    let credential = Credential::resolve(&cli.args[1]);
    info!("Using {} authentication", credential.kind());

    let factory = SessionFactory::new(server, credential, config.session_settings());

    let table = pipeline::create_and_retrieve_table_from_new_worker(&factory, &config)
        .await
        .context("Generating a table on a new worker failed")?;
    println!("Printing new table from test worker:");
    println!("{}", table);

    if let [_, _, query_name, table_name] = cli.args.as_slice() {
        let table = pipeline::retrieve_table_from_persistent_query(
            &factory,
            query_name,
            table_name,
            config.tail_rows,
        )
        .await
        .with_context(|| format!("Retrieving {} from {} failed", table_name, query_name))?;
        println!("Printing table {} from query {}: ", table_name, query_name);
        println!("{}", table);
    }

    Ok(())
}
