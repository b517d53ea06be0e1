//! Purpose: `tunnel-stub` entrypoint serving the in-memory tunnel service over HTTP.
//! Role: Local development target for clients configured with an `http://` endpoint.
//! Invariants: Tables given on the command line exist before the listener accepts requests.
#![allow(clippy::result_large_err)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use tabletunnel::api::{Error, ErrorKind, Schema, TunnelStub};
use tabletunnel::serve::{self, DEFAULT_MAX_BODY_BYTES, ServeConfig};

#[derive(Parser)]
#[command(
    name = "tunnel-stub",
    version,
    about = "Serve an in-memory table tunnel for local testing",
    after_help = r#"EXAMPLES
  $ tunnel-stub --table 'sales.orders={"columns":[{"name":"id","type":"bigint"}]}'
  $ tunnel-stub --bind 127.0.0.1:9710 --table sales.orders=@orders.schema.json"#
)]
struct Cli {
    #[arg(long, default_value = "127.0.0.1:9710", help = "Address to listen on")]
    bind: SocketAddr,
    #[arg(long, help = "Allow binding a non-loopback address")]
    allow_non_loopback: bool,
    #[arg(
        long = "table",
        value_name = "PROJECT.TABLE=SCHEMA",
        help = "Create a table; SCHEMA is inline JSON or @path to a JSON file (repeatable)"
    )]
    tables: Vec<String>,
    #[arg(long, default_value_t = 24 * 60 * 60, help = "Session lifetime in seconds")]
    session_ttl_secs: u64,
    #[arg(long, default_value_t = DEFAULT_MAX_BODY_BYTES, help = "Largest accepted request body")]
    max_body_bytes: usize,
}

fn main() {
    let exit_code = match run() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("tunnel-stub: {err}");
            match err.kind() {
                ErrorKind::Usage => 2,
                _ => 1,
            }
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<(), Error> {
    let cli = Cli::parse();
    serve::init_tracing();

    let stub = TunnelStub::new().with_session_ttl(Duration::from_secs(cli.session_ttl_secs));
    for spec in &cli.tables {
        let (project, table, schema) = parse_table_arg(spec)?;
        stub.create_table(&project, &table, schema)?;
        info!(project = %project, table = %table, "table created");
    }

    let config = ServeConfig {
        bind: cli.bind,
        allow_non_loopback: cli.allow_non_loopback,
        max_body_bytes: cli.max_body_bytes,
    };
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to start runtime")
                .with_source(err)
        })?;
    runtime.block_on(serve::serve(Arc::new(stub), config))
}

fn parse_table_arg(spec: &str) -> Result<(String, String, Schema), Error> {
    let usage = || {
        Error::new(ErrorKind::Usage)
            .with_message(format!("--table {spec:?} must look like PROJECT.TABLE=SCHEMA"))
    };
    let (name, schema) = spec.split_once('=').ok_or_else(usage)?;
    let (project, table) = name.trim().split_once('.').ok_or_else(usage)?;
    let text = match schema.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("failed to read schema file {path}"))
                .with_source(err)
        })?,
        None => schema.to_string(),
    };
    let schema: Schema = serde_json::from_str(&text).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("invalid schema for {name}"))
            .with_source(err)
    })?;
    Ok((project.to_string(), table.to_string(), schema))
}
