// Copyright 2025 tupledb Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # tupledb CLI
//!
//! Command-line client for tupledb servers.
//!
//! ## Key Commands
//!
//! - `tupledb ping`: Check every given server and report its latency
//! - `tupledb call`: Call a stored function (outputs raw JSON for scripting)
//! - `tupledb eval`: Evaluate an expression on the server
//! - `tupledb spaces`: Dump the space and index schema
//!
//! Connection options (`--user`, `--password`, `--connections`, `--retries`,
//! `--timeout-ms`) go before the command. Addresses may be given as a
//! comma-separated list, in which case requests are spread across them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use argh::FromArgs;
use serde_json::{json, Value};
use tracing::warn;
use tupledb_client::{Client, ClientConfig, DdlMetadataProvider, RetryConfig};

#[derive(FromArgs, Debug)]
/// tupledb - resilient client for tuple-store servers
pub struct Cli {
    /// user to authenticate as (guest when omitted)
    #[argh(option, short = 'u')]
    pub user: Option<String>,

    /// password for --user
    #[argh(option, short = 'p', default = "String::new()")]
    pub password: String,

    /// connections opened per server
    #[argh(option, short = 'c', default = "1")]
    pub connections: usize,

    /// retries of network failures after the first attempt
    #[argh(option, short = 'r', default = "0")]
    pub retries: usize,

    /// budget for one attempt in milliseconds
    #[argh(option, short = 't', long = "timeout-ms", default = "2000")]
    pub timeout_ms: u64,

    #[argh(subcommand)]
    pub command: Commands,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
pub enum Commands {
    Ping(PingArgs),
    Call(CallArgs),
    Eval(EvalArgs),
    Spaces(SpacesArgs),
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "ping")]
/// ping every given server
pub struct PingArgs {
    /// server addresses (host:port)
    #[argh(positional)]
    pub addresses: Vec<String>,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "call")]
/// call a stored function
pub struct CallArgs {
    /// server address, or a comma-separated list
    #[argh(positional)]
    pub address: String,

    /// function name
    #[argh(positional)]
    pub function: String,

    /// arguments as a JSON array (or a single JSON value)
    #[argh(positional)]
    pub args: Option<String>,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "eval")]
/// evaluate an expression
pub struct EvalArgs {
    /// server address, or a comma-separated list
    #[argh(positional)]
    pub address: String,

    /// expression to evaluate
    #[argh(positional)]
    pub expression: String,

    /// arguments as a JSON array (or a single JSON value)
    #[argh(positional)]
    pub args: Option<String>,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "spaces")]
/// print spaces and their indexes
pub struct SpacesArgs {
    /// server address, or a comma-separated list
    #[argh(positional)]
    pub address: String,

    /// read the schema through this function instead of the system spaces
    #[argh(option)]
    pub ddl_function: Option<String>,
}

impl Cli {
    /// Client configuration built from the global options.
    pub fn config(&self) -> Result<ClientConfig> {
        let timeout = Duration::from_millis(self.timeout_ms);
        let mut config = ClientConfig::default()
            .with_connections(self.connections)
            .with_connect_timeout(timeout)
            .with_read_timeout(timeout)
            .with_request_timeout(timeout);

        if self.retries > 0 {
            config = config.with_retry(RetryConfig::attempts(self.retries));
        }
        if let Some(user) = &self.user {
            config = config.with_credentials(user.clone(), self.password.clone());
        }

        config.validate()?;
        Ok(config)
    }
}

/// Runs the parsed command and returns the JSON it prints.
pub async fn run(cli: Cli) -> Result<Value> {
    let config = cli.config()?;

    match cli.command {
        Commands::Ping(args) => ping(config, &args.addresses).await,
        Commands::Call(args) => {
            let client = connect(config, &args.address).await?;
            let arguments = parse_args(args.args.as_deref())?;
            let result = client.call(&args.function, arguments).await?;
            client.close();
            Ok(result)
        }
        Commands::Eval(args) => {
            let client = connect(config, &args.address).await?;
            let arguments = parse_args(args.args.as_deref())?;
            let result = client.eval(&args.expression, arguments).await?;
            client.close();
            Ok(result)
        }
        Commands::Spaces(args) => {
            let mut client = connect(config, &args.address).await?;
            if let Some(function) = args.ddl_function {
                let provider = DdlMetadataProvider::with_function(client.executor(), function);
                client = client.with_metadata_provider(Arc::new(provider));
            }
            let result = spaces(&client).await;
            client.close();
            result
        }
    }
}

async fn connect(config: ClientConfig, address: &str) -> Result<Client> {
    let addresses = split_addresses(address);
    if addresses.is_empty() {
        anyhow::bail!("No server address given");
    }
    Client::connect(config, &addresses)
        .await
        .with_context(|| format!("Failed to connect to {}", address))
}

/// Pings each address on its own connection; unreachable servers are
/// reported rather than failing the whole command.
async fn ping(config: ClientConfig, addresses: &[String]) -> Result<Value> {
    if addresses.is_empty() {
        anyhow::bail!("No server address given");
    }

    let mut results = Vec::with_capacity(addresses.len());
    for address in addresses {
        let started = Instant::now();
        let outcome = match Client::connect(config.clone(), &[address.as_str()]).await {
            Ok(client) => {
                let outcome = client.ping().await;
                client.close();
                outcome
            }
            Err(e) => Err(e),
        };

        results.push(match outcome {
            Ok(()) => json!({
                "address": address,
                "ok": true,
                "latency_ms": started.elapsed().as_secs_f64() * 1000.0,
            }),
            Err(e) => {
                warn!("Ping to {} failed: {}", address, e);
                json!({
                    "address": address,
                    "ok": false,
                    "error": e.to_string(),
                })
            }
        });
    }
    Ok(Value::Array(results))
}

async fn spaces(client: &Client) -> Result<Value> {
    let mut result = Vec::new();
    for space in client.metadata().get_spaces().await? {
        let indexes = client.metadata().get_indexes(&space.name).await?;
        let mut entry = serde_json::to_value(&space)?;
        entry["indexes"] = serde_json::to_value(indexes)?;
        result.push(entry);
    }
    Ok(Value::Array(result))
}

/// Splits `a:1,b:2` into its addresses, ignoring empty entries.
pub fn split_addresses(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parses the optional JSON argument list; no arguments means `[]`.
pub fn parse_args(args: Option<&str>) -> Result<Value> {
    match args {
        None => Ok(json!([])),
        Some(raw) => serde_json::from_str(raw).with_context(|| format!("Invalid JSON in args: {}", raw)),
    }
}
