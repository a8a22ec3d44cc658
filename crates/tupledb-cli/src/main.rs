//! # tupledb CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Check servers
//! tupledb ping 127.0.0.1:3301 127.0.0.1:3302
//!
//! # Call a function (outputs raw JSON)
//! tupledb call 127.0.0.1:3301 box.info
//! tupledb --user admin --password secret call 127.0.0.1:3301,127.0.0.1:3302 echo '[1, "two"]'
//!
//! # Evaluate an expression
//! tupledb eval 127.0.0.1:3301 'return ...' '[42]'
//!
//! # Dump the schema
//! tupledb spaces 127.0.0.1:3301
//! ```

use anyhow::Result;
use tupledb_cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Logs go to stderr so stdout stays pipeable; RUST_LOG overrides the level.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let output = tupledb_cli::run(cli).await?;
    println!("{}", serde_json::to_string(&output)?);

    Ok(())
}
