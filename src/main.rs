//! echo-bench: a load generator for TCP echo servers
//!
//! Opens many concurrent connections to one server, sends a fixed payload
//! on each connection a fixed number of times, waits for a reply after
//! every send, and reports aggregate throughput once every connection
//! is done.
//!
//! Features:
//! - One independent worker per connection, strictly request-then-reply
//! - Connect and per-operation timeouts so a dead peer cannot hang the run
//! - Optional verification of echoed bytes
//! - Ctrl-C stops the run and still prints a report
//! - Built-in raw echo server (`--serve`) to benchmark against
//! - Configuration via CLI arguments or TOML file

mod config;
mod driver;
mod report;
mod server;
mod worker;

use config::{Config, OutputFormat};
use std::net::SocketAddr;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    if config.serve {
        runtime.block_on(serve(config))
    } else {
        runtime.block_on(bench(config))
    }
}

/// Run the load driver and print its report.
async fn bench(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            // Without the signal handler the run can only end on its own.
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    let report = driver::run_until(&config, shutdown).await?;

    match config.output {
        OutputFormat::Text => println!("{report}"),
        OutputFormat::Json => println!("{}", report.to_json()?),
    }

    Ok(())
}

/// Run the built-in echo server on the target address until Ctrl-C.
async fn serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = config.target.parse()?;
    let server = server::Server::bind(addr)?;

    tokio::select! {
        res = server.run() => res.map_err(|e| e as Box<dyn std::error::Error>)?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down echo server"),
    }

    Ok(())
}
