/*!
 * Cinder Server Main Entry Point
 *
 * Parses the flags, routes structured logs into the `log` facade and
 * starts one cluster node.
 */

use anyhow::*;
use cinder::{server, Config};
use clap::Parser;
use slog::{o, Drain};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Main function - entry point for a cinder node
///
/// 1. Initialize logging (respects RUST_LOG, e.g. RUST_LOG=debug)
/// 2. Parse flags and environment
/// 3. Open the raft engine, bootstrap or join
/// 4. Serve clients until the process is killed
fn main() -> Result<()> {
    env_logger::init();

    let config = Config::parse();

    let drain = slog_stdlog::StdLog.fuse();
    let logger = slog::Logger::root(drain, o!());

    log::info!("starting cinder node {}", config.node_id);
    server::run(&config, logger)
}
