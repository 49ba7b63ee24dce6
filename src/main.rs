use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use clap_serde_derive::ClapSerde;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::api::AppState;
use crate::config::Config;
use crate::inference::host::ModelHost;

#[macro_export]
macro_rules! exit_err {
    ($code:expr, $fmt:expr $(, $arg:expr)*) => {
        {
            error!($fmt $(, $arg)*);
            std::process::exit($code);
        }
    };
}

mod api;
mod config;
mod error;
mod inference;
mod telemetry;

#[cfg(unix)]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

const DEFAULT_CONFIG_FILE: &str = "ChatRunner.toml";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env, default_value = DEFAULT_CONFIG_FILE)]
    config_file: String,

    /// Configuration options
    #[command(flatten)]
    pub opt_config: <Config as ClapSerde>::Opt,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = match Config::from_toml(&args.config_file) {
        Ok(conf) => conf.merge(args.opt_config),
        Err(err) => {
            if args.config_file == DEFAULT_CONFIG_FILE {
                Config::default().merge(args.opt_config)
            } else {
                eprintln!(
                    "Failed to read configuration file {} with error: {}",
                    args.config_file, err
                );
                std::process::exit(1);
            }
        }
    };
    telemetry::init_telemetry(config.debug);

    // The listener is only bound once the model is ready
    let model_path = config.model_path.clone();
    let load_config = config.clone();
    let host = match tokio::task::spawn_blocking(move || ModelHost::load(&model_path, &load_config))
        .await?
    {
        Ok(host) => host,
        Err(err) => exit_err!(1, "{}", err),
    };

    let state = AppState {
        host: Arc::new(host),
        max_length_ceiling: config.max_length_ceiling,
    };
    let router = api::router(state);

    let listener = TcpListener::bind(format!("{}:{}", config.address, config.port)).await?;
    info!("Listening on {}", listener.local_addr()?);
    info!(
        "Supported features: avx: {}, neon: {}, simd128: {}, f16c: {}",
        candle_core::utils::with_avx(),
        candle_core::utils::with_neon(),
        candle_core::utils::with_simd128(),
        candle_core::utils::with_f16c()
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutting down..."),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
}
