use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Registry;

/// `RUST_LOG` wins over the debug flag when it is set.
pub(crate) fn init_telemetry(debug: bool) {
    let default_level = if debug { "DEBUG" } else { "INFO" };
    let filter = EnvFilter::try_from_default_env().unwrap_or(EnvFilter::new(default_level));

    Registry::default()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
