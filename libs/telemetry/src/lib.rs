//! Tracing and metric helpers for Gramflow services.
//!
//! Every binary calls [`install`] once at startup; libraries only use the
//! `tracing` macros and the label helpers below.

use anyhow::Result;
use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

mod context;
mod metrics;

pub use context::EventLabels;
pub use metrics::record_counter;

static INIT: OnceCell<()> = OnceCell::new();

/// Installs the global tracing subscriber configured from `RUST_LOG`.
///
/// Set `LOG_JSON=true` to emit newline-delimited JSON instead of the human
/// readable format. Calling this twice is a no-op.
pub fn install(service_name: &str) -> Result<()> {
    if INIT.get().is_some() {
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json_logs = std::env::var("LOG_JSON")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let fmt_layer = if json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .ok();

    tracing::info!(service = service_name, "telemetry installed");
    INIT.set(()).ok();
    Ok(())
}
