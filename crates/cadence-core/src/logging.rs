//! Subscriber setup for hosts that do not install their own.

use std::env;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, fmt};

/// Filter used when `CADENCE_LOG` is unset or invalid.
fn fallback_filter() -> EnvFilter {
    EnvFilter::new(if env::var("DEBUG").is_ok() {
        "cadence=debug,info"
    } else {
        "cadence=info,warn"
    })
}

/// Install a global subscriber.
///
/// `CADENCE_LOG` takes an `EnvFilter` directive. `CADENCE_LOG_FORMAT=json`
/// switches to JSON lines; anything else is compact text.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn try_init_tracing() -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_env("CADENCE_LOG").unwrap_or_else(|_| fallback_filter());
    let format = env::var("CADENCE_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => registry.with(fmt::layer().json().with_ansi(false)).try_init(),
        _ => registry.with(fmt::layer().compact()).try_init(),
    }
}

/// Like [`try_init_tracing`], ignoring an already-installed subscriber.
pub fn init_tracing() {
    if try_init_tracing().is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
