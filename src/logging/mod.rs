//! Logging setup: stderr console output plus an optional span-timing file.

use anyhow::Context;
use std::fs::File;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_FILTER: &str = "pacer=warn";
const PROFILE_FILTER: &str = "pacer=trace";

/// Console logs go to stderr so they never land on the progress line.
///
/// With `profile` set, every closed span under the `pacer` target is written
/// to that file along with its busy and idle time.
pub fn init(profile: Option<&Path>) -> anyhow::Result<()> {
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let profile_layer = match profile {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("failed to create profile output {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_filter(EnvFilter::new(PROFILE_FILTER)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .with(profile_layer)
        .try_init()?;

    Ok(())
}
