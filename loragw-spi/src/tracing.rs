//! Provide tracing, tailored to this crate.
//!
//! Library code only emits events; a binary calls
//! [`init_journald_or_stdout`] once at startup to install a subscriber.
//! Verbosity is picked at runtime through the default level and `RUST_LOG`,
//! so the SPI layer can be silent or chatty without a rebuild.
//!
//! The rest of the crate can `use crate::tracing::prelude::*` for the
//! `trace!()`, `debug!()`, `info!()`, `warn!()`, and `error!()` macros.

use std::env;
use time::OffsetDateTime;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{format::Writer, time::FormatTime},
    prelude::*,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

/// Initialize logging.
///
/// If running under systemd, use journald; otherwise fall back to stdout
/// with `default_level` unless `RUST_LOG` says otherwise.
pub fn init_journald_or_stdout(default_level: LevelFilter) {
    if env::var("JOURNAL_STREAM").is_ok() {
        if let Ok(layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(env_filter(default_level))
                .with(layer)
                .init();
        } else {
            use_stdout(default_level);
            error!("Failed to initialize journald logging, using stdout.");
        }
    } else {
        use_stdout(default_level);
    }
}

fn env_filter(default_level: LevelFilter) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(default_level.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy()
}

fn use_stdout(default_level: LevelFilter) {
    tracing_subscriber::registry()
        .with(env_filter(default_level))
        .with(tracing_subscriber::fmt::layer().with_timer(LocalTimer))
        .init();
}

// Timestamps in local time to the nearest second. Bus traces are read by
// people correlating them with a logic analyzer, not by machines.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or(OffsetDateTime::now_utc());
        let stamp = now
            .format(time::macros::format_description!("[hour]:[minute]:[second]"))
            .map_err(|_| std::fmt::Error)?;
        write!(w, "{}", stamp)
    }
}
