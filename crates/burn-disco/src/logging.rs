//! Logging setup

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Parse a level name, falling back to `INFO`
pub fn parse_level(name: &str) -> Level {
    Level::from_str(name.trim()).unwrap_or(Level::INFO)
}

/// Install a global fmt subscriber at `level`
///
/// Returns `false` if a global subscriber was already set.
pub fn init_logging(level: &str) -> bool {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(parse_level(level))
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).is_ok()
}
