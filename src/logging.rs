//! tracing subscriber setup

use crate::config::LoggingConfig;
use tracing::Level;

/// Install the global fmt subscriber. Safe to call more than once; later
/// calls keep whatever subscriber is already in place.
pub fn init(config: &LoggingConfig) {
    let level = config.level.parse::<Level>().unwrap_or(Level::INFO);
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        let config = LoggingConfig {
            level: "debug".to_string(),
        };
        init(&config);
        init(&config);
        tracing::debug!("logging initialised");
    }
}
