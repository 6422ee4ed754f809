//! Process-wide logger setup.

use std::sync::Once;

static INIT: Once = Once::new();

/// Install `env_logger`, letting `RUST_LOG` override `default_level`.
///
/// Safe to call more than once; only the first call has an effect.
pub fn init(default_level: &str) {
    INIT.call_once(|| {
        let env = env_logger::Env::default().default_filter_or(default_level);
        let _ = env_logger::Builder::from_env(env)
            .format_timestamp_secs()
            .try_init();
    });
}
