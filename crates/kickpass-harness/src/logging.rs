//! Tracing setup for harness tests

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// Static initialization guard
static INIT: Once = Once::new();

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "kickpass_harness=info";

/// Install a fmt subscriber writing through the test harness' capture.
///
/// Safe to call from every test; only the first call installs anything, and
/// a subscriber installed by someone else is left in place.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(false)
            .try_init();
    });
}
