// logging.rs: tracing subscriber bootstrap

use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber.
///
/// `RUST_LOG` wins when set. Otherwise `developer` selects between `debug`
/// and `info`, the same split the console makes between developer prints
/// and regular prints.
pub fn init(developer: bool) {
    let default_level = if developer { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    // A second init (tests, embedding) is not an error.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
