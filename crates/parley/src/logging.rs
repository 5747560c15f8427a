//! Log output setup.

use parley_room::ClientOptions;
use tracing_subscriber::EnvFilter;

/// Installs a `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `options.log_level`.
///
/// Returns `false` if a global subscriber was already installed, in which
/// case nothing changes. Safe to call more than once.
pub fn init(options: &ClientOptions) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&options.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_noop() {
        let options = ClientOptions::default();
        let _ = init(&options);
        assert!(!init(&options));
    }
}
