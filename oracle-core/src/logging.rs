//! Logging setup shared by the binaries.

use std::sync::Once;

use tracing_subscriber::{util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// Progress at info level.
    Normal,
    /// Every append and replacement, as the build makes it.
    Debug,
    /// No output; used from tests.
    Test,
}

impl Profile {
    pub fn default_filter(self) -> &'static str {
        match self {
            Profile::Normal => "oracle_core=info,oracle_cli=info",
            Profile::Debug => "oracle_core=debug,oracle_cli=debug",
            Profile::Test => "off",
        }
    }
}

static INIT_ONCE: Once = Once::new();

/// Install the global subscriber. Only the first call has any effect.
/// `RUST_LOG` overrides the profile's filter.
pub fn init(profile: Profile) {
    INIT_ONCE.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(profile.default_filter()));
        // Logs go to stderr; stdout carries command output.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .finish()
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init(Profile::Test);
        init(Profile::Debug);
        init(Profile::Test);
    }

    #[test]
    fn debug_filter_is_wider() {
        assert!(Profile::Debug.default_filter().contains("debug"));
        assert!(Profile::Normal.default_filter().contains("info"));
        assert_eq!(Profile::Test.default_filter(), "off");
    }
}
