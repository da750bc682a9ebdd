//! Tracing initialisation for the `chainsink` binary.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber, logging to stderr. `RUST_LOG`, when set,
/// wins over `level`.
pub fn init(level: &str, json: bool) {
    let filter = filter(std::env::var("RUST_LOG").ok().as_deref(), level);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn filter(rust_log: Option<&str>, level: &str) -> EnvFilter {
    rust_log
        .filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_new(level).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::level_filters::LevelFilter;

    #[test]
    fn rust_log_overrides_the_level_flag() {
        let hint = |rust_log: Option<&str>, level: &str| filter(rust_log, level).max_level_hint();
        assert_eq!(hint(Some("chainsink_core=trace"), "warn"), Some(LevelFilter::TRACE));
        assert_eq!(hint(None, "debug"), Some(LevelFilter::DEBUG));
        assert_eq!(hint(Some("  "), "warn"), Some(LevelFilter::WARN));
    }
}
