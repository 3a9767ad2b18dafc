use std::sync::Once;

use log::LevelFilter;
use logforth::diagnostic::ThreadLocalDiagnostic;

const DEFAULT_FILTER: &str = "info,pegaflow_regcache=debug";

static INIT: Once = Once::new();

/// Installs the stderr logger with the crate's default filter.
pub(crate) fn ensure_initialized() {
    ensure_initialized_with(DEFAULT_FILTER);
}

/// Installs a stderr logger filtered by `RUST_LOG`, falling back to
/// `default_filter`. No-op when the host process already owns a logger.
pub(crate) fn ensure_initialized_with(default_filter: &str) {
    if log::max_level() != LevelFilter::Off {
        return;
    }

    INIT.call_once(|| {
        let directives = std::env::var("RUST_LOG")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| default_filter.to_string());
        let filter: logforth::filter::EnvFilter = directives
            .parse()
            .unwrap_or_else(|_| DEFAULT_FILTER.into());

        logforth::starter_log::builder()
            .dispatch(|d| {
                d.filter(filter)
                    .diagnostic(ThreadLocalDiagnostic::default())
                    .append(logforth::append::Stderr::default())
            })
            .apply();
        log::debug!("regcache logging initialized: {directives}");
    });
}
