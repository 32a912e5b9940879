use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "KCAL_LOG";

/// Install the global subscriber. Logs go to stderr so `--json` output on
/// stdout stays parseable. `KCAL_LOG` takes the usual filter directives
/// (`info`, `kcal_core=debug`, ...); the default is `warn`.
pub(crate) fn init() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    // A second init (tests) is harmless.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
