//! Tracing subscriber setup for the CLI.
//!
//! Logs always go to stderr so `--json` output on stdout stays parseable.
//! Filter priority: `DOCPILOT_LOG`, then `RUST_LOG`, then the verbosity default.

use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "DOCPILOT_LOG";

fn build_filter(verbose: bool) -> EnvFilter {
    if let Ok(directives) = std::env::var(LOG_ENV)
        && let Ok(filter) = EnvFilter::try_new(&directives)
    {
        return filter;
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "docpilot=debug,info" } else { "warn,docpilot=info" })
    })
}

/// Installs the global subscriber. Later calls are no-ops.
pub fn init(verbose: bool, json: bool) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(build_filter(verbose))
        .with_writer(std::io::stderr)
        .with_target(verbose);

    let _ = if json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };
}
