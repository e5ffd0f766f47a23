use std::env;

use tracing_subscriber::EnvFilter;
#[cfg(target_os = "linux")]
use tracing_subscriber::layer::SubscriberExt;
#[cfg(target_os = "linux")]
use tracing_subscriber::util::SubscriberInitExt;

/// Env vars that override the configured verbosity, first match wins.
const FILTER_ENV_KEYS: [&str; 2] = ["STOMPHUB_LOG", "RUST_LOG"];

/// Targets raised by the config `debug` switch; everything else stays
/// at warn.
const BROKER_TARGETS: [&str; 3] =
    ["stomphub_server", "stomphub_broker", "stomphub_proto"];

/// Installs the global subscriber. `debug` is the broker config switch:
/// it raises the stomphub targets from info to debug. An explicit
/// `STOMPHUB_LOG` or `RUST_LOG` wins over the switch. Under systemd the
/// output goes to journald, otherwise to an stderr formatter.
pub fn init(debug: bool) {
    let filter = resolve_filter(debug);

    #[cfg(target_os = "linux")]
    let filter = match init_journald(filter) {
        Ok(()) => return,
        Err(filter) => filter,
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn resolve_filter(debug: bool) -> EnvFilter {
    for key in FILTER_ENV_KEYS {
        if let Some(raw) =
            env::var(key).ok().filter(|value| !value.trim().is_empty())
        {
            if let Ok(filter) = EnvFilter::try_new(raw) {
                return filter;
            }
        }
    }
    EnvFilter::new(broker_directives(if debug { "debug" } else { "info" }))
}

fn broker_directives(level: &str) -> String {
    let mut directives = vec!["warn".to_string()];
    directives
        .extend(BROKER_TARGETS.iter().map(|target| format!("{target}={level}")));
    directives.join(",")
}

/// Journald is only attempted when systemd is supervising the process.
/// On any failure the filter is handed back for the stderr path.
#[cfg(target_os = "linux")]
fn init_journald(filter: EnvFilter) -> Result<(), EnvFilter> {
    let supervised = env::var_os("JOURNAL_STREAM").is_some()
        || env::var_os("INVOCATION_ID").is_some();
    if !supervised {
        return Err(filter);
    }

    match tracing_journald::layer() {
        Ok(journald) => {
            tracing_subscriber::registry().with(filter).with(journald).init();
            Ok(())
        }
        Err(_) => Err(filter),
    }
}

#[cfg(test)]
mod tests {
    use super::broker_directives;

    #[test]
    fn directives_pin_broker_targets_and_default_to_warn() {
        let info = broker_directives("info");
        assert!(info.starts_with("warn,"));
        assert!(info.contains("stomphub_broker=info"));
        assert!(info.contains("stomphub_server=info"));
        assert!(info.contains("stomphub_proto=info"));

        let debug = broker_directives("debug");
        assert!(debug.contains("stomphub_broker=debug"));
        assert!(!debug.contains("=info"));
    }
}
