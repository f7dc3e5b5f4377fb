use tracing_subscriber::EnvFilter;

/// Initializes the process-wide tracing subscriber.
///
/// The filter comes from `env_key` when set, then `RUST_LOG`, then the
/// built-in default directive. Under systemd on Linux the journald layer
/// is preferred; everywhere else a stderr formatter is installed.
pub fn init_logging(
    default_filter: &str,
    env_key: &str,
    service_name: &str,
) {
    let env_filter = EnvFilter::try_from_env(env_key)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    if init_journald(env_filter, service_name) {
        return;
    }

    let env_filter = EnvFilter::try_from_env(env_key)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

#[cfg(target_os = "linux")]
fn init_journald(env_filter: EnvFilter, service_name: &str) -> bool {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let under_systemd = std::env::var_os("JOURNAL_STREAM").is_some()
        || std::env::var_os("INVOCATION_ID").is_some();
    if !under_systemd {
        return false;
    }

    match tracing_journald::layer() {
        Ok(layer) => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(layer)
                .init();
            true
        }
        Err(err) => {
            eprintln!(
                "{service_name}: journald init failed, falling back to stderr formatter: {err}"
            );
            false
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn init_journald(_env_filter: EnvFilter, _service_name: &str) -> bool {
    false
}
