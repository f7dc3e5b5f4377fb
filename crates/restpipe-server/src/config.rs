use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use restpipe_core::tls::TlsMaterial;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_bind_interface")]
    pub bind_interface: String,
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
    #[serde(default = "default_http_bind")]
    pub http_bind: String,
    #[serde(default = "default_cert_path")]
    pub cert_path: PathBuf,
    #[serde(default = "default_key_filename")]
    pub key_filename: String,
    #[serde(default = "default_crt_filename")]
    pub crt_filename: String,
    #[serde(default = "default_ca_crt_filename")]
    pub ca_crt_filename: String,
    #[serde(default = "default_event_handler")]
    pub event_handler: String,
    #[serde(default = "default_state_change")]
    pub state_change: String,
    #[serde(default = "default_hostname_resolver")]
    pub hostname_resolver: String,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_connection_wait_timeout_secs")]
    pub connection_wait_timeout_secs: u64,
    #[serde(default = "default_event_timeout_secs")]
    pub event_timeout_secs: u64,
    #[serde(default = "default_unhandled_event_code")]
    pub unhandled_event_code: i32,
    #[serde(default = "default_unhandled_exception_code")]
    pub unhandled_exception_code: i32,
    #[serde(default)]
    pub statsd_addr: Option<String>,
}

impl ServerConfig {
    pub fn load() -> Result<Self> {
        let config_path = parse_config_path_arg(env::args().skip(1))?
            .or_else(resolve_server_config_path);

        let mut config = match config_path {
            Some(path) => load_config_yaml(&path)?,
            None => built_in_defaults()?,
        };

        config.apply_env_overrides(&|key| non_empty_env(key))?;
        config.normalize()?;
        Ok(config)
    }

    pub fn tls_material(&self) -> TlsMaterial {
        TlsMaterial {
            key: self.cert_path.join(&self.key_filename),
            crt: self.cert_path.join(&self.crt_filename),
            ca_crt: self.cert_path.join(&self.ca_crt_filename),
        }
    }

    /// Applies the `RP_*` environment surface on top of whatever the YAML
    /// carried. The lookup is injected so the mapping stays testable.
    fn apply_env_overrides(
        &mut self,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<()> {
        if let Some(value) = env("RP_SERVER_BIND_INTERFACE") {
            self.bind_interface = value;
        }
        if let Some(value) = env("RP_SERVER_BIND_PORT") {
            self.bind_port = parse_env("RP_SERVER_BIND_PORT", &value)?;
        }
        if let Some(value) = env("RP_SERVER_CERT_PATH") {
            self.cert_path = PathBuf::from(value);
        }
        if let Some(value) = env("RP_SERVER_KEY_FILENAME") {
            self.key_filename = value;
        }
        if let Some(value) = env("RP_SERVER_CRT_FILENAME") {
            self.crt_filename = value;
        }
        if let Some(value) = env("RP_CA_CRT_FILENAME") {
            self.ca_crt_filename = value;
        }
        if let Some(value) = env("RP_EVENT_HANDLER_FQ_CLASS") {
            self.event_handler = value;
        }
        if let Some(value) = env("RP_SERVER_CONNECTION_STATE_CHANGE_EVENT_CLASS")
        {
            self.state_change = value;
        }
        if let Some(value) = env("HEARTBEAT_INTERVAL_S") {
            self.heartbeat_interval_secs =
                parse_env("HEARTBEAT_INTERVAL_S", &value)?;
        }
        if let Some(value) = env("MESSAGE_LOOP_READ_TIMEOUT_S") {
            self.read_timeout_secs =
                parse_env("MESSAGE_LOOP_READ_TIMEOUT_S", &value)?;
        }
        if let Some(value) = env("DEFAULT_CONNECTION_WAIT_TIMEOUT_S") {
            self.connection_wait_timeout_secs =
                parse_env("DEFAULT_CONNECTION_WAIT_TIMEOUT_S", &value)?;
        }
        if let Some(value) = env("UNHANDLED_EVENT_CODE") {
            self.unhandled_event_code =
                parse_env("UNHANDLED_EVENT_CODE", &value)?;
        }
        if let Some(value) = env("UNHANDLED_EXCEPTION_CODE") {
            self.unhandled_exception_code =
                parse_env("UNHANDLED_EXCEPTION_CODE", &value)?;
        }
        if let Some(host) = env("RP_STATSD_HOST") {
            let port = env("RP_STATSD_PORT")
                .context("RP_STATSD_HOST is set but RP_STATSD_PORT is not")?;
            self.statsd_addr = Some(format!("{host}:{port}"));
        }

        Ok(())
    }

    fn normalize(&mut self) -> Result<()> {
        self.bind_interface = trim_owned(self.bind_interface.clone());
        self.http_bind = trim_owned(self.http_bind.clone());

        if self.bind_interface.is_empty() {
            self.bind_interface = default_bind_interface();
        }
        if self.http_bind.is_empty() {
            self.http_bind = default_http_bind();
        }
        if self.cert_path.as_os_str().is_empty() {
            self.cert_path = default_cert_path();
        }

        self.heartbeat_interval_secs = self.heartbeat_interval_secs.max(1);
        self.read_timeout_secs = self.read_timeout_secs.max(1);
        self.connection_wait_timeout_secs =
            self.connection_wait_timeout_secs.max(1);
        self.event_timeout_secs = self.event_timeout_secs.max(1);

        if self.unhandled_event_code == 0 || self.unhandled_exception_code == 0
        {
            bail!("reserved reply codes must be non-zero (zero means success)");
        }

        Ok(())
    }
}

fn built_in_defaults() -> Result<ServerConfig> {
    serde_yaml::from_str("{}").context("failed to build default config")
}

fn parse_config_path_arg<I>(mut args: I) -> Result<Option<PathBuf>>
where
    I: Iterator<Item = String>,
{
    let first = args.next();
    let second = args.next();

    if let Some(arg) = second {
        bail!(
            "too many arguments: {arg} (usage: restpipe-server [config-path])"
        );
    }

    if matches!(first.as_deref(), Some("-h" | "--help")) {
        bail!("usage: restpipe-server [config-path]");
    }

    Ok(first.map(PathBuf::from))
}

fn load_config_yaml(path: &Path) -> Result<ServerConfig> {
    let raw = std::fs::read(path).with_context(|| {
        format!("failed to read config file {}", path.display())
    })?;
    serde_yaml::from_slice(&raw).with_context(|| {
        format!("failed to parse YAML config {}", path.display())
    })
}

fn resolve_server_config_path() -> Option<PathBuf> {
    if let Some(path) = non_empty_env("RESTPIPE_SERVER_CONFIG_PATH") {
        return Some(PathBuf::from(path));
    }

    if let Some(home) = non_empty_env("HOME") {
        let home_yaml = PathBuf::from(&home).join("restpipe-server.yaml");
        if home_yaml.exists() {
            return Some(home_yaml);
        }
    }

    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let cwd_yaml = cwd.join("restpipe-server.yaml");
    if cwd_yaml.exists() {
        return Some(cwd_yaml);
    }

    None
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid value for {key}: {value}"))
}

fn trim_owned(value: String) -> String {
    value.trim().to_string()
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
    })
}

fn default_bind_interface() -> String {
    "0.0.0.0".to_string()
}

fn default_bind_port() -> u16 {
    1234
}

fn default_http_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_cert_path() -> PathBuf {
    PathBuf::from("/var/lib/restpipe")
}

fn default_key_filename() -> String {
    "restpipe.server.key.pem".to_string()
}

fn default_crt_filename() -> String {
    "restpipe.server.crt.pem".to_string()
}

fn default_ca_crt_filename() -> String {
    "ca.crt.pem".to_string()
}

fn default_event_handler() -> String {
    "default".to_string()
}

fn default_state_change() -> String {
    "log".to_string()
}

fn default_hostname_resolver() -> String {
    "dns".to_string()
}

fn default_heartbeat_interval_secs() -> u64 {
    10
}

fn default_read_timeout_secs() -> u64 {
    5
}

fn default_connection_wait_timeout_secs() -> u64 {
    20
}

fn default_event_timeout_secs() -> u64 {
    30
}

fn default_unhandled_event_code() -> i32 {
    -1
}

fn default_unhandled_exception_code() -> i32 {
    -2
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;

    use super::{ServerConfig, built_in_defaults, parse_config_path_arg};

    fn env_from(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn defaults_cover_every_field() {
        let config = built_in_defaults().expect("defaults");
        assert_eq!(config.bind_interface, "0.0.0.0");
        assert_eq!(config.bind_port, 1234);
        assert_eq!(config.cert_path, PathBuf::from("/var/lib/restpipe"));
        assert_eq!(config.key_filename, "restpipe.server.key.pem");
        assert_eq!(config.ca_crt_filename, "ca.crt.pem");
        assert_eq!(config.event_handler, "default");
        assert_eq!(config.hostname_resolver, "dns");
        assert_eq!(config.heartbeat_interval_secs, 10);
        assert_eq!(config.connection_wait_timeout_secs, 20);
        assert_eq!(config.unhandled_event_code, -1);
        assert_eq!(config.unhandled_exception_code, -2);
        assert!(config.statsd_addr.is_none());
    }

    #[test]
    fn yaml_fields_override_defaults() {
        let config: ServerConfig = serde_yaml::from_str(
            "bind_port: 4433\nheartbeat_interval_secs: 3\nstate_change: noop\n",
        )
        .expect("parse");
        assert_eq!(config.bind_port, 4433);
        assert_eq!(config.heartbeat_interval_secs, 3);
        assert_eq!(config.state_change, "noop");
    }

    #[test]
    fn unknown_yaml_keys_are_rejected() {
        let parsed =
            serde_yaml::from_str::<ServerConfig>("bind_prot: 4433\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn env_overrides_take_precedence() {
        let env = env_from(&[
            ("RP_SERVER_BIND_INTERFACE", "10.1.2.3"),
            ("RP_SERVER_BIND_PORT", "4444"),
            ("HEARTBEAT_INTERVAL_S", "7"),
            ("UNHANDLED_EVENT_CODE", "-100"),
            ("RP_STATSD_HOST", "metrics.internal"),
            ("RP_STATSD_PORT", "8125"),
        ]);

        let mut config = built_in_defaults().expect("defaults");
        config
            .apply_env_overrides(&|key| env.get(key).cloned())
            .expect("overrides");

        assert_eq!(config.bind_interface, "10.1.2.3");
        assert_eq!(config.bind_port, 4444);
        assert_eq!(config.heartbeat_interval_secs, 7);
        assert_eq!(config.unhandled_event_code, -100);
        assert_eq!(
            config.statsd_addr.as_deref(),
            Some("metrics.internal:8125")
        );
    }

    #[test]
    fn statsd_host_without_port_is_rejected() {
        let env = env_from(&[("RP_STATSD_HOST", "metrics.internal")]);

        let mut config = built_in_defaults().expect("defaults");
        let applied = config.apply_env_overrides(&|key| env.get(key).cloned());
        assert!(applied.is_err());
    }

    #[test]
    fn unparsable_env_value_is_rejected() {
        let env = env_from(&[("RP_SERVER_BIND_PORT", "not-a-port")]);

        let mut config = built_in_defaults().expect("defaults");
        let applied = config.apply_env_overrides(&|key| env.get(key).cloned());
        assert!(applied.is_err());
    }

    #[test]
    fn zero_reserved_code_fails_normalization() {
        let mut config = built_in_defaults().expect("defaults");
        config.unhandled_event_code = 0;
        assert!(config.normalize().is_err());
    }

    #[test]
    fn tls_material_joins_cert_path() {
        let mut config = built_in_defaults().expect("defaults");
        config.cert_path = PathBuf::from("/etc/restpipe");
        let material = config.tls_material();
        assert_eq!(
            material.key,
            PathBuf::from("/etc/restpipe/restpipe.server.key.pem")
        );
        assert_eq!(
            material.ca_crt,
            PathBuf::from("/etc/restpipe/ca.crt.pem")
        );
    }

    #[test]
    fn config_path_arg_parsing() {
        let path = parse_config_path_arg(
            vec!["/etc/restpipe/server.yaml".to_string()].into_iter(),
        )
        .expect("parse");
        assert_eq!(path, Some(PathBuf::from("/etc/restpipe/server.yaml")));

        assert!(
            parse_config_path_arg(
                vec!["a".to_string(), "b".to_string()].into_iter()
            )
            .is_err()
        );
        assert!(
            parse_config_path_arg(vec!["--help".to_string()].into_iter())
                .is_err()
        );
    }
}
