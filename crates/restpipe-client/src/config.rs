use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use restpipe_core::tls::TlsMaterial;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    #[serde(default = "default_target_hostname")]
    pub target_hostname: String,
    #[serde(default = "default_target_port")]
    pub target_port: u16,
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
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    #[serde(default = "default_min_reattempt_wait_secs")]
    pub min_reattempt_wait_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_event_timeout_secs")]
    pub event_timeout_secs: u64,
    #[serde(default = "default_unhandled_event_code")]
    pub unhandled_event_code: i32,
    #[serde(default = "default_unhandled_exception_code")]
    pub unhandled_exception_code: i32,
    #[serde(default)]
    pub statsd_addr: Option<String>,
}

impl ClientConfig {
    pub fn load() -> Result<Self> {
        let config_path = parse_config_path_arg(env::args().skip(1))?
            .or_else(resolve_client_config_path);

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
        if let Some(value) = env("RP_CLIENT_TARGET_HOSTNAME") {
            self.target_hostname = value;
        }
        if let Some(value) = env("RP_CLIENT_TARGET_PORT") {
            self.target_port = parse_env("RP_CLIENT_TARGET_PORT", &value)?;
        }
        if let Some(value) = env("RP_CLIENT_CERT_PATH") {
            self.cert_path = PathBuf::from(value);
        }
        if let Some(value) = env("RP_CLIENT_KEY_FILENAME") {
            self.key_filename = value;
        }
        if let Some(value) = env("RP_CLIENT_CRT_FILENAME") {
            self.crt_filename = value;
        }
        if let Some(value) = env("RP_CA_CRT_FILENAME") {
            self.ca_crt_filename = value;
        }
        if let Some(value) = env("RP_EVENT_HANDLER_FQ_CLASS") {
            self.event_handler = value;
        }
        if let Some(value) = env("RP_CLIENT_CONNECTION_STATE_CHANGE_EVENT_CLASS")
        {
            self.state_change = value;
        }
        if let Some(value) = env("HEARTBEAT_INTERVAL_S") {
            self.heartbeat_interval_secs =
                parse_env("HEARTBEAT_INTERVAL_S", &value)?;
        }
        if let Some(value) = env("HEARTBEAT_TIMEOUT_S") {
            self.heartbeat_timeout_secs =
                parse_env("HEARTBEAT_TIMEOUT_S", &value)?;
        }
        if let Some(value) = env("MINIMAL_CONNECTION_FAIL_REATTEMPT_WAIT_TIME_S")
        {
            self.min_reattempt_wait_secs = parse_env(
                "MINIMAL_CONNECTION_FAIL_REATTEMPT_WAIT_TIME_S",
                &value,
            )?;
        }
        if let Some(value) = env("MESSAGE_LOOP_READ_TIMEOUT_S") {
            self.read_timeout_secs =
                parse_env("MESSAGE_LOOP_READ_TIMEOUT_S", &value)?;
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
        self.target_hostname = trim_owned(self.target_hostname.clone());
        self.http_bind = trim_owned(self.http_bind.clone());

        if self.target_hostname.is_empty() {
            bail!("client config missing `target_hostname`");
        }
        if self.http_bind.is_empty() {
            self.http_bind = default_http_bind();
        }
        if self.cert_path.as_os_str().is_empty() {
            self.cert_path = default_cert_path();
        }

        self.heartbeat_interval_secs = self.heartbeat_interval_secs.max(1);
        self.heartbeat_timeout_secs = self.heartbeat_timeout_secs.max(1);
        self.read_timeout_secs = self.read_timeout_secs.max(1);
        self.event_timeout_secs = self.event_timeout_secs.max(1);

        if self.unhandled_event_code == 0 || self.unhandled_exception_code == 0
        {
            bail!("reserved reply codes must be non-zero (zero means success)");
        }

        Ok(())
    }
}

fn built_in_defaults() -> Result<ClientConfig> {
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
            "too many arguments: {arg} (usage: restpipe-client [config-path])"
        );
    }

    if matches!(first.as_deref(), Some("-h" | "--help")) {
        bail!("usage: restpipe-client [config-path]");
    }

    Ok(first.map(PathBuf::from))
}

fn load_config_yaml(path: &Path) -> Result<ClientConfig> {
    let raw = std::fs::read(path).with_context(|| {
        format!("failed to read config file {}", path.display())
    })?;
    serde_yaml::from_slice(&raw).with_context(|| {
        format!("failed to parse YAML config {}", path.display())
    })
}

fn resolve_client_config_path() -> Option<PathBuf> {
    if let Some(path) = non_empty_env("RESTPIPE_CLIENT_CONFIG_PATH") {
        return Some(PathBuf::from(path));
    }

    if let Some(home) = non_empty_env("HOME") {
        let home_yaml = PathBuf::from(&home).join("restpipe-client.yaml");
        if home_yaml.exists() {
            return Some(home_yaml);
        }
    }

    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let cwd_yaml = cwd.join("restpipe-client.yaml");
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

fn default_target_hostname() -> String {
    "localhost".to_string()
}

fn default_target_port() -> u16 {
    1234
}

fn default_http_bind() -> String {
    "127.0.0.1:8081".to_string()
}

fn default_cert_path() -> PathBuf {
    PathBuf::from("/var/lib/restpipe")
}

fn default_key_filename() -> String {
    "restpipe.client.key.pem".to_string()
}

fn default_crt_filename() -> String {
    "restpipe.client.crt.pem".to_string()
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

fn default_heartbeat_interval_secs() -> u64 {
    10
}

fn default_heartbeat_timeout_secs() -> u64 {
    20
}

fn default_min_reattempt_wait_secs() -> u64 {
    5
}

fn default_read_timeout_secs() -> u64 {
    5
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

    use super::built_in_defaults;

    fn env_from(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn defaults_cover_every_field() {
        let config = built_in_defaults().expect("defaults");
        assert_eq!(config.target_hostname, "localhost");
        assert_eq!(config.target_port, 1234);
        assert_eq!(config.http_bind, "127.0.0.1:8081");
        assert_eq!(config.key_filename, "restpipe.client.key.pem");
        assert_eq!(config.heartbeat_interval_secs, 10);
        assert_eq!(config.heartbeat_timeout_secs, 20);
        assert_eq!(config.min_reattempt_wait_secs, 5);
    }

    #[test]
    fn env_overrides_take_precedence() {
        let env = env_from(&[
            ("RP_CLIENT_TARGET_HOSTNAME", "pipe.example.net"),
            ("RP_CLIENT_TARGET_PORT", "4433"),
            ("HEARTBEAT_TIMEOUT_S", "9"),
            ("MINIMAL_CONNECTION_FAIL_REATTEMPT_WAIT_TIME_S", "2"),
        ]);

        let mut config = built_in_defaults().expect("defaults");
        config
            .apply_env_overrides(&|key| env.get(key).cloned())
            .expect("overrides");

        assert_eq!(config.target_hostname, "pipe.example.net");
        assert_eq!(config.target_port, 4433);
        assert_eq!(config.heartbeat_timeout_secs, 9);
        assert_eq!(config.min_reattempt_wait_secs, 2);
    }

    #[test]
    fn blank_target_hostname_fails_normalization() {
        let mut config = built_in_defaults().expect("defaults");
        config.target_hostname = "   ".to_string();
        assert!(config.normalize().is_err());
    }

    #[test]
    fn tls_material_uses_the_client_filenames() {
        let mut config = built_in_defaults().expect("defaults");
        config.cert_path = PathBuf::from("/etc/restpipe");
        let material = config.tls_material();
        assert_eq!(
            material.crt,
            PathBuf::from("/etc/restpipe/restpipe.client.crt.pem")
        );
    }
}
