use std::path::PathBuf;
use std::str::FromStr;

use crate::engine::TransitionPolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Server settings, read once at startup from `RENTD_*` environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub approval_policy: TransitionPolicy,
    pub tls: Option<TlsPaths>,
    pub metrics_port: Option<u16>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "rentd".into(),
            max_connections: 256,
            compact_threshold: 1000,
            approval_policy: TransitionPolicy::default(),
            tls: None,
            metrics_port: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let tls = match (lookup("RENTD_TLS_CERT"), lookup("RENTD_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert: cert.into(),
                key: key.into(),
            }),
            _ => return Err(ConfigError::IncompleteTls),
        };

        Ok(Self {
            port: parse_or(&lookup, "RENTD_PORT", defaults.port)?,
            bind: lookup("RENTD_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("RENTD_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            password: lookup("RENTD_PASSWORD").unwrap_or(defaults.password),
            max_connections: parse_or(&lookup, "RENTD_MAX_CONNECTIONS", defaults.max_connections)?,
            compact_threshold: parse_or(
                &lookup,
                "RENTD_COMPACT_THRESHOLD",
                defaults.compact_threshold,
            )?,
            approval_policy: parse_or(&lookup, "RENTD_APPROVAL_POLICY", defaults.approval_policy)?,
            tls,
            metrics_port: lookup("RENTD_METRICS_PORT")
                .map(|raw| parse_value("RENTD_METRICS_PORT", &raw))
                .transpose()?,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T: FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: raw.to_string(),
    })
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    Invalid { key: &'static str, value: String },
    IncompleteTls,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { key, value } => write!(f, "invalid value for {key}: {value:?}"),
            ConfigError::IncompleteTls => {
                write!(f, "both RENTD_TLS_CERT and RENTD_TLS_KEY must be set, or neither")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.listen_addr(), "0.0.0.0:5433");
        assert_eq!(cfg.data_dir, PathBuf::from("./data"));
        assert_eq!(cfg.password, "rentd");
        assert_eq!(cfg.max_connections, 256);
        assert_eq!(cfg.compact_threshold, 1000);
        assert_eq!(cfg.approval_policy, TransitionPolicy::Revocable);
        assert!(cfg.tls.is_none());
        assert!(cfg.metrics_port.is_none());
    }

    #[test]
    fn overrides_apply() {
        let cfg = config(&[
            ("RENTD_PORT", "6000"),
            ("RENTD_BIND", "127.0.0.1"),
            ("RENTD_APPROVAL_POLICY", "Final"),
            ("RENTD_METRICS_PORT", "9100"),
            ("RENTD_TLS_CERT", "/etc/rentd.crt"),
            ("RENTD_TLS_KEY", "/etc/rentd.key"),
        ])
        .unwrap();
        assert_eq!(cfg.listen_addr(), "127.0.0.1:6000");
        assert_eq!(cfg.approval_policy, TransitionPolicy::Final);
        assert_eq!(cfg.metrics_port, Some(9100));
        assert_eq!(cfg.tls.unwrap().key, PathBuf::from("/etc/rentd.key"));
    }

    #[test]
    fn bad_number_is_reported() {
        let err = config(&[("RENTD_MAX_CONNECTIONS", "lots")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "RENTD_MAX_CONNECTIONS",
                value: "lots".into()
            }
        );
    }

    #[test]
    fn unknown_policy_is_reported() {
        assert!(matches!(
            config(&[("RENTD_APPROVAL_POLICY", "sometimes")]),
            Err(ConfigError::Invalid {
                key: "RENTD_APPROVAL_POLICY",
                ..
            })
        ));
    }

    #[test]
    fn half_tls_config_rejected() {
        assert_eq!(
            config(&[("RENTD_TLS_CERT", "/etc/rentd.crt")]).unwrap_err(),
            ConfigError::IncompleteTls
        );
    }
}
