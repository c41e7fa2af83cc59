pub mod etcd;

use std::fs;
use std::net::SocketAddr;

use log::{debug, trace};
use pingora::server::configuration::{Opt, ServerConf};
use pingora_error::{Error, ErrorType::*, OrErr, Result};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError, ValidationErrors, ValidationErrorsKind};

#[derive(Default, Debug, Serialize, Deserialize, Validate)]
pub struct Config {
    #[serde(default)]
    pub pingora: ServerConf,

    #[validate(nested)]
    pub reliefops: ReliefOps,
}

// Config file load and validation
impl Config {
    pub fn load_from_yaml<P>(path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path).or_err_with(ReadError, || {
            format!("Unable to read conf file from {path}")
        })?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    // config file load entry point
    pub fn load_yaml_with_opt_override(opt: &Opt) -> Result<Self> {
        if let Some(path) = &opt.conf {
            let mut conf = Self::load_from_yaml(path)?;
            conf.merge_with_opt(opt);
            Ok(conf)
        } else {
            Error::e_explain(ReadError, "No path specified")
        }
    }

    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        let conf: Config =
            serde_yaml::from_str(conf_str).or_err(ReadError, "Unable to parse yaml conf")?;

        trace!("Loaded conf with {} listeners", conf.reliefops.listeners.len());

        if let Err(e) = conf.validate() {
            return Error::e_explain(
                FileReadError,
                format!("Conf file valid failed: {}", describe_invalid(&e)),
            );
        }

        Ok(conf)
    }

    pub fn merge_with_opt(&mut self, opt: &Opt) {
        if opt.daemon {
            self.pingora.daemon = true;
        }
    }
}

/// Field paths and rule codes of a failed validation.
///
/// `ValidationErrors`' own `Display` echoes the rejected values, which would
/// put operator passwords and the token secret on stderr.
fn describe_invalid(errors: &ValidationErrors) -> String {
    let mut failures = Vec::new();
    collect_invalid("", errors, &mut failures);
    failures.sort();
    failures.join(", ")
}

fn collect_invalid(path: &str, errors: &ValidationErrors, out: &mut Vec<String>) {
    for (field, kind) in errors.errors() {
        let field_path = if path.is_empty() {
            field.to_string()
        } else {
            format!("{path}.{field}")
        };
        match kind {
            ValidationErrorsKind::Field(errs) => {
                for err in errs {
                    out.push(format!("{field_path}: {}", err.code));
                }
            }
            ValidationErrorsKind::Struct(nested) => collect_invalid(&field_path, nested, out),
            ValidationErrorsKind::List(items) => {
                for (index, nested) in items {
                    collect_invalid(&format!("{field_path}[{index}]"), nested, out);
                }
            }
        }
    }
}

#[derive(Default, Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "ReliefOps::validate_store"))]
pub struct ReliefOps {
    #[validate(length(min = 1))]
    #[validate(nested)]
    pub listeners: Vec<Listener>,

    #[serde(default)]
    pub store: Store,
    #[validate(nested)]
    pub etcd: Option<Etcd>,

    #[validate(nested)]
    pub auth: Auth,
    #[serde(default)]
    #[validate(nested)]
    pub intake: Intake,

    pub log: Option<Log>,
    pub prometheus: Option<Prometheus>,
    pub status: Option<Status>,
}

impl ReliefOps {
    fn validate_store(&self) -> Result<(), ValidationError> {
        if self.store.backend == StoreBackend::Etcd && self.etcd.is_none() {
            Err(ValidationError::new("etcd_required_for_etcd_backend"))
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Listener::validate_tls_for_offer_h2"))]
pub struct Listener {
    pub address: SocketAddr,
    pub tls: Option<Tls>,
    #[serde(default)]
    pub offer_h2: bool,
}

impl Listener {
    fn validate_tls_for_offer_h2(&self) -> Result<(), ValidationError> {
        if self.offer_h2 && self.tls.is_none() {
            Err(ValidationError::new("tls_required_for_h2"))
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tls {
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Etcd,
}

#[derive(Clone, Default, Debug, Serialize, Deserialize)]
pub struct Store {
    #[serde(default)]
    pub backend: StoreBackend,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Etcd {
    #[validate(length(min = 1))]
    pub host: Vec<String>,
    #[serde(default = "Etcd::default_prefix")]
    #[validate(length(min = 1))]
    pub prefix: String,
    pub timeout: Option<u32>,
    pub connect_timeout: Option<u32>,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Etcd {
    fn default_prefix() -> String {
        "/reliefops".to_string()
    }
}

#[derive(Clone, Default, Debug, Serialize, Deserialize, Validate)]
pub struct Auth {
    /// HMAC secret used to sign operator session tokens.
    #[validate(length(min = 16))]
    pub secret: String,
    /// Session lifetime in seconds.
    #[serde(default = "Auth::default_token_ttl")]
    #[validate(range(min = 60))]
    pub token_ttl: u64,
    #[validate(length(min = 1))]
    #[validate(nested)]
    pub operators: Vec<Operator>,
}

impl Auth {
    fn default_token_ttl() -> u64 {
        12 * 60 * 60
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Operator {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 8))]
    pub password: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Intake {
    #[serde(default = "Intake::default_rate_limit")]
    #[validate(nested)]
    pub rate_limit: Option<RateLimit>,
    /// Key the rate limit on `X-Forwarded-For` / `X-Real-IP` instead of the
    /// peer address. Only safe behind a proxy that overwrites those headers.
    #[serde(default)]
    pub trust_forwarded_headers: bool,
}

impl Default for Intake {
    fn default() -> Self {
        Self {
            rate_limit: Self::default_rate_limit(),
            trust_forwarded_headers: false,
        }
    }
}

impl Intake {
    fn default_rate_limit() -> Option<RateLimit> {
        Some(RateLimit {
            time_window: 60,
            count: 10,
        })
    }
}

/// Maximum submissions per client address per window.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct RateLimit {
    #[validate(range(min = 1))]
    pub time_window: u32,
    #[validate(range(min = 1))]
    pub count: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Log {
    pub path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Prometheus {
    pub address: SocketAddr,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Status {
    pub address: SocketAddr,
}
