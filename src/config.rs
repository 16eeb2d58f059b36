use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use config::{Config, ConfigError, Environment, File};
use poem::http::StatusCode;
use serde::Deserialize;

use crate::acme::objects::ChallengeKind;

const DEFAULT_BASE_PATH: &str = "";
const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: i64 = 4000;
const DEFAULT_ACME_VERSION: &str = "ietf-draft";
const DEFAULT_AUTHZ_EXPIRY: &str = "5m";
const DEFAULT_MAX_VALIDITY: &str = "8760h";
const DEFAULT_NONCE_CAPACITY: i64 = 4096;
const DEFAULT_CA_CERT: &str = "ca/cert.pem";
const DEFAULT_CA_KEY: &str = "ca/key.pem";
const DEFAULT_ALLOWED_EXTENSION: &str = "subjectAltName";

/// Protocol dialect switch: url-header enforcement, the legacy RSA
/// strength floor and the duplicate-registration status all hang off it.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub enum AcmeVersion {
    #[serde(rename = "ietf-draft")]
    IetfDraft,
    #[serde(rename = "le")]
    Le,
}

impl AcmeVersion {
    pub fn requires_url_header(self) -> bool {
        matches!(self, Self::IetfDraft)
    }

    pub fn min_rsa_bits(self) -> Option<usize> {
        match self {
            Self::Le => Some(2048),
            Self::IetfDraft => None,
        }
    }

    pub fn duplicate_registration_status(self) -> StatusCode {
        match self {
            Self::IetfDraft => StatusCode::OK,
            Self::Le => StatusCode::CONFLICT,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub base_path: String,
    pub host: String,
    pub port: u16,
    pub acme_version: AcmeVersion,
    pub authz_expiry: String,
    pub max_validity: String,
    pub nonce_capacity: usize,
    pub scoped_authorizations: bool,
    pub require_oob: bool,
    pub terms: Option<String>,
    pub allowed_extensions: Vec<String>,
    pub challenges: ChallengeSettings,
    pub ca: CaSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChallengeSettings {
    pub http: bool,
    pub dns: bool,
    pub tlssni: bool,
    pub auto: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaSettings {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl Settings {
    /// Creates a new `Settings` instance from defaults, an optional TOML
    /// file and `BOOTCA`-prefixed environment overrides.
    ///
    /// # Errors
    /// Returns error if configuration parsing fails (e.g. invalid format).
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut s = Config::builder();
        s = s
            .set_default("base_path", DEFAULT_BASE_PATH)?
            .set_default("host", DEFAULT_HOST)?
            .set_default("port", DEFAULT_PORT)?
            .set_default("acme_version", DEFAULT_ACME_VERSION)?
            .set_default("authz_expiry", DEFAULT_AUTHZ_EXPIRY)?
            .set_default("max_validity", DEFAULT_MAX_VALIDITY)?
            .set_default("nonce_capacity", DEFAULT_NONCE_CAPACITY)?
            .set_default("scoped_authorizations", false)?
            .set_default("require_oob", false)?
            .set_default("allowed_extensions", vec![DEFAULT_ALLOWED_EXTENSION])?
            .set_default("challenges.http", true)?
            .set_default("challenges.dns", true)?
            .set_default("challenges.tlssni", false)?
            .set_default("challenges.auto", false)?
            .set_default("ca.cert", DEFAULT_CA_CERT)?
            .set_default("ca.key", DEFAULT_CA_KEY)?;

        let path = config_path.unwrap_or_else(|| PathBuf::from("bootca.toml"));
        s = s.add_source(File::from(path).required(false));

        s = s.add_source(
            Environment::with_prefix("BOOTCA")
                .separator("__")
                .try_parsing(true)
                .ignore_empty(true),
        );

        s.build()?.try_deserialize()
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must be greater than 0");
        }
        self.authz_expiry_duration()?;
        self.max_validity_duration()?;
        if self.nonce_capacity == 0 {
            anyhow::bail!("nonce_capacity must be greater than 0");
        }
        if self.enabled_challenges().is_empty() {
            anyhow::bail!("at least one challenge type must be enabled");
        }
        if let Some(terms) = &self.terms
            && terms.trim().is_empty()
        {
            anyhow::bail!("terms must not be empty when set");
        }
        if !self.base_path.is_empty() && !self.base_path.starts_with('/') {
            anyhow::bail!("base_path must start with /");
        }
        if self.ca.cert.as_os_str().is_empty() || self.ca.key.as_os_str().is_empty() {
            anyhow::bail!("ca.cert and ca.key must be set");
        }
        Ok(())
    }

    /// Lifetime of freshly created authorizations.
    ///
    /// # Errors
    /// Returns error if the configured value is not a duration or zero.
    pub fn authz_expiry_duration(&self) -> Result<Duration> {
        parse_duration("authz_expiry", &self.authz_expiry)
    }

    /// Ceiling on issued certificate validity.
    ///
    /// # Errors
    /// Returns error if the configured value is not a duration or zero.
    pub fn max_validity_duration(&self) -> Result<Duration> {
        parse_duration("max_validity", &self.max_validity)
    }

    /// Challenge types attached to new authorizations, in the stable
    /// order their indices are assigned.
    pub fn enabled_challenges(&self) -> Vec<ChallengeKind> {
        let mut kinds = Vec::new();
        if self.challenges.http {
            kinds.push(ChallengeKind::Http01);
        }
        if self.challenges.dns {
            kinds.push(ChallengeKind::Dns01);
        }
        if self.challenges.tlssni {
            kinds.push(ChallengeKind::TlsSni01);
        }
        if self.challenges.auto {
            kinds.push(ChallengeKind::Auto);
        }
        kinds
    }
}

fn parse_duration(name: &str, value: &str) -> Result<Duration> {
    let duration = humantime::parse_duration(value)
        .map_err(|err| anyhow::anyhow!("{name} invalid: {err}"))?;
    if duration.is_zero() {
        anyhow::bail!("{name} must be greater than 0");
    }
    Ok(duration)
}
