use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::jose::Jwk;
use crate::problem::Problem;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Valid,
    Invalid,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ChallengeKind {
    #[serde(rename = "http-01")]
    Http01,
    #[serde(rename = "dns-01")]
    Dns01,
    #[serde(rename = "tls-sni-01")]
    TlsSni01,
    #[serde(rename = "auto")]
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identifier {
    pub r#type: String,
    pub value: String,
}

impl Identifier {
    pub fn dns(value: impl Into<String>) -> Self {
        Self {
            r#type: "dns".to_string(),
            value: value.into(),
        }
    }
}

/// An ACME account. The id is the hex thumbprint of the account key, so
/// it is derived rather than allocated and never collides for one key.
#[derive(Debug, Clone)]
pub struct Registration {
    pub id: String,
    pub url: String,
    pub key: Jwk,
    pub contact: Vec<String>,
    pub agreement: Option<String>,
}

impl Registration {
    pub fn marshal(&self) -> Value {
        let mut doc = json!({
            "id": self.id,
            "key": self.key,
            "contact": self.contact,
            "status": "good",
        });
        if let Some(agreement) = &self.agreement {
            doc["agreement"] = json!(agreement);
        }
        doc
    }
}

/// One authorization a certificate order is waiting on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Requirement {
    pub r#type: String,
    pub status: AuthorizationStatus,
    pub url: String,
}

/// A client's request for a certificate covering a set of DNS names.
#[derive(Debug, Clone)]
pub struct Order {
    pub id: String,
    pub url: String,
    pub thumbprint: String,
    pub status: OrderStatus,
    pub not_before: Option<String>,
    pub not_after: Option<String>,
    pub requirements: Vec<Requirement>,
    pub certificate: Option<String>,
}

impl Order {
    pub fn new(id: String, url: String, thumbprint: String) -> Self {
        Self {
            id,
            url,
            thumbprint,
            status: OrderStatus::Pending,
            not_before: None,
            not_after: None,
            requirements: Vec::new(),
            certificate: None,
        }
    }

    pub fn finalize_url(&self) -> String {
        format!("{}/finalize", self.url)
    }

    /// pending → ready once every requirement has been validated.
    pub fn mark_ready(&mut self) {
        if self.status == OrderStatus::Pending
            && self
                .requirements
                .iter()
                .all(|requirement| requirement.status == AuthorizationStatus::Valid)
        {
            self.status = OrderStatus::Ready;
        }
    }

    pub fn marshal(&self) -> Value {
        let mut doc = json!({
            "status": self.status,
            "requirements": self.requirements,
            "finalize": self.finalize_url(),
        });
        if let Some(not_before) = &self.not_before {
            doc["notBefore"] = json!(not_before);
        }
        if let Some(not_after) = &self.not_after {
            doc["notAfter"] = json!(not_after);
        }
        if let Some(certificate) = &self.certificate {
            doc["certificate"] = json!(certificate);
        }
        doc
    }
}

/// One proof-of-control attempt under an authorization. Indices are
/// stable insertion order and the URL embeds them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Challenge {
    pub r#type: ChallengeKind,
    pub status: ChallengeStatus,
    pub token: String,
    pub url: String,
}

impl Challenge {
    pub fn marshal(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// Proof that an account controls one DNS identifier.
#[derive(Debug, Clone)]
pub struct Authorization {
    pub id: String,
    pub url: String,
    pub thumbprint: String,
    pub identifier: Identifier,
    pub scope: Option<String>,
    pub expires: OffsetDateTime,
    pub challenges: Vec<Challenge>,
    pub status: AuthorizationStatus,
}

impl Authorization {
    /// Recomputes the cached status: expiry wins, then any valid
    /// challenge. Callers persist the result through the store.
    pub fn refresh(&mut self) {
        self.refresh_at(OffsetDateTime::now_utc());
    }

    pub fn refresh_at(&mut self, now: OffsetDateTime) {
        if now >= self.expires {
            self.status = AuthorizationStatus::Invalid;
        } else if self
            .challenges
            .iter()
            .any(|challenge| challenge.status == ChallengeStatus::Valid)
        {
            self.status = AuthorizationStatus::Valid;
        }
    }

    pub fn as_requirement(&self) -> Requirement {
        Requirement {
            r#type: "authorization".to_string(),
            status: self.status,
            url: self.url.clone(),
        }
    }

    pub fn marshal(&self) -> Value {
        let mut doc = json!({
            "status": self.status,
            "identifier": self.identifier,
            "expires": self.expires.format(&Rfc3339).unwrap_or_default(),
            "challenges": self.challenges,
        });
        if let Some(scope) = &self.scope {
            doc["scope"] = json!(scope);
        }
        doc
    }
}

/// An issued DER-encoded X.509 certificate. Immutable once stored.
#[derive(Debug, Clone)]
pub struct Certificate {
    pub id: String,
    pub url: String,
    pub body: Vec<u8>,
}

/// Challenge-type-specific verification. Production validators probe the
/// network (well-known HTTP fetch, DNS TXT lookup, TLS-SNI handshake)
/// and are registered by the embedding server; none ship in this crate.
/// The built-in auto kind bypasses this hook and completes immediately.
#[async_trait]
pub trait ChallengeValidator: Send + Sync {
    async fn validate(
        &self,
        challenge: &Challenge,
        authz: &Authorization,
        payload: &Value,
    ) -> Result<ChallengeStatus, Problem>;
}
