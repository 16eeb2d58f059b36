use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use poem::http::StatusCode;
use ring::rand::{SecureRandom, SystemRandom};
use serde_json::{Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::acme::objects::{
    Authorization, AuthorizationStatus, Certificate, Challenge, ChallengeKind, ChallengeStatus,
    ChallengeValidator, Identifier, Order, OrderStatus, Registration,
};
use crate::acme::transport::VerifiedRequest;
use crate::acme::urls::UrlMap;
use crate::ca::CertificateAuthority;
use crate::config::{AcmeVersion, Settings};
use crate::nonce::NoncePool;
use crate::policy::CsrPolicy;
use crate::problem::Problem;
use crate::store::{Object, ObjectKind, ObjectStore};

const CHALLENGE_TOKEN_BYTES: usize = 16;
const DEFAULT_VALIDITY_DAYS: i64 = 365;

/// Successful handler output; the HTTP layer turns it into a response.
#[derive(Debug)]
pub struct Reply {
    pub status: StatusCode,
    pub location: Option<String>,
    pub link: Option<String>,
    pub body: ReplyBody,
}

#[derive(Debug)]
pub enum ReplyBody {
    Json(Value),
    Der(Vec<u8>),
    Empty,
}

impl Reply {
    pub fn json(status: StatusCode, body: Value) -> Self {
        Self {
            status,
            location: None,
            link: None,
            body: ReplyBody::Json(body),
        }
    }

    pub fn der(status: StatusCode, body: Vec<u8>) -> Self {
        Self {
            status,
            location: None,
            link: None,
            body: ReplyBody::Der(body),
        }
    }

    pub fn empty(status: StatusCode) -> Self {
        Self {
            status,
            location: None,
            link: None,
            body: ReplyBody::Empty,
        }
    }

    pub fn with_location(mut self, url: impl Into<String>) -> Self {
        self.location = Some(url.into());
        self
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }
}

/// The ACME protocol state machine: registrations, orders,
/// authorizations, challenges, finalization and issuance. All shared
/// state lives in the object store; the engine itself is immutable after
/// construction and shared behind an `Arc`.
pub struct Engine {
    version: AcmeVersion,
    terms: Option<String>,
    scoped_authorizations: bool,
    authz_expiry: time::Duration,
    max_validity: time::Duration,
    challenge_kinds: Vec<ChallengeKind>,
    policy: CsrPolicy,
    urls: UrlMap,
    store: ObjectStore,
    nonces: NoncePool,
    ca: CertificateAuthority,
    validators: HashMap<ChallengeKind, Arc<dyn ChallengeValidator>>,
    rng: SystemRandom,
}

impl Engine {
    /// Builds the engine from validated settings and a ready CA.
    ///
    /// # Errors
    /// Returns error if a configured duration cannot be represented.
    pub fn new(settings: &Settings, ca: CertificateAuthority) -> Result<Self> {
        let authz_expiry = time::Duration::try_from(settings.authz_expiry_duration()?)?;
        let max_validity = time::Duration::try_from(settings.max_validity_duration()?)?;
        Ok(Self {
            version: settings.acme_version,
            terms: settings.terms.clone(),
            scoped_authorizations: settings.scoped_authorizations,
            authz_expiry,
            max_validity,
            challenge_kinds: settings.enabled_challenges(),
            policy: CsrPolicy::new(settings.allowed_extensions.clone()),
            urls: UrlMap::new(&settings.host, settings.port, &settings.base_path),
            store: ObjectStore::new(),
            nonces: NoncePool::new(settings.nonce_capacity),
            ca,
            validators: HashMap::new(),
            rng: SystemRandom::new(),
        })
    }

    /// Registers an out-of-process validator for one challenge kind.
    #[must_use]
    pub fn with_validator(
        mut self,
        kind: ChallengeKind,
        validator: Arc<dyn ChallengeValidator>,
    ) -> Self {
        self.validators.insert(kind, validator);
        self
    }

    pub fn urls(&self) -> &UrlMap {
        &self.urls
    }

    pub fn version(&self) -> AcmeVersion {
        self.version
    }

    pub fn nonces(&self) -> &NoncePool {
        &self.nonces
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    /// The endpoint map served at /directory.
    pub fn directory(&self) -> Value {
        let mut doc = json!({
            "newNonce": self.urls.endpoint("new-nonce"),
            "newAccount": self.urls.endpoint("new-acct"),
            "newOrder": self.urls.endpoint("new-app"),
            "newAuthz": self.urls.endpoint("new-authz"),
        });
        if let Some(terms) = &self.terms {
            doc["meta"] = json!({ "terms-of-service": terms });
        }
        doc
    }

    /// POST /new-acct (and the legacy /new-reg alias).
    ///
    /// # Errors
    /// Returns a problem when the contact payload is malformed.
    pub async fn new_registration(&self, request: &VerifiedRequest) -> Result<Reply, Problem> {
        let url = self.urls.object(ObjectKind::Registration, &request.thumbprint);
        if self.store.registration(&request.thumbprint).await.is_some() {
            debug!(thumbprint = %request.thumbprint, "registration already exists");
            return Ok(Reply::empty(self.version.duplicate_registration_status())
                .with_location(url));
        }

        let contact = parse_contact(&request.payload)?;
        let registration = Registration {
            id: request.thumbprint.clone(),
            url: url.clone(),
            key: request.account_key.clone(),
            contact,
            agreement: None,
        };
        let body = registration.marshal();
        self.store.put(Object::Registration(registration)).await;
        info!(thumbprint = %request.thumbprint, "registered new account");

        let mut reply = Reply::json(StatusCode::CREATED, body).with_location(url);
        if let Some(terms) = &self.terms {
            reply = reply.with_link(format!("<{terms}>;rel=\"terms-of-service\""));
        }
        Ok(reply)
    }

    /// POST /reg/{id}. Only the owning key may update, and only with an
    /// agreement matching the configured terms.
    ///
    /// # Errors
    /// Returns a problem on unknown accounts, foreign ids or bad payloads.
    pub async fn update_registration(
        &self,
        request: &VerifiedRequest,
        id: &str,
    ) -> Result<Reply, Problem> {
        let mut registration = self
            .store
            .registration(&request.thumbprint)
            .await
            .ok_or_else(|| Problem::unauthorized("no account for this key"))?;
        if id != request.thumbprint {
            return Err(Problem::unauthorized(
                "account key does not own this registration",
            ));
        }

        if request.payload.get("contact").is_some() {
            registration.contact = parse_contact(&request.payload)?;
        }
        if let Some(agreement) = request.payload.get("agreement") {
            let agreement = agreement
                .as_str()
                .ok_or_else(|| Problem::malformed("agreement must be a string"))?;
            match &self.terms {
                Some(terms) if terms == agreement => {
                    registration.agreement = Some(agreement.to_string());
                }
                _ => {
                    return Err(Problem::malformed(
                        "agreement does not match the current terms of service",
                    ));
                }
            }
        }

        let body = registration.marshal();
        self.store.put(Object::Registration(registration)).await;
        Ok(Reply::json(StatusCode::OK, body))
    }

    /// POST /new-app (and the /new-order alias).
    ///
    /// # Errors
    /// Returns a problem for unknown accounts or unparsable payloads.
    pub async fn new_order(&self, request: &VerifiedRequest) -> Result<Reply, Problem> {
        self.require_account(request).await?;
        let names = parse_identifiers(&request.payload)?;
        let not_before = parse_rfc3339_field(&request.payload, "notBefore")?;
        let not_after = parse_rfc3339_field(&request.payload, "notAfter")?;

        let id = Uuid::new_v4().to_string();
        let url = self.urls.object(ObjectKind::Order, &id);
        let mut order = Order::new(id, url.clone(), request.thumbprint.clone());
        order.not_before = not_before;
        order.not_after = not_after;

        for name in &names {
            let authz = self
                .find_or_create_authz(&request.thumbprint, name, Some(&url))
                .await;
            order.requirements.push(authz.as_requirement());
        }
        // Reused authorizations may already be valid, in which case the
        // order is ready from the moment it exists.
        order.mark_ready();

        info!(order = %order.id, names = names.len(), "created order");
        let body = order.marshal();
        self.store.put(Object::Order(order)).await;
        Ok(Reply::json(StatusCode::CREATED, body).with_location(url))
    }

    /// POST /new-authz: a pre-order authorization for one identifier.
    ///
    /// # Errors
    /// Returns a problem for unknown accounts or a missing identifier.
    pub async fn new_authorization(&self, request: &VerifiedRequest) -> Result<Reply, Problem> {
        self.require_account(request).await?;
        let name = request
            .payload
            .get("identifier")
            .and_then(|identifier| identifier.get("value"))
            .and_then(Value::as_str)
            .ok_or_else(|| Problem::malformed("payload missing identifier value"))?;

        let authz = self
            .find_or_create_authz(&request.thumbprint, name, None)
            .await;
        let url = authz.url.clone();
        Ok(Reply::json(StatusCode::CREATED, authz.marshal()).with_location(url))
    }

    /// POST /app/{id}: the marshalled order.
    ///
    /// # Errors
    /// Returns not-found for unknown orders.
    pub async fn order(&self, id: &str) -> Result<Reply, Problem> {
        let order = self.store.order(id).await.ok_or(Problem::NotFound)?;
        Ok(Reply::json(StatusCode::OK, order.marshal()))
    }

    /// POST /authz/{id}: the canonical challenge-0 view of an
    /// authorization.
    ///
    /// # Errors
    /// Returns a problem for unknown accounts or authorizations.
    pub async fn authorization(
        &self,
        request: &VerifiedRequest,
        id: &str,
    ) -> Result<Reply, Problem> {
        self.require_account(request).await?;
        let mut authz = self
            .store
            .authorization(id)
            .await
            .ok_or(Problem::NotFound)?;
        authz.refresh();
        self.store.put(Object::Authorization(authz.clone())).await;

        let token = authz
            .challenges
            .first()
            .map(|challenge| challenge.token.clone())
            .unwrap_or_default();
        let body = json!({
            "status": authz.status,
            "identifier": authz.identifier,
            "challenges": [{
                "type": "http-01",
                "token": token,
                "url": format!("{}/0", authz.url),
            }],
        });
        Ok(Reply::json(StatusCode::CREATED, body))
    }

    /// POST /authz/{id}/{index}: drives one challenge, refreshes the
    /// authorization and propagates into orders before responding.
    ///
    /// # Errors
    /// Returns not-found for unknown authz/index, a problem otherwise.
    pub async fn update_challenge(
        &self,
        request: &VerifiedRequest,
        id: &str,
        index: &str,
    ) -> Result<Reply, Problem> {
        let mut authz = self
            .store
            .authorization(id)
            .await
            .ok_or(Problem::NotFound)?;
        let index: usize = index.parse().map_err(|_| Problem::NotFound)?;
        if index >= authz.challenges.len() {
            return Err(Problem::NotFound);
        }
        self.require_account(request).await?;
        if authz.thumbprint != request.thumbprint {
            return Err(Problem::unauthorized(
                "account key does not own this authorization",
            ));
        }

        let challenge = authz.challenges[index].clone();
        let outcome = match challenge.r#type {
            ChallengeKind::Auto => ChallengeStatus::Valid,
            kind => match self.validators.get(&kind) {
                Some(validator) => {
                    validator
                        .validate(&challenge, &authz, &request.payload)
                        .await?
                }
                None => challenge.status,
            },
        };

        authz.challenges[index].status = outcome;
        authz.refresh();
        self.store.put(Object::Authorization(authz.clone())).await;
        self.store.update_orders_for(&authz).await;
        debug!(authz = %authz.id, index, status = ?outcome, "challenge updated");
        Ok(Reply::json(StatusCode::OK, authz.challenges[index].marshal()))
    }

    /// GET /{type}/{id}: the marshalled entity. Registrations are never
    /// fetchable; certificates come back as raw DER.
    ///
    /// # Errors
    /// Returns unauthorized for registrations, not-found for unknown ids.
    pub async fn fetch(&self, kind: ObjectKind, id: &str) -> Result<Reply, Problem> {
        if kind == ObjectKind::Registration {
            return Err(Problem::unauthorized("registrations are not fetchable"));
        }
        match self.store.get(kind, id).await {
            Some(Object::Authorization(mut authz)) => {
                authz.refresh();
                self.store.put(Object::Authorization(authz.clone())).await;
                Ok(Reply::json(StatusCode::OK, authz.marshal()))
            }
            Some(Object::Certificate(certificate)) => {
                Ok(Reply::der(StatusCode::OK, certificate.body))
            }
            Some(object) => Ok(Reply::json(StatusCode::OK, object.marshal())),
            None => Err(Problem::NotFound),
        }
    }

    /// GET /authz/{id}/{index}: one challenge, after a status refresh.
    ///
    /// # Errors
    /// Returns not-found for unknown authz/index.
    pub async fn fetch_challenge(&self, id: &str, index: &str) -> Result<Reply, Problem> {
        let mut authz = self
            .store
            .authorization(id)
            .await
            .ok_or(Problem::NotFound)?;
        let index: usize = index.parse().map_err(|_| Problem::NotFound)?;
        let challenge = authz
            .challenges
            .get(index)
            .cloned()
            .ok_or(Problem::NotFound)?;
        authz.refresh();
        self.store.put(Object::Authorization(authz)).await;
        Ok(Reply::json(StatusCode::OK, challenge.marshal()))
    }

    /// POST /app/{id}/finalize: validates the CSR, issues and stores the
    /// certificate, and flips the order to valid. The order sits in
    /// processing while the CSR is checked and reverts to ready on any
    /// failure, the one deliberate non-atomic mutation in the engine.
    ///
    /// # Errors
    /// Returns a problem on unknown accounts/orders or CSR rejection.
    pub async fn finalize(&self, request: &VerifiedRequest, id: &str) -> Result<Reply, Problem> {
        self.require_account(request).await?;
        let mut order = self.store.order(id).await.ok_or(Problem::NotFound)?;

        // Issuance runs at most once per order: a valid order already has
        // its certificate and answers idempotently, and an order another
        // request is finalizing must not be re-entered.
        match order.status {
            OrderStatus::Valid => {
                let location = order.url.clone();
                return Ok(Reply::json(StatusCode::CREATED, order.marshal())
                    .with_location(location));
            }
            OrderStatus::Processing => {
                return Err(Problem::malformed("order is already being finalized"));
            }
            _ => {}
        }

        order.status = OrderStatus::Processing;
        self.store.put(Object::Order(order.clone())).await;

        match self.issue_for_order(request, &mut order).await {
            Ok(reply) => Ok(reply),
            Err(problem) => {
                order.status = OrderStatus::Ready;
                self.store.put(Object::Order(order)).await;
                Err(problem)
            }
        }
    }

    async fn issue_for_order(
        &self,
        request: &VerifiedRequest,
        order: &mut Order,
    ) -> Result<Reply, Problem> {
        let csr_b64 = request
            .payload
            .get("csr")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let names = self.policy.check_csr(csr_b64).map_err(|message| {
            warn!(order = %order.id, %message, "rejected finalize CSR");
            Problem::malformed(message)
        })?;

        let now = OffsetDateTime::now_utc();
        let not_before = match &order.not_before {
            Some(value) => parse_rfc3339(value)?,
            None => now,
        };
        let requested = match &order.not_after {
            Some(value) => parse_rfc3339(value)?,
            None => now + time::Duration::days(DEFAULT_VALIDITY_DAYS),
        };
        let ceiling = now + self.max_validity;
        let not_after = if requested > ceiling { ceiling } else { requested };

        for name in &names {
            if self.store.authz_for(&request.thumbprint, name).await.is_none() {
                let authz = self.build_authorization(&request.thumbprint, name, Some(&order.url));
                self.store.put(Object::Authorization(authz)).await;
            }
        }

        let csr_der = crate::jose::b64_decode(csr_b64)
            .map_err(|_| Problem::malformed("csr is not base64url"))?;
        let der = self.ca.issue(&csr_der, not_before, not_after).map_err(|err| {
            warn!(order = %order.id, "certificate issuance failed: {err:#}");
            Problem::malformed("certificate issuance failed")
        })?;

        let cert_id = Uuid::new_v4().to_string();
        let cert_url = self.urls.object(ObjectKind::Certificate, &cert_id);
        self.store
            .put(Object::Certificate(Certificate {
                id: cert_id,
                url: cert_url.clone(),
                body: der,
            }))
            .await;

        order.certificate = Some(cert_url);
        order.status = OrderStatus::Valid;
        info!(order = %order.id, "issued certificate");
        let body = order.marshal();
        self.store.put(Object::Order(order.clone())).await;
        Ok(Reply::json(StatusCode::CREATED, body).with_location(order.url.clone()))
    }

    /// POST /cert/{id}: the raw DER body.
    ///
    /// # Errors
    /// Returns a problem for unknown accounts or certificates.
    pub async fn certificate(
        &self,
        request: &VerifiedRequest,
        id: &str,
    ) -> Result<Reply, Problem> {
        self.require_account(request).await?;
        let certificate = self
            .store
            .certificate(id)
            .await
            .ok_or(Problem::NotFound)?;
        Ok(Reply::der(StatusCode::OK, certificate.body))
    }

    async fn require_account(&self, request: &VerifiedRequest) -> Result<Registration, Problem> {
        self.store
            .registration(&request.thumbprint)
            .await
            .ok_or_else(|| Problem::unauthorized("no account for this key"))
    }

    async fn find_or_create_authz(
        &self,
        thumbprint: &str,
        name: &str,
        order_url: Option<&str>,
    ) -> Authorization {
        if let Some(existing) = self.store.authz_for(thumbprint, name).await {
            return existing;
        }
        let authz = self.build_authorization(thumbprint, name, order_url);
        self.store.put(Object::Authorization(authz.clone())).await;
        authz
    }

    fn build_authorization(
        &self,
        thumbprint: &str,
        name: &str,
        order_url: Option<&str>,
    ) -> Authorization {
        let id = Uuid::new_v4().to_string();
        let url = self.urls.object(ObjectKind::Authorization, &id);
        let challenges = self
            .challenge_kinds
            .iter()
            .enumerate()
            .map(|(index, kind)| Challenge {
                r#type: *kind,
                status: ChallengeStatus::Pending,
                token: self.challenge_token(),
                url: format!("{url}/{index}"),
            })
            .collect();
        Authorization {
            id,
            url,
            thumbprint: thumbprint.to_string(),
            identifier: Identifier::dns(name),
            scope: order_url
                .filter(|_| self.scoped_authorizations)
                .map(ToString::to_string),
            expires: OffsetDateTime::now_utc() + self.authz_expiry,
            challenges,
            status: AuthorizationStatus::Pending,
        }
    }

    fn challenge_token(&self) -> String {
        let mut bytes = [0u8; CHALLENGE_TOKEN_BYTES];
        if self.rng.fill(&mut bytes).is_err() {
            warn!("system RNG unavailable while minting challenge token");
        }
        crate::jose::b64(&bytes)
    }
}

fn parse_contact(payload: &Value) -> Result<Vec<String>, Problem> {
    let Some(contact) = payload.get("contact") else {
        return Ok(Vec::new());
    };
    let entries = contact
        .as_array()
        .ok_or_else(|| Problem::malformed("contact must be an array"))?;
    entries
        .iter()
        .map(|entry| {
            entry
                .as_str()
                .map(ToString::to_string)
                .ok_or_else(|| Problem::malformed("contact entries must be strings"))
        })
        .collect()
}

fn parse_identifiers(payload: &Value) -> Result<Vec<String>, Problem> {
    let identifiers = payload
        .get("identifiers")
        .and_then(Value::as_array)
        .ok_or_else(|| Problem::malformed("payload missing identifiers"))?;
    identifiers
        .iter()
        .map(|identifier| {
            identifier
                .get("value")
                .and_then(Value::as_str)
                .map(ToString::to_string)
                .ok_or_else(|| Problem::malformed("identifier missing value"))
        })
        .collect()
}

fn parse_rfc3339_field(payload: &Value, field: &str) -> Result<Option<String>, Problem> {
    let Some(value) = payload.get(field) else {
        return Ok(None);
    };
    let value = value
        .as_str()
        .ok_or_else(|| Problem::malformed(format!("{field} must be a string")))?;
    parse_rfc3339(value)?;
    Ok(Some(value.to_string()))
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime, Problem> {
    OffsetDateTime::parse(value, &Rfc3339)
        .map_err(|_| Problem::malformed(format!("{value} is not an RFC 3339 timestamp")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_contact_accepts_missing() {
        assert_eq!(parse_contact(&json!({})).unwrap(), Vec::<String>::new());
        assert_eq!(
            parse_contact(&json!({"contact": ["mailto:a@example.com"]})).unwrap(),
            vec!["mailto:a@example.com"]
        );
        assert!(parse_contact(&json!({"contact": "mailto:a@example.com"})).is_err());
        assert!(parse_contact(&json!({"contact": [1]})).is_err());
    }

    #[test]
    fn test_parse_identifiers() {
        let payload = json!({"identifiers": [
            {"type": "dns", "value": "example.com"},
            {"type": "dns", "value": "www.example.com"},
        ]});
        assert_eq!(
            parse_identifiers(&payload).unwrap(),
            vec!["example.com", "www.example.com"]
        );
        assert!(parse_identifiers(&json!({})).is_err());
        assert!(parse_identifiers(&json!({"identifiers": [{"type": "dns"}]})).is_err());
    }

    #[test]
    fn test_parse_rfc3339_field() {
        let payload = json!({"notBefore": "2026-01-01T00:00:00Z"});
        assert_eq!(
            parse_rfc3339_field(&payload, "notBefore").unwrap(),
            Some("2026-01-01T00:00:00Z".to_string())
        );
        assert_eq!(parse_rfc3339_field(&payload, "notAfter").unwrap(), None);
        assert!(parse_rfc3339_field(&json!({"notBefore": "tomorrow"}), "notBefore").is_err());
    }
}
