use std::collections::HashMap;

use serde_json::{Value, json};
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::acme::objects::{
    Authorization, AuthorizationStatus, Certificate, Order, Registration,
};
use crate::jose;

/// Type-tag half of every entity identity; doubles as the URL segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Registration,
    Order,
    Authorization,
    Certificate,
}

impl ObjectKind {
    pub fn tag(self) -> &'static str {
        match self {
            Self::Registration => "reg",
            Self::Order => "app",
            Self::Authorization => "authz",
            Self::Certificate => "cert",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "reg" => Some(Self::Registration),
            "app" => Some(Self::Order),
            "authz" => Some(Self::Authorization),
            "cert" => Some(Self::Certificate),
            _ => None,
        }
    }
}

/// Tagged union over everything the store owns. The only capabilities
/// shared across variants are identity and the public JSON view.
#[derive(Debug, Clone)]
pub enum Object {
    Registration(Registration),
    Order(Order),
    Authorization(Authorization),
    Certificate(Certificate),
}

impl Object {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Registration(_) => ObjectKind::Registration,
            Self::Order(_) => ObjectKind::Order,
            Self::Authorization(_) => ObjectKind::Authorization,
            Self::Certificate(_) => ObjectKind::Certificate,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Registration(registration) => &registration.id,
            Self::Order(order) => &order.id,
            Self::Authorization(authz) => &authz.id,
            Self::Certificate(certificate) => &certificate.id,
        }
    }

    pub fn marshal(&self) -> Value {
        match self {
            Self::Registration(registration) => registration.marshal(),
            Self::Order(order) => order.marshal(),
            Self::Authorization(authz) => authz.marshal(),
            Self::Certificate(certificate) => json!({ "body": jose::b64(&certificate.body) }),
        }
    }
}

/// In-memory registry keyed by (type, id). A single coarse lock
/// serializes every operation; readers get clones and publish any
/// mutation back through `put`.
#[derive(Debug, Default)]
pub struct ObjectStore {
    inner: Mutex<HashMap<ObjectKind, HashMap<String, Object>>>,
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, object: Object) {
        let mut inner = self.inner.lock().await;
        inner
            .entry(object.kind())
            .or_default()
            .insert(object.id().to_string(), object);
    }

    pub async fn get(&self, kind: ObjectKind, id: &str) -> Option<Object> {
        self.inner.lock().await.get(&kind)?.get(id).cloned()
    }

    pub async fn registration(&self, thumbprint: &str) -> Option<Registration> {
        match self.get(ObjectKind::Registration, thumbprint).await {
            Some(Object::Registration(registration)) => Some(registration),
            _ => None,
        }
    }

    pub async fn order(&self, id: &str) -> Option<Order> {
        match self.get(ObjectKind::Order, id).await {
            Some(Object::Order(order)) => Some(order),
            _ => None,
        }
    }

    pub async fn authorization(&self, id: &str) -> Option<Authorization> {
        match self.get(ObjectKind::Authorization, id).await {
            Some(Object::Authorization(authz)) => Some(authz),
            _ => None,
        }
    }

    pub async fn certificate(&self, id: &str) -> Option<Certificate> {
        match self.get(ObjectKind::Certificate, id).await {
            Some(Object::Certificate(certificate)) => Some(certificate),
            _ => None,
        }
    }

    /// First live authorization owned by `thumbprint` covering `name`.
    /// Expired authorizations are skipped so callers mint a fresh one.
    pub async fn authz_for(&self, thumbprint: &str, name: &str) -> Option<Authorization> {
        let inner = self.inner.lock().await;
        let authzs = inner.get(&ObjectKind::Authorization)?;
        let now = OffsetDateTime::now_utc();
        for object in authzs.values() {
            let Object::Authorization(authz) = object else {
                continue;
            };
            if authz.thumbprint != thumbprint || authz.identifier.value != name {
                continue;
            }
            let mut candidate = authz.clone();
            candidate.refresh_at(now);
            if candidate.status != AuthorizationStatus::Invalid {
                return Some(candidate);
            }
        }
        None
    }

    /// Propagates an authorization's status into every order of the same
    /// account that references it, then re-evaluates order readiness.
    pub async fn update_orders_for(&self, authz: &Authorization) {
        let mut inner = self.inner.lock().await;
        let Some(orders) = inner.get_mut(&ObjectKind::Order) else {
            return;
        };
        for object in orders.values_mut() {
            let Object::Order(order) = object else {
                continue;
            };
            if order.thumbprint != authz.thumbprint {
                continue;
            }
            for requirement in &mut order.requirements {
                if requirement.url == authz.url {
                    requirement.status = authz.status;
                }
            }
            order.mark_ready();
        }
    }
}
