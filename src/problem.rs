use poem::http::StatusCode;
use poem::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Error kinds surfaced to clients as ACME problem documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProblemKind {
    Malformed,
    Unauthorized,
    BadNonce,
}

impl ProblemKind {
    pub fn urn(self) -> String {
        format!("urn:ietf:params:acme:error:{}", self.suffix())
    }

    fn suffix(self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::Unauthorized => "unauthorized",
            Self::BadNonce => "bad-nonce",
        }
    }

    fn title(self) -> &'static str {
        match self {
            Self::Malformed => "Malformed request",
            Self::Unauthorized => "Unauthorized",
            Self::BadNonce => "Bad replay nonce",
        }
    }

    fn status(self) -> StatusCode {
        match self {
            Self::Malformed | Self::BadNonce => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
        }
    }
}

/// A request-level failure: either a structured problem document or one
/// of the bare statuses the protocol uses for missing objects.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Problem {
    #[error("{kind:?}: {description}")]
    Document {
        kind: ProblemKind,
        description: String,
    },
    #[error("not found")]
    NotFound,
}

impl Problem {
    pub fn malformed(description: impl Into<String>) -> Self {
        Self::Document {
            kind: ProblemKind::Malformed,
            description: description.into(),
        }
    }

    pub fn unauthorized(description: impl Into<String>) -> Self {
        Self::Document {
            kind: ProblemKind::Unauthorized,
            description: description.into(),
        }
    }

    pub fn bad_nonce(description: impl Into<String>) -> Self {
        Self::Document {
            kind: ProblemKind::BadNonce,
            description: description.into(),
        }
    }
}

impl IntoResponse for Problem {
    fn into_response(self) -> Response {
        match self {
            Self::Document { kind, description } => {
                let body = json!({
                    "type": kind.urn(),
                    "title": kind.title(),
                    "description": description,
                });
                Response::builder()
                    .status(kind.status())
                    .content_type("application/problem+json")
                    .body(body.to_string())
            }
            Self::NotFound => StatusCode::NOT_FOUND.into_response(),
        }
    }
}
