use serde_json::Value;

use crate::acme::urls::UrlMap;
use crate::config::AcmeVersion;
use crate::jose::{self, Jwk, JwsEnvelope, ProtectedHeader};
use crate::nonce::NoncePool;
use crate::problem::Problem;
use crate::store::{ObjectKind, ObjectStore};

/// Outcome of authenticated-transport validation, handed to the
/// protocol handlers. The payload is the decoded JSON body (an empty
/// object for zero-length payloads), the key is the verified signer.
#[derive(Debug, Clone)]
pub struct VerifiedRequest {
    pub payload: Value,
    pub account_key: Jwk,
    pub thumbprint: String,
}

/// Validates a signed POST body: flattened-JWS shape, header rules,
/// single-use nonce, key resolution and signature. Any failure
/// short-circuits with the problem the caller surfaces unchanged.
pub async fn verify_request(
    body: &[u8],
    effective_url: &str,
    version: AcmeVersion,
    nonces: &NoncePool,
    store: &ObjectStore,
    urls: &UrlMap,
) -> Result<VerifiedRequest, Problem> {
    let envelope: JwsEnvelope = serde_json::from_slice(body)
        .map_err(|_| Problem::malformed("request body is not a flattened JWS"))?;
    let protected = jose::b64_decode(&envelope.protected)
        .map_err(|_| Problem::malformed("protected header is not base64url"))?;
    let header: ProtectedHeader = serde_json::from_slice(&protected)
        .map_err(|_| Problem::malformed("protected header is not JSON"))?;

    if header.alg.as_deref().is_none_or(str::is_empty) {
        return Err(Problem::malformed("protected header missing alg"));
    }

    let account_key = match (header.jwk, header.kid) {
        (Some(jwk), None) => jwk,
        (None, Some(kid)) => resolve_kid(&kid, store, urls).await?,
        _ => {
            return Err(Problem::malformed(
                "protected header must carry exactly one of jwk and kid",
            ));
        }
    };

    let nonce = header
        .nonce
        .as_deref()
        .ok_or_else(|| Problem::bad_nonce("protected header missing nonce"))?;
    if !nonces.consume(nonce).await {
        return Err(Problem::bad_nonce("nonce is unknown or already used"));
    }

    if version.requires_url_header() {
        let url = header
            .url
            .as_deref()
            .ok_or_else(|| Problem::malformed("protected header missing url"))?;
        if url != effective_url {
            return Err(Problem::malformed("protected url does not match request url"));
        }
    }

    if let Some(min_bits) = version.min_rsa_bits()
        && account_key.kty == "RSA"
    {
        let bits = account_key
            .rsa_modulus_bits()
            .ok_or_else(|| Problem::malformed("RSA JWK missing modulus"))?;
        if bits < min_bits {
            return Err(Problem::malformed(format!(
                "RSA modulus must be at least {min_bits} bits"
            )));
        }
    }

    let signature = jose::b64_decode(&envelope.signature)
        .map_err(|_| Problem::malformed("signature is not base64url"))?;
    let message = format!("{}.{}", envelope.protected, envelope.payload);
    account_key.verify(message.as_bytes(), &signature)?;

    let payload = if envelope.payload.is_empty() {
        Value::Object(serde_json::Map::new())
    } else {
        let bytes = jose::b64_decode(&envelope.payload)
            .map_err(|_| Problem::malformed("payload is not base64url"))?;
        serde_json::from_slice(&bytes).map_err(|_| Problem::malformed("payload is not JSON"))?
    };

    let thumbprint = account_key.thumbprint()?;
    Ok(VerifiedRequest {
        payload,
        account_key,
        thumbprint,
    })
}

async fn resolve_kid(kid: &str, store: &ObjectStore, urls: &UrlMap) -> Result<Jwk, Problem> {
    let prefix = format!("{}/{}/", urls.base(), ObjectKind::Registration.tag());
    let id = kid
        .strip_prefix(&prefix)
        .ok_or_else(|| Problem::unauthorized("kid does not name a known account"))?;
    let registration = store
        .registration(id)
        .await
        .ok_or_else(|| Problem::unauthorized("kid does not name a known account"))?;
    Ok(registration.key)
}
