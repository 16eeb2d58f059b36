use std::collections::BTreeMap;
use std::fmt::Write as _;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ring::digest::{Context as DigestContext, SHA256};
use ring::signature::{
    ECDSA_P256_SHA256_FIXED, RSA_PKCS1_2048_8192_SHA256, RsaPublicKeyComponents, UnparsedPublicKey,
};
use serde::{Deserialize, Serialize};

use crate::problem::Problem;

pub fn b64(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

pub fn b64_decode(value: &str) -> Result<Vec<u8>, base64::DecodeError> {
    URL_SAFE_NO_PAD.decode(value)
}

/// Public account key in JWK form. EC P-256 and RSA members are carried;
/// anything else fails thumbprinting and verification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Jwk {
    pub kty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
}

impl Jwk {
    /// Hex SHA-256 over the canonical JWK members. Stable per key, so it
    /// doubles as the account id.
    pub fn thumbprint(&self) -> Result<String, Problem> {
        let mut map = BTreeMap::new();
        match self.kty.as_str() {
            "EC" => {
                map.insert("crv", member(self.crv.as_deref(), "crv")?);
                map.insert("kty", self.kty.as_str());
                map.insert("x", member(self.x.as_deref(), "x")?);
                map.insert("y", member(self.y.as_deref(), "y")?);
            }
            "RSA" => {
                map.insert("e", member(self.e.as_deref(), "e")?);
                map.insert("kty", self.kty.as_str());
                map.insert("n", member(self.n.as_deref(), "n")?);
            }
            other => {
                return Err(Problem::malformed(format!("unsupported key type {other}")));
            }
        }
        let canonical = serde_json::to_string(&map)
            .map_err(|err| Problem::malformed(format!("JWK canonicalization failed: {err}")))?;

        let mut context = DigestContext::new(&SHA256);
        context.update(canonical.as_bytes());
        let digest = context.finish();

        let mut out = String::with_capacity(64);
        for byte in digest.as_ref() {
            let _ = write!(&mut out, "{byte:02x}");
        }
        Ok(out)
    }

    /// Bit length of the RSA modulus, `None` for non-RSA keys.
    pub fn rsa_modulus_bits(&self) -> Option<usize> {
        let modulus = b64_decode(self.n.as_deref()?).ok()?;
        let significant = modulus.iter().skip_while(|byte| **byte == 0).count();
        Some(significant * 8)
    }

    /// Verifies `signature` over `message` with this key.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), Problem> {
        match self.kty.as_str() {
            "EC" => {
                let x = decode_member(self.x.as_deref(), "x")?;
                let y = decode_member(self.y.as_deref(), "y")?;
                let mut point = Vec::with_capacity(1 + x.len() + y.len());
                point.push(0x04);
                point.extend_from_slice(&x);
                point.extend_from_slice(&y);
                UnparsedPublicKey::new(&ECDSA_P256_SHA256_FIXED, point)
                    .verify(message, signature)
                    .map_err(|_| Problem::unauthorized("signature verification failed"))
            }
            "RSA" => {
                let n = decode_member(self.n.as_deref(), "n")?;
                let e = decode_member(self.e.as_deref(), "e")?;
                RsaPublicKeyComponents { n: &n, e: &e }
                    .verify(&RSA_PKCS1_2048_8192_SHA256, message, signature)
                    .map_err(|_| Problem::unauthorized("signature verification failed"))
            }
            other => Err(Problem::malformed(format!("unsupported key type {other}"))),
        }
    }
}

fn member<'a>(value: Option<&'a str>, name: &str) -> Result<&'a str, Problem> {
    value.ok_or_else(|| Problem::malformed(format!("JWK missing {name}")))
}

fn decode_member(value: Option<&str>, name: &str) -> Result<Vec<u8>, Problem> {
    b64_decode(member(value, name)?)
        .map_err(|_| Problem::malformed(format!("JWK member {name} is not base64url")))
}

/// Flattened JWS serialization, the only body shape POST handlers accept.
#[derive(Debug, Deserialize)]
pub struct JwsEnvelope {
    pub protected: String,
    #[serde(default)]
    pub payload: String,
    pub signature: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProtectedHeader {
    #[serde(default)]
    pub alg: Option<String>,
    #[serde(default)]
    pub jwk: Option<Jwk>,
    #[serde(default)]
    pub kid: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}
