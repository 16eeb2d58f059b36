use std::sync::LazyLock;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use regex::Regex;
use x509_parser::oid_registry::OID_X509_COMMON_NAME;
use x509_parser::prelude::*;

static DNS_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z0-9][a-z0-9-]{1,62}\.)+[a-z][a-z0-9-]{0,62}$")
        .expect("hard-coded DNS name pattern compiles")
});

const EXTENSION_SUBJECT_ALT_NAME: &str = "subjectAltName";

/// Constraints applied to client CSRs before issuance. The checks run in
/// a fixed order and stop at the first failing element, so the reported
/// message is deterministic for a given CSR.
#[derive(Debug, Clone)]
pub struct CsrPolicy {
    allowed_extensions: Vec<String>,
}

impl CsrPolicy {
    pub fn new(allowed_extensions: Vec<String>) -> Self {
        Self { allowed_extensions }
    }

    /// Validates a base64url CSR and returns the union of the names it
    /// covers (commonName plus dNSName SANs), lowercased and deduplicated.
    pub fn check_csr(&self, csr_b64: &str) -> Result<Vec<String>, String> {
        let der = URL_SAFE_NO_PAD
            .decode(csr_b64)
            .map_err(|_| "csr is not base64url".to_string())?;
        let (_, csr) = X509CertificationRequest::from_der(&der)
            .map_err(|_| "csr is not a DER certification request".to_string())?;
        let info = &csr.certification_request_info;

        let mut names = Vec::new();

        let subject: Vec<_> = info.subject.iter_attributes().collect();
        if subject.len() > 1 {
            return Err("subject must carry at most one attribute".to_string());
        }
        if let Some(attribute) = subject.first() {
            if attribute.attr_type() != &OID_X509_COMMON_NAME {
                return Err("subject attribute must be a commonName".to_string());
            }
            let value = attribute
                .as_str()
                .map_err(|_| "commonName is not a string".to_string())?
                .to_lowercase();
            if !DNS_NAME.is_match(&value) {
                return Err(format!("commonName {value} is not a DNS name"));
            }
            names.push(value);
        }

        let attributes = info.attributes();
        if attributes.len() > 1 {
            return Err("csr must carry at most one attribute".to_string());
        }
        if let Some(attribute) = attributes.first() {
            let ParsedCriAttribute::ExtensionRequest(request) = attribute.parsed_attribute()
            else {
                return Err("csr attribute must be an extensionRequest".to_string());
            };
            if request.extensions.len() > 1 {
                return Err("extensionRequest must carry at most one extension".to_string());
            }
            if let Some(extension) = request.extensions.first() {
                let ParsedExtension::SubjectAlternativeName(san) = extension.parsed_extension()
                else {
                    return Err("requested extension must be a subjectAltName".to_string());
                };
                if !self.allows(EXTENSION_SUBJECT_ALT_NAME) {
                    return Err("subjectAltName extension is not allowed".to_string());
                }
                for general_name in &san.general_names {
                    let GeneralName::DNSName(dns) = general_name else {
                        return Err("subjectAltName entries must be dNSName".to_string());
                    };
                    let value = dns.to_lowercase();
                    if !DNS_NAME.is_match(&value) {
                        return Err(format!("subjectAltName {value} is not a DNS name"));
                    }
                    if !names.contains(&value) {
                        names.push(value);
                    }
                }
            }
        }

        if names.is_empty() {
            return Err("csr names nothing to issue for".to_string());
        }
        Ok(names)
    }

    fn allows(&self, extension: &str) -> bool {
        self.allowed_extensions.iter().any(|name| name == extension)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_policy() -> CsrPolicy {
        CsrPolicy::new(vec![EXTENSION_SUBJECT_ALT_NAME.to_string()])
    }

    fn csr_b64(params: &rcgen::CertificateParams) -> String {
        let key = rcgen::KeyPair::generate().unwrap();
        let csr = params.serialize_request(&key).unwrap();
        URL_SAFE_NO_PAD.encode(csr.der())
    }

    fn san_params(names: &[&str]) -> rcgen::CertificateParams {
        rcgen::CertificateParams::new(names.iter().map(ToString::to_string).collect::<Vec<_>>())
            .unwrap()
    }

    #[test]
    fn test_accepts_cn_and_sans() {
        let mut params = san_params(&["example.com", "www.example.com"]);
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "example.com");
        let names = default_policy().check_csr(&csr_b64(&params)).unwrap();
        assert_eq!(names, vec!["example.com", "www.example.com"]);
    }

    #[test]
    fn test_sans_alone_are_enough() {
        let params = san_params(&["example.com"]);
        let names = default_policy().check_csr(&csr_b64(&params)).unwrap();
        assert_eq!(names, vec!["example.com"]);
    }

    #[test]
    fn test_uppercase_names_are_lowercased() {
        let mut params = san_params(&["example.com"]);
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "EXAMPLE.COM");
        let names = default_policy().check_csr(&csr_b64(&params)).unwrap();
        assert_eq!(names, vec!["example.com"]);
    }

    #[test]
    fn test_rejects_multi_attribute_subject() {
        let mut params = san_params(&["example.com"]);
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "example.com");
        params
            .distinguished_name
            .push(rcgen::DnType::OrganizationName, "Example Corp");
        let err = default_policy().check_csr(&csr_b64(&params)).unwrap_err();
        assert!(err.contains("at most one attribute"), "{err}");
    }

    #[test]
    fn test_rejects_non_cn_subject() {
        let mut params = san_params(&["example.com"]);
        params
            .distinguished_name
            .push(rcgen::DnType::OrganizationName, "Example Corp");
        let err = default_policy().check_csr(&csr_b64(&params)).unwrap_err();
        assert!(err.contains("commonName"), "{err}");
    }

    #[test]
    fn test_rejects_non_dns_san() {
        let mut params = san_params(&["example.com"]);
        params.subject_alt_names.push(rcgen::SanType::IpAddress(
            std::net::IpAddr::from([127, 0, 0, 1]),
        ));
        let err = default_policy().check_csr(&csr_b64(&params)).unwrap_err();
        assert!(err.contains("dNSName"), "{err}");
    }

    #[test]
    fn test_rejects_bare_label() {
        let mut params = rcgen::CertificateParams::default();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "localhost");
        let err = default_policy().check_csr(&csr_b64(&params)).unwrap_err();
        assert!(err.contains("not a DNS name"), "{err}");
    }

    #[test]
    fn test_rejects_garbage_input() {
        assert!(default_policy().check_csr("@@not-base64@@").is_err());
        assert!(default_policy().check_csr(&URL_SAFE_NO_PAD.encode(b"junk")).is_err());
    }

    #[test]
    fn test_rejects_disallowed_san_extension() {
        let policy = CsrPolicy::new(Vec::new());
        let params = san_params(&["example.com"]);
        let err = policy.check_csr(&csr_b64(&params)).unwrap_err();
        assert!(err.contains("not allowed"), "{err}");
    }

    #[test]
    fn test_check_is_idempotent() {
        let params = san_params(&["example.com"]);
        let encoded = csr_b64(&params);
        let policy = default_policy();
        assert_eq!(policy.check_csr(&encoded), policy.check_csr(&encoded));
    }
}
