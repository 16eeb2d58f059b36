use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use rcgen::{CertificateSigningRequestParams, Issuer, KeyPair};
use rustls_pki_types::CertificateSigningRequestDer;
use time::OffsetDateTime;

/// Signs client CSRs against the operator CA key. Serials are strictly
/// monotonic within one process run; persisting the counter is left to
/// operators who need cross-restart monotonicity.
pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    serial: AtomicU64,
}

impl CertificateAuthority {
    /// Builds the authority from PEM-encoded CA certificate and key.
    ///
    /// # Errors
    /// Returns error if either PEM fails to parse.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key = KeyPair::from_pem(key_pem).context("parse CA key PEM")?;
        let issuer =
            Issuer::from_ca_cert_pem(cert_pem, key).context("parse CA certificate PEM")?;
        Ok(Self {
            issuer,
            serial: AtomicU64::new(0),
        })
    }

    /// Issues a DER certificate for the CSR, passing subject, public key
    /// and requested extensions through unchanged.
    ///
    /// # Errors
    /// Returns error if the CSR does not parse or signing fails.
    pub fn issue(
        &self,
        csr_der: &[u8],
        not_before: OffsetDateTime,
        not_after: OffsetDateTime,
    ) -> Result<Vec<u8>> {
        let der = CertificateSigningRequestDer::from(csr_der.to_vec());
        let mut csr = CertificateSigningRequestParams::from_der(&der)
            .context("parse certification request")?;
        csr.params.not_before = not_before;
        csr.params.not_after = not_after;
        csr.params.serial_number = Some(self.next_serial().into());
        let certificate = csr.signed_by(&self.issuer).context("sign certificate")?;
        Ok(certificate.der().to_vec())
    }

    fn next_serial(&self) -> Vec<u8> {
        let serial = self.serial.fetch_add(1, Ordering::SeqCst) + 1;
        serial.to_be_bytes().to_vec()
    }
}
