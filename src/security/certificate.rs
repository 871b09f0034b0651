//! X.509 certificate handling for the authentication plugin: PEM loading,
//! chain verification, subject-name access for GUID binding, signed-data
//! verification and CRL checks.

use bcder::{encode::Values, Mode};
use bytes::Bytes;
use der::Decode;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use ring::{digest, signature::VerificationAlgorithm};
use x509_cert::crl::CertificateList;
use x509_certificate::{
  certificate::CapturedX509Certificate, KeyAlgorithm, SignatureAlgorithm,
};

use crate::{
  create_security_error_and_log,
  security::{SecurityError, SecurityResult},
};

/// SHA-256 digest value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sha256([u8; 32]);

impl Sha256 {
  pub fn hash(data: &[u8]) -> Self {
    let d = digest::digest(&digest::SHA256, data);
    // digest length is static for SHA-256
    Self(d.as_ref().try_into().unwrap())
  }
}

impl AsRef<[u8]> for Sha256 {
  fn as_ref(&self) -> &[u8] {
    &self.0
  }
}

impl PartialEq<Bytes> for Sha256 {
  fn eq(&self, other: &Bytes) -> bool {
    self.0.as_slice() == other.as_ref()
  }
}

/// An X.509 certificate, either an identity CA or a participant identity.
#[derive(Debug, Clone)]
pub struct Certificate {
  cert: CapturedX509Certificate,
  der: Vec<u8>,
}

impl Certificate {
  pub fn from_pem(pem: impl AsRef<[u8]>) -> SecurityResult<Self> {
    let cert = CapturedX509Certificate::from_pem(pem)
      .map_err(|e| create_security_error_and_log!("Certificate PEM parse failure: {e}"))?;
    let der = cert.encode_der()?;
    Ok(Self { cert, der })
  }

  pub fn to_pem(&self) -> String {
    self.cert.encode_pem()
  }

  pub fn to_der(&self) -> &[u8] {
    &self.der
  }

  /// DER encoding of the subject Name, the input of the GUID binding hash.
  pub fn subject_name_der(&self) -> SecurityResult<Vec<u8>> {
    let encoded = self.cert.subject_name().encode_ref();
    let mut buf = Vec::new();
    encoded
      .write_encoded(Mode::Der, &mut buf)
      .map_err(|e| create_security_error_and_log!("Cannot DER-encode subject name: {e:?}"))?;
    Ok(buf)
  }

  /// Subject name in RFC 4514 style, for the identity token.
  pub fn subject_name_string(&self) -> String {
    self
      .cert
      .subject_name()
      .user_friendly_str()
      .unwrap_or_else(|_| "<unprintable subject>".to_string())
  }

  pub fn key_algorithm(&self) -> Option<KeyAlgorithm> {
    self.cert.key_algorithm()
  }

  pub fn signature_algorithm(&self) -> Option<SignatureAlgorithm> {
    self.cert.signature_algorithm()
  }

  /// Checks that `self` was signed by `issuer` (certificate chain step).
  pub fn verify_signed_by_certificate(&self, issuer: &Certificate) -> SecurityResult<()> {
    self
      .cert
      .verify_signed_by_certificate(&issuer.cert)
      .map_err(|e| {
        create_security_error_and_log!("Certificate signature verification failure: {e}")
      })
  }

  /// Verifies a detached signature over `data` with this certificate's
  /// public key and the given algorithm.
  pub fn verify_signed_data_with_algorithm(
    &self,
    data: impl AsRef<[u8]>,
    signature: impl AsRef<[u8]>,
    algorithm: &'static dyn VerificationAlgorithm,
  ) -> SecurityResult<()> {
    self
      .cert
      .verify_signed_data_with_algorithm(data, signature, algorithm)
      .map_err(|e| create_security_error_and_log!("Signed data verification failure: {e}"))
  }

  /// Serial number of this certificate, for revocation checks.
  pub fn serial_number(&self) -> SecurityResult<Vec<u8>> {
    let parsed = x509_cert::Certificate::from_der(&self.der)
      .map_err(|e| create_security_error_and_log!("Certificate DER reparse failure: {e}"))?;
    Ok(parsed.tbs_certificate.serial_number.as_bytes().to_vec())
  }
}

/// A certificate revocation list, matched by serial number.
#[derive(Debug, Clone)]
pub struct CertificateRevocationList {
  revoked_serials: Vec<Vec<u8>>,
}

impl CertificateRevocationList {
  pub fn from_der(der: &[u8]) -> SecurityResult<Self> {
    let crl = CertificateList::from_der(der)
      .map_err(|e| create_security_error_and_log!("CRL DER parse failure: {e}"))?;
    let revoked_serials = crl
      .tbs_cert_list
      .revoked_certificates
      .unwrap_or_default()
      .iter()
      .map(|rc| rc.serial_number.as_bytes().to_vec())
      .collect();
    Ok(Self { revoked_serials })
  }

  pub fn from_pem(pem: impl AsRef<[u8]>) -> SecurityResult<Self> {
    let der = pem_to_der(pem.as_ref(), "X509 CRL")?;
    Self::from_der(&der)
  }

  pub fn is_revoked(&self, certificate: &Certificate) -> SecurityResult<bool> {
    let serial = certificate.serial_number()?;
    Ok(self.revoked_serials.iter().any(|s| *s == serial))
  }

  pub fn len(&self) -> usize {
    self.revoked_serials.len()
  }

  pub fn is_empty(&self) -> bool {
    self.revoked_serials.is_empty()
  }
}

/// Minimal PEM armor removal for the one non-certificate document we load.
fn pem_to_der(pem: &[u8], label: &str) -> Result<Vec<u8>, SecurityError> {
  let text = std::str::from_utf8(pem)
    .map_err(|_| create_security_error_and_log!("PEM document is not UTF-8"))?;
  let begin = format!("-----BEGIN {label}-----");
  let end = format!("-----END {label}-----");
  let body: String = text
    .lines()
    .skip_while(|l| l.trim() != begin)
    .skip(1)
    .take_while(|l| l.trim() != end)
    .collect();
  if body.is_empty() {
    return Err(create_security_error_and_log!(
      "No '{label}' PEM block found"
    ));
  }
  openssl::base64::decode_block(&body)
    .map_err(|e| create_security_error_and_log!("PEM base64 decode failure: {e}"))
}
