//! Test-only certificate material: a CA, identities signed by it, and
//! CRLs, generated in-process so tests never depend on fixture files.

use std::{
  str::FromStr,
  sync::atomic::{AtomicU32, Ordering},
};

use der::{
  asn1::{BitString, UtcTime},
  DateTime, Encode,
};
use openssl::{
  asn1::Asn1Time,
  bn::BigNum,
  ec::{EcGroup, EcKey},
  hash::MessageDigest,
  nid::Nid,
  pkey::{PKey, Private},
  rsa::Rsa,
  x509::{extension::BasicConstraints, X509Builder, X509NameBuilder, X509},
};
use x509_cert::{
  crl::{CertificateList, RevokedCert, TbsCertList},
  name::RdnSequence,
  serial_number::SerialNumber,
  spki::AlgorithmIdentifierOwned,
  time::Time,
  Version,
};

use crate::security::certificate::Certificate;

static NEXT_SERIAL: AtomicU32 = AtomicU32::new(1);

pub(crate) struct TestCa {
  pub cert_pem: String,
  pub key_pem: String,
  pub(crate) cert: X509,
  pub(crate) pkey: PKey<Private>,
}

pub(crate) struct TestIdentity {
  pub cert_pem: String,
  pub key_pem: String,
}

fn ec_key() -> PKey<Private> {
  let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
  PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
}

fn rsa_key() -> PKey<Private> {
  PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap()
}

fn name(cn: &str) -> openssl::x509::X509Name {
  let mut builder = X509NameBuilder::new().unwrap();
  builder.append_entry_by_nid(Nid::COMMONNAME, cn).unwrap();
  builder.build()
}

fn build_cert(
  subject_cn: &str,
  subject_key: &PKey<Private>,
  issuer: Option<(&X509, &PKey<Private>)>,
  is_ca: bool,
) -> X509 {
  let mut builder = X509Builder::new().unwrap();
  builder.set_version(2).unwrap();
  let subject = name(subject_cn);
  builder.set_subject_name(&subject).unwrap();
  match issuer {
    Some((ca_cert, _)) => builder.set_issuer_name(ca_cert.subject_name()).unwrap(),
    None => builder.set_issuer_name(&subject).unwrap(),
  }
  builder.set_pubkey(subject_key).unwrap();

  // small sequential serials keep DER integer normalization out of the way
  let serial = BigNum::from_u32(NEXT_SERIAL.fetch_add(1, Ordering::Relaxed))
    .unwrap()
    .to_asn1_integer()
    .unwrap();
  builder.set_serial_number(&serial).unwrap();
  builder
    .set_not_before(&Asn1Time::days_from_now(0).unwrap())
    .unwrap();
  builder
    .set_not_after(&Asn1Time::days_from_now(365).unwrap())
    .unwrap();
  if is_ca {
    builder
      .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
      .unwrap();
  }
  let signing_key = match issuer {
    Some((_, ca_key)) => ca_key,
    None => subject_key,
  };
  builder.sign(signing_key, MessageDigest::sha256()).unwrap();
  builder.build()
}

fn ca_with_key(pkey: PKey<Private>, cn: &str) -> TestCa {
  let cert = build_cert(cn, &pkey, None, true);
  TestCa {
    cert_pem: String::from_utf8(cert.to_pem().unwrap()).unwrap(),
    key_pem: String::from_utf8(pkey.private_key_to_pem_pkcs8().unwrap()).unwrap(),
    cert,
    pkey,
  }
}

/// Self-signed ECDSA P-256 CA.
pub(crate) fn test_ca() -> TestCa {
  ca_with_key(ec_key(), "Test CA")
}

/// Self-signed RSA-2048 CA, for the classic-DH selection paths.
pub(crate) fn test_rsa_ca() -> TestCa {
  ca_with_key(rsa_key(), "Test RSA CA")
}

fn identity_with_key(ca: &TestCa, cn: &str, pkey: PKey<Private>) -> TestIdentity {
  let cert = build_cert(cn, &pkey, Some((&ca.cert, &ca.pkey)), false);
  TestIdentity {
    cert_pem: String::from_utf8(cert.to_pem().unwrap()).unwrap(),
    key_pem: String::from_utf8(pkey.private_key_to_pem_pkcs8().unwrap()).unwrap(),
  }
}

/// ECDSA P-256 participant identity signed by `ca`.
pub(crate) fn test_identity(ca: &TestCa, cn: &str) -> TestIdentity {
  identity_with_key(ca, cn, ec_key())
}

/// RSA participant identity signed by `ca`.
pub(crate) fn test_rsa_identity(ca: &TestCa, cn: &str) -> TestIdentity {
  identity_with_key(ca, cn, rsa_key())
}

/// CRL revoking the given certificates. The revocation matching under test
/// is serial-based, so the CRL signature is a placeholder.
pub(crate) fn test_crl(_ca: &TestCa, revoked: &[&Certificate]) -> String {
  let algorithm = AlgorithmIdentifierOwned {
    oid: der::asn1::ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2"),
    parameters: None,
  };
  let revocation_date = Time::UtcTime(
    UtcTime::from_date_time(DateTime::new(2026, 1, 1, 0, 0, 0).unwrap()).unwrap(),
  );
  let revoked_certificates: Vec<RevokedCert> = revoked
    .iter()
    .map(|cert| RevokedCert {
      serial_number: SerialNumber::new(&cert.serial_number().unwrap()).unwrap(),
      revocation_date,
      crl_entry_extensions: None,
    })
    .collect();

  let tbs_cert_list = TbsCertList {
    version: Version::V2,
    signature: algorithm.clone(),
    issuer: RdnSequence::from_str("CN=Test CA").unwrap(),
    this_update: revocation_date,
    next_update: None,
    revoked_certificates: Some(revoked_certificates),
    crl_extensions: None,
  };
  let crl = CertificateList {
    tbs_cert_list,
    signature_algorithm: algorithm,
    signature: BitString::from_bytes(&[0u8; 8]).unwrap(),
  };
  let der = crl.to_der().unwrap();

  let b64 = openssl::base64::encode_block(&der);
  let mut pem = String::from("-----BEGIN X509 CRL-----\n");
  for chunk in b64.as_bytes().chunks(64) {
    pem.push_str(std::str::from_utf8(chunk).unwrap());
    pem.push('\n');
  }
  pem.push_str("-----END X509 CRL-----\n");
  pem
}
