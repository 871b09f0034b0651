//! Signing keys for the authentication handshake: PEM-loaded in-memory
//! keys, or keys held by a PKCS#11 module which never leave the token.

use bytes::Bytes;
use cryptoki::{
  context::{CInitializeArgs, Pkcs11},
  mechanism::Mechanism,
  object::{Attribute, AttributeType, ObjectClass},
  session::{Session, UserType},
  types::AuthPin,
};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use openssl::{
  hash::MessageDigest,
  pkey::{Id, PKey, Private},
  rsa::Padding,
  sign::{RsaPssSaltlen, Signer},
};

use crate::{
  create_security_error_and_log,
  security::{
    config::{other_config_error, parse_config_error, ConfigError},
    openssl_init,
    SecurityResult,
  },
};

/// A private signing key. RSA keys sign RSASSA-PSS-SHA256, EC keys sign
/// ECDSA-SHA256 with DER-encoded signatures, matching what the handshake
/// verification expects on the other end.
pub enum PrivateKey {
  InMemory {
    evp: PKey<Private>,
  },
  /// Key object inside a PKCS#11 token; signing is delegated to the HSM.
  Pkcs11 {
    session: Session,
    key: cryptoki::object::ObjectHandle,
    is_ec: bool,
  },
}

impl std::fmt::Debug for PrivateKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::InMemory { .. } => write!(f, "PrivateKey::InMemory"),
      Self::Pkcs11 { .. } => write!(f, "PrivateKey::Pkcs11"),
    }
  }
}

impl PrivateKey {
  pub fn from_pem(pem: impl AsRef<[u8]>) -> Result<Self, ConfigError> {
    openssl_init::ensure_initialized();
    let evp = PKey::private_key_from_pem(pem.as_ref())
      .map_err(|e| parse_config_error(format!("Private key PEM parse failure: {e}")))?;
    match evp.id() {
      Id::RSA | Id::EC => Ok(Self::InMemory { evp }),
      other => Err(parse_config_error(format!(
        "Unsupported private key type {other:?}"
      ))),
    }
  }

  /// Loads a key from a `pkcs11:` URI of the form
  /// `pkcs11:object=<label>?pin-value=<pin>&module-path=<lib.so>`.
  ///
  /// The first private-key object capable of signing in the named token is
  /// used; selecting among several keys in one token is not supported.
  pub fn from_pkcs11_uri_path_and_query(path_and_query: &str) -> Result<Self, ConfigError> {
    let (path, query) = match path_and_query.split_once('?') {
      Some((p, q)) => (p, Some(q)),
      None => (path_and_query, None),
    };

    let mut token_label = None;
    for part in path.split(';') {
      if let Some(label) = part.strip_prefix("object=") {
        token_label = Some(label.to_string());
      }
    }
    let mut pin = None;
    let mut module_path = None;
    if let Some(query) = query {
      for part in query.split('&') {
        if let Some(v) = part.strip_prefix("pin-value=") {
          pin = Some(v.to_string());
        } else if let Some(v) = part.strip_prefix("module-path=") {
          module_path = Some(v.to_string());
        }
      }
    }
    let module_path = module_path
      .ok_or_else(|| parse_config_error("pkcs11: URI without module-path".to_string()))?;

    let pkcs11 = Pkcs11::new(module_path)?;
    pkcs11.initialize(CInitializeArgs::OsThreads)?;

    let slot = pkcs11
      .get_slots_with_token()?
      .into_iter()
      .find(|slot| match (pkcs11.get_token_info(*slot), &token_label) {
        (Ok(info), Some(label)) => info.label().trim_end() == label,
        (Ok(_), None) => true,
        (Err(_), _) => false,
      })
      .ok_or_else(|| other_config_error("No matching PKCS#11 token found".to_string()))?;

    let session = pkcs11.open_ro_session(slot)?;
    if let Some(pin) = pin {
      session.login(UserType::User, Some(&AuthPin::new(pin)))?;
    }

    let key = session
      .find_objects(&[
        Attribute::Class(ObjectClass::PRIVATE_KEY),
        Attribute::Sign(true),
      ])?
      .into_iter()
      .next()
      .ok_or_else(|| {
        other_config_error("No signing-capable private key in PKCS#11 token".to_string())
      })?;

    let is_ec = matches!(
      session
        .get_attributes(key, &[AttributeType::KeyType])?
        .first(),
      Some(Attribute::KeyType(kt)) if *kt == cryptoki::object::KeyType::EC
    );

    Ok(Self::Pkcs11 {
      session,
      key,
      is_ec,
    })
  }

  /// Signs `data`. The signature format is what
  /// `Certificate::verify_signed_data_with_algorithm` verifies with the
  /// matching algorithm on the peer side.
  pub fn sign(&self, data: &[u8]) -> SecurityResult<Bytes> {
    match self {
      Self::InMemory { evp } => {
        let mut signer = Signer::new(MessageDigest::sha256(), evp)?;
        if evp.id() == Id::RSA {
          signer.set_rsa_padding(Padding::PKCS1_PSS)?;
          signer.set_rsa_mgf1_md(MessageDigest::sha256())?;
          signer.set_rsa_pss_saltlen(RsaPssSaltlen::DIGEST_LENGTH)?;
        }
        let signature = signer.sign_oneshot_to_vec(data)?;
        Ok(Bytes::from(signature))
      }
      Self::Pkcs11 { session, key, is_ec } => {
        let mechanism = if *is_ec {
          Mechanism::EcdsaSha256
        } else {
          Mechanism::Sha256RsaPkcsPss(cryptoki::mechanism::rsa::PkcsPssParams {
            hash_alg: cryptoki::mechanism::MechanismType::SHA256,
            mgf: cryptoki::mechanism::rsa::PkcsMgfType::MGF1_SHA256,
            s_len: cryptoki::types::Ulong::from(32u64),
          })
        };
        let raw = session
          .sign(&mechanism, *key, data)
          .map_err(|e| create_security_error_and_log!("PKCS#11 signing failure: {e}"))?;
        if *is_ec {
          // PKCS#11 ECDSA yields raw r||s; verification expects DER
          ecdsa_raw_to_der(&raw).map(Bytes::from)
        } else {
          Ok(Bytes::from(raw))
        }
      }
    }
  }
}

/// Re-encodes a fixed-size r||s ECDSA signature as an ASN.1 DER SEQUENCE of
/// two INTEGERs.
fn ecdsa_raw_to_der(raw: &[u8]) -> SecurityResult<Vec<u8>> {
  if raw.len() % 2 != 0 || raw.is_empty() {
    return Err(create_security_error_and_log!(
      "Malformed raw ECDSA signature of {} bytes",
      raw.len()
    ));
  }
  let (r, s) = raw.split_at(raw.len() / 2);

  fn integer(scalar: &[u8]) -> Vec<u8> {
    let mut bytes: Vec<u8> = scalar.iter().copied().skip_while(|b| *b == 0).collect();
    if bytes.is_empty() {
      bytes.push(0);
    }
    if bytes[0] & 0x80 != 0 {
      bytes.insert(0, 0);
    }
    let mut out = vec![0x02, bytes.len() as u8];
    out.extend_from_slice(&bytes);
    out
  }

  let r = integer(r);
  let s = integer(s);
  let mut out = vec![0x30, (r.len() + s.len()) as u8];
  out.extend_from_slice(&r);
  out.extend_from_slice(&s);
  Ok(out)
}

#[cfg(test)]
mod tests {
  use ring::signature as ring_signature;

  use super::*;
  use crate::security::{certificate::Certificate, test_keys};

  #[test]
  fn ec_signature_verifies_with_certificate() {
    let ca = test_keys::test_ca();
    let identity = test_keys::test_identity(&ca, "Signer");
    let key = PrivateKey::from_pem(&identity.key_pem).unwrap();
    let cert = Certificate::from_pem(&identity.cert_pem).unwrap();

    let data = b"handshake contents to be signed";
    let signature = key.sign(data).unwrap();
    cert
      .verify_signed_data_with_algorithm(
        data,
        &signature,
        &ring_signature::ECDSA_P256_SHA256_ASN1,
      )
      .unwrap();

    // tampered data must not verify
    assert!(cert
      .verify_signed_data_with_algorithm(
        b"handshake contents to be signed!",
        &signature,
        &ring_signature::ECDSA_P256_SHA256_ASN1,
      )
      .is_err());
  }

  #[test]
  fn rsa_signature_is_pss_sha256() {
    let ca = test_keys::test_rsa_ca();
    let identity = test_keys::test_rsa_identity(&ca, "RsaSigner");
    let key = PrivateKey::from_pem(&identity.key_pem).unwrap();
    let cert = Certificate::from_pem(&identity.cert_pem).unwrap();

    let data = b"pss signed contents";
    let signature = key.sign(data).unwrap();
    cert
      .verify_signed_data_with_algorithm(
        data,
        &signature,
        &ring_signature::RSA_PSS_2048_8192_SHA256,
      )
      .unwrap();
  }

  #[test]
  fn garbage_pem_is_a_parse_error() {
    assert!(PrivateKey::from_pem(b"not a pem at all").is_err());
  }

  #[test]
  fn ecdsa_der_encoding_handles_leading_bytes() {
    // high bit set in both scalars forces the 0x00 prefix
    let raw = [[0x80u8; 4], [0xffu8; 4]].concat();
    let der = ecdsa_raw_to_der(&raw).unwrap();
    assert_eq!(der[0], 0x30);
    assert_eq!(der[2], 0x02);
    assert_eq!(der[4], 0x00);

    // leading zeros are stripped
    let raw = [0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02];
    let der = ecdsa_raw_to_der(&raw).unwrap();
    assert_eq!(der, vec![0x30, 0x06, 0x02, 0x01, 0x01, 0x02, 0x01, 0x02]);
  }
}
