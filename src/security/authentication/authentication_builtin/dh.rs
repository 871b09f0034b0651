//! Key agreement backends of the handshake.
//!
//! The handshake logic only sees this interface; which library implements
//! which group stays in here. ECDH over P-256 runs on ring, classic DH
//! over the RFC 5114 2048/256 MODP group runs on OpenSSL.

use bytes::Bytes;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use openssl::{bn::BigNum, dh::Dh, pkey::Private};
use ring::{agreement, rand::SystemRandom};

use crate::{
  create_security_error_and_log,
  security::{
    authentication::SharedSecret,
    certificate::Sha256,
    openssl_init, SecurityResult,
  },
};
use super::types::{
  KeyAgreementPreference, DH_MODP_KAGREE_ALGO_NAME, ECDH_KAGREE_ALGO_NAME,
};

/// Which key agreement group a handshake uses.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum KeyAgreementKind {
  DhModp2048,
  EcdhP256,
}

impl KeyAgreementKind {
  pub fn algo_name(&self) -> &'static str {
    match self {
      Self::DhModp2048 => DH_MODP_KAGREE_ALGO_NAME,
      Self::EcdhP256 => ECDH_KAGREE_ALGO_NAME,
    }
  }

  pub fn from_algo_name(name: &[u8]) -> SecurityResult<Self> {
    match name {
      n if n == DH_MODP_KAGREE_ALGO_NAME.as_bytes() => Ok(Self::DhModp2048),
      n if n == ECDH_KAGREE_ALGO_NAME.as_bytes() => Ok(Self::EcdhP256),
      other => Err(create_security_error_and_log!(
        "Unexpected key agreement algorithm: {:?}",
        String::from_utf8_lossy(other)
      )),
    }
  }

  /// Resolves the configured preference against the CA algorithm rule: an
  /// RSA CA chooses classic DH, anything else the elliptic curve.
  pub fn from_preference(preference: KeyAgreementPreference, ca_is_rsa: bool) -> Self {
    match preference {
      KeyAgreementPreference::DhModp2048 => Self::DhModp2048,
      KeyAgreementPreference::EcdhP256 => Self::EcdhP256,
      KeyAgreementPreference::Auto => {
        if ca_is_rsa {
          Self::DhModp2048
        } else {
          Self::EcdhP256
        }
      }
    }
  }
}

/// One side's ephemeral key agreement state.
pub enum DHKeys {
  EcP256 {
    private_key: agreement::EphemeralPrivateKey,
    public_key: agreement::PublicKey,
  },
  Modp2048 {
    keypair: Dh<Private>,
  },
}

impl std::fmt::Debug for DHKeys {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::EcP256 { .. } => write!(f, "DHKeys::EcP256"),
      Self::Modp2048 { .. } => write!(f, "DHKeys::Modp2048"),
    }
  }
}

impl DHKeys {
  pub fn new(kind: KeyAgreementKind, secure_random: &SystemRandom) -> SecurityResult<Self> {
    match kind {
      KeyAgreementKind::EcdhP256 => Self::new_ec_keys(secure_random),
      KeyAgreementKind::DhModp2048 => Self::new_modp_keys(),
    }
  }

  pub fn new_ec_keys(secure_random: &SystemRandom) -> SecurityResult<Self> {
    let private_key =
      agreement::EphemeralPrivateKey::generate(&agreement::ECDH_P256, secure_random)?;
    let public_key = private_key.compute_public_key()?;
    Ok(Self::EcP256 {
      private_key,
      public_key,
    })
  }

  pub fn new_modp_keys() -> SecurityResult<Self> {
    openssl_init::ensure_initialized();
    let params = Dh::get_2048_256()?;
    let keypair = params.generate_key()?;
    Ok(Self::Modp2048 { keypair })
  }

  pub fn kind(&self) -> KeyAgreementKind {
    match self {
      Self::EcP256 { .. } => KeyAgreementKind::EcdhP256,
      Self::Modp2048 { .. } => KeyAgreementKind::DhModp2048,
    }
  }

  pub fn kagree_algo_name_str(&self) -> &'static str {
    self.kind().algo_name()
  }

  /// Wire form of the public key: the uncompressed curve point for ECDH,
  /// the big-endian public BIGNUM for MODP DH.
  pub fn public_key_bytes(&self) -> SecurityResult<Bytes> {
    match self {
      Self::EcP256 { public_key, .. } => Ok(Bytes::copy_from_slice(public_key.as_ref())),
      Self::Modp2048 { keypair } => Ok(Bytes::from(keypair.public_key().to_vec())),
    }
  }

  /// Derives the 32-byte shared secret: SHA-256 over the raw agreement
  /// output. Consumes the private key, which can only be used once.
  pub fn compute_shared_secret(self, peer_public: Bytes) -> SecurityResult<SharedSecret> {
    let raw_secret: Vec<u8> = match self {
      Self::EcP256 { private_key, .. } => {
        let peer = agreement::UnparsedPublicKey::new(&agreement::ECDH_P256, peer_public);
        agreement::agree_ephemeral(private_key, &peer, |raw| raw.to_vec()).map_err(|_| {
          create_security_error_and_log!("ECDH key agreement failed: bad peer public key?")
        })?
      }
      Self::Modp2048 { keypair } => {
        let peer = BigNum::from_slice(&peer_public)
          .map_err(|e| create_security_error_and_log!("Cannot deserialize DH: {e}"))?;
        keypair
          .compute_key(&peer)
          .map_err(|e| create_security_error_and_log!("DH key agreement failed: {e}"))?
      }
    };

    let digest = Sha256::hash(&raw_secret);
    // length is static
    Ok(SharedSecret::from(
      <[u8; 32]>::try_from(digest.as_ref()).unwrap(),
    ))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ecdh_both_ends_derive_the_same_secret() {
    let rng = SystemRandom::new();
    let a = DHKeys::new_ec_keys(&rng).unwrap();
    let b = DHKeys::new_ec_keys(&rng).unwrap();
    let a_pub = a.public_key_bytes().unwrap();
    let b_pub = b.public_key_bytes().unwrap();

    let secret_a = a.compute_shared_secret(b_pub).unwrap();
    let secret_b = b.compute_shared_secret(a_pub).unwrap();
    assert_eq!(secret_a, secret_b);
  }

  #[test]
  fn modp_both_ends_derive_the_same_secret() {
    let a = DHKeys::new_modp_keys().unwrap();
    let b = DHKeys::new_modp_keys().unwrap();
    let a_pub = a.public_key_bytes().unwrap();
    let b_pub = b.public_key_bytes().unwrap();

    let secret_a = a.compute_shared_secret(b_pub).unwrap();
    let secret_b = b.compute_shared_secret(a_pub).unwrap();
    assert_eq!(secret_a, secret_b);
  }

  #[test]
  fn garbage_peer_key_fails_cleanly() {
    let rng = SystemRandom::new();
    let a = DHKeys::new_ec_keys(&rng).unwrap();
    assert!(a
      .compute_shared_secret(Bytes::from_static(b"not a curve point"))
      .is_err());
  }

  #[test]
  fn auto_selection_follows_the_ca_algorithm() {
    assert_eq!(
      KeyAgreementKind::from_preference(KeyAgreementPreference::Auto, true),
      KeyAgreementKind::DhModp2048
    );
    assert_eq!(
      KeyAgreementKind::from_preference(KeyAgreementPreference::Auto, false),
      KeyAgreementKind::EcdhP256
    );
    assert_eq!(
      KeyAgreementKind::from_preference(KeyAgreementPreference::DhModp2048, false),
      KeyAgreementKind::DhModp2048
    );
  }
}
