//! Token formats and algorithm naming of the DDS:Auth:PKI-DH plugin.

use bytes::Bytes;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use ring::signature as ring_signature;
use x509_certificate::KeyAlgorithm;

use crate::{
  create_security_error_and_log,
  security::{
    BinaryProperty, DataHolder, HandshakeMessageToken, IdentityToken, Property, SecurityError,
    SecurityResult,
  },
};

pub const IDENTITY_TOKEN_CLASS_ID: &str = "DDS:Auth:PKI-DH:1.0";
pub const HANDSHAKE_REQUEST_CLASS_ID: &str = "DDS:Auth:PKI-DH:1.0+Req";
pub const HANDSHAKE_REPLY_CLASS_ID: &str = "DDS:Auth:PKI-DH:1.0+Reply";
pub const HANDSHAKE_FINAL_CLASS_ID: &str = "DDS:Auth:PKI-DH:1.0+Final";

// Property names within the IdentityToken.
pub const CERT_SN_PROPERTY_NAME: &str = "dds.cert.sn";
pub const CERT_ALGO_PROPERTY_NAME: &str = "dds.cert.algo";
pub const CA_SN_PROPERTY_NAME: &str = "dds.ca.sn";
pub const CA_ALGO_PROPERTY_NAME: &str = "dds.ca.algo";

// Configuration property names, as in the original plugin.
pub const IDENTITY_CA_PROPERTY_NAME: &str = "dds.sec.auth.builtin.PKI-DH.identity_ca";
pub const IDENTITY_CERTIFICATE_PROPERTY_NAME: &str =
  "dds.sec.auth.builtin.PKI-DH.identity_certificate";
pub const IDENTITY_CRL_PROPERTY_NAME: &str = "dds.sec.auth.builtin.PKI-DH.identity_crl";
pub const PRIVATE_KEY_PROPERTY_NAME: &str = "dds.sec.auth.builtin.PKI-DH.private_key";
pub const PASSWORD_PROPERTY_NAME: &str = "dds.sec.auth.builtin.PKI-DH.password";
pub const PREFERRED_KEY_AGREEMENT_PROPERTY_NAME: &str =
  "dds.sec.auth.builtin.PKI-DH.preferred_key_agreement";
pub const TRANSMIT_LEGACY_ALGORITHMS_PROPERTY_NAME: &str =
  "dds.sec.auth.builtin.PKI-DH.transmit_algorithms_as_legacy";

// Algorithm naming. Two sets are in circulation: the legacy internal names
// that older DDS implementations put on the wire, and the names the DDS
// Security 1.1 specification mandates. One set is chosen for serialization
// by configuration; both are accepted on input. Matching is by the full
// string, never by substring.
//
//   internal / legacy      DDS-SEC 1.1 token      DDS-SEC 1.1 dsign
//   "RSA_SHA256"           "RSA-2048"             "RSASSA-PSS-SHA256"
//   "ECDSA_SHA256"         "EC-prime256v1"        "ECDSA-SHA256"
//
// Key agreement names are shared by both sets, with the config-only
// aliases "DH" and "ECDH".
const RSA_LEGACY_NAME: &str = "RSA_SHA256";
const EC_LEGACY_NAME: &str = "ECDSA_SHA256";
const RSA_TOKEN_NAME: &str = "RSA-2048";
const EC_TOKEN_NAME: &str = "EC-prime256v1";
const RSA_DSIGN_NAME: &str = "RSASSA-PSS-SHA256";
const EC_DSIGN_NAME: &str = "ECDSA-SHA256";

pub const DH_MODP_KAGREE_ALGO_NAME: &str = "DH+MODP-2048-256";
pub const ECDH_KAGREE_ALGO_NAME: &str = "ECDH+prime256v1-CEUM";

/// The two public-key algorithms the plugin accepts in certificates.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CertificateAlgorithm {
  RsaSha256,
  EcdsaSha256,
}

impl CertificateAlgorithm {
  pub fn from_certificate_key(algorithm: Option<KeyAlgorithm>) -> SecurityResult<Self> {
    match algorithm {
      Some(KeyAlgorithm::Rsa) => Ok(Self::RsaSha256),
      Some(KeyAlgorithm::Ecdsa(_)) => Ok(Self::EcdsaSha256),
      other => Err(create_security_error_and_log!(
        "Unsupported certificate key algorithm: {other:?}"
      )),
    }
  }

  /// Name used in IdentityToken properties (dds.cert.algo / dds.ca.algo).
  pub fn token_algo_name(&self, legacy: bool) -> &'static str {
    match (self, legacy) {
      (Self::RsaSha256, true) => RSA_LEGACY_NAME,
      (Self::RsaSha256, false) => RSA_TOKEN_NAME,
      (Self::EcdsaSha256, true) => EC_LEGACY_NAME,
      (Self::EcdsaSha256, false) => EC_TOKEN_NAME,
    }
  }

  /// Name used in the c.dsign_algo handshake field.
  pub fn dsign_algo_name(&self, legacy: bool) -> &'static str {
    match (self, legacy) {
      (Self::RsaSha256, true) => RSA_LEGACY_NAME,
      (Self::RsaSha256, false) => RSA_DSIGN_NAME,
      (Self::EcdsaSha256, true) => EC_LEGACY_NAME,
      (Self::EcdsaSha256, false) => EC_DSIGN_NAME,
    }
  }

  /// Accepts any of the names from either naming set.
  pub fn parse(name: &str) -> SecurityResult<Self> {
    match name {
      RSA_LEGACY_NAME | RSA_TOKEN_NAME | RSA_DSIGN_NAME => Ok(Self::RsaSha256),
      EC_LEGACY_NAME | EC_TOKEN_NAME | EC_DSIGN_NAME => Ok(Self::EcdsaSha256),
      other => Err(create_security_error_and_log!(
        "Unknown signature algorithm name {other:?}"
      )),
    }
  }

  /// The ring algorithm that verifies signatures produced under this
  /// certificate algorithm.
  pub fn verification_algorithm(
    &self,
  ) -> &'static dyn ring_signature::VerificationAlgorithm {
    match self {
      Self::RsaSha256 => &ring_signature::RSA_PSS_2048_8192_SHA256,
      Self::EcdsaSha256 => &ring_signature::ECDSA_P256_SHA256_ASN1,
    }
  }
}

/// Maps a received c.dsign_algo value to the ring verification algorithm,
/// accepting both naming sets.
pub fn parse_signature_algo_name_to_ring(
  algo_name: &[u8],
) -> SecurityResult<&'static dyn ring_signature::VerificationAlgorithm> {
  let name = std::str::from_utf8(algo_name)
    .map_err(|_| create_security_error_and_log!("Signature algorithm name is not UTF-8"))?;
  CertificateAlgorithm::parse(name).map(|a| a.verification_algorithm())
}

/// Configured key agreement preference.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum KeyAgreementPreference {
  /// Follow the CA's signature algorithm: RSA chooses classic DH, anything
  /// else the elliptic curve.
  #[default]
  Auto,
  DhModp2048,
  EcdhP256,
}

impl KeyAgreementPreference {
  /// Accepts the full algorithm names and the short config aliases.
  pub fn parse(value: &str) -> SecurityResult<Self> {
    match value {
      "AUTO" => Ok(Self::Auto),
      "DH" | DH_MODP_KAGREE_ALGO_NAME => Ok(Self::DhModp2048),
      "ECDH" | ECDH_KAGREE_ALGO_NAME => Ok(Self::EcdhP256),
      other => Err(create_security_error_and_log!(
        "Invalid key agreement algorithm '{other}'"
      )),
    }
  }
}

/// Contents of the IdentityToken of this plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltinIdentityToken {
  pub certificate_subject: String,
  pub certificate_algorithm: CertificateAlgorithm,
  pub ca_subject: String,
  pub ca_algorithm: CertificateAlgorithm,
}

impl BuiltinIdentityToken {
  pub fn to_token(&self, legacy: bool) -> IdentityToken {
    let mut holder = DataHolder::with_class_id(IDENTITY_TOKEN_CLASS_ID);
    holder.properties = vec![
      Property::with_propagate(CERT_SN_PROPERTY_NAME, self.certificate_subject.clone()),
      Property::with_propagate(
        CERT_ALGO_PROPERTY_NAME,
        self.certificate_algorithm.token_algo_name(legacy).to_string(),
      ),
      Property::with_propagate(CA_SN_PROPERTY_NAME, self.ca_subject.clone()),
      Property::with_propagate(
        CA_ALGO_PROPERTY_NAME,
        self.ca_algorithm.token_algo_name(legacy).to_string(),
      ),
    ];
    IdentityToken {
      data_holder: holder,
    }
  }

  pub fn try_from_token(token: &IdentityToken) -> SecurityResult<Self> {
    if token.class_id() != IDENTITY_TOKEN_CLASS_ID {
      return Err(create_security_error_and_log!(
        "Identity token class_id is {:?}",
        token.class_id()
      ));
    }
    let holder = &token.data_holder;
    let get = |name: &str| -> SecurityResult<String> {
      holder
        .get_property(name)
        .map(str::to_string)
        .ok_or_else(|| create_security_error_and_log!("Identity token missing {name}"))
    };
    Ok(Self {
      certificate_subject: get(CERT_SN_PROPERTY_NAME)?,
      certificate_algorithm: CertificateAlgorithm::parse(&get(CERT_ALGO_PROPERTY_NAME)?)?,
      ca_subject: get(CA_SN_PROPERTY_NAME)?,
      ca_algorithm: CertificateAlgorithm::parse(&get(CA_ALGO_PROPERTY_NAME)?)?,
    })
  }
}

/// All binary fields a handshake message token may carry. Which of them
/// must be present depends on the message class.
#[derive(Debug, Clone, Default)]
pub struct BuiltinHandshakeMessageToken {
  pub class_id: String,
  pub c_id: Option<Bytes>,
  pub c_perm: Option<Bytes>,
  pub c_pdata: Option<Bytes>,
  pub c_dsign_algo: Option<Bytes>,
  pub c_kagree_algo: Option<Bytes>,
  pub hash_c1: Option<Bytes>,
  pub dh1: Option<Bytes>,
  pub hash_c2: Option<Bytes>,
  pub dh2: Option<Bytes>,
  pub challenge1: Option<Bytes>,
  pub challenge2: Option<Bytes>,
  pub signature: Option<Bytes>,
}

/// Validated contents of a `+Req` token.
pub struct HandshakeRequest {
  pub c_id: Bytes,
  pub c_perm: Bytes,
  pub c_pdata: Bytes,
  pub c_dsign_algo: Bytes,
  pub c_kagree_algo: Bytes,
  pub hash_c1: Option<Bytes>,
  pub dh1: Bytes,
  pub challenge1: Bytes,
}

/// Validated contents of a `+Reply` token.
pub struct HandshakeReply {
  pub c_id: Bytes,
  pub c_perm: Bytes,
  pub c_pdata: Bytes,
  pub c_dsign_algo: Bytes,
  pub c_kagree_algo: Bytes,
  pub hash_c1: Option<Bytes>,
  pub dh1: Bytes,
  pub hash_c2: Option<Bytes>,
  pub dh2: Bytes,
  pub challenge1: Bytes,
  pub challenge2: Bytes,
  pub signature: Bytes,
}

/// Validated contents of a `+Final` token.
pub struct HandshakeFinal {
  pub hash_c1: Option<Bytes>,
  pub dh1: Option<Bytes>,
  pub hash_c2: Option<Bytes>,
  pub dh2: Option<Bytes>,
  pub challenge1: Bytes,
  pub challenge2: Bytes,
  pub signature: Bytes,
}

impl BuiltinHandshakeMessageToken {
  pub fn extract_request(self) -> SecurityResult<HandshakeRequest> {
    if self.class_id != HANDSHAKE_REQUEST_CLASS_ID {
      return Err(create_security_error_and_log!(
        "Expected handshake request, class_id is {:?}",
        self.class_id
      ));
    }
    Ok(HandshakeRequest {
      c_id: required(self.c_id, "c.id")?,
      c_perm: self.c_perm.unwrap_or_default(),
      c_pdata: required(self.c_pdata, "c.pdata")?,
      c_dsign_algo: required(self.c_dsign_algo, "c.dsign_algo")?,
      c_kagree_algo: required(self.c_kagree_algo, "c.kagree_algo")?,
      hash_c1: self.hash_c1,
      dh1: required(self.dh1, "dh1")?,
      challenge1: required(self.challenge1, "challenge1")?,
    })
  }

  pub fn extract_reply(self) -> SecurityResult<HandshakeReply> {
    if self.class_id != HANDSHAKE_REPLY_CLASS_ID {
      return Err(create_security_error_and_log!(
        "Expected handshake reply, class_id is {:?}",
        self.class_id
      ));
    }
    Ok(HandshakeReply {
      c_id: required(self.c_id, "c.id")?,
      c_perm: self.c_perm.unwrap_or_default(),
      c_pdata: required(self.c_pdata, "c.pdata")?,
      c_dsign_algo: required(self.c_dsign_algo, "c.dsign_algo")?,
      c_kagree_algo: required(self.c_kagree_algo, "c.kagree_algo")?,
      hash_c1: self.hash_c1,
      dh1: required(self.dh1, "dh1")?,
      hash_c2: self.hash_c2,
      dh2: required(self.dh2, "dh2")?,
      challenge1: required(self.challenge1, "challenge1")?,
      challenge2: required(self.challenge2, "challenge2")?,
      signature: required(self.signature, "signature")?,
    })
  }

  pub fn extract_final(self) -> SecurityResult<HandshakeFinal> {
    if self.class_id != HANDSHAKE_FINAL_CLASS_ID {
      return Err(create_security_error_and_log!(
        "Expected handshake final, class_id is {:?}",
        self.class_id
      ));
    }
    Ok(HandshakeFinal {
      hash_c1: self.hash_c1,
      dh1: self.dh1,
      hash_c2: self.hash_c2,
      dh2: self.dh2,
      challenge1: required(self.challenge1, "challenge1")?,
      challenge2: required(self.challenge2, "challenge2")?,
      signature: required(self.signature, "signature")?,
    })
  }
}

fn required(field: Option<Bytes>, name: &str) -> SecurityResult<Bytes> {
  field.ok_or_else(|| {
    create_security_error_and_log!("Handshake token is missing the {name} property")
  })
}

impl From<BuiltinHandshakeMessageToken> for HandshakeMessageToken {
  fn from(token: BuiltinHandshakeMessageToken) -> Self {
    let mut holder = DataHolder::with_class_id(&token.class_id);
    let mut push = |name: &str, value: Option<Bytes>| {
      if let Some(value) = value {
        holder
          .binary_properties
          .push(BinaryProperty::with_propagate(name, value));
      }
    };
    push("c.id", token.c_id);
    push("c.perm", token.c_perm);
    push("c.pdata", token.c_pdata);
    push("c.dsign_algo", token.c_dsign_algo);
    push("c.kagree_algo", token.c_kagree_algo);
    push("hash_c1", token.hash_c1);
    push("dh1", token.dh1);
    push("hash_c2", token.hash_c2);
    push("dh2", token.dh2);
    push("challenge1", token.challenge1);
    push("challenge2", token.challenge2);
    push("signature", token.signature);
    HandshakeMessageToken {
      data_holder: holder,
    }
  }
}

impl TryFrom<HandshakeMessageToken> for BuiltinHandshakeMessageToken {
  type Error = SecurityError;

  fn try_from(token: HandshakeMessageToken) -> SecurityResult<Self> {
    let holder = token.data_holder;
    let get = |name: &str| holder.get_binary_property(name);
    Ok(Self {
      class_id: holder.class_id.clone(),
      c_id: get("c.id"),
      c_perm: get("c.perm"),
      c_pdata: get("c.pdata"),
      c_dsign_algo: get("c.dsign_algo"),
      c_kagree_algo: get("c.kagree_algo"),
      hash_c1: get("hash_c1"),
      dh1: get("dh1"),
      hash_c2: get("hash_c2"),
      dh2: get("dh2"),
      challenge1: get("challenge1"),
      challenge2: get("challenge2"),
      signature: get("signature"),
    })
  }
}
