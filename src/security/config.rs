//! Configuration plumbing for the security plugin: document URIs and the
//! file bundle a secured participant needs.

use std::{
  fmt::Debug,
  path::{Path, PathBuf},
};

use bytes::Bytes;

use crate::security::private_key::PrivateKey;

/// How to access the certificate's private key for signing.
pub enum PrivateSigningKey {
  /// Private key is stored in a regular .pem file. The contents may be
  /// encrypted with a password.
  Files {
    /// Where the PEM file is stored
    file_path: PathBuf,
    /// Decryption key, if the private key file is encrypted
    file_password: Option<String>,
  },
  /// The private key is held by a PKCS#11 Hardware Security Module, which
  /// typically refuses to output the key. Signing operations are done by
  /// the HSM.
  ///
  /// Note: there is no mechanism for choosing an object within the
  /// selected token. The first suitable object is used, recognized by
  /// ObjectClass = PRIVATE_KEY and Sign = true.
  Pkcs11 {
    /// Dynamic library file for accessing the HSM, e.g.
    /// "/usr/lib/softhsm/libsofthsm2.so". Use an absolute path.
    hsm_access_library: PathBuf,
    /// Label of the token to use, per PKCS#11 CK_TOKEN_INFO.
    token_label: String,
    /// Login PIN to operate the token, if any. Despite the name, the PIN
    /// is alphanumeric.
    token_pin: Option<String>,
  },
}

/// Paths to the documents that configure authentication for one
/// participant.
pub struct ParticipantSecurityConfigFiles {
  /// CA that is used to validate identities of participants.
  pub identity_ca_certificate: PathBuf,
  /// Identity document for this participant.
  pub participant_identity_certificate: PathBuf,
  /// Private (signing) key for this participant.
  pub participant_identity_private_key: PrivateSigningKey,
  /// Certificate revocation list of the identity CA, if one is published.
  pub certificate_revocation_list: Option<PathBuf>,
  /// Signed access permissions document, carried opaquely in the
  /// handshake.
  pub participant_permissions_document: PathBuf,
}

impl ParticipantSecurityConfigFiles {
  /// Conventional file names inside one configuration directory.
  pub fn with_default_names(
    security_config_dir: impl AsRef<Path>,
    private_key_password: Option<String>,
  ) -> Self {
    let d = security_config_dir;
    ParticipantSecurityConfigFiles {
      identity_ca_certificate: own_and_append(&d, "identity_ca.cert.pem"),
      participant_identity_certificate: own_and_append(&d, "cert.pem"),
      participant_identity_private_key: PrivateSigningKey::Files {
        file_path: own_and_append(&d, "key.pem"),
        file_password: private_key_password,
      },
      certificate_revocation_list: None, // "crl.pem"
      participant_permissions_document: own_and_append(&d, "permissions.p7s"),
    }
  }

  pub fn private_key_uri(&self) -> String {
    match &self.participant_identity_private_key {
      PrivateSigningKey::Files { file_path, .. } => {
        format!("file://{}", file_path.display())
      }
      PrivateSigningKey::Pkcs11 {
        hsm_access_library,
        token_label,
        token_pin,
      } => {
        // for example
        // pkcs11:object=my_key?pin-value=OpenSesame&module-path=/usr/lib/libhsm.so
        let mut uri = format!("pkcs11:object={token_label}");
        uri.push('?');
        if let Some(pin) = token_pin {
          uri.push_str(&format!("pin-value={pin}&"));
        }
        uri.push_str(&format!("module-path={}", hsm_access_library.display()));
        uri
      }
    }
  }
}

fn own_and_append(d: impl AsRef<Path>, f: impl AsRef<Path>) -> PathBuf {
  let mut pb = d.as_ref().to_path_buf();
  pb.push(f);
  pb
}

/// Reads the document behind a configuration URI.
///
/// Accepted schemes: `file://<path>` (also the lax `file:<path>` form) and
/// `data:,<content>`. `pkcs11:` names a key inside an HSM, so there is no
/// document to read. Anything else is an unsupported URI format.
pub fn read_uri(uri: &str) -> Result<Bytes, ConfigError> {
  match uri.split_once(':') {
    Some(("data", content)) => Ok(Bytes::copy_from_slice(
      content.strip_prefix(',').unwrap_or(content).as_bytes(),
    )),
    Some(("pkcs11", _)) => Err(other_config_error(
      "URI scheme 'pkcs11:' names a key object, not a readable document".to_owned(),
    )),
    Some(("file", path)) => {
      let path = path.strip_prefix("//").unwrap_or(path);
      std::fs::read(path)
        .map_err(to_config_error_other(&format!("I/O error reading {path}")))
        .map(Bytes::from)
    }
    _ => Err(parse_config_error(format!(
      "Unsupported URI format: {uri}"
    ))),
  }
}

/// Loads a private key from `file:`, `data:` or `pkcs11:` URIs.
pub fn read_uri_to_private_key(uri: &str) -> Result<PrivateKey, ConfigError> {
  match uri.split_once(':') {
    Some(("data", content)) => {
      PrivateKey::from_pem(content.strip_prefix(',').unwrap_or(content).as_bytes())
    }
    Some(("pkcs11", path_and_query)) => {
      // These URIs are composed of "pkcs11" ":" path [ "?" query ]
      PrivateKey::from_pkcs11_uri_path_and_query(path_and_query)
    }
    Some(("file", path)) => {
      let path = path.strip_prefix("//").unwrap_or(path);
      std::fs::read(path)
        .map_err(to_config_error_other(&format!("I/O error reading {path}")))
        .and_then(|bytes| PrivateKey::from_pem(&bytes))
    }
    _ => Err(parse_config_error(format!(
      "Unsupported URI format: {uri}"
    ))),
  }
}

#[derive(Debug)]
pub enum ConfigError {
  Parse(String),
  Pkcs11(String),
  Security(String),
  Other(String),
}

impl From<cryptoki::error::Error> for ConfigError {
  fn from(e: cryptoki::error::Error) -> ConfigError {
    ConfigError::Pkcs11(format!("PKCS11 hardware security module error: {e:?}"))
  }
}

pub(crate) fn to_config_error_other<E: Debug + 'static>(
  text: &str,
) -> impl FnOnce(E) -> ConfigError + '_ {
  move |e: E| ConfigError::Other(format!("{text}: {e:?}"))
}

pub(crate) fn parse_config_error(text: String) -> ConfigError {
  ConfigError::Parse(text)
}

pub(crate) fn other_config_error(text: String) -> ConfigError {
  ConfigError::Other(text)
}
