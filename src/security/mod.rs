//! DDS Security: the builtin PKI-DH authentication plugin and its
//! supporting certificate, key and configuration machinery.

use std::fmt;

pub mod authentication;
pub mod certificate;
pub mod config;
pub mod openssl_init;
pub mod private_key;
#[cfg(test)]
pub(crate) mod test_keys;
pub mod types;

pub use types::*;

/// Error type of the security plugin surface. Validation and crypto
/// failures both end up here; the message carries the underlying cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityError {
  pub msg: String,
}

impl fmt::Display for SecurityError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "SecurityError: {}", self.msg)
  }
}

impl std::error::Error for SecurityError {}

pub type SecurityResult<T> = Result<T, SecurityError>;

pub fn security_error(msg: &str) -> SecurityError {
  SecurityError {
    msg: msg.to_string(),
  }
}

/// Formats a security error and logs it in one step, so that every
/// validation failure leaves a trace at the point of detection.
#[macro_export]
macro_rules! create_security_error_and_log {
  ($($arg:tt)*) => {{
    let msg = format!($($arg)*);
    log::error!("{}", msg);
    $crate::security::SecurityError { msg }
  }};
}

impl From<openssl::error::ErrorStack> for SecurityError {
  fn from(e: openssl::error::ErrorStack) -> Self {
    SecurityError {
      msg: format!("OpenSSL error: {e}"),
    }
  }
}

impl From<ring::error::Unspecified> for SecurityError {
  fn from(_: ring::error::Unspecified) -> Self {
    SecurityError {
      msg: "Cryptographic primitive failure".to_string(),
    }
  }
}

impl From<x509_certificate::X509CertificateError> for SecurityError {
  fn from(e: x509_certificate::X509CertificateError) -> Self {
    SecurityError {
      msg: format!("X.509 certificate error: {e}"),
    }
  }
}

impl From<config::ConfigError> for SecurityError {
  fn from(e: config::ConfigError) -> Self {
    SecurityError {
      msg: format!("Configuration error: {e:?}"),
    }
  }
}

impl From<std::io::Error> for SecurityError {
  fn from(e: std::io::Error) -> Self {
    SecurityError {
      msg: format!("I/O error: {e}"),
    }
  }
}
