//! Authentication plugin interface: outcomes, handles and the secret
//! material produced by a completed handshake.

use std::fmt;

pub mod authentication_builtin;

pub use authentication_builtin::AuthenticationBuiltin;

/// Result category of one authentication plugin call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ValidationOutcome {
  Ok,
  /// Local side must send the handshake request.
  PendingHandshakeRequest,
  /// Waiting for the next message from the remote side.
  PendingHandshakeMessage,
  /// Handshake complete, and a final message must still be sent.
  OkFinalMessage,
}

/// Opaque reference to a validated identity, local or remote.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityHandle(pub(crate) u32);

/// Opaque reference to one handshake in progress.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandshakeHandle(pub(crate) u32);

/// 256-bit handshake nonce.
#[derive(Clone, PartialEq, Eq)]
pub struct Challenge([u8; 32]);

impl From<[u8; 32]> for Challenge {
  fn from(bytes: [u8; 32]) -> Self {
    Self(bytes)
  }
}

impl AsRef<[u8]> for Challenge {
  fn as_ref(&self) -> &[u8] {
    &self.0
  }
}

impl fmt::Debug for Challenge {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Challenge({:02x}{:02x}..)", self.0[0], self.0[1])
  }
}

/// The 32-byte shared secret derived by both ends of a successful
/// handshake: SHA-256 of the raw key agreement output.
///
/// Never serialized and never logged; the Debug impl is deliberately
/// opaque.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
  /// Key material access for the cryptographic transform plugin.
  pub fn as_bytes(&self) -> &[u8; 32] {
    &self.0
  }
}

impl From<[u8; 32]> for SharedSecret {
  fn from(bytes: [u8; 32]) -> Self {
    Self(bytes)
  }
}

impl fmt::Debug for SharedSecret {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "SharedSecret(<redacted>)")
  }
}

/// Outcome of a successful handshake, consumed by the (external)
/// cryptographic plugin: the secret plus both challenges for key-id
/// derivation.
#[derive(Clone, Debug)]
pub struct SharedSecretHandle {
  pub challenge1: Challenge,
  pub challenge2: Challenge,
  pub shared_secret: SharedSecret,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn shared_secret_debug_is_redacted() {
    let secret = SharedSecret::from([0xab; 32]);
    let shown = format!("{secret:?}");
    assert!(!shown.contains("ab"));
    assert!(shown.contains("redacted"));
  }
}
