//! Process-global OpenSSL initialization.
//!
//! OpenSSL keeps process-wide state; its initialization must happen once,
//! before the first key or certificate operation, no matter how many
//! participants are running.

use std::sync::Once;

static OPENSSL_INIT: Once = Once::new();

pub fn ensure_initialized() {
  OPENSSL_INIT.call_once(openssl::init);
}
