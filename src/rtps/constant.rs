use crate::structure::duration::Duration;

/// Well-known discovery server port over UDP.
pub const DEFAULT_DISCOVERY_UDP_PORT: u16 = 11811;
/// Well-known discovery server port over TCP.
pub const DEFAULT_DISCOVERY_TCP_PORT: u16 = 42100;

/// Port gain per domain for participant metatraffic unicast.
const PORT_GAIN_PER_DOMAIN: u16 = 250;
const METATRAFFIC_UNICAST_OFFSET: u16 = 2;

/// Participant metatraffic unicast port for a domain. `None` when the
/// domain id pushes the port out of the 16-bit range.
pub fn metatraffic_unicast_port(domain_id: u16) -> Option<u16> {
  DEFAULT_DISCOVERY_UDP_PORT
    .checked_add(domain_id.checked_mul(PORT_GAIN_PER_DOMAIN)?)?
    .checked_add(METATRAFFIC_UNICAST_OFFSET)
}

/// How long a freshly matched reader waits before its first unsolicited
/// ACKNACK.
pub const INITIAL_ACKNACK_DELAY: Duration = Duration::from_millis(70);

/// Delay before answering a HEARTBEAT with an ACKNACK, so that responses to
/// bursts of heartbeats coalesce.
pub const HEARTBEAT_RESPONSE_DELAY: Duration = Duration::from_millis(5);

/// Serialized payloads above this many bytes go out as DATA_FRAG, when the
/// publish mode permits.
pub const DEFAULT_FRAGMENT_SIZE_THRESHOLD: u32 = 65000;

/// Reassembly buffers untouched for this long are garbage collected.
pub const FRAGMENT_ASSEMBLY_TIMEOUT: Duration = Duration::from_secs(10);

#[cfg(test)]
mod tests {
  use test_case::test_case;

  use super::*;

  #[test_case(0, Some(11813) ; "domain zero")]
  #[test_case(1, Some(12063) ; "domain one")]
  #[test_case(2, Some(12313) ; "domain two")]
  #[test_case(u16::MAX, None ; "domain pushes the port out of range")]
  fn metatraffic_ports_per_domain(domain_id: u16, expected: Option<u16>) {
    assert_eq!(metatraffic_unicast_port(domain_id), expected);
  }
}
