//! ferrite-dds implements the three demanding cores of an RTPS
//! (Real-Time Publish-Subscribe) middleware:
//!
//! * the reader-side reliable-delivery state machine
//!   ([`rtps::rtps_writer_proxy`], [`rtps::reader`]), which reconstructs
//!   in-order delivery from out-of-order DATA, DATA_FRAG, HEARTBEAT and
//!   GAP traffic and drives selective acknowledgement,
//! * the writer-side history and QoS enforcement engine
//!   ([`history::writer_history`], [`rtps::writer`]) with keep-last /
//!   keep-all admission, per-instance depth, deadline and lifespan timers
//!   and fragmentation, and
//! * the DDS Security PKI-DH authentication handshake
//!   ([`security::authentication`], behind the `security` feature), which
//!   bootstraps a per-participant-pair shared secret.
//!
//! Transports, discovery and the participant facade are external
//! collaborators: submessages come in and go out as structs, and the
//! caller provides the threads that pump them.

pub mod dds;
pub mod history;
pub mod messages;
pub mod rtps;
pub mod structure;

#[cfg(feature = "security")]
pub mod security;

pub use dds::qos::{policy, QosPolicies, QosPolicyBuilder, TopicKind};
pub use structure::{
  cache_change::{CacheChange, ChangeKind, InstanceHandle, WriteParams},
  change_pool::{ChangePool, ChangeRef},
  duration::Duration,
  guid::{EntityId, EntityKind, GuidPrefix, GUID},
  sequence_number::{FragmentNumber, SequenceNumber, SequenceNumberSet},
  time::Timestamp,
};
