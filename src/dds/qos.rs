//! QoS policies consumed by the history and reliability cores.

use serde::{Deserialize, Serialize};

use crate::structure::duration::Duration;

/// Whether samples carry a key, which turns on per-instance bookkeeping in
/// both histories.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopicKind {
  NoKey,
  WithKey,
}

pub mod policy {
  use super::*;

  #[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
  pub enum History {
    KeepAll,
    KeepLast { depth: i32 },
  }

  #[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
  pub struct ResourceLimits {
    pub max_samples: i32,
    pub max_instances: i32,
    pub max_samples_per_instance: i32,
    /// Change-pool slots preallocated at history construction.
    pub allocated_samples: i32,
  }

  impl Default for ResourceLimits {
    fn default() -> Self {
      Self {
        max_samples: 5000,
        max_instances: 10,
        max_samples_per_instance: 400,
        allocated_samples: 100,
      }
    }
  }

  #[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
  pub enum Reliability {
    BestEffort,
    Reliable {
      /// Upper bound on how long a KEEP_ALL write may block waiting for
      /// space. A deadline, not an interval.
      max_blocking_time: Duration,
    },
  }

  #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
  pub enum Durability {
    Volatile,
    TransientLocal,
    Transient,
    Persistent,
  }

  #[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
  pub enum Ownership {
    Shared,
    Exclusive { strength: i32 },
  }

  #[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
  pub struct Deadline {
    pub period: Duration,
  }

  #[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
  pub struct Lifespan {
    pub duration: Duration,
  }

  /// Fast-path vs background emission. Oversized samples can only be
  /// fragmented when publishing asynchronously.
  #[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
  pub enum PublishMode {
    Synchronous,
    Asynchronous,
  }

  #[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
  pub struct DisablePositiveAcks {
    pub enabled: bool,
    pub duration: Duration,
  }
}

/// Aggregate of all policies an endpoint carries. Unset fields fall back to
/// the DDS defaults through the accessor methods.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QosPolicies {
  pub history: Option<policy::History>,
  pub resource_limits: Option<policy::ResourceLimits>,
  pub reliability: Option<policy::Reliability>,
  pub durability: Option<policy::Durability>,
  pub ownership: Option<policy::Ownership>,
  pub deadline: Option<policy::Deadline>,
  pub lifespan: Option<policy::Lifespan>,
  pub publish_mode: Option<policy::PublishMode>,
  pub disable_positive_acks: Option<policy::DisablePositiveAcks>,
}

impl QosPolicies {
  pub fn builder() -> QosPolicyBuilder {
    QosPolicyBuilder::new()
  }

  pub fn history(&self) -> policy::History {
    self.history.unwrap_or(policy::History::KeepLast { depth: 1 })
  }

  pub fn resource_limits(&self) -> policy::ResourceLimits {
    self.resource_limits.unwrap_or_default()
  }

  pub fn reliability(&self) -> policy::Reliability {
    self.reliability.unwrap_or(policy::Reliability::BestEffort)
  }

  pub fn is_reliable(&self) -> bool {
    matches!(self.reliability(), policy::Reliability::Reliable { .. })
  }

  pub fn durability(&self) -> policy::Durability {
    self.durability.unwrap_or(policy::Durability::Volatile)
  }

  pub fn ownership(&self) -> policy::Ownership {
    self.ownership.unwrap_or(policy::Ownership::Shared)
  }

  pub fn deadline_period(&self) -> Duration {
    self
      .deadline
      .map(|d| d.period)
      .unwrap_or(Duration::INFINITE)
  }

  pub fn lifespan_duration(&self) -> Duration {
    self
      .lifespan
      .map(|l| l.duration)
      .unwrap_or(Duration::INFINITE)
  }

  pub fn publish_mode(&self) -> policy::PublishMode {
    self
      .publish_mode
      .unwrap_or(policy::PublishMode::Synchronous)
  }
}

#[derive(Clone, Debug, Default)]
pub struct QosPolicyBuilder {
  qos: QosPolicies,
}

impl QosPolicyBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn history(mut self, history: policy::History) -> Self {
    self.qos.history = Some(history);
    self
  }

  pub fn resource_limits(mut self, limits: policy::ResourceLimits) -> Self {
    self.qos.resource_limits = Some(limits);
    self
  }

  pub fn reliability(mut self, reliability: policy::Reliability) -> Self {
    self.qos.reliability = Some(reliability);
    self
  }

  pub fn best_effort(self) -> Self {
    self.reliability(policy::Reliability::BestEffort)
  }

  pub fn reliable(self, max_blocking_time: Duration) -> Self {
    self.reliability(policy::Reliability::Reliable { max_blocking_time })
  }

  pub fn durability(mut self, durability: policy::Durability) -> Self {
    self.qos.durability = Some(durability);
    self
  }

  pub fn ownership(mut self, ownership: policy::Ownership) -> Self {
    self.qos.ownership = Some(ownership);
    self
  }

  pub fn deadline(mut self, period: Duration) -> Self {
    self.qos.deadline = Some(policy::Deadline { period });
    self
  }

  pub fn lifespan(mut self, duration: Duration) -> Self {
    self.qos.lifespan = Some(policy::Lifespan { duration });
    self
  }

  pub fn publish_mode(mut self, mode: policy::PublishMode) -> Self {
    self.qos.publish_mode = Some(mode);
    self
  }

  pub fn disable_positive_acks(mut self, enabled: bool, duration: Duration) -> Self {
    self.qos.disable_positive_acks = Some(policy::DisablePositiveAcks { enabled, duration });
    self
  }

  pub fn build(self) -> QosPolicies {
    self.qos
  }
}
