// Describe the communication status changes as events.
//
// These implement a mechanism equivalent to what is described in
// Section 2.2.4 Listeners, Conditions, and Wait-sets of the DDS
// specification v1.4: instead of listener objects holding back-pointers
// into the endpoints, every state transition emits a typed event onto a
// per-endpoint channel and whoever would have been the listener consumes
// the channel.

use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError, TrySendError};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  dds::result::SampleRejectedReason,
  structure::{cache_change::InstanceHandle, guid::GUID, sequence_number::SequenceNumber},
};

/// Status changes a DataWriter reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataWriterStatus {
  OfferedDeadlineMissed {
    total_count: i32,
    total_count_change: i32,
    last_instance: InstanceHandle,
  },
  LifespanExpired {
    sequence_number: SequenceNumber,
  },
}

/// Status changes a DataReader reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataReaderStatus {
  SampleLost {
    total_count: i32,
    total_count_change: i32,
  },
  SampleRejected {
    total_count: i32,
    total_count_change: i32,
    reason: SampleRejectedReason,
    last_instance: InstanceHandle,
  },
  LivelinessAsserted {
    writer: GUID,
  },
}

/// Bounded status channel. Sending never blocks: status events are
/// advisory, so a full channel simply drops the event and a missing
/// receiver is not an error either.
pub fn sync_status_channel<T>(capacity: usize) -> (StatusChannelSender<T>, StatusChannelReceiver<T>) {
  let (sender, receiver) = mpsc::sync_channel(capacity);
  (
    StatusChannelSender { sender },
    StatusChannelReceiver { receiver },
  )
}

#[derive(Clone)]
pub struct StatusChannelSender<T> {
  sender: SyncSender<T>,
}

impl<T> StatusChannelSender<T> {
  /// Best-effort send. No-one is required to be listening to these, so
  /// both a full channel and a hung-up receiver lose the event silently.
  pub fn try_send(&self, t: T) {
    match self.sender.try_send(t) {
      Ok(()) => {}
      Err(TrySendError::Full(_)) => {
        trace!("StatusChannelSender: channel full, dropping status event");
      }
      Err(TrySendError::Disconnected(_)) => {
        trace!("StatusChannelSender: no receiver, dropping status event");
      }
    }
  }
}

pub struct StatusChannelReceiver<T> {
  receiver: Receiver<T>,
}

impl<T> StatusChannelReceiver<T> {
  pub fn try_recv(&self) -> Option<T> {
    match self.receiver.try_recv() {
      Ok(t) => Some(t),
      Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
    }
  }

  pub fn drain(&self) -> Vec<T> {
    let mut out = Vec::new();
    while let Some(t) = self.try_recv() {
      out.push(t);
    }
    out
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn events_flow_in_order() {
    let (tx, rx) = sync_status_channel(4);
    tx.try_send(1u32);
    tx.try_send(2u32);
    assert_eq!(rx.try_recv(), Some(1));
    assert_eq!(rx.try_recv(), Some(2));
    assert_eq!(rx.try_recv(), None);
  }

  #[test]
  fn full_channel_drops_instead_of_blocking() {
    let (tx, rx) = sync_status_channel(1);
    tx.try_send(1u32);
    tx.try_send(2u32); // dropped
    assert_eq!(rx.drain(), vec![1]);
  }

  #[test]
  fn hung_up_receiver_is_not_an_error() {
    let (tx, rx) = sync_status_channel::<u32>(1);
    drop(rx);
    tx.try_send(1); // silently lost
  }
}
