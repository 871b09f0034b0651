//! Reassembly of large samples from out-of-order DATA_FRAG submessages.

use std::collections::BTreeMap;

use bit_vec::BitVec;
use bytes::{Bytes, BytesMut};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
  messages::submessages::DataFrag,
  structure::{duration::Duration, sequence_number::SequenceNumber, time::Timestamp},
};

/// One partially reassembled sample.
struct AssemblyBuffer {
  buffer: BytesMut,
  fragment_count: u32,
  fragments_received: u32,
  received_bitmap: BitVec,
  modified: Timestamp,
}

impl AssemblyBuffer {
  fn new(data_size: u32, fragment_count: u32, now: Timestamp) -> Self {
    let mut buffer = BytesMut::with_capacity(data_size as usize);
    buffer.resize(data_size as usize, 0);
    Self {
      buffer,
      fragment_count,
      fragments_received: 0,
      received_bitmap: BitVec::from_elem(fragment_count as usize, false),
      modified: now,
    }
  }

  fn is_complete(&self) -> bool {
    self.fragments_received == self.fragment_count
  }
}

/// Per-writer fragment reassembler. Buffers are keyed by sequence number;
/// a completed buffer is promoted to the whole serialized payload, an
/// abandoned one is garbage collected by age.
pub struct FragmentAssembler {
  fragment_size: u16,
  assembly_buffers: BTreeMap<SequenceNumber, AssemblyBuffer>,
}

impl FragmentAssembler {
  pub fn new(fragment_size: u16) -> Self {
    Self {
      fragment_size,
      assembly_buffers: BTreeMap::new(),
    }
  }

  /// Feeds one DATA_FRAG. Returns the complete payload when this fragment
  /// was the last missing piece.
  pub fn new_datafrag(&mut self, datafrag: &DataFrag, now: Timestamp) -> Option<Bytes> {
    let sn = datafrag.writer_sn;
    let frag_size = datafrag.fragment_size;
    if frag_size == 0 {
      warn!("DATA_FRAG with zero fragment_size from sn {sn:?}");
      return None;
    }
    if frag_size != self.fragment_size {
      // Writers keep one fragment size per endpoint; a change mid-stream
      // would corrupt pending buffers keyed to the old size.
      debug!(
        "DATA_FRAG fragment_size {} differs from expected {}",
        frag_size, self.fragment_size
      );
    }

    let fragment_count = datafrag.total_fragments();
    let buffer = self
      .assembly_buffers
      .entry(sn)
      .or_insert_with(|| AssemblyBuffer::new(datafrag.data_size, fragment_count, now));

    let start_frag = datafrag.fragment_starting_num.0; // 1-based
    let payload = &datafrag.serialized_payload;

    for i in 0..datafrag.fragments_in_submessage as u32 {
      let frag_num = start_frag + i;
      if frag_num == 0 || frag_num > buffer.fragment_count {
        warn!("DATA_FRAG fragment number {frag_num} out of range for sn {sn:?}");
        break;
      }
      let idx = (frag_num - 1) as usize;
      if buffer.received_bitmap.get(idx) == Some(true) {
        continue; // duplicate fragment
      }

      let from = (i * frag_size as u32) as usize;
      let to = payload.len().min(from + frag_size as usize);
      if from >= payload.len() {
        warn!("DATA_FRAG payload shorter than declared fragment count");
        break;
      }
      let dest_from = (idx as u32 * frag_size as u32) as usize;
      let dest_to = buffer.buffer.len().min(dest_from + (to - from));
      buffer.buffer[dest_from..dest_to].copy_from_slice(&payload[from..from + (dest_to - dest_from)]);

      buffer.received_bitmap.set(idx, true);
      buffer.fragments_received += 1;
    }
    buffer.modified = now;

    if buffer.is_complete() {
      trace!("Sample {sn:?} complete with {} fragments", buffer.fragment_count);
      let done = self.assembly_buffers.remove(&sn)?;
      Some(done.buffer.freeze())
    } else {
      None
    }
  }

  /// Aborts a pending reassembly; used when a GAP covers the sample.
  pub fn release(&mut self, sn: SequenceNumber) {
    if self.assembly_buffers.remove(&sn).is_some() {
      debug!("Dropped partial reassembly of {sn:?}");
    }
  }

  /// Drops buffers that have not seen a fragment within `timeout`.
  pub fn garbage_collect(&mut self, now: Timestamp, timeout: Duration) {
    self
      .assembly_buffers
      .retain(|sn, buf| {
        let keep = now.duration_since(buf.modified) < timeout;
        if !keep {
          debug!("Reassembly of {sn:?} timed out");
        }
        keep
      });
  }

  pub fn pending_count(&self) -> usize {
    self.assembly_buffers.len()
  }
}
