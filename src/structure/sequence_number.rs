use std::ops::{Add, AddAssign, Sub};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};
use speedy::{Context, Readable, Reader, Writable, Writer};

/// Per-writer sample counter. Strictly monotonic, starts at 1; zero means
/// "none yet".
#[derive(
  Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SequenceNumber(i64);

impl SequenceNumber {
  pub const ZERO: Self = Self(0);

  pub const fn new(value: i64) -> Self {
    Self(value)
  }
}

impl From<i64> for SequenceNumber {
  fn from(value: i64) -> Self {
    Self(value)
  }
}

impl From<SequenceNumber> for i64 {
  fn from(sn: SequenceNumber) -> Self {
    sn.0
  }
}

impl Add<i64> for SequenceNumber {
  type Output = Self;
  fn add(self, other: i64) -> Self {
    Self(self.0 + other)
  }
}

impl AddAssign<i64> for SequenceNumber {
  fn add_assign(&mut self, other: i64) {
    self.0 += other;
  }
}

impl Sub<i64> for SequenceNumber {
  type Output = Self;
  fn sub(self, other: i64) -> Self {
    Self(self.0 - other)
  }
}

impl Sub for SequenceNumber {
  type Output = i64;
  fn sub(self, other: Self) -> i64 {
    self.0 - other.0
  }
}

// Wire form is { i32 high, u32 low }, each in submessage endianness.
impl<'a, C: Context> Readable<'a, C> for SequenceNumber {
  fn read_from<R: Reader<'a, C>>(reader: &mut R) -> Result<Self, C::Error> {
    let high = reader.read_i32()?;
    let low = reader.read_u32()?;
    Ok(Self(((high as i64) << 32) | (low as i64)))
  }
}

impl<C: Context> Writable<C> for SequenceNumber {
  fn write_to<T: ?Sized + Writer<C>>(&self, writer: &mut T) -> Result<(), C::Error> {
    writer.write_i32((self.0 >> 32) as i32)?;
    writer.write_u32((self.0 & 0xffff_ffff) as u32)
  }
}

/// 1-based index of a fragment within a fragmented sample.
#[derive(
  Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Readable,
  Writable,
)]
pub struct FragmentNumber(pub u32);

impl From<u32> for FragmentNumber {
  fn from(value: u32) -> Self {
    Self(value)
  }
}

const BITMAP_WINDOW: i64 = 256;
const BITMAP_WORDS: usize = 8;

/// Compact set of sequence numbers rooted at a base, covering at most
/// `[base, base+256)`. This is both the reader's missing-changes window and
/// the ACKNACK / GAP wire element.
///
/// Adding an element outside the window is a silent no-op so that protocol
/// code can attempt to record arbitrarily distant numbers and the set stays
/// within what the wire form can represent.
#[derive(Clone, Debug, Eq, Serialize, Deserialize)]
pub struct SequenceNumberSet {
  base: SequenceNumber,
  num_bits: u32,
  bitmap: [u32; BITMAP_WORDS],
}

impl SequenceNumberSet {
  pub fn new(base: SequenceNumber) -> Self {
    Self {
      base,
      num_bits: 0,
      bitmap: [0; BITMAP_WORDS],
    }
  }

  /// Set containing the whole range `[base, base + count)`.
  pub fn new_range(base: SequenceNumber, count: u32) -> Self {
    let mut set = Self::new(base);
    set.add_range(base, base + count as i64);
    set
  }

  pub fn base(&self) -> SequenceNumber {
    self.base
  }

  pub fn is_empty(&self) -> bool {
    self.bitmap.iter().all(|w| *w == 0)
  }

  pub fn count(&self) -> usize {
    self.bitmap.iter().map(|w| w.count_ones() as usize).sum()
  }

  fn offset(&self, sn: SequenceNumber) -> Option<usize> {
    let off = sn - self.base;
    if (0..BITMAP_WINDOW).contains(&off) {
      Some(off as usize)
    } else {
      None
    }
  }

  /// Returns false when `sn` falls outside the 256-element window.
  pub fn add(&mut self, sn: SequenceNumber) -> bool {
    match self.offset(sn) {
      Some(off) => {
        self.bitmap[off / 32] |= 0x8000_0000 >> (off % 32);
        self.num_bits = self.num_bits.max(off as u32 + 1);
        true
      }
      None => false,
    }
  }

  /// Adds `[from, to)`, clipped to the window.
  pub fn add_range(&mut self, from: SequenceNumber, to: SequenceNumber) {
    let mut sn = from.max(self.base);
    while sn < to {
      if !self.add(sn) {
        break; // ran past the window
      }
      sn += 1;
    }
  }

  pub fn remove(&mut self, sn: SequenceNumber) {
    if let Some(off) = self.offset(sn) {
      self.bitmap[off / 32] &= !(0x8000_0000 >> (off % 32));
    }
  }

  pub fn is_set(&self, sn: SequenceNumber) -> bool {
    match self.offset(sn) {
      Some(off) => self.bitmap[off / 32] & (0x8000_0000 >> (off % 32)) != 0,
      None => false,
    }
  }

  pub fn iter(&self) -> impl Iterator<Item = SequenceNumber> + '_ {
    let base = self.base;
    (0..self.num_bits as i64)
      .map(move |off| base + off)
      .filter(move |sn| self.is_set(*sn))
  }

  pub fn for_each<F: FnMut(SequenceNumber)>(&self, mut f: F) {
    for sn in self.iter() {
      f(sn);
    }
  }

  /// Elementwise union; elements of `other` outside this window are dropped.
  pub fn union_with(&mut self, other: &SequenceNumberSet) {
    other.for_each(|sn| {
      self.add(sn);
    });
  }
}

/// Equality is base-aware: two sets are equal when they contain the same
/// elements, regardless of base. The wire window received from a peer then
/// compares equal to the conceptually identical set built locally.
impl PartialEq for SequenceNumberSet {
  fn eq(&self, other: &Self) -> bool {
    if self.is_empty() && other.is_empty() {
      return true;
    }
    self.iter().all(|sn| other.is_set(sn)) && other.iter().all(|sn| self.is_set(sn))
  }
}

// Wire form: { base, u32 num_bits, u32 bitmap[ceil(num_bits/32)] }.
impl<'a, C: Context> Readable<'a, C> for SequenceNumberSet {
  fn read_from<R: Reader<'a, C>>(reader: &mut R) -> Result<Self, C::Error> {
    let base = SequenceNumber::read_from(reader)?;
    let mut num_bits = reader.read_u32()?;
    if num_bits > BITMAP_WINDOW as u32 {
      // The wire form cannot legitimately describe more. Clamp rather than
      // let a hostile peer dictate allocation.
      warn!("SequenceNumberSet with {num_bits} bits, clamping to {BITMAP_WINDOW}");
      num_bits = BITMAP_WINDOW as u32;
    }
    let word_count = num_bits.div_ceil(32) as usize;
    let mut bitmap = [0u32; BITMAP_WORDS];
    for word in bitmap.iter_mut().take(word_count) {
      *word = reader.read_u32()?;
    }
    Ok(Self {
      base,
      num_bits,
      bitmap,
    })
  }
}

impl<C: Context> Writable<C> for SequenceNumberSet {
  fn write_to<T: ?Sized + Writer<C>>(&self, writer: &mut T) -> Result<(), C::Error> {
    self.base.write_to(writer)?;
    writer.write_u32(self.num_bits)?;
    let word_count = self.num_bits.div_ceil(32) as usize;
    for word in self.bitmap.iter().take(word_count) {
      writer.write_u32(*word)?;
    }
    Ok(())
  }
}

/// Bitmap set of fragment numbers, used by NACK_FRAG. Same layout rules as
/// `SequenceNumberSet` with a 32-bit base.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentNumberSet {
  base: FragmentNumber,
  num_bits: u32,
  bitmap: [u32; BITMAP_WORDS],
}

impl FragmentNumberSet {
  pub fn new(base: FragmentNumber) -> Self {
    Self {
      base,
      num_bits: 0,
      bitmap: [0; BITMAP_WORDS],
    }
  }

  pub fn base(&self) -> FragmentNumber {
    self.base
  }

  pub fn add(&mut self, fnum: FragmentNumber) -> bool {
    let off = fnum.0 as i64 - self.base.0 as i64;
    if (0..BITMAP_WINDOW).contains(&off) {
      let off = off as usize;
      self.bitmap[off / 32] |= 0x8000_0000 >> (off % 32);
      self.num_bits = self.num_bits.max(off as u32 + 1);
      true
    } else {
      false
    }
  }

  pub fn is_set(&self, fnum: FragmentNumber) -> bool {
    let off = fnum.0 as i64 - self.base.0 as i64;
    (0..BITMAP_WINDOW).contains(&off)
      && self.bitmap[off as usize / 32] & (0x8000_0000 >> (off % 32)) != 0
  }
}

impl<'a, C: Context> Readable<'a, C> for FragmentNumberSet {
  fn read_from<R: Reader<'a, C>>(reader: &mut R) -> Result<Self, C::Error> {
    let base = FragmentNumber(reader.read_u32()?);
    let mut num_bits = reader.read_u32()?;
    if num_bits > BITMAP_WINDOW as u32 {
      warn!("FragmentNumberSet with {num_bits} bits, clamping to {BITMAP_WINDOW}");
      num_bits = BITMAP_WINDOW as u32;
    }
    let word_count = num_bits.div_ceil(32) as usize;
    let mut bitmap = [0u32; BITMAP_WORDS];
    for word in bitmap.iter_mut().take(word_count) {
      *word = reader.read_u32()?;
    }
    Ok(Self {
      base,
      num_bits,
      bitmap,
    })
  }
}

impl<C: Context> Writable<C> for FragmentNumberSet {
  fn write_to<T: ?Sized + Writer<C>>(&self, writer: &mut T) -> Result<(), C::Error> {
    writer.write_u32(self.base.0)?;
    writer.write_u32(self.num_bits)?;
    let word_count = self.num_bits.div_ceil(32) as usize;
    for word in self.bitmap.iter().take(word_count) {
      writer.write_u32(*word)?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sn(v: i64) -> SequenceNumber {
    SequenceNumber::from(v)
  }

  #[test]
  fn add_remove_is_set() {
    let mut set = SequenceNumberSet::new(sn(10));
    assert!(set.is_empty());
    assert!(set.add(sn(10)));
    assert!(set.add(sn(42)));
    assert!(set.is_set(sn(42)));
    assert!(!set.is_set(sn(41)));
    set.remove(sn(42));
    assert!(!set.is_set(sn(42)));
    assert_eq!(set.count(), 1);
  }

  #[test]
  fn add_outside_window_is_silent_noop() {
    let mut set = SequenceNumberSet::new(sn(10));
    assert!(!set.add(sn(9)));
    assert!(!set.add(sn(10 + 256)));
    assert!(set.add(sn(10 + 255)));
    assert!(set.is_empty() == false);
    assert_eq!(set.count(), 1);
  }

  #[test]
  fn add_range_clips_to_window() {
    let mut set = SequenceNumberSet::new(sn(1));
    set.add_range(sn(1), sn(1000));
    assert_eq!(set.count(), 256);
    assert!(set.is_set(sn(256)));
    assert!(!set.is_set(sn(257)));
  }

  #[test]
  fn equality_ignores_base() {
    let mut a = SequenceNumberSet::new(sn(1));
    a.add(sn(5));
    a.add(sn(7));
    let mut b = SequenceNumberSet::new(sn(5));
    b.add(sn(5));
    b.add(sn(7));
    assert_eq!(a, b);

    // empty sets are equal no matter the base
    assert_eq!(SequenceNumberSet::new(sn(1)), SequenceNumberSet::new(sn(99)));

    b.add(sn(9));
    assert_ne!(a, b);
  }

  #[test]
  fn union_is_elementwise() {
    let mut a = SequenceNumberSet::new(sn(1));
    a.add(sn(2));
    let mut b = SequenceNumberSet::new(sn(1));
    b.add(sn(3));
    a.union_with(&b);
    assert!(a.is_set(sn(2)) && a.is_set(sn(3)));
  }

  #[test]
  fn wire_roundtrip_preserves_elements() {
    use speedy::{Endianness, Readable, Writable};

    let mut set = SequenceNumberSet::new(sn(7));
    set.add(sn(7));
    set.add(sn(100));
    for endianness in [Endianness::LittleEndian, Endianness::BigEndian] {
      let bytes = set.write_to_vec_with_ctx(endianness).unwrap();
      let parsed = SequenceNumberSet::read_from_buffer_with_ctx(endianness, &bytes).unwrap();
      assert_eq!(set, parsed);
      assert_eq!(parsed.base(), sn(7));
    }
  }

  #[test]
  fn wire_image_matches_rtps_layout() {
    use hex_literal::hex;
    use speedy::{Endianness, Writable};

    // base = 7, no bits: { i32 high=0, u32 low=7, u32 num_bits=0 }
    let empty = SequenceNumberSet::new(sn(7));
    assert_eq!(
      empty.write_to_vec_with_ctx(Endianness::BigEndian).unwrap(),
      hex!("00000000 00000007 00000000")
    );

    // base = 1 with element 1 set: one bitmap word, MSB first
    let mut one = SequenceNumberSet::new(sn(1));
    one.add(sn(1));
    assert_eq!(
      one.write_to_vec_with_ctx(Endianness::BigEndian).unwrap(),
      hex!("00000000 00000001 00000001 80000000")
    );
  }

  #[test]
  fn sequence_number_wire_form_is_high_low() {
    use hex_literal::hex;
    use speedy::{Endianness, Writable};
    let bytes = sn(42).write_to_vec_with_ctx(Endianness::LittleEndian).unwrap();
    assert_eq!(bytes, hex!("00000000 2a000000"));
  }

  #[test]
  fn fragment_number_set_add_and_query() {
    let mut set = FragmentNumberSet::new(FragmentNumber(1));
    assert!(set.add(FragmentNumber(3)));
    assert!(set.is_set(FragmentNumber(3)));
    assert!(!set.add(FragmentNumber(300)));
  }
}
