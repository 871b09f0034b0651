pub mod parameter_list;
pub mod submessage_flag;
pub mod submessage_kind;
pub mod submessages;

/// Asserts that a wire type serializes to exactly the given little- and
/// big-endian images and reads back equal.
#[cfg(test)]
macro_rules! serialization_test {
  ( type = $t:ty, { $name:ident, $value:expr, le = $le:expr, be = $be:expr } ) => {
    #[test]
    fn $name() {
      use speedy::{Endianness, Readable, Writable};
      let value: $t = $value;

      let bytes_le = value.write_to_vec_with_ctx(Endianness::LittleEndian).unwrap();
      assert_eq!(bytes_le, $le.to_vec(), "little-endian image mismatch");
      let read_le = <$t>::read_from_buffer_with_ctx(Endianness::LittleEndian, &bytes_le).unwrap();
      assert_eq!(read_le, value);

      let bytes_be = value.write_to_vec_with_ctx(Endianness::BigEndian).unwrap();
      assert_eq!(bytes_be, $be.to_vec(), "big-endian image mismatch");
      let read_be = <$t>::read_from_buffer_with_ctx(Endianness::BigEndian, &bytes_be).unwrap();
      assert_eq!(read_be, value);
    }
  };
}

#[cfg(test)]
pub(crate) use serialization_test;
