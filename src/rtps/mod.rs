#[allow(dead_code)] // We allow this, since extra constants are not too harmful.
pub mod constant;

pub mod fragment_assembler;
pub mod reader;
pub mod rtps_reader_proxy;
pub mod rtps_writer_proxy;
pub mod timed_event;
pub mod writer;
