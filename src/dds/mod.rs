pub mod qos;
pub mod result;
pub mod statusevents;
