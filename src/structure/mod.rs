pub mod cache_change;
pub mod change_pool;
pub mod duration;
pub mod guid;
pub mod sequence_number;
pub mod time;
