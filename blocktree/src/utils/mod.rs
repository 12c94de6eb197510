pub mod aligned_buf;
pub mod array_map;
