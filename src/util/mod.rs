//! Shared utilities: buffers, slot bitmap, data verification and timing

pub mod bitmap;
pub mod buffer;
pub mod time;
pub mod verification;
