// src/wgpu_utils/mod.rs
//! WGPU helpers shared by the compute engine and the point renderer.

pub mod readback;
pub mod uniform_buffer;

pub use readback::{read_buffer, wait_idle};
pub use uniform_buffer::UniformBuffer;
