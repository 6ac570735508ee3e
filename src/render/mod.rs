// src/render/mod.rs
//! Drawing particles straight out of the simulation's buffers.

pub mod camera;
pub mod points;

pub use camera::{CameraUniform, OrbitCamera};
pub use points::PointRasterizer;
