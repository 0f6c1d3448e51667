pub mod bounds;
pub mod camera;
pub mod config;
pub mod decoder;
pub mod error;
pub mod fetch;
pub mod gaussians;
pub mod pipelines;
pub mod ply;
pub mod projection;
pub mod splat_buffer;
pub mod viewer;
