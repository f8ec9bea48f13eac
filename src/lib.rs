//! GPU ray intersection around a fat bounding-volume hierarchy.
//!
//! A world of triangle meshes and transformed instances is flattened into a
//! single world-space triangle stream with one BVH over all face bounds.
//! The hierarchy is translated into a device node layout that carries both
//! children's boxes per record, and four intersection entry points dispatch
//! the precompiled kernels over ray batches. The compute layer is a narrow
//! trait surface with a wgpu backend and a software reference device.

pub mod accel;
pub mod calc;
pub mod error;
pub mod ray;
pub mod scene;
pub mod strategy;

pub use error::{Error, Result};
pub use ray::{Intersection, Ray, HIT, MISS, NULL_ID};
pub use scene::{Instance, Mesh, Shape, World};
pub use strategy::FatBvhStrategy;
