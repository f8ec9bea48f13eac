// src/scene/mod.rs
// Scene model consumed by the intersection strategy: triangle meshes,
// transformed instances of a shared base mesh, and the world that owns them.

pub mod instance;
pub mod mesh;
pub mod world;

pub use instance::Instance;
pub use mesh::{Face, Mesh};
pub use world::{Options, StateChange, World};

use std::sync::Arc;

use glam::Mat4;

/// A shape in the world. The only dispatch the strategy needs is whether a
/// shape is an instance plus access to its base mesh, so a tagged variant
/// carries the whole capability set.
#[derive(Clone)]
pub enum Shape {
    Mesh(Arc<Mesh>),
    Instance(Instance),
}

impl Shape {
    pub fn id(&self) -> u32 {
        match self {
            Shape::Mesh(m) => m.id(),
            Shape::Instance(i) => i.id(),
        }
    }

    pub fn mask(&self) -> u32 {
        match self {
            Shape::Mesh(m) => m.mask(),
            Shape::Instance(i) => i.mask(),
        }
    }

    pub fn is_instance(&self) -> bool {
        matches!(self, Shape::Instance(_))
    }

    /// Forward and inverse world transform of the shape itself: an instance
    /// answers with its own matrices, not the base mesh's.
    pub fn transform(&self) -> (Mat4, Mat4) {
        match self {
            Shape::Mesh(m) => m.transform(),
            Shape::Instance(i) => i.transform(),
        }
    }

    /// The mesh supplying geometry: the shape itself or the instanced base.
    pub fn base_mesh(&self) -> &Mesh {
        match self {
            Shape::Mesh(m) => m,
            Shape::Instance(i) => i.base_mesh(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_reports_its_own_transform() {
        let mesh = Arc::new(Mesh::new(
            vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            vec![[0, 1, 2]],
        ));
        let m = Mat4::from_translation(glam::Vec3::new(5.0, 0.0, 0.0));
        let instance = Instance::new(mesh.clone(), m);

        let shape = Shape::Instance(instance);
        assert!(shape.is_instance());
        assert_eq!(shape.transform().0, m);
        assert_eq!(shape.base_mesh().num_vertices(), 3);

        let shape = Shape::Mesh(mesh);
        assert!(!shape.is_instance());
        assert_eq!(shape.transform().0, Mat4::IDENTITY);
    }
}
