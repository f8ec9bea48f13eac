// src/scene/mesh.rs
// Triangle mesh: object-space vertex/index representation plus the world
// transform it carries into the flattened geometry stream.

use glam::{Mat4, Vec3};

use crate::accel::Aabb;

/// One triangle of a mesh: vertex indices relative to the owning mesh and
/// the primitive id reported back from hit queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Face {
    pub idx: [u32; 3],
    pub id: u32,
}

/// Triangle mesh with an object-to-world transform.
pub struct Mesh {
    id: u32,
    mask: u32,
    transform: Mat4,
    inv_transform: Mat4,
    vertices: Vec<Vec3>,
    faces: Vec<Face>,
}

impl Mesh {
    /// Primitive ids are assigned sequentially in face order.
    pub fn new(vertices: Vec<[f32; 3]>, indices: Vec<[u32; 3]>) -> Self {
        let faces = indices
            .into_iter()
            .enumerate()
            .map(|(i, idx)| Face { idx, id: i as u32 })
            .collect();
        Self {
            id: 0,
            mask: !0,
            transform: Mat4::IDENTITY,
            inv_transform: Mat4::IDENTITY,
            vertices: vertices.into_iter().map(Vec3::from_array).collect(),
            faces,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn set_id(&mut self, id: u32) {
        self.id = id;
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }

    pub fn set_mask(&mut self, mask: u32) {
        self.mask = mask;
    }

    pub fn transform(&self) -> (Mat4, Mat4) {
        (self.transform, self.inv_transform)
    }

    pub fn set_transform(&mut self, m: Mat4) {
        self.transform = m;
        self.inv_transform = m.inverse();
    }

    pub fn num_faces(&self) -> usize {
        self.faces.len()
    }

    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    /// Object-space vertex positions.
    pub fn vertices(&self) -> &[Vec3] {
        &self.vertices
    }

    pub fn faces(&self) -> &[Face] {
        &self.faces
    }

    /// Bounds of face `j`, either in object space or through the mesh's own
    /// transform. World-space bounds enclose the transformed vertices rather
    /// than transforming the object-space box, which keeps them tight.
    pub fn face_bounds(&self, j: usize, object_space: bool) -> Aabb {
        let face = &self.faces[j];
        Aabb::from_points(face.idx.iter().map(|&vi| {
            let v = self.vertices[vi as usize];
            if object_space {
                v
            } else {
                self.transform.transform_point3(v)
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> Mesh {
        Mesh::new(
            vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            vec![[0, 1, 2]],
        )
    }

    #[test]
    fn sequential_primitive_ids() {
        let mesh = Mesh::new(
            vec![[0.0; 3], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [1.0, 1.0, 0.0]],
            vec![[0, 1, 2], [1, 3, 2]],
        );
        assert_eq!(mesh.faces()[0].id, 0);
        assert_eq!(mesh.faces()[1].id, 1);
        assert_eq!(mesh.num_faces(), 2);
        assert_eq!(mesh.num_vertices(), 4);
    }

    #[test]
    fn face_bounds_follow_the_transform() {
        let mut mesh = triangle();
        mesh.set_transform(Mat4::from_translation(Vec3::new(0.0, 0.0, 3.0)));

        let object = mesh.face_bounds(0, true);
        assert_eq!(object.min.z, 0.0);
        assert_eq!(object.max.z, 0.0);

        let world = mesh.face_bounds(0, false);
        assert_eq!(world.min.z, 3.0);
        assert_eq!(world.max.z, 3.0);
        assert_eq!(world.max.x, 1.0);
    }
}
