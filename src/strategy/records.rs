// src/strategy/records.rs
// Device-resident record layouts for the flattened scene. All records are
// fixed multiples of 16 bytes so kernels can load them aligned.

use bytemuck::{Pod, Zeroable};

/// World-space vertex position.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct VertexRecord {
    pub position: [f32; 3],
    pub _pad: f32,
}

impl From<[f32; 3]> for VertexRecord {
    fn from(position: [f32; 3]) -> Self {
        Self { position, _pad: 0.0 }
    }
}

/// One flattened triangle in BVH leaf order.
///
/// `idx` are absolute positions in the vertex buffer, `shape_index` indexes
/// the shape table, `prim_id` is the face's position within its shape, and
/// `cnt` is a traversal counter the kernels own (uploaded as zero).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct FaceRecord {
    pub idx: [u32; 3],
    pub shape_index: u32,
    pub prim_id: u32,
    pub cnt: u32,
    pub _pad: [u32; 2],
}

/// Per-shape descriptor.
///
/// `bvh_root` is reserved: a per-shape hierarchy root used by two-level
/// strategies; the fat-BVH kernels never read it and it is written as zero.
/// The velocity fields are reserved for motion blur and are not consumed by
/// traversal either.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ShapeRecord {
    pub id: u32,
    pub bvh_root: u32,
    pub mask: u32,
    pub _pad: u32,
    pub inv_transform: [f32; 16],
    pub linear_velocity: [f32; 4],
    pub angular_velocity: [f32; 4],
}

const _: () = {
    assert!(std::mem::size_of::<VertexRecord>() == 16);
    assert!(std::mem::size_of::<FaceRecord>() == 32);
    assert!(std::mem::size_of::<ShapeRecord>() == 112);
    assert!(std::mem::size_of::<ShapeRecord>() % 16 == 0);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_16_byte_multiples() {
        assert_eq!(std::mem::size_of::<VertexRecord>() % 16, 0);
        assert_eq!(std::mem::size_of::<FaceRecord>() % 16, 0);
        assert_eq!(std::mem::size_of::<ShapeRecord>() % 16, 0);
    }

    #[test]
    fn vertex_from_position() {
        let v = VertexRecord::from([1.0, 2.0, 3.0]);
        assert_eq!(v.position, [1.0, 2.0, 3.0]);
        assert_eq!(v._pad, 0.0);
    }
}
