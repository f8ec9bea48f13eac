// src/ray.rs
// Device-facing ray and hit records shared by the host strategy and the kernels.
// Layouts are fixed multiples of 16 bytes for aligned device access.

use bytemuck::{Pod, Zeroable};

/// Shape id reported for a miss.
pub const NULL_ID: i32 = -1;

/// Occlusion result written per ray: `HIT` on any intersection, `MISS` otherwise.
pub const HIT: i32 = 1;
pub const MISS: i32 = -1;

/// A single ray in a query batch.
///
/// `max_t` bounds the parametric range, `mask` is matched against shape
/// visibility masks, and rays with `active == 0` are skipped entirely.
/// `time` is reserved for motion blur and not consumed by traversal.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Ray {
    pub origin: [f32; 3],
    pub max_t: f32,
    pub direction: [f32; 3],
    pub time: f32,
    pub mask: i32,
    pub active: i32,
    pub _pad: [i32; 2],
}

impl Ray {
    pub fn new(origin: [f32; 3], direction: [f32; 3], max_t: f32) -> Self {
        Self {
            origin,
            max_t,
            direction,
            time: 0.0,
            mask: !0,
            active: 1,
            _pad: [0; 2],
        }
    }
}

impl Default for Ray {
    fn default() -> Self {
        Self::new([0.0; 3], [0.0, 0.0, 1.0], f32::MAX)
    }
}

/// Closest-hit record written per ray.
///
/// `uvwt` packs the barycentric coordinates in xy and the hit distance in w;
/// z is unused. A miss leaves `shape_id == NULL_ID`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Intersection {
    pub shape_id: i32,
    pub prim_id: i32,
    pub _pad: [i32; 2],
    pub uvwt: [f32; 4],
}

impl Intersection {
    pub fn miss() -> Self {
        Self {
            shape_id: NULL_ID,
            prim_id: NULL_ID,
            _pad: [0; 2],
            uvwt: [0.0, 0.0, 0.0, f32::MAX],
        }
    }

    pub fn is_hit(&self) -> bool {
        self.shape_id != NULL_ID
    }
}

impl Default for Intersection {
    fn default() -> Self {
        Self::miss()
    }
}

const _: () = {
    assert!(std::mem::size_of::<Ray>() == 48);
    assert!(std::mem::size_of::<Intersection>() == 32);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layouts() {
        assert_eq!(std::mem::size_of::<Ray>() % 16, 0);
        assert_eq!(std::mem::size_of::<Intersection>() % 16, 0);
    }

    #[test]
    fn miss_is_not_a_hit() {
        assert!(!Intersection::miss().is_hit());
        let mut i = Intersection::miss();
        i.shape_id = 3;
        assert!(i.is_hit());
    }
}
