// src/accel/types.rs
// Bounds math shared by the builder, the fat-node translation and the scene
// flattening passes, plus the host-side BVH node.
// RELEVANT FILES:src/accel/bvh.rs,src/accel/fat_tree.rs,src/strategy/fat_bvh.rs

use glam::{Mat4, Vec3};

/// Axis-aligned box kept as a min/max corner pair. A freshly constructed
/// `empty()` box has inverted corners so the first `grow` or `merge` snaps
/// it onto real geometry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Inverted box that unions correctly with anything.
    pub fn empty() -> Self {
        Self {
            min: Vec3::splat(f32::INFINITY),
            max: Vec3::splat(f32::NEG_INFINITY),
        }
    }

    /// Smallest box around a point set; `empty()` when the set is.
    pub fn from_points<I>(points: I) -> Self
    where
        I: IntoIterator<Item = Vec3>,
    {
        let mut aabb = Self::empty();
        for p in points {
            aabb.grow(p);
        }
        aabb
    }

    /// Extend the box to cover one more point.
    pub fn grow(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    /// Union of two boxes.
    pub fn merge(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn centroid(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn diagonal(&self) -> Vec3 {
        self.max - self.min
    }

    /// Index of the widest extent, x winning ties.
    pub fn longest_axis(&self) -> usize {
        let d = self.diagonal();
        if d.x > d.y && d.x > d.z {
            0
        } else if d.y > d.z {
            1
        } else {
            2
        }
    }

    /// False while the box is still inverted.
    pub fn is_valid(&self) -> bool {
        self.min.cmple(self.max).all()
    }

    /// Total face area, the quantity the SAH cost model compares.
    pub fn surface_area(&self) -> f32 {
        if !self.is_valid() {
            return 0.0;
        }
        let d = self.diagonal();
        2.0 * (d.x * d.y + d.y * d.z + d.z * d.x)
    }

    /// Box around the eight transformed corners. Instance bounds take an
    /// object-space box through the instance's forward matrix.
    pub fn transformed(&self, m: &Mat4) -> Aabb {
        Aabb::from_points((0..8).map(|corner| {
            let p = Vec3::new(
                if corner & 1 != 0 { self.max.x } else { self.min.x },
                if corner & 2 != 0 { self.max.y } else { self.min.y },
                if corner & 4 != 0 { self.max.z } else { self.min.z },
            );
            m.transform_point3(p)
        }))
    }
}

impl Default for Aabb {
    fn default() -> Self {
        Self::empty()
    }
}

/// Host-side BVH node.
///
/// For internal nodes `left`/`right` are child node indices; for leaves they
/// are the first primitive position and the primitive count in the builder's
/// reordered index array.
#[derive(Debug, Clone, Copy)]
pub struct BvhNode {
    pub aabb: Aabb,
    kind: u32, // 0 = internal, 1 = leaf
    left: u32,
    right: u32,
}

impl BvhNode {
    /// Create internal node
    pub fn internal(aabb: Aabb, left: u32, right: u32) -> Self {
        Self {
            aabb,
            kind: 0,
            left,
            right,
        }
    }

    /// Create leaf node
    pub fn leaf(aabb: Aabb, first_prim: u32, prim_count: u32) -> Self {
        Self {
            aabb,
            kind: 1,
            left: first_prim,
            right: prim_count,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.kind == 1
    }

    pub fn is_internal(&self) -> bool {
        self.kind == 0
    }

    /// Get child indices for internal nodes
    pub fn children(&self) -> Option<(u32, u32)> {
        if self.is_internal() {
            Some((self.left, self.right))
        } else {
            None
        }
    }

    /// Get primitive range for leaf nodes (first position, count)
    pub fn primitives(&self) -> Option<(u32, u32)> {
        if self.is_leaf() {
            Some((self.left, self.right))
        } else {
            None
        }
    }
}
