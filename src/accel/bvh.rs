// src/accel/bvh.rs
// Host-side BVH over per-face bounding boxes.
// Two split policies: spatial midpoint (default) and a swept surface-area
// heuristic, selected at construction. The builder reorders a primitive
// index array in place; leaves reference ranges of that array, so after a
// build `indices()` is the leaf-order permutation of the input bounds.

use std::time::Instant;

use anyhow::{bail, Result};
use glam::Vec3;

use crate::accel::types::{Aabb, BvhNode};

/// Primitives per leaf before subdivision stops.
pub const DEFAULT_MAX_LEAF_SIZE: u32 = 4;

// Recursion guard; well above the traversal stack bound so that overly deep
// scenes are still observable through height() and rejected by the caller.
const MAX_BUILD_DEPTH: u32 = 64;

#[derive(Debug, Clone, Default)]
pub struct BuildStats {
    pub build_time_ms: f32,
    pub primitive_count: u32,
    pub leaf_count: u32,
    pub max_depth: u32,
}

/// Binary hierarchy over a set of bounding boxes.
pub struct Bvh {
    use_sah: bool,
    max_leaf_size: u32,
    nodes: Vec<BvhNode>,
    indices: Vec<u32>,
    stats: BuildStats,
}

impl Bvh {
    pub fn new(use_sah: bool) -> Self {
        Self {
            use_sah,
            max_leaf_size: DEFAULT_MAX_LEAF_SIZE,
            nodes: Vec::new(),
            indices: Vec::new(),
            stats: BuildStats::default(),
        }
    }

    /// Build the hierarchy over `bounds`. An empty slice yields an empty
    /// tree with height 0.
    pub fn build(&mut self, bounds: &[Aabb]) -> Result<()> {
        let start_time = Instant::now();

        self.nodes.clear();
        self.indices.clear();
        self.stats = BuildStats {
            primitive_count: bounds.len() as u32,
            ..BuildStats::default()
        };

        if bounds.is_empty() {
            return Ok(());
        }

        for (i, b) in bounds.iter().enumerate() {
            if !b.is_valid() || !b.min.is_finite() || !b.max.is_finite() {
                bail!("primitive bounds {} are not finite", i);
            }
        }

        let centroids: Vec<Vec3> = bounds.iter().map(|b| b.centroid()).collect();
        let mut world = Aabb::empty();
        for b in bounds {
            world = world.merge(b);
        }

        self.indices = (0..bounds.len() as u32).collect();

        let info = BuildInfo {
            aabb: world,
            first: 0,
            count: bounds.len() as u32,
            depth: 1,
        };
        let root = self.build_recursive(bounds, &centroids, info);
        self.nodes.push(root);

        self.stats.build_time_ms = start_time.elapsed().as_secs_f32() * 1000.0;
        log::debug!(
            "built {} hierarchy: {} primitives, {} nodes, height {}, {:.2} ms",
            if self.use_sah { "sah" } else { "midpoint" },
            bounds.len(),
            self.nodes.len(),
            self.stats.max_depth,
            self.stats.build_time_ms,
        );
        Ok(())
    }

    /// Leaf-order permutation: `indices()[i]` is the input position of the
    /// primitive that now sits at leaf-order position `i`.
    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    /// Maximum root-to-leaf depth, inclusive. Zero for an empty tree.
    pub fn height(&self) -> u32 {
        self.stats.max_depth
    }

    pub fn nodes(&self) -> &[BvhNode] {
        &self.nodes
    }

    /// Children are appended before their parent, so the root sits last.
    pub fn root_index(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn stats(&self) -> &BuildStats {
        &self.stats
    }

    fn build_recursive(&mut self, bounds: &[Aabb], centroids: &[Vec3], info: BuildInfo) -> BvhNode {
        self.stats.max_depth = self.stats.max_depth.max(info.depth);

        if info.count <= self.max_leaf_size || info.depth >= MAX_BUILD_DEPTH {
            self.stats.leaf_count += 1;
            return BvhNode::leaf(info.aabb, info.first, info.count);
        }

        let range = &self.indices[info.first as usize..(info.first + info.count) as usize];
        let split = if self.use_sah {
            find_sah_split(bounds, range, &info.aabb)
        } else {
            find_midpoint_split(centroids, range)
        };

        let Some((axis, position)) = split else {
            self.stats.leaf_count += 1;
            return BvhNode::leaf(info.aabb, info.first, info.count);
        };

        let split_index = self.partition(centroids, info.first, info.count, axis, position);
        let left_count = split_index - info.first;
        let right_count = info.count - left_count;

        if left_count == 0 || right_count == 0 {
            self.stats.leaf_count += 1;
            return BvhNode::leaf(info.aabb, info.first, info.count);
        }

        let left_aabb = enclose(bounds, &self.indices[info.first as usize..split_index as usize]);
        let right_aabb = enclose(
            bounds,
            &self.indices[split_index as usize..(info.first + info.count) as usize],
        );

        let left = self.build_recursive(
            bounds,
            centroids,
            BuildInfo {
                aabb: left_aabb,
                first: info.first,
                count: left_count,
                depth: info.depth + 1,
            },
        );
        let left_idx = self.nodes.len() as u32;
        self.nodes.push(left);

        let right = self.build_recursive(
            bounds,
            centroids,
            BuildInfo {
                aabb: right_aabb,
                first: split_index,
                count: right_count,
                depth: info.depth + 1,
            },
        );
        let right_idx = self.nodes.len() as u32;
        self.nodes.push(right);

        BvhNode::internal(info.aabb, left_idx, right_idx)
    }

    fn partition(&mut self, centroids: &[Vec3], first: u32, count: u32, axis: usize, position: f32) -> u32 {
        let range = &mut self.indices[first as usize..(first + count) as usize];

        let mut left = 0;
        let mut right = range.len();
        while left < right {
            if centroids[range[left] as usize][axis] < position {
                left += 1;
            } else {
                right -= 1;
                range.swap(left, right);
            }
        }

        first + left as u32
    }
}

struct BuildInfo {
    aabb: Aabb,
    first: u32,
    count: u32,
    depth: u32,
}

fn enclose(bounds: &[Aabb], indices: &[u32]) -> Aabb {
    let mut aabb = Aabb::empty();
    for &idx in indices {
        aabb = aabb.merge(&bounds[idx as usize]);
    }
    aabb
}

/// Split at the center of the centroid bounds along their largest axis.
fn find_midpoint_split(centroids: &[Vec3], indices: &[u32]) -> Option<(usize, f32)> {
    let cb = Aabb::from_points(indices.iter().map(|&idx| centroids[idx as usize]));
    let axis = cb.longest_axis();

    if cb.diagonal()[axis] <= 0.0 {
        // All centroids coincide along every axis worth splitting.
        return None;
    }

    Some((axis, cb.centroid()[axis]))
}

/// Sweep candidate planes between sorted centroids and keep the cheapest
/// partition by surface-area cost; None when a leaf is cheaper.
fn find_sah_split(bounds: &[Aabb], indices: &[u32], parent_aabb: &Aabb) -> Option<(usize, f32)> {
    if indices.len() < 2 {
        return None;
    }

    let parent_sa = parent_aabb.surface_area();
    if parent_sa <= 0.0 {
        return None;
    }

    let mut best: Option<(usize, f32)> = None;
    let mut best_cost = f32::INFINITY;

    for axis in 0..3 {
        let mut centroids: Vec<f32> = indices
            .iter()
            .map(|&idx| bounds[idx as usize].centroid()[axis])
            .collect();
        centroids.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        for i in 1..centroids.len() {
            if centroids[i] == centroids[i - 1] {
                continue;
            }
            let position = (centroids[i] + centroids[i - 1]) * 0.5;

            let mut left_aabb = Aabb::empty();
            let mut right_aabb = Aabb::empty();
            let mut left_count = 0u32;
            let mut right_count = 0u32;
            for &idx in indices {
                let b = &bounds[idx as usize];
                if b.centroid()[axis] < position {
                    left_aabb = left_aabb.merge(b);
                    left_count += 1;
                } else {
                    right_aabb = right_aabb.merge(b);
                    right_count += 1;
                }
            }
            if left_count == 0 || right_count == 0 {
                continue;
            }

            let cost = 1.0
                + (left_aabb.surface_area() / parent_sa) * left_count as f32
                + (right_aabb.surface_area() / parent_sa) * right_count as f32;
            if cost < best_cost {
                best_cost = cost;
                best = Some((axis, position));
            }
        }
    }

    // Splitting must beat intersecting everything in place.
    if best_cost < indices.len() as f32 {
        best
    } else {
        None
    }
}
