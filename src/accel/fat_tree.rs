// src/accel/fat_tree.rs
// Translation of the host hierarchy into the device node layout.
// Each record carries BOTH children's bounds plus their links, so traversal
// decides on two boxes per step and only ever pushes node indices, keeping
// the per-ray stack within a small fixed bound.

use bytemuck::{Pod, Zeroable};

use crate::accel::bvh::Bvh;
use crate::accel::types::BvhNode;

/// Link value for a missing child (single-leaf trees only).
pub const ABSENT: i32 = -1;

/// Device node, 64 bytes.
///
/// Per child: `count > 0` marks a leaf whose primitives occupy
/// `[link, link + count)` of the reordered face buffer; `count == 0` marks
/// an internal child with `link` indexing this node array; `count < 0`
/// marks an absent child.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct FatNode {
    pub left_min: [f32; 3],
    pub left_link: i32,
    pub left_max: [f32; 3],
    pub left_count: i32,
    pub right_min: [f32; 3],
    pub right_link: i32,
    pub right_max: [f32; 3],
    pub right_count: i32,
}

const _: () = {
    assert!(std::mem::size_of::<FatNode>() == 64);
    assert!(std::mem::align_of::<FatNode>() == 4);
};

/// Flatten a built hierarchy into device nodes, parents before children.
pub fn flatten(bvh: &Bvh) -> Vec<FatNode> {
    let nodes = bvh.nodes();
    if nodes.is_empty() {
        return Vec::new();
    }

    let root = &nodes[bvh.root_index()];
    let mut out = Vec::with_capacity(nodes.len() / 2 + 1);

    if let Some((first, count)) = root.primitives() {
        // Degenerate tree: the root itself is a leaf.
        let mut node = FatNode::zeroed();
        node.left_min = root.aabb.min.to_array();
        node.left_max = root.aabb.max.to_array();
        node.left_link = first as i32;
        node.left_count = count as i32;
        node.right_link = ABSENT;
        node.right_count = ABSENT;
        out.push(node);
        return out;
    }

    emit(nodes, bvh.root_index(), &mut out);
    out
}

fn emit(nodes: &[BvhNode], idx: usize, out: &mut Vec<FatNode>) -> i32 {
    let slot = out.len();
    out.push(FatNode::zeroed());

    let (left, right) = nodes[idx]
        .children()
        .expect("emit is only called for internal nodes");

    let (left_link, left_count) = child_ref(nodes, left as usize, out);
    let (right_link, right_count) = child_ref(nodes, right as usize, out);

    let l = &nodes[left as usize].aabb;
    let r = &nodes[right as usize].aabb;
    out[slot] = FatNode {
        left_min: l.min.to_array(),
        left_link,
        left_max: l.max.to_array(),
        left_count,
        right_min: r.min.to_array(),
        right_link,
        right_max: r.max.to_array(),
        right_count,
    };
    slot as i32
}

fn child_ref(nodes: &[BvhNode], idx: usize, out: &mut Vec<FatNode>) -> (i32, i32) {
    match nodes[idx].primitives() {
        Some((first, count)) => (first as i32, count as i32),
        None => (emit(nodes, idx, out), 0),
    }
}
