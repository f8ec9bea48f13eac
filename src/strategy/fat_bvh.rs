// src/strategy/fat_bvh.rs
// Fat-BVH intersection strategy. Preprocess merges meshes and instanced
// meshes into one linear world-space triangle stream, builds a single BVH
// over the face bounds, translates it into the device node layout and
// uploads the flattened scene. Queries dispatch the precompiled kernels
// over ray batches with a lazily grown per-ray traversal stack.
// RELEVANT FILES:src/accel/bvh.rs,src/accel/fat_tree.rs,src/calc/mod.rs

use std::sync::{Arc, Mutex};

use bytemuck::Zeroable;
use rayon::prelude::*;

use crate::accel::{fat_tree, Aabb, Bvh};
use crate::calc::{
    Arg, Buffer, BufferHandle, BufferKind, Device, EventHandle, Executable, Function,
    KernelSource, Platform,
};
use crate::error::{Error, Result};
use crate::scene::{Shape, StateChange, World};
use crate::strategy::records::{FaceRecord, ShapeRecord, VertexRecord};
use crate::strategy::{
    KERNEL_CLOSEST, KERNEL_CLOSEST_RC, KERNEL_OCCLUDE, KERNEL_OCCLUDE_RC, MAX_BATCH_SIZE,
    MAX_STACK_DEPTH, WORK_GROUP_SIZE,
};

/// Kernel source a device consumes, keyed by its platform. The WGSL kernels
/// ship embedded in the binary; OpenCL and Vulkan sources are compiled
/// externally and loaded from disk. `with_kernel_source` overrides either.
fn default_kernel_source(platform: Platform) -> KernelSource {
    match platform {
        Platform::OpenCl => KernelSource::File("kernels/CL/fat_bvh.cl".into()),
        Platform::Vulkan => KernelSource::File("kernels/GLSL/fat_bvh.comp".into()),
        Platform::Wgpu => KernelSource::Embedded(include_str!("../shaders/fat_bvh.wgsl")),
        Platform::Cpu => KernelSource::Builtin,
    }
}

struct SceneData {
    bvh: Bvh,
    nodes: BufferHandle,
    vertices: BufferHandle,
    faces: BufferHandle,
    shapes: BufferHandle,
    ray_count: BufferHandle,
}

/// Borrowed view of the resident scene, for callers that bind the buffers
/// elsewhere and for inspection in tests.
pub struct SceneView<'a> {
    pub bvh: &'a Bvh,
    pub nodes: &'a BufferHandle,
    pub vertices: &'a BufferHandle,
    pub faces: &'a BufferHandle,
    pub shapes: &'a BufferHandle,
    pub ray_count: &'a BufferHandle,
}

enum CountArg<'a> {
    Direct(u32),
    Indirect(&'a BufferHandle),
}

pub struct FatBvhStrategy {
    device: Arc<dyn Device>,
    // Owned so the kernel module outlives its functions.
    #[allow(dead_code)]
    executable: Box<dyn Executable>,
    closest_func: Box<dyn Function>,
    occlude_func: Box<dyn Function>,
    closest_indirect_func: Box<dyn Function>,
    occlude_indirect_func: Box<dyn Function>,
    scene: Option<SceneData>,
    // Grown lazily at query time, retained across scene rebuilds. The lock
    // is held across bind and submit, which serializes concurrent queries
    // around both the resize and the shared argument state.
    stack: Mutex<Option<BufferHandle>>,
}

impl FatBvhStrategy {
    pub fn new(device: Arc<dyn Device>) -> Result<Self> {
        let source = default_kernel_source(device.platform());
        Self::with_kernel_source(device, &source)
    }

    pub fn with_kernel_source(device: Arc<dyn Device>, source: &KernelSource) -> Result<Self> {
        let executable = device.compile_executable(source)?;
        let closest_func = executable.create_function(KERNEL_CLOSEST)?;
        let occlude_func = executable.create_function(KERNEL_OCCLUDE)?;
        let closest_indirect_func = executable.create_function(KERNEL_CLOSEST_RC)?;
        let occlude_indirect_func = executable.create_function(KERNEL_OCCLUDE_RC)?;

        Ok(Self {
            device,
            executable,
            closest_func,
            occlude_func,
            closest_indirect_func,
            occlude_indirect_func,
            scene: None,
            stack: Mutex::new(None),
        })
    }

    /// Rebuild the device-resident scene if the world changed since the
    /// last commit. On failure no scene is left resident.
    pub fn preprocess(&mut self, world: &World) -> Result<()> {
        if self.scene.is_some()
            && !world.has_changed()
            && world.state_change() == StateChange::None
        {
            return Ok(());
        }

        // Release stale buffers before rebuilding; a failed rebuild must not
        // leave a half-updated scene behind.
        self.scene = None;

        let spec = self.device.spec();
        let required = MAX_BATCH_SIZE * MAX_STACK_DEPTH as u64 * 4;
        if spec.max_alloc_size <= required {
            return Err(Error::InsufficientStackMemory {
                required,
                limit: spec.max_alloc_size,
            });
        }

        // Stable partition: meshes first, instances after, each keeping its
        // original relative order.
        let mut shapes: Vec<&Shape> = Vec::with_capacity(world.shapes().len());
        shapes.extend(world.shapes().iter().filter(|s| !s.is_instance()));
        let num_meshes = shapes.len();
        shapes.extend(world.shapes().iter().filter(|s| s.is_instance()));
        let num_shapes = shapes.len();
        let num_instances = num_shapes - num_meshes;

        // Per-shape offsets into the flattened streams.
        let mut face_start = vec![0usize; num_shapes];
        let mut vertex_start = vec![0usize; num_shapes];
        let mut num_faces = 0usize;
        let mut num_vertices = 0usize;
        for (k, shape) in shapes.iter().enumerate() {
            face_start[k] = num_faces;
            vertex_start[k] = num_vertices;
            let mesh = shape.base_mesh();
            num_faces += mesh.num_faces();
            num_vertices += mesh.num_vertices();
        }

        // World-space bounds per face plus the shape table. Offsets are
        // prefix sums, so the per-shape output slices are disjoint and the
        // loop parallelizes without locking.
        let mut bounds = vec![Aabb::empty(); num_faces];
        let mut shape_records = vec![ShapeRecord::zeroed(); num_shapes];
        let bounds_slices = split_by(&mut bounds, shapes.iter().map(|s| s.base_mesh().num_faces()));
        bounds_slices
            .into_par_iter()
            .zip(shape_records.par_iter_mut().zip(shapes.par_iter()))
            .for_each(|(dst, (record, shape))| {
                let mesh = shape.base_mesh();
                if shape.is_instance() {
                    // The instance applies its own transform to the shared
                    // base geometry, so take object-space bounds and
                    // transform them here.
                    let (m, _) = shape.transform();
                    for (j, b) in dst.iter_mut().enumerate() {
                        *b = mesh.face_bounds(j, true).transformed(&m);
                    }
                } else {
                    for (j, b) in dst.iter_mut().enumerate() {
                        *b = mesh.face_bounds(j, false);
                    }
                }

                let (_, inv) = shape.transform();
                *record = ShapeRecord {
                    id: shape.id(),
                    bvh_root: 0,
                    mask: shape.mask(),
                    _pad: 0,
                    inv_transform: inv.to_cols_array(),
                    linear_velocity: [0.0; 4],
                    angular_velocity: [0.0, 0.0, 0.0, 1.0],
                };
            });

        let enable_sah = world.options().option("bvh.builder") == Some("sah");
        let mut bvh = Bvh::new(enable_sah);
        bvh.build(&bounds).map_err(Error::build)?;

        if bvh.height() >= MAX_STACK_DEPTH as u32 {
            return Err(Error::StackBoundExceeded {
                height: bvh.height(),
                bound: MAX_STACK_DEPTH as u32,
            });
        }

        let fat_nodes = fat_tree::flatten(&bvh);

        // Vertices go to the device in world space: each shape's object
        // vertices through that shape's own transform.
        let mut vertices = vec![VertexRecord::zeroed(); num_vertices];
        let vertex_slices = split_by(
            &mut vertices,
            shapes.iter().map(|s| s.base_mesh().num_vertices()),
        );
        vertex_slices
            .into_par_iter()
            .zip(shapes.par_iter())
            .for_each(|(dst, shape)| {
                let (m, _) = shape.transform();
                for (out, v) in dst.iter_mut().zip(shape.base_mesh().vertices()) {
                    out.position = m.transform_point3(*v).to_array();
                }
            });

        // Faces in BVH leaf order. One linear fill of the inverse map keeps
        // the whole pass O(numfaces) instead of a search per face.
        let mut shape_of_face = vec![0u32; num_faces];
        for (k, shape) in shapes.iter().enumerate() {
            let start = face_start[k];
            shape_of_face[start..start + shape.base_mesh().num_faces()].fill(k as u32);
        }

        let mut face_records = Vec::with_capacity(num_faces);
        for &orig in bvh.indices() {
            let orig = orig as usize;
            let k = shape_of_face[orig] as usize;
            let f = orig - face_start[k];
            let face = &shapes[k].base_mesh().faces()[f];
            let base = vertex_start[k] as u32;
            face_records.push(FaceRecord {
                idx: [face.idx[0] + base, face.idx[1] + base, face.idx[2] + base],
                shape_index: k as u32,
                prim_id: face.id,
                cnt: 0,
                _pad: [0; 2],
            });
        }

        let nodes_buf = self
            .device
            .create_buffer_with_data(BufferKind::Read, bytemuck::cast_slice(&fat_nodes))?;
        let vertices_buf = self
            .device
            .create_buffer_with_data(BufferKind::Read, bytemuck::cast_slice(&vertices))?;
        let faces_buf = self
            .device
            .create_buffer_with_data(BufferKind::Read, bytemuck::cast_slice(&face_records))?;
        let shapes_buf = self
            .device
            .create_buffer_with_data(BufferKind::Read, bytemuck::cast_slice(&shape_records))?;
        let ray_count_buf = self.device.create_buffer(4, BufferKind::Write)?;

        // Commit every upload before a query can observe the new scene.
        self.device.finish(0)?;

        log::info!(
            "flattened scene: {} shapes ({} meshes, {} instances), {} faces, {} vertices, {} device nodes, height {}",
            num_shapes,
            num_meshes,
            num_instances,
            num_faces,
            num_vertices,
            fat_nodes.len(),
            bvh.height(),
        );

        self.scene = Some(SceneData {
            bvh,
            nodes: nodes_buf,
            vertices: vertices_buf,
            faces: faces_buf,
            shapes: shapes_buf,
            ray_count: ray_count_buf,
        });
        Ok(())
    }

    /// Closest-hit query over `num_rays` rays; `hits` receives one
    /// `Intersection` record per ray.
    pub fn query_intersection(
        &self,
        queue: u32,
        rays: &BufferHandle,
        num_rays: u32,
        hits: &BufferHandle,
    ) -> Result<EventHandle> {
        self.dispatch(
            self.closest_func.as_ref(),
            queue,
            rays,
            CountArg::Direct(num_rays),
            num_rays,
            hits,
        )
    }

    /// Any-hit query over `num_rays` rays; `hits` receives one `i32` per
    /// ray, `HIT` or `MISS`.
    pub fn query_occlusion(
        &self,
        queue: u32,
        rays: &BufferHandle,
        num_rays: u32,
        hits: &BufferHandle,
    ) -> Result<EventHandle> {
        self.dispatch(
            self.occlude_func.as_ref(),
            queue,
            rays,
            CountArg::Direct(num_rays),
            num_rays,
            hits,
        )
    }

    /// Closest-hit query whose ray count lives in a device buffer, bounded
    /// by `max_rays`.
    pub fn query_intersection_indirect(
        &self,
        queue: u32,
        rays: &BufferHandle,
        num_rays: &BufferHandle,
        max_rays: u32,
        hits: &BufferHandle,
    ) -> Result<EventHandle> {
        self.dispatch(
            self.closest_indirect_func.as_ref(),
            queue,
            rays,
            CountArg::Indirect(num_rays),
            max_rays,
            hits,
        )
    }

    /// Any-hit query whose ray count lives in a device buffer, bounded by
    /// `max_rays`.
    pub fn query_occlusion_indirect(
        &self,
        queue: u32,
        rays: &BufferHandle,
        num_rays: &BufferHandle,
        max_rays: u32,
        hits: &BufferHandle,
    ) -> Result<EventHandle> {
        self.dispatch(
            self.occlude_indirect_func.as_ref(),
            queue,
            rays,
            CountArg::Indirect(num_rays),
            max_rays,
            hits,
        )
    }

    pub fn scene_view(&self) -> Option<SceneView<'_>> {
        self.scene.as_ref().map(|scene| SceneView {
            bvh: &scene.bvh,
            nodes: &scene.nodes,
            vertices: &scene.vertices,
            faces: &scene.faces,
            shapes: &scene.shapes,
            ray_count: &scene.ray_count,
        })
    }

    /// Current traversal stack size in bytes; zero before the first query
    /// or when the stack state is unavailable.
    pub fn stack_capacity(&self) -> u64 {
        match self.stack.lock() {
            Ok(guard) => guard.as_ref().map_or(0, |b| b.size()),
            Err(_) => 0,
        }
    }

    fn dispatch(
        &self,
        func: &dyn Function,
        queue: u32,
        rays: &BufferHandle,
        count: CountArg<'_>,
        max_rays: u32,
        hits: &BufferHandle,
    ) -> Result<EventHandle> {
        let scene = self.scene.as_ref().ok_or(Error::SceneNotCommitted)?;

        let stack_size = 4 * max_rays as u64 * MAX_STACK_DEPTH as u64;
        let mut stack_guard = self
            .stack
            .lock()
            .map_err(|_| Error::device("traversal stack mutex poisoned"))?;
        let grow = stack_guard.as_ref().map_or(true, |b| b.size() < stack_size);
        if grow {
            log::debug!("growing traversal stack to {stack_size} bytes");
            *stack_guard = Some(self.device.create_buffer(stack_size, BufferKind::Write)?);
        }
        let stack = stack_guard.as_ref().expect("stack allocated above");

        func.set_arg(0, Arg::Buffer(&scene.nodes))?;
        func.set_arg(1, Arg::Buffer(&scene.vertices))?;
        func.set_arg(2, Arg::Buffer(&scene.faces))?;
        func.set_arg(3, Arg::Buffer(&scene.shapes))?;
        func.set_arg(4, Arg::Buffer(rays))?;
        func.set_arg(5, Arg::U32(0))?;
        match count {
            CountArg::Direct(n) => func.set_arg(6, Arg::U32(n))?,
            CountArg::Indirect(buffer) => func.set_arg(6, Arg::Buffer(buffer))?,
        }
        func.set_arg(7, Arg::Buffer(hits))?;
        func.set_arg(8, Arg::Buffer(stack))?;

        let global = max_rays as u64 + WORK_GROUP_SIZE - 1;
        let global = (global / WORK_GROUP_SIZE) * WORK_GROUP_SIZE;
        self.device.execute(func, queue, global, WORK_GROUP_SIZE)
    }
}

/// Split a slice into consecutive chunks of the given lengths.
fn split_by<T>(data: &mut [T], counts: impl Iterator<Item = usize>) -> Vec<&mut [T]> {
    let mut rest = data;
    let mut out = Vec::new();
    for count in counts {
        let (head, tail) = std::mem::take(&mut rest).split_at_mut(count);
        out.push(head);
        rest = tail;
    }
    out
}
