// src/calc/software.rs
// Software reference device. Buffers are host memory and `execute`
// interprets the four fat-BVH kernel entry points directly, so the whole
// strategy pipeline can be driven end to end without a GPU. Traversal
// matches the device kernels: both child boxes tested per node, leaves via
// Moller-Trumbore with the shape visibility mask applied.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use glam::Vec3;
use rayon::prelude::*;

use crate::accel::fat_tree::FatNode;
use crate::calc::{
    Arg, Buffer, BufferHandle, BufferKind, Device, DeviceSpec, Event, EventHandle, Executable,
    Function, KernelSource, Platform,
};
use crate::error::{Error, Result};
use crate::ray::{Intersection, Ray, HIT, MISS};
use crate::strategy::records::{FaceRecord, ShapeRecord, VertexRecord};
use crate::strategy::{
    KERNEL_CLOSEST, KERNEL_CLOSEST_RC, KERNEL_OCCLUDE, KERNEL_OCCLUDE_RC, MAX_STACK_DEPTH,
};

const DEFAULT_MAX_ALLOC: u64 = 4 << 30;

pub struct SoftwareDevice {
    spec: DeviceSpec,
}

impl SoftwareDevice {
    pub fn new() -> Self {
        Self::with_max_alloc(DEFAULT_MAX_ALLOC)
    }

    /// A device with a reduced allocation limit, mainly for exercising the
    /// preprocess budget check.
    pub fn with_max_alloc(max_alloc_size: u64) -> Self {
        Self {
            spec: DeviceSpec { max_alloc_size },
        }
    }
}

impl Default for SoftwareDevice {
    fn default() -> Self {
        Self::new()
    }
}

struct SoftwareBuffer {
    size: u64,
    data: RwLock<Vec<u8>>,
}

impl SoftwareBuffer {
    fn new(bytes: Vec<u8>) -> Self {
        Self {
            size: bytes.len() as u64,
            data: RwLock::new(bytes),
        }
    }
}

impl Buffer for SoftwareBuffer {
    fn size(&self) -> u64 {
        self.size
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct SoftwareEvent;

impl Event for SoftwareEvent {
    fn wait(&self) -> Result<()> {
        // Execution is synchronous; the work is already done.
        Ok(())
    }
}

struct SoftwareExecutable;

impl Executable for SoftwareExecutable {
    fn create_function(&self, name: &str) -> Result<Box<dyn Function>> {
        match name {
            KERNEL_CLOSEST | KERNEL_OCCLUDE | KERNEL_CLOSEST_RC | KERNEL_OCCLUDE_RC => {
                Ok(Box::new(SoftwareFunction {
                    name: name.to_string(),
                    args: Mutex::new(HashMap::new()),
                }))
            }
            other => Err(Error::compile(format!("unknown kernel entry point '{other}'"))),
        }
    }
}

#[derive(Clone)]
enum StoredArg {
    Buffer(BufferHandle),
    U32(u32),
}

struct SoftwareFunction {
    name: String,
    args: Mutex<HashMap<u32, StoredArg>>,
}

impl Function for SoftwareFunction {
    fn set_arg(&self, index: u32, arg: Arg<'_>) -> Result<()> {
        let stored = match arg {
            Arg::Buffer(handle) => StoredArg::Buffer(Arc::clone(handle)),
            Arg::U32(value) => StoredArg::U32(value),
        };
        self.args
            .lock()
            .map_err(|_| Error::device("kernel argument mutex poisoned"))?
            .insert(index, stored);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Device for SoftwareDevice {
    fn spec(&self) -> DeviceSpec {
        self.spec
    }

    fn platform(&self) -> Platform {
        Platform::Cpu
    }

    fn compile_executable(&self, _source: &KernelSource) -> Result<Box<dyn Executable>> {
        // The entry points are built in; any source selection is accepted.
        Ok(Box::new(SoftwareExecutable))
    }

    fn create_buffer(&self, size: u64, _kind: BufferKind) -> Result<BufferHandle> {
        if size > self.spec.max_alloc_size {
            return Err(Error::device(format!(
                "allocation of {size} bytes exceeds device limit of {}",
                self.spec.max_alloc_size
            )));
        }
        Ok(Arc::new(SoftwareBuffer::new(vec![0u8; size as usize])))
    }

    fn create_buffer_with_data(&self, _kind: BufferKind, data: &[u8]) -> Result<BufferHandle> {
        if data.len() as u64 > self.spec.max_alloc_size {
            return Err(Error::device(format!(
                "allocation of {} bytes exceeds device limit of {}",
                data.len(),
                self.spec.max_alloc_size
            )));
        }
        Ok(Arc::new(SoftwareBuffer::new(data.to_vec())))
    }

    fn read_buffer(&self, buffer: &BufferHandle, offset: u64, out: &mut [u8]) -> Result<()> {
        let buffer = downcast_buffer(buffer)?;
        let data = buffer
            .data
            .read()
            .map_err(|_| Error::device("buffer lock poisoned"))?;
        let start = offset as usize;
        let end = start + out.len();
        if end > data.len() {
            return Err(Error::device(format!(
                "read of [{start}, {end}) outside buffer of {} bytes",
                data.len()
            )));
        }
        out.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn execute(
        &self,
        func: &dyn Function,
        _queue: u32,
        global_size: u64,
        local_size: u64,
    ) -> Result<EventHandle> {
        let func = func
            .as_any()
            .downcast_ref::<SoftwareFunction>()
            .ok_or_else(|| Error::device("function was created by a different backend"))?;
        if local_size == 0 || global_size % local_size != 0 {
            return Err(Error::device("global size must be a multiple of local size"));
        }
        run_kernel(func, global_size)?;
        Ok(Box::new(SoftwareEvent))
    }

    fn finish(&self, _queue: u32) -> Result<()> {
        Ok(())
    }
}

fn downcast_buffer(handle: &BufferHandle) -> Result<&SoftwareBuffer> {
    handle
        .as_any()
        .downcast_ref::<SoftwareBuffer>()
        .ok_or_else(|| Error::device("buffer was created by a different backend"))
}

fn buffer_arg(args: &HashMap<u32, StoredArg>, index: u32) -> Result<BufferHandle> {
    match args.get(&index) {
        Some(StoredArg::Buffer(handle)) => Ok(Arc::clone(handle)),
        Some(StoredArg::U32(_)) => Err(Error::device(format!(
            "kernel argument {index} is a scalar, expected a buffer"
        ))),
        None => Err(Error::device(format!("kernel argument {index} is not bound"))),
    }
}

fn scalar_arg(args: &HashMap<u32, StoredArg>, index: u32) -> Result<u32> {
    match args.get(&index) {
        Some(StoredArg::U32(value)) => Ok(*value),
        Some(StoredArg::Buffer(_)) => Err(Error::device(format!(
            "kernel argument {index} is a buffer, expected a scalar"
        ))),
        None => Err(Error::device(format!("kernel argument {index} is not bound"))),
    }
}

fn typed_copy<T: bytemuck::AnyBitPattern + bytemuck::NoUninit>(
    handle: &BufferHandle,
) -> Result<Vec<T>> {
    let buffer = downcast_buffer(handle)?;
    let data = buffer
        .data
        .read()
        .map_err(|_| Error::device("buffer lock poisoned"))?;
    let record = std::mem::size_of::<T>();
    if record == 0 || data.len() % record != 0 {
        return Err(Error::device(format!(
            "buffer of {} bytes is not a whole number of {}-byte records",
            data.len(),
            record
        )));
    }
    Ok(bytemuck::pod_collect_to_vec(&data[..]))
}

// Argument order shared by all four entry points.
const ARG_NODES: u32 = 0;
const ARG_VERTICES: u32 = 1;
const ARG_FACES: u32 = 2;
const ARG_SHAPES: u32 = 3;
const ARG_RAYS: u32 = 4;
const ARG_OFFSET: u32 = 5;
const ARG_COUNT: u32 = 6;
const ARG_HITS: u32 = 7;
const ARG_STACK: u32 = 8;

fn run_kernel(func: &SoftwareFunction, global_size: u64) -> Result<()> {
    let args = func
        .args
        .lock()
        .map_err(|_| Error::device("kernel argument mutex poisoned"))?
        .clone();

    let nodes: Vec<FatNode> = typed_copy(&buffer_arg(&args, ARG_NODES)?)?;
    let vertices: Vec<VertexRecord> = typed_copy(&buffer_arg(&args, ARG_VERTICES)?)?;
    let faces: Vec<FaceRecord> = typed_copy(&buffer_arg(&args, ARG_FACES)?)?;
    let shapes: Vec<ShapeRecord> = typed_copy(&buffer_arg(&args, ARG_SHAPES)?)?;
    let rays: Vec<Ray> = typed_copy(&buffer_arg(&args, ARG_RAYS)?)?;
    let offset = scalar_arg(&args, ARG_OFFSET)? as usize;

    let count = match args.get(&ARG_COUNT) {
        Some(StoredArg::U32(value)) => *value as u64,
        Some(StoredArg::Buffer(handle)) => {
            let mut bytes = [0u8; 4];
            let buffer = downcast_buffer(handle)?;
            let data = buffer
                .data
                .read()
                .map_err(|_| Error::device("buffer lock poisoned"))?;
            if data.len() < 4 {
                return Err(Error::device("ray count buffer is smaller than 4 bytes"));
            }
            bytes.copy_from_slice(&data[..4]);
            u32::from_le_bytes(bytes) as u64
        }
        None => return Err(Error::device("ray count argument is not bound")),
    };
    // Lanes only exist up to the dispatch size.
    let count = count.min(global_size) as usize;

    if offset + count > rays.len() {
        return Err(Error::device(format!(
            "ray range [{offset}, {}) outside buffer of {} rays",
            offset + count,
            rays.len()
        )));
    }

    let stack = buffer_arg(&args, ARG_STACK)?;
    let required_stack = (count * MAX_STACK_DEPTH * 4) as u64;
    if stack.size() < required_stack {
        return Err(Error::device(format!(
            "traversal stack of {} bytes is too small for {count} rays ({required_stack} required)",
            stack.size()
        )));
    }

    let hits = buffer_arg(&args, ARG_HITS)?;
    let scene = SceneRefs {
        nodes: &nodes,
        vertices: &vertices,
        faces: &faces,
        shapes: &shapes,
    };

    match func.name.as_str() {
        KERNEL_CLOSEST | KERNEL_CLOSEST_RC => {
            let required = (count * std::mem::size_of::<Intersection>()) as u64;
            if hits.size() < required {
                return Err(Error::device("hit buffer too small for batch"));
            }
            let results: Vec<Option<Intersection>> = (0..count)
                .into_par_iter()
                .map(|i| {
                    let ray = &rays[offset + i];
                    if ray.active == 0 {
                        return None;
                    }
                    Some(closest_hit(&scene, ray))
                })
                .collect();

            let hits = downcast_buffer(&hits)?;
            let mut data = hits
                .data
                .write()
                .map_err(|_| Error::device("buffer lock poisoned"))?;
            for (i, result) in results.iter().enumerate() {
                if let Some(hit) = result {
                    let at = i * std::mem::size_of::<Intersection>();
                    data[at..at + std::mem::size_of::<Intersection>()]
                        .copy_from_slice(bytemuck::bytes_of(hit));
                }
            }
        }
        KERNEL_OCCLUDE | KERNEL_OCCLUDE_RC => {
            let required = (count * 4) as u64;
            if hits.size() < required {
                return Err(Error::device("hit buffer too small for batch"));
            }
            let results: Vec<Option<i32>> = (0..count)
                .into_par_iter()
                .map(|i| {
                    let ray = &rays[offset + i];
                    if ray.active == 0 {
                        return None;
                    }
                    Some(if occluded(&scene, ray) { HIT } else { MISS })
                })
                .collect();

            let hits = downcast_buffer(&hits)?;
            let mut data = hits
                .data
                .write()
                .map_err(|_| Error::device("buffer lock poisoned"))?;
            for (i, result) in results.iter().enumerate() {
                if let Some(flag) = result {
                    let at = i * 4;
                    data[at..at + 4].copy_from_slice(&flag.to_le_bytes());
                }
            }
        }
        other => return Err(Error::device(format!("unknown kernel entry point '{other}'"))),
    }

    Ok(())
}

struct SceneRefs<'a> {
    nodes: &'a [FatNode],
    vertices: &'a [VertexRecord],
    faces: &'a [FaceRecord],
    shapes: &'a [ShapeRecord],
}

fn closest_hit(scene: &SceneRefs<'_>, ray: &Ray) -> Intersection {
    let origin = Vec3::from_array(ray.origin);
    let direction = Vec3::from_array(ray.direction);
    let inv_dir = direction.recip();

    let mut best = Intersection::miss();
    let mut closest_t = ray.max_t;

    if scene.nodes.is_empty() {
        return best;
    }

    let mut stack = [0i32; MAX_STACK_DEPTH];
    let mut sp = 1usize;
    stack[0] = 0;

    while sp > 0 {
        sp -= 1;
        let node = &scene.nodes[stack[sp] as usize];
        for (bounds_min, bounds_max, link, count) in [
            (node.left_min, node.left_max, node.left_link, node.left_count),
            (node.right_min, node.right_max, node.right_link, node.right_count),
        ] {
            if count < 0 {
                continue;
            }
            if !hit_box(bounds_min, bounds_max, origin, inv_dir, closest_t) {
                continue;
            }
            if count == 0 {
                debug_assert!(sp < MAX_STACK_DEPTH);
                stack[sp] = link;
                sp += 1;
            } else {
                for f in link..link + count {
                    let face = &scene.faces[f as usize];
                    if let Some((t, u, v)) = hit_face(scene, face, origin, direction, ray.mask, closest_t)
                    {
                        closest_t = t;
                        best = Intersection {
                            shape_id: scene.shapes[face.shape_index as usize].id as i32,
                            prim_id: face.prim_id as i32,
                            _pad: [0; 2],
                            uvwt: [u, v, 0.0, t],
                        };
                    }
                }
            }
        }
    }

    best
}

fn occluded(scene: &SceneRefs<'_>, ray: &Ray) -> bool {
    let origin = Vec3::from_array(ray.origin);
    let direction = Vec3::from_array(ray.direction);
    let inv_dir = direction.recip();

    if scene.nodes.is_empty() {
        return false;
    }

    let mut stack = [0i32; MAX_STACK_DEPTH];
    let mut sp = 1usize;
    stack[0] = 0;

    while sp > 0 {
        sp -= 1;
        let node = &scene.nodes[stack[sp] as usize];
        for (bounds_min, bounds_max, link, count) in [
            (node.left_min, node.left_max, node.left_link, node.left_count),
            (node.right_min, node.right_max, node.right_link, node.right_count),
        ] {
            if count < 0 {
                continue;
            }
            if !hit_box(bounds_min, bounds_max, origin, inv_dir, ray.max_t) {
                continue;
            }
            if count == 0 {
                debug_assert!(sp < MAX_STACK_DEPTH);
                stack[sp] = link;
                sp += 1;
            } else {
                for f in link..link + count {
                    let face = &scene.faces[f as usize];
                    if hit_face(scene, face, origin, direction, ray.mask, ray.max_t).is_some() {
                        return true;
                    }
                }
            }
        }
    }

    false
}

fn hit_box(min: [f32; 3], max: [f32; 3], origin: Vec3, inv_dir: Vec3, t_max: f32) -> bool {
    let t0 = (Vec3::from_array(min) - origin) * inv_dir;
    let t1 = (Vec3::from_array(max) - origin) * inv_dir;
    let enter = t0.min(t1).max_element().max(0.0);
    let exit = t0.max(t1).min_element().min(t_max);
    enter <= exit
}

fn hit_face(
    scene: &SceneRefs<'_>,
    face: &FaceRecord,
    origin: Vec3,
    direction: Vec3,
    ray_mask: i32,
    t_max: f32,
) -> Option<(f32, f32, f32)> {
    if scene.shapes[face.shape_index as usize].mask & ray_mask as u32 == 0 {
        return None;
    }

    let v0 = Vec3::from_array(scene.vertices[face.idx[0] as usize].position);
    let v1 = Vec3::from_array(scene.vertices[face.idx[1] as usize].position);
    let v2 = Vec3::from_array(scene.vertices[face.idx[2] as usize].position);

    let e1 = v1 - v0;
    let e2 = v2 - v0;
    let p = direction.cross(e2);
    let det = e1.dot(p);
    if det.abs() < 1e-10 {
        return None;
    }
    let inv_det = 1.0 / det;
    let tv = origin - v0;
    let u = tv.dot(p) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = tv.cross(e1);
    let v = direction.dot(q) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = e2.dot(q) * inv_det;
    if t > 0.0 && t <= t_max {
        Some((t, u, v))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slab_test_hits_and_misses() {
        let origin = Vec3::new(0.5, 0.5, 2.0);
        let inv = Vec3::new(0.0, 0.0, -1.0).recip();
        assert!(hit_box([0.0; 3], [1.0; 3], origin, inv, f32::MAX));
        assert!(!hit_box([2.0, 0.0, 0.0], [3.0, 1.0, 1.0], origin, inv, f32::MAX));
        // Behind the origin.
        assert!(!hit_box([0.0, 0.0, 3.0], [1.0, 1.0, 4.0], origin, inv, f32::MAX));
        // Beyond the current closest distance.
        assert!(!hit_box([0.0; 3], [1.0; 3], origin, inv, 0.5));
    }

    #[test]
    fn unknown_entry_point_is_rejected() {
        let exe = SoftwareExecutable;
        assert!(exe.create_function("IntersectClosest").is_ok());
        assert!(exe.create_function("Shade").is_err());
    }

    #[test]
    fn allocation_limit_is_enforced() {
        let device = SoftwareDevice::with_max_alloc(1024);
        assert!(device.create_buffer(1024, BufferKind::Write).is_ok());
        assert!(device.create_buffer(1025, BufferKind::Write).is_err());
    }
}
