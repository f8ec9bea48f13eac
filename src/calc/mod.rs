// src/calc/mod.rs
// The compute layer consumed by the strategy, as a narrow trait surface:
// device, buffers, a compiled executable with named kernel functions, and
// completion events. Resource release is Drop. Two implementations ship:
// a wgpu backend (gpu) and a software reference device (software).

pub mod gpu;
pub mod software;

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::Result;

pub type BufferHandle = Arc<dyn Buffer>;
pub type EventHandle = Box<dyn Event>;

/// Kernel-source family a device consumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Platform {
    OpenCl,
    Vulkan,
    Wgpu,
    Cpu,
}

/// Kernel access intent for a buffer. Backends may treat both the same;
/// the distinction documents which buffers queries mutate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferKind {
    Read,
    Write,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceSpec {
    /// Largest single allocation the device accepts, in bytes.
    pub max_alloc_size: u64,
}

/// Where kernel code comes from: a file on disk, source embedded in the
/// binary, or the backend's own built-in rendition of the entry points.
#[derive(Clone, Debug)]
pub enum KernelSource {
    File(PathBuf),
    Embedded(&'static str),
    Builtin,
}

/// A kernel argument at bind time. Buffer arguments are retained by the
/// function until rebound; scalars are captured by value.
pub enum Arg<'a> {
    Buffer(&'a BufferHandle),
    U32(u32),
}

pub trait Buffer: Send + Sync {
    fn size(&self) -> u64;
    fn as_any(&self) -> &dyn Any;
}

pub trait Event: Send {
    /// Block until the submission this event tracks has completed.
    fn wait(&self) -> Result<()>;
}

pub trait Function: Send + Sync {
    fn set_arg(&self, index: u32, arg: Arg<'_>) -> Result<()>;
    fn as_any(&self) -> &dyn Any;
}

pub trait Executable: Send + Sync {
    fn create_function(&self, name: &str) -> Result<Box<dyn Function>>;
}

pub trait Device: Send + Sync {
    fn spec(&self) -> DeviceSpec;

    fn platform(&self) -> Platform;

    fn compile_executable(&self, source: &KernelSource) -> Result<Box<dyn Executable>>;

    fn create_buffer(&self, size: u64, kind: BufferKind) -> Result<BufferHandle>;

    fn create_buffer_with_data(&self, kind: BufferKind, data: &[u8]) -> Result<BufferHandle>;

    /// Copy `out.len()` bytes starting at `offset` out of a device buffer,
    /// blocking until the copy completes.
    fn read_buffer(&self, buffer: &BufferHandle, offset: u64, out: &mut [u8]) -> Result<()>;

    /// Submit one kernel dispatch on the given queue and return its
    /// completion event. `global_size` must be a multiple of `local_size`.
    fn execute(
        &self,
        func: &dyn Function,
        queue: u32,
        global_size: u64,
        local_size: u64,
    ) -> Result<EventHandle>;

    /// Block until every submission on the queue has completed.
    fn finish(&self, queue: u32) -> Result<()>;
}
