//! Central error handling for the intersection strategy.
//!
//! One categorized enum covers the two fatal preprocess conditions plus
//! propagation from the compute layer and the host BVH builder.

/// Errors reported by preprocessing and query dispatch.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The device cannot hold a full-batch traversal stack.
    #[error(
        "fat BVH accelerator cannot allocate enough stack memory \
         ({required} bytes required, {limit} bytes available), try using a different accelerator"
    )]
    InsufficientStackMemory { required: u64, limit: u64 },

    /// The scene hierarchy is deeper than the per-ray stack bound.
    #[error(
        "fat BVH accelerator can cause a traversal stack overflow for this scene \
         (height {height} >= bound {bound}), try using a different accelerator"
    )]
    StackBoundExceeded { height: u32, bound: u32 },

    /// A query was issued before a world was successfully preprocessed.
    #[error("no scene is resident; call preprocess on a committed world first")]
    SceneNotCommitted,

    #[error("device error: {0}")]
    Device(String),

    #[error("kernel compilation error: {0}")]
    Compile(String),

    #[error("hierarchy build error: {0}")]
    Build(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn device<T: ToString>(msg: T) -> Self {
        Error::Device(msg.to_string())
    }

    pub fn compile<T: ToString>(msg: T) -> Self {
        Error::Compile(msg.to_string())
    }

    pub fn build<T: ToString>(msg: T) -> Self {
        Error::Build(msg.to_string())
    }
}

/// Result type alias for strategy operations.
pub type Result<T> = std::result::Result<T, Error>;
