use thiserror::Error;

use crate::device::TextureHandle;
use crate::texture::{TextureId, TextureTraits};

/// Failures reported by a [`TextureDevice`](crate::device::TextureDevice).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("out of video memory allocating {bytes} bytes")]
    OutOfVideoMemory { bytes: u64 },

    #[error("device lost")]
    DeviceLost,

    #[error("transfer of level {level} failed")]
    TransferFailed { level: u32 },

    #[error("invalid texture size {width}x{height} ({levels} levels)")]
    InvalidSize { width: u32, height: u32, levels: u32 },

    #[error("unknown texture handle {0:?}")]
    UnknownHandle(TextureHandle),

    #[error("level {level} upload expects {expected} bytes, got {actual}")]
    SizeMismatch {
        level: u32,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("no supported pixel format for traits {traits:?}")]
    UnsupportedFormat { traits: TextureTraits },

    #[error("texture {id:?}: no mip level fits within {max_width}x{max_height}")]
    NoFittingMip {
        id: TextureId,
        max_width: u32,
        max_height: u32,
    },

    #[error("malformed source texture {id:?}: {reason}")]
    MalformedSource { id: TextureId, reason: String },

    #[error("device reset did not complete; reset again before binding")]
    ResetRequired,

    #[error(transparent)]
    Device(#[from] DeviceError),
}
