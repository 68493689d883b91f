// Bounded texture residency cache: maps an unbounded set of logical
// textures onto fixed pools of device texture objects.

pub mod error;
pub mod texture;
pub mod format;
pub mod convert;
pub mod device;
pub mod pool;
pub mod directory;
pub mod evict;
pub mod upload;
pub mod stats;
pub mod config;
pub mod cache;

#[cfg(test)]
mod proptests;

pub use cache::{BoundTexture, ResidentTexture, TextureCache};
pub use config::CacheConfig;
pub use device::{DeviceCaps, SoftwareDevice, TextureDevice, TextureHandle};
pub use error::{CacheError, DeviceError};
pub use format::{PixelFormatKind, PixelFormatRegistry};
pub use stats::FormatStats;
pub use texture::{DynamicFlags, LogicalTexture, Palette, Rgba, SourceMip, TextureKey, TextureTraits};
