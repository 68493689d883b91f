//! The device seam: what the cache needs from a graphics API.
//!
//! `SoftwareDevice` keeps every texture in system memory. It enforces a
//! video-memory budget and can be told to fail transfers, so it stands in
//! for real hardware in tests and in the replay tool.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::error::DeviceError;
use crate::format::{FormatCaps, PixelFormatKind};

/// Opaque GPU texture handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle(pub u64);

/// Shape of a texture object to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub kind: PixelFormatKind,
    pub width: u32,
    pub height: u32,
    pub levels: u32,
}

impl TextureDesc {
    pub fn level_size(&self, level: u32) -> (u32, u32) {
        ((self.width >> level).max(1), (self.height >> level).max(1))
    }

    pub fn level_bytes(&self, level: u32) -> usize {
        let (w, h) = self.level_size(level);
        self.kind.level_bytes(w, h)
    }

    /// Bytes for the whole chain.
    pub fn total_bytes(&self) -> usize {
        (0..self.levels).map(|l| self.level_bytes(l)).sum()
    }
}

/// What a device reports at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCaps {
    pub formats: Vec<FormatCaps>,
    /// Smallest legal texture edge.
    pub min_texture_size: u32,
    /// Largest legal width:height (or height:width) ratio.
    pub max_aspect_ratio: u32,
    /// Paletted textures may take a 16-bit palette.
    pub palette16: bool,
    /// Texture memory can be written in place.
    pub direct_mapping: bool,
    pub video_memory_bytes: u64,
}

impl DeviceCaps {
    /// Every format, no size quirks.
    pub fn full(video_memory_bytes: u64) -> Self {
        Self {
            formats: PixelFormatKind::ALL
                .iter()
                .map(|&k| FormatCaps::new(k, 2048))
                .collect(),
            min_texture_size: 1,
            max_aspect_ratio: 2048,
            palette16: true,
            direct_mapping: true,
            video_memory_bytes,
        }
    }

    /// Direct-color formats plus BC1; no palettes.
    pub fn d3d_like(video_memory_bytes: u64) -> Self {
        use PixelFormatKind::*;
        Self {
            formats: [Opaque565, Alpha1555, Alpha4444, Rgba8888, Bc1]
                .iter()
                .map(|&k| FormatCaps::new(k, 1024))
                .collect(),
            min_texture_size: 1,
            max_aspect_ratio: 1024,
            palette16: false,
            direct_mapping: true,
            video_memory_bytes,
        }
    }

    /// 256 max edge, 8:1 aspect, 16-bit formats plus palettes.
    pub fn glide_like(video_memory_bytes: u64) -> Self {
        use PixelFormatKind::*;
        Self {
            formats: [Paletted8, Opaque565, Alpha1555, Alpha4444]
                .iter()
                .map(|&k| FormatCaps::new(k, 256))
                .collect(),
            min_texture_size: 1,
            max_aspect_ratio: 8,
            palette16: true,
            direct_mapping: false,
            video_memory_bytes,
        }
    }

    /// A single opaque 16-bit format.
    pub fn opaque_only(video_memory_bytes: u64) -> Self {
        Self {
            formats: vec![FormatCaps::new(PixelFormatKind::Opaque565, 256)],
            min_texture_size: 8,
            max_aspect_ratio: 8,
            palette16: false,
            direct_mapping: false,
            video_memory_bytes,
        }
    }
}

/// Operations the cache issues against a graphics device.
pub trait TextureDevice {
    fn caps(&self) -> &DeviceCaps;

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureHandle, DeviceError>;

    fn destroy_texture(&mut self, handle: TextureHandle);

    /// Replace the full contents of one level.
    fn upload_level(&mut self, handle: TextureHandle, level: u32, data: &[u8]) -> Result<(), DeviceError>;

    /// Replace the palette of a paletted texture.
    fn upload_palette(&mut self, handle: TextureHandle, palette: &[u8]) -> Result<(), DeviceError>;

    /// Whether `map_level` is available for this texture.
    fn can_map(&self, _handle: TextureHandle) -> bool {
        false
    }

    /// Borrow a level's storage for in-place writes. The write lands when
    /// `unmap_level` succeeds.
    fn map_level(&mut self, handle: TextureHandle, _level: u32) -> Result<&mut [u8], DeviceError> {
        Err(DeviceError::UnknownHandle(handle))
    }

    fn unmap_level(&mut self, _handle: TextureHandle, _level: u32) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Re-create the device with new capabilities. Every handle is invalid
    /// afterwards.
    fn reset(&mut self, caps: &DeviceCaps) -> Result<(), DeviceError>;
}

// ============================================================
// SoftwareDevice
// ============================================================

/// Counters shared between a `SoftwareDevice` and anyone holding its probe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceCounters {
    pub created: u64,
    pub destroyed: u64,
    pub level_uploads: u64,
    pub mapped_writes: u64,
    pub palette_uploads: u64,
    pub failed_transfers: u64,
    pub bytes_uploaded: u64,
    pub used_bytes: u64,
    pub live_textures: u64,
}

/// Read-only view of a `SoftwareDevice`'s counters. Stays valid after the
/// device moves into a cache.
#[derive(Debug, Clone)]
pub struct DeviceProbe(Arc<Mutex<DeviceCounters>>);

impl DeviceProbe {
    pub fn snapshot(&self) -> DeviceCounters {
        self.0.lock().clone()
    }
}

#[derive(Debug)]
struct SoftTexture {
    desc: TextureDesc,
    levels: Vec<Vec<u8>>,
    palette: Option<Vec<u8>>,
    /// Level storage handed out by `map_level`, written back on unmap.
    mapped: Option<(u32, Vec<u8>)>,
}

#[derive(Debug)]
pub struct SoftwareDevice {
    caps: DeviceCaps,
    textures: HashMap<TextureHandle, SoftTexture>,
    next_handle: u64,
    fail_transfers: u32,
    lost: bool,
    counters: Arc<Mutex<DeviceCounters>>,
}

impl SoftwareDevice {
    pub fn new(caps: DeviceCaps) -> Self {
        Self {
            caps,
            textures: HashMap::new(),
            next_handle: 1,
            fail_transfers: 0,
            lost: false,
            counters: Arc::new(Mutex::new(DeviceCounters::default())),
        }
    }

    pub fn probe(&self) -> DeviceProbe {
        DeviceProbe(Arc::clone(&self.counters))
    }

    /// Make the next `count` level transfers fail.
    pub fn fail_next_transfers(&mut self, count: u32) {
        self.fail_transfers = count;
    }

    /// Simulate a lost device. Everything fails until `reset`.
    pub fn set_lost(&mut self, lost: bool) {
        self.lost = lost;
    }

    pub fn used_bytes(&self) -> u64 {
        self.counters.lock().used_bytes
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn desc(&self, handle: TextureHandle) -> Option<TextureDesc> {
        self.textures.get(&handle).map(|t| t.desc)
    }

    /// Current bytes of one level.
    pub fn read_back(&self, handle: TextureHandle, level: u32) -> Option<&[u8]> {
        self.textures
            .get(&handle)
            .and_then(|t| t.levels.get(level as usize))
            .map(Vec::as_slice)
    }

    /// Last palette uploaded to a paletted texture.
    pub fn palette(&self, handle: TextureHandle) -> Option<&[u8]> {
        self.textures.get(&handle).and_then(|t| t.palette.as_deref())
    }

    fn texture_mut(&mut self, handle: TextureHandle) -> Result<&mut SoftTexture, DeviceError> {
        if self.lost {
            return Err(DeviceError::DeviceLost);
        }
        self.textures
            .get_mut(&handle)
            .ok_or(DeviceError::UnknownHandle(handle))
    }

    fn take_transfer_failure(&mut self, level: u32) -> Result<(), DeviceError> {
        if self.fail_transfers > 0 {
            self.fail_transfers -= 1;
            self.counters.lock().failed_transfers += 1;
            return Err(DeviceError::TransferFailed { level });
        }
        Ok(())
    }
}

impl TextureDevice for SoftwareDevice {
    fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureHandle, DeviceError> {
        if self.lost {
            return Err(DeviceError::DeviceLost);
        }
        let (full_w, full_h) = (desc.width.max(1), desc.height.max(1));
        let chain = 32 - full_w.max(full_h).leading_zeros();
        if desc.width == 0 || desc.height == 0 || desc.levels == 0 || desc.levels > chain {
            return Err(DeviceError::InvalidSize {
                width: desc.width,
                height: desc.height,
                levels: desc.levels,
            });
        }

        let bytes = desc.total_bytes() as u64;
        let mut counters = self.counters.lock();
        if counters.used_bytes + bytes > self.caps.video_memory_bytes {
            return Err(DeviceError::OutOfVideoMemory { bytes });
        }
        counters.used_bytes += bytes;
        counters.created += 1;
        counters.live_textures += 1;
        drop(counters);

        let handle = TextureHandle(self.next_handle);
        self.next_handle += 1;
        let levels = (0..desc.levels).map(|l| vec![0u8; desc.level_bytes(l)]).collect();
        self.textures.insert(
            handle,
            SoftTexture {
                desc: *desc,
                levels,
                palette: None,
                mapped: None,
            },
        );
        trace!("created {:?} {:?} ({} bytes)", handle, desc, bytes);
        Ok(handle)
    }

    fn destroy_texture(&mut self, handle: TextureHandle) {
        if let Some(texture) = self.textures.remove(&handle) {
            let mut counters = self.counters.lock();
            counters.used_bytes -= texture.desc.total_bytes() as u64;
            counters.destroyed += 1;
            counters.live_textures -= 1;
        }
    }

    fn upload_level(&mut self, handle: TextureHandle, level: u32, data: &[u8]) -> Result<(), DeviceError> {
        self.take_transfer_failure(level)?;
        let texture = self.texture_mut(handle)?;
        let dest = texture
            .levels
            .get_mut(level as usize)
            .ok_or(DeviceError::InvalidSize {
                width: texture.desc.width,
                height: texture.desc.height,
                levels: level + 1,
            })?;
        if dest.len() != data.len() {
            return Err(DeviceError::SizeMismatch {
                level,
                expected: dest.len(),
                actual: data.len(),
            });
        }
        dest.copy_from_slice(data);

        let mut counters = self.counters.lock();
        counters.level_uploads += 1;
        counters.bytes_uploaded += data.len() as u64;
        Ok(())
    }

    fn upload_palette(&mut self, handle: TextureHandle, palette: &[u8]) -> Result<(), DeviceError> {
        let texture = self.texture_mut(handle)?;
        texture.palette = Some(palette.to_vec());
        self.counters.lock().palette_uploads += 1;
        Ok(())
    }

    fn can_map(&self, handle: TextureHandle) -> bool {
        self.caps.direct_mapping && !self.lost && self.textures.contains_key(&handle)
    }

    fn map_level(&mut self, handle: TextureHandle, level: u32) -> Result<&mut [u8], DeviceError> {
        let texture = self.texture_mut(handle)?;
        if level >= texture.desc.levels {
            return Err(DeviceError::InvalidSize {
                width: texture.desc.width,
                height: texture.desc.height,
                levels: level + 1,
            });
        }
        let len = texture.desc.level_bytes(level);
        let (_, storage) = texture.mapped.insert((level, vec![0u8; len]));
        Ok(storage.as_mut_slice())
    }

    fn unmap_level(&mut self, handle: TextureHandle, level: u32) -> Result<(), DeviceError> {
        self.take_transfer_failure(level)?;
        let texture = self.texture_mut(handle)?;
        let Some((mapped_level, storage)) = texture.mapped.take() else {
            return Ok(());
        };
        debug_assert_eq!(mapped_level, level);
        let bytes = storage.len() as u64;
        texture.levels[mapped_level as usize] = storage;

        let mut counters = self.counters.lock();
        counters.mapped_writes += 1;
        counters.bytes_uploaded += bytes;
        Ok(())
    }

    fn reset(&mut self, caps: &DeviceCaps) -> Result<(), DeviceError> {
        let handles: Vec<TextureHandle> = self.textures.keys().copied().collect();
        for handle in handles {
            self.destroy_texture(handle);
        }
        self.caps = caps.clone();
        self.lost = false;
        self.fail_transfers = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(kind: PixelFormatKind, w: u32, h: u32, levels: u32) -> TextureDesc {
        TextureDesc { kind, width: w, height: h, levels }
    }

    #[test]
    fn test_desc_total_bytes() {
        let d = desc(PixelFormatKind::Opaque565, 8, 4, 4);
        // 8x4, 4x2, 2x1, 1x1
        assert_eq!(d.total_bytes(), (32 + 8 + 2 + 1) * 2);
    }

    #[test]
    fn test_create_respects_memory_budget() {
        let mut dev = SoftwareDevice::new(DeviceCaps::full(1024));
        let d = desc(PixelFormatKind::Rgba8888, 16, 16, 1);
        assert!(dev.create_texture(&d).is_ok());
        assert_eq!(dev.used_bytes(), 1024);
        let err = dev.create_texture(&d).unwrap_err();
        assert_eq!(err, DeviceError::OutOfVideoMemory { bytes: 1024 });
    }

    #[test]
    fn test_destroy_returns_memory() {
        let mut dev = SoftwareDevice::new(DeviceCaps::full(1 << 20));
        let h = dev.create_texture(&desc(PixelFormatKind::Paletted8, 16, 16, 1)).unwrap();
        dev.destroy_texture(h);
        assert_eq!(dev.used_bytes(), 0);
        assert_eq!(dev.live_textures(), 0);
        let c = dev.probe().snapshot();
        assert_eq!((c.created, c.destroyed), (1, 1));
    }

    #[test]
    fn test_invalid_level_count() {
        let mut dev = SoftwareDevice::new(DeviceCaps::full(1 << 20));
        let err = dev.create_texture(&desc(PixelFormatKind::Rgba8888, 4, 4, 4)).unwrap_err();
        assert!(matches!(err, DeviceError::InvalidSize { .. }));
    }

    #[test]
    fn test_upload_and_read_back() {
        let mut dev = SoftwareDevice::new(DeviceCaps::full(1 << 20));
        let h = dev.create_texture(&desc(PixelFormatKind::Paletted8, 2, 2, 2)).unwrap();
        dev.upload_level(h, 0, &[1, 2, 3, 4]).unwrap();
        dev.upload_level(h, 1, &[9]).unwrap();
        assert_eq!(dev.read_back(h, 0), Some(&[1u8, 2, 3, 4][..]));
        assert_eq!(dev.read_back(h, 1), Some(&[9u8][..]));

        let err = dev.upload_level(h, 0, &[1, 2]).unwrap_err();
        assert!(matches!(err, DeviceError::SizeMismatch { expected: 4, actual: 2, .. }));
    }

    #[test]
    fn test_forced_transfer_failure() {
        let mut dev = SoftwareDevice::new(DeviceCaps::full(1 << 20));
        let h = dev.create_texture(&desc(PixelFormatKind::Paletted8, 1, 1, 1)).unwrap();
        dev.fail_next_transfers(1);
        assert_eq!(dev.upload_level(h, 0, &[5]), Err(DeviceError::TransferFailed { level: 0 }));
        assert!(dev.upload_level(h, 0, &[5]).is_ok());
        assert_eq!(dev.probe().snapshot().failed_transfers, 1);
    }

    #[test]
    fn test_map_then_unmap_writes_level() {
        let mut dev = SoftwareDevice::new(DeviceCaps::full(1 << 20));
        let h = dev.create_texture(&desc(PixelFormatKind::Paletted8, 2, 1, 1)).unwrap();
        assert!(dev.can_map(h));
        dev.map_level(h, 0).unwrap().copy_from_slice(&[7, 8]);
        dev.unmap_level(h, 0).unwrap();
        assert_eq!(dev.read_back(h, 0), Some(&[7u8, 8][..]));
        assert_eq!(dev.probe().snapshot().mapped_writes, 1);
    }

    #[test]
    fn test_lost_device_until_reset() {
        let mut dev = SoftwareDevice::new(DeviceCaps::full(1 << 20));
        let h = dev.create_texture(&desc(PixelFormatKind::Paletted8, 1, 1, 1)).unwrap();
        dev.set_lost(true);
        assert_eq!(dev.upload_level(h, 0, &[1]), Err(DeviceError::DeviceLost));
        dev.reset(&DeviceCaps::glide_like(1 << 20)).unwrap();
        assert_eq!(dev.live_textures(), 0);
        assert_eq!(dev.caps().max_aspect_ratio, 8);
        assert!(dev.create_texture(&desc(PixelFormatKind::Paletted8, 1, 1, 1)).is_ok());
    }
}
