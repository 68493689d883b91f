//! Moving converted pixels into a slot.
//!
//! A fill runs `Idle -> StagingFill -> DeviceTransfer -> Idle`. Staged
//! fills convert the whole chain into one reused system-memory buffer and
//! then copy it level by level; mapped fills convert each level straight
//! into device memory.

use std::time::{Duration, Instant};

use tracing::trace;

use crate::convert::{
    encode_palette, fill, max_color, wants_normalization, ColorScale, FillParams, LevelLayout, Normalizer,
};
use crate::device::{TextureDevice, TextureHandle};
use crate::error::DeviceError;
use crate::format::PixelFormatKind;
use crate::pool::PoolKey;
use crate::texture::{DynamicFlags, Palette, SourceMip};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    StagingFill,
    DeviceTransfer,
}

/// One slot fill.
#[derive(Debug, Clone, Copy)]
pub struct UploadJob<'a> {
    pub handle: TextureHandle,
    pub kind: PixelFormatKind,
    pub key: PoolKey,
    /// Source chain starting at the first mip that fits the slot.
    pub source: &'a [SourceMip],
    pub palette: Option<&'a Palette>,
    pub flags: DynamicFlags,
    pub translucent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UploadReport {
    pub color_scale: ColorScale,
    pub bytes: usize,
    pub levels: u32,
    pub mapped: bool,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct UploadPipeline {
    state: UploadState,
    staging: Vec<u8>,
    direct_map: bool,
}

impl UploadPipeline {
    pub fn new(direct_map: bool) -> Self {
        Self {
            state: UploadState::Idle,
            staging: Vec::new(),
            direct_map,
        }
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    pub fn set_direct_map(&mut self, direct_map: bool) {
        self.direct_map = direct_map;
    }

    /// Bytes currently reserved for staging.
    pub fn staging_capacity(&self) -> usize {
        self.staging.capacity()
    }

    pub fn run<D: TextureDevice + ?Sized>(
        &mut self,
        device: &mut D,
        job: &UploadJob,
    ) -> Result<UploadReport, DeviceError> {
        let start = Instant::now();
        let masked = job.flags.contains(DynamicFlags::MASKED);
        let normalizer = match job.source.first() {
            Some(base) if wants_normalization(job.kind, job.flags) => {
                Normalizer::from_max(max_color(base, job.palette, masked))
            }
            _ => Normalizer::NONE,
        };
        let params = FillParams {
            palette: job.palette,
            flags: job.flags,
            translucent: job.translucent,
            normalizer,
        };

        let mapped = self.direct_map && device.can_map(job.handle);
        let result = if mapped {
            self.transfer_mapped(device, job, &params)
        } else {
            self.transfer_staged(device, job, &params)
        };
        self.state = UploadState::Idle;
        let bytes = result?;

        if job.kind == PixelFormatKind::Paletted8 {
            if let Some(palette) = job.palette {
                let palette_norm = if job.flags.contains(DynamicFlags::PALETTE_16) {
                    normalizer
                } else {
                    Normalizer::NONE
                };
                device.upload_palette(job.handle, &encode_palette(palette, job.flags, palette_norm))?;
            }
        }

        Ok(UploadReport {
            color_scale: normalizer.inverse(),
            bytes,
            levels: job.key.levels as u32,
            mapped,
            elapsed: start.elapsed(),
        })
    }

    fn layouts<'a>(job: &'a UploadJob) -> impl Iterator<Item = (u32, LevelLayout, &'a SourceMip)> + 'a {
        let last = job.source.len().saturating_sub(1);
        (0..job.key.levels as u32).map(move |level| {
            let (w, h) = job.key.level_size(level);
            let source = &job.source[(level as usize).min(last)];
            (level, LevelLayout::new(job.kind, w, h), source)
        })
    }

    fn transfer_staged<D: TextureDevice + ?Sized>(
        &mut self,
        device: &mut D,
        job: &UploadJob,
        params: &FillParams,
    ) -> Result<usize, DeviceError> {
        self.state = UploadState::StagingFill;
        let total: usize = Self::layouts(job).map(|(_, layout, _)| layout.byte_len()).sum();
        self.staging.clear();
        self.staging.resize(total, 0);

        let mut offset = 0;
        for (_, layout, source) in Self::layouts(job) {
            let len = layout.byte_len();
            fill(&mut self.staging[offset..offset + len], layout, source, params);
            offset += len;
        }

        self.state = UploadState::DeviceTransfer;
        let mut offset = 0;
        for (level, layout, _) in Self::layouts(job) {
            let len = layout.byte_len();
            device.upload_level(job.handle, level, &self.staging[offset..offset + len])?;
            trace!("{:?} level {} {}x{}: {} bytes staged", job.handle, level, layout.width, layout.height, len);
            offset += len;
        }
        Ok(total)
    }

    fn transfer_mapped<D: TextureDevice + ?Sized>(
        &mut self,
        device: &mut D,
        job: &UploadJob,
        params: &FillParams,
    ) -> Result<usize, DeviceError> {
        let mut total = 0;
        for (level, layout, source) in Self::layouts(job) {
            self.state = UploadState::StagingFill;
            let dest = device.map_level(job.handle, level)?;
            fill(dest, layout, source, params);

            self.state = UploadState::DeviceTransfer;
            device.unmap_level(job.handle, level)?;
            trace!("{:?} level {} {}x{}: {} bytes mapped", job.handle, level, layout.width, layout.height, layout.byte_len());
            total += layout.byte_len();
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::decode_level;
    use crate::device::{DeviceCaps, SoftwareDevice, TextureDesc};
    use crate::format::PixelFormatId;
    use crate::texture::Rgba;

    fn grey_palette() -> Palette {
        let mut p = [Rgba::TRANSPARENT; 256];
        for (i, e) in p.iter_mut().enumerate() {
            *e = Rgba::grey(i as u8);
        }
        p
    }

    fn setup(kind: PixelFormatKind, w: u32, h: u32, levels: u32, direct: bool) -> (SoftwareDevice, TextureHandle, PoolKey) {
        let mut caps = DeviceCaps::full(1 << 20);
        caps.direct_mapping = direct;
        let mut dev = SoftwareDevice::new(caps);
        let handle = dev
            .create_texture(&TextureDesc { kind, width: w, height: h, levels })
            .unwrap();
        (dev, handle, PoolKey::new(PixelFormatId(0), w, h, levels))
    }

    #[test]
    fn test_staged_upload_writes_every_level() {
        let (mut dev, handle, key) = setup(PixelFormatKind::Paletted8, 4, 4, 3, false);
        let mips = vec![
            SourceMip::indexed(4, 4, vec![1; 16]),
            SourceMip::indexed(2, 2, vec![2; 4]),
            SourceMip::indexed(1, 1, vec![3]),
        ];
        let palette = grey_palette();
        let job = UploadJob {
            handle,
            kind: PixelFormatKind::Paletted8,
            key,
            source: &mips,
            palette: Some(&palette),
            flags: DynamicFlags::empty(),
            translucent: false,
        };
        let mut pipeline = UploadPipeline::new(true);
        let report = pipeline.run(&mut dev, &job).unwrap();

        assert_eq!(report.bytes, 16 + 4 + 1);
        assert_eq!(report.levels, 3);
        assert!(!report.mapped);
        assert!(report.color_scale.is_identity());
        assert_eq!(pipeline.state(), UploadState::Idle);
        assert_eq!(dev.read_back(handle, 2), Some(&[3u8][..]));
        assert_eq!(dev.palette(handle).map(<[u8]>::len), Some(1024));
        assert!(pipeline.staging_capacity() >= 21);
    }

    #[test]
    fn test_mapped_upload() {
        let (mut dev, handle, key) = setup(PixelFormatKind::Rgba8888, 2, 2, 1, true);
        let mips = vec![SourceMip::rgba(2, 2, vec![Rgba::opaque(1, 2, 3); 4])];
        let job = UploadJob {
            handle,
            kind: PixelFormatKind::Rgba8888,
            key,
            source: &mips,
            palette: None,
            flags: DynamicFlags::empty(),
            translucent: false,
        };
        let mut pipeline = UploadPipeline::new(true);
        let report = pipeline.run(&mut dev, &job).unwrap();
        assert!(report.mapped);
        assert_eq!(dev.probe().snapshot().mapped_writes, 1);
        assert_eq!(dev.probe().snapshot().level_uploads, 0);
        let layout = LevelLayout::new(PixelFormatKind::Rgba8888, 2, 2);
        let texels = decode_level(layout, dev.read_back(handle, 0).unwrap(), None);
        assert!(texels.iter().all(|&t| t == Rgba::opaque(1, 2, 3)));
    }

    #[test]
    fn test_failed_transfer_returns_to_idle() {
        let (mut dev, handle, key) = setup(PixelFormatKind::Opaque565, 2, 2, 2, false);
        let mips = vec![
            SourceMip::rgba(2, 2, vec![Rgba::grey(9); 4]),
            SourceMip::rgba(1, 1, vec![Rgba::grey(9)]),
        ];
        let job = UploadJob {
            handle,
            kind: PixelFormatKind::Opaque565,
            key,
            source: &mips,
            palette: None,
            flags: DynamicFlags::empty(),
            translucent: false,
        };
        dev.fail_next_transfers(1);
        let mut pipeline = UploadPipeline::new(false);
        assert_eq!(pipeline.run(&mut dev, &job), Err(DeviceError::TransferFailed { level: 0 }));
        assert_eq!(pipeline.state(), UploadState::Idle);
        assert!(pipeline.run(&mut dev, &job).is_ok());
    }

    #[test]
    fn test_reduced_precision_reports_scale() {
        let (mut dev, handle, key) = setup(PixelFormatKind::Opaque565, 2, 1, 1, false);
        let palette = grey_palette();
        let mips = vec![SourceMip::indexed(2, 1, vec![32, 64])];
        let job = UploadJob {
            handle,
            kind: PixelFormatKind::Opaque565,
            key,
            source: &mips,
            palette: Some(&palette),
            flags: DynamicFlags::empty(),
            translucent: false,
        };
        let report = UploadPipeline::new(false).run(&mut dev, &job).unwrap();
        assert!((report.color_scale.r - 64.0 / 255.0).abs() < 1e-6);
        let layout = LevelLayout::new(PixelFormatKind::Opaque565, 2, 1);
        let texels = decode_level(layout, dev.read_back(handle, 0).unwrap(), None);
        assert_eq!(texels[1], Rgba::opaque(255, 255, 255));
    }
}
