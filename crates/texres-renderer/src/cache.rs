//! The texture residency cache.
//!
//! `TextureCache` owns the device, the format registry, every pool, the
//! directory and the upload pipeline. Draw calls go through
//! `bind_texture`, which must be bracketed by `on_frame_begin` and
//! `on_frame_end`.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::convert::ColorScale;
use crate::device::{DeviceCaps, TextureDesc, TextureDevice, TextureHandle};
use crate::directory::CacheDirectory;
use crate::error::{CacheError, DeviceError};
use crate::format::{PixelFormatKind, PixelFormatRegistry, Resolved};
use crate::pool::{fit_texture, legalize, FitPlan, PoolId, PoolKey, SlotRef, TexturePool};
use crate::stats::{FormatStats, FrameCounters, ThrashStats};
use crate::texture::{
    DynamicFlags, LogicalTexture, MipData, Rgba, SourceMip, TextureKey, TextureTraits,
};
use crate::upload::{UploadJob, UploadPipeline};

/// What a draw call gets back.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundTexture {
    pub handle: TextureHandle,
    /// Multiply sampled colors by this to undo max-color normalization.
    pub color_scale: ColorScale,
    pub width: u32,
    pub height: u32,
    /// The texture couldn't be made resident; this is the neutral stand-in.
    pub fallback: bool,
}

/// One line of the resident texture list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResidentTexture {
    pub key: TextureKey,
    pub slot: SlotRef,
    pub handle: TextureHandle,
    pub kind: PixelFormatKind,
    pub format: &'static str,
    pub width: u32,
    pub height: u32,
    pub levels: u32,
    pub unloaded: bool,
}

#[derive(Debug, Clone, Copy)]
struct Fallback {
    handle: TextureHandle,
    color_scale: ColorScale,
    width: u32,
    height: u32,
}

pub struct TextureCache<D: TextureDevice> {
    device: D,
    config: CacheConfig,
    registry: PixelFormatRegistry,
    pools: Vec<TexturePool>,
    pool_index: HashMap<PoolKey, PoolId>,
    directory: CacheDirectory,
    upload: UploadPipeline,
    frame: u64,
    in_frame: bool,
    video_memory_full: bool,
    /// `None` after a device reset failed part way; binds are refused
    /// until a reset succeeds.
    fallback: Option<Fallback>,
    /// Indexed by `PixelFormatId`.
    counters: Vec<FrameCounters>,
}

impl<D: TextureDevice> TextureCache<D> {
    pub fn new(mut device: D, config: CacheConfig) -> Result<Self, CacheError> {
        let registry = PixelFormatRegistry::from_caps(device.caps());
        let mut upload = UploadPipeline::new(config.direct_map);
        let fallback = create_fallback(&mut device, &registry, &mut upload, config.fallback_grey)?;
        let counters = vec![FrameCounters::default(); registry.len()];
        info!(
            "texture cache up: {} formats, {}k pool budget",
            registry.len(),
            config.pool_budget_kb
        );

        Ok(Self {
            device,
            config,
            registry,
            pools: Vec::new(),
            pool_index: HashMap::new(),
            directory: CacheDirectory::new(),
            upload,
            frame: 0,
            in_frame: false,
            video_memory_full: false,
            fallback: Some(fallback),
            counters,
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn registry(&self) -> &PixelFormatRegistry {
        &self.registry
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Some pool ran out of video memory since the last flush.
    pub fn video_memory_full(&self) -> bool {
        self.video_memory_full
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    pub fn lookup(&self, key: &TextureKey) -> Option<SlotRef> {
        self.directory.lookup(key)
    }

    pub fn fallback_handle(&self) -> Option<TextureHandle> {
        self.fallback.map(|f| f.handle)
    }

    // ============================================================
    // Frame bracket
    // ============================================================

    pub fn on_frame_begin(&mut self) {
        debug_assert!(!self.in_frame, "on_frame_begin called twice without on_frame_end");
        self.frame = self.frame.saturating_add(1);
        self.in_frame = true;
        self.counters.fill(FrameCounters::default());
    }

    pub fn on_frame_end(&mut self) {
        debug_assert!(self.in_frame, "on_frame_end without on_frame_begin");
        self.in_frame = false;
    }

    // ============================================================
    // Binding
    // ============================================================

    /// Make `texture` resident and return what to draw with.
    pub fn bind_texture(&mut self, texture: &LogicalTexture) -> Result<BoundTexture, CacheError> {
        assert!(self.in_frame, "bind_texture called outside the frame bracket");
        self.bind_inner(texture, true)
    }

    /// Upload `texture` ahead of use, e.g. during level load.
    pub fn precache(&mut self, texture: &LogicalTexture) -> Result<(), CacheError> {
        assert!(self.in_frame, "precache called outside the frame bracket");
        self.bind_inner(texture, false).map(|_| ())
    }

    fn bind_inner(&mut self, texture: &LogicalTexture, count_bind: bool) -> Result<BoundTexture, CacheError> {
        if self.fallback.is_none() {
            return Err(CacheError::ResetRequired);
        }
        validate_source(texture)?;
        let resolved = self.registry.resolve(texture.traits, texture.key.flags)?;
        let format = self.registry.get(resolved.format);
        let plan = fit_texture(texture.key.id, format, self.device.caps(), texture.mips)?;
        if count_bind {
            self.counters[resolved.format.index()].binds += 1;
        }

        if let Some(sref) = self.directory.lookup(&texture.key) {
            let pool = &mut self.pools[sref.pool.0 as usize];
            if pool.key() == plan.key {
                return self.bind_hit(sref, texture, &resolved, &plan);
            }
            // Same key, new shape (e.g. the art was replaced at a new size).
            self.directory.unbind(sref);
            pool.release(sref.slot);
        }
        self.bind_miss(texture, &resolved, &plan)
    }

    fn bind_hit(
        &mut self,
        sref: SlotRef,
        texture: &LogicalTexture,
        resolved: &Resolved,
        plan: &FitPlan,
    ) -> Result<BoundTexture, CacheError> {
        let frame = self.frame;
        let pool = &mut self.pools[sref.pool.0 as usize];
        debug_assert_eq!(pool.slot(sref.slot).occupant, Some(texture.key));
        pool.touch(sref.slot, frame);

        let slot = pool.slot(sref.slot);
        let stale = slot.unloaded || texture.realtime_changed;
        if stale && slot.fill_frame != Some(frame) {
            self.fill_slot(sref, texture, resolved, plan)?;
        }
        self.bound(sref)
    }

    fn bind_miss(
        &mut self,
        texture: &LogicalTexture,
        resolved: &Resolved,
        plan: &FitPlan,
    ) -> Result<BoundTexture, CacheError> {
        let pool_id = self.pool_for(plan.key);
        let idx = pool_id.0 as usize;
        let was_degraded = self.pools[idx].is_degraded();

        let claim = self.pools[idx].find_free_or_evict(
            &mut self.device,
            texture.key,
            self.frame,
            self.video_memory_full,
        )?;

        if !was_degraded && self.pools[idx].is_degraded() && !self.video_memory_full {
            warn!("video memory full; pools will reuse slots before growing");
            self.video_memory_full = true;
        }

        let counters = &mut self.counters[resolved.format.index()];
        let Some(claim) = claim else {
            counters.fallbacks += 1;
            debug!(
                "{:?}: pool {:?} full with every slot in use this frame",
                texture.key.id, pool_id
            );
            return self.fallback_bound();
        };
        if claim.evicted.is_some() {
            counters.evictions += 1;
        }

        let sref = SlotRef {
            pool: pool_id,
            slot: claim.slot,
        };
        let displaced = self.directory.bind(texture.key, sref);
        debug_assert_eq!(displaced, claim.evicted);

        let elapsed = self.fill_slot(sref, texture, resolved, plan)?;
        if claim.evicted.is_some() {
            self.pools[idx].record_eviction(elapsed);
        }
        self.bound(sref)
    }

    /// Run the upload pipeline for a slot. Transfer failures leave the
    /// slot unloaded for a retry next frame; a lost device is returned.
    fn fill_slot(
        &mut self,
        sref: SlotRef,
        texture: &LogicalTexture,
        resolved: &Resolved,
        plan: &FitPlan,
    ) -> Result<Duration, CacheError> {
        let idx = sref.pool.0 as usize;
        let pool = &self.pools[idx];
        let job = UploadJob {
            handle: pool.slot(sref.slot).handle,
            kind: pool.kind(),
            key: pool.key(),
            source: &texture.mips[plan.first_mip..],
            palette: texture.palette,
            flags: resolved.flags,
            translucent: resolved.translucent,
        };
        let result = self.upload.run(&mut self.device, &job);

        let slot = self.pools[idx].slot_mut(sref.slot);
        slot.fill_frame = Some(self.frame);
        match result {
            Ok(report) => {
                slot.unloaded = false;
                slot.color_scale = report.color_scale;
                let counters = &mut self.counters[resolved.format.index()];
                counters.uploads += 1;
                counters.upload_bytes += report.bytes as u64;
                counters.upload_time += report.elapsed;
                Ok(report.elapsed)
            }
            Err(DeviceError::DeviceLost) => {
                slot.unloaded = true;
                Err(DeviceError::DeviceLost.into())
            }
            Err(e) => {
                slot.unloaded = true;
                debug!("{:?}: upload failed ({}); retrying next frame", texture.key.id, e);
                Ok(Duration::ZERO)
            }
        }
    }

    fn bound(&mut self, sref: SlotRef) -> Result<BoundTexture, CacheError> {
        let pool = &self.pools[sref.pool.0 as usize];
        let slot = pool.slot(sref.slot);
        if slot.unloaded {
            let format = pool.key().format;
            self.counters[format.index()].fallbacks += 1;
            return self.fallback_bound();
        }
        Ok(BoundTexture {
            handle: slot.handle,
            color_scale: slot.color_scale,
            width: pool.key().width(),
            height: pool.key().height(),
            fallback: false,
        })
    }

    fn fallback_bound(&self) -> Result<BoundTexture, CacheError> {
        let fallback = self.fallback.ok_or(CacheError::ResetRequired)?;
        Ok(BoundTexture {
            handle: fallback.handle,
            color_scale: fallback.color_scale,
            width: fallback.width,
            height: fallback.height,
            fallback: true,
        })
    }

    fn pool_for(&mut self, key: PoolKey) -> PoolId {
        if let Some(&id) = self.pool_index.get(&key) {
            return id;
        }
        let format = self.registry.get(key.format);
        let desc = TextureDesc {
            kind: format.kind,
            width: key.width(),
            height: key.height(),
            levels: key.levels as u32,
        };
        let capacity = self.config.pool_capacity(desc.total_bytes());
        let id = PoolId(self.pools.len() as u16);
        debug!(
            "new pool {:?}: {} {}x{} x{} levels, {} slots",
            id,
            format.tag,
            desc.width,
            desc.height,
            desc.levels,
            capacity
        );
        self.pools
            .push(TexturePool::new(id, key, format, capacity, self.config.thrash_window));
        self.pool_index.insert(key, id);
        id
    }

    // ============================================================
    // Maintenance
    // ============================================================

    /// Drop the binding for `key`, freeing its slot for reuse.
    pub fn forget(&mut self, key: &TextureKey) -> bool {
        match self.directory.remove(key) {
            Some(sref) => {
                self.pools[sref.pool.0 as usize].release(sref.slot);
                true
            }
            None => false,
        }
    }

    /// Destroy every slot and binding. Formats and the fallback survive.
    pub fn flush(&mut self) {
        for pool in &mut self.pools {
            pool.on_reset(&mut self.device);
        }
        let dropped = self.directory.len();
        self.pools.clear();
        self.pool_index.clear();
        self.directory.clear();
        self.video_memory_full = false;
        info!("texture cache flushed ({} bindings dropped)", dropped);
    }

    /// The device was re-created, possibly with different capabilities.
    /// If this fails the cache refuses binds until a later reset succeeds.
    pub fn on_device_reset(&mut self, caps: DeviceCaps) -> Result<(), CacheError> {
        self.flush();
        if let Some(old) = self.fallback.take() {
            self.device.destroy_texture(old.handle);
        }
        self.device.reset(&caps)?;

        self.registry = PixelFormatRegistry::from_caps(self.device.caps());
        self.counters = vec![FrameCounters::default(); self.registry.len()];
        let fallback = create_fallback(
            &mut self.device,
            &self.registry,
            &mut self.upload,
            self.config.fallback_grey,
        )
        .inspect_err(|e| warn!("device reset incomplete: {}", e))?;
        self.fallback = Some(fallback);
        info!("texture cache reset: {} formats", self.registry.len());
        Ok(())
    }

    /// Switch to new tuning. Pool sizing changes flush the cache.
    pub fn apply_config(&mut self, config: CacheConfig) -> Result<(), CacheError> {
        let old = self.config;
        self.config = config;
        self.upload.set_direct_map(config.direct_map);

        if old.needs_flush(&config) {
            self.flush();
        } else if old.thrash_window != config.thrash_window {
            for pool in &mut self.pools {
                pool.set_thrash_window(config.thrash_window);
            }
        }

        if old.fallback_grey != config.fallback_grey {
            // The old fallback stays until its replacement exists.
            let fresh = match create_fallback(
                &mut self.device,
                &self.registry,
                &mut self.upload,
                config.fallback_grey,
            ) {
                Ok(fresh) => fresh,
                Err(e) => {
                    self.config.fallback_grey = old.fallback_grey;
                    return Err(e);
                }
            };
            if let Some(stale) = self.fallback.replace(fresh) {
                self.device.destroy_texture(stale.handle);
            }
        }
        Ok(())
    }

    // ============================================================
    // Inspection
    // ============================================================

    pub fn stats(&self) -> Vec<FormatStats> {
        self.registry
            .iter()
            .map(|format| {
                let mut s = FormatStats {
                    format: format.id,
                    kind: format.kind,
                    tag: format.tag,
                    pools: 0,
                    slots: 0,
                    capacity: 0,
                    resident_bytes: 0,
                    degraded: false,
                    frame: self.counters[format.id.index()],
                    thrash: ThrashStats::default(),
                };
                for pool in self.pools.iter().filter(|p| p.key().format == format.id) {
                    s.pools += 1;
                    s.slots += pool.len();
                    s.capacity += pool.capacity();
                    s.resident_bytes += pool.resident_bytes();
                    s.degraded |= pool.is_degraded();
                    s.thrash.merge(pool.thrash_stats());
                }
                s
            })
            .collect()
    }

    /// Every bound texture, ordered by identity.
    pub fn resident_textures(&self) -> Vec<ResidentTexture> {
        let mut list: Vec<ResidentTexture> = self
            .directory
            .iter()
            .map(|(key, sref)| {
                let pool = &self.pools[sref.pool.0 as usize];
                let pk = pool.key();
                ResidentTexture {
                    key: *key,
                    slot: *sref,
                    handle: pool.slot(sref.slot).handle,
                    kind: pool.kind(),
                    format: self.registry.get(pk.format).tag,
                    width: pk.width(),
                    height: pk.height(),
                    levels: pk.levels as u32,
                    unloaded: pool.slot(sref.slot).unloaded,
                }
            })
            .collect();
        list.sort_by_key(|r| (r.key.id, r.key.flags.bits()));
        list
    }

    /// Verify directory/pool agreement and capacity limits.
    pub fn check_invariants(&self) -> Result<(), String> {
        if !self.directory.is_consistent() {
            return Err("directory forward and reverse maps disagree".into());
        }
        for (key, sref) in self.directory.iter() {
            let occupant = self.pools[sref.pool.0 as usize].slot(sref.slot).occupant;
            if occupant != Some(*key) {
                return Err(format!("{:?} maps to {:?} occupied by {:?}", key, sref, occupant));
            }
        }
        for pool in &self.pools {
            if pool.len() > pool.capacity() {
                return Err(format!(
                    "pool {:?} holds {} slots, capacity {}",
                    pool.id(),
                    pool.len(),
                    pool.capacity()
                ));
            }
            for (slot_id, slot) in pool.slots() {
                let sref = SlotRef {
                    pool: pool.id(),
                    slot: slot_id,
                };
                if let Some(key) = slot.occupant {
                    if self.directory.lookup(&key) != Some(sref) {
                        return Err(format!("{:?} occupies {:?} without a directory entry", key, sref));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Reject sources the fillers can't convert.
fn validate_source(texture: &LogicalTexture) -> Result<(), CacheError> {
    let id = texture.key.id;
    let malformed = |reason: String| CacheError::MalformedSource { id, reason };

    let Some(base) = texture.mips.first() else {
        return Err(malformed("no mip levels".into()));
    };
    let is_kind = |mip: &SourceMip, other: &MipData| {
        std::mem::discriminant(&mip.data) == std::mem::discriminant(other)
    };
    for (level, mip) in texture.mips.iter().enumerate() {
        if !is_kind(mip, &base.data) {
            return Err(malformed(format!("level {level} mixes pixel layouts")));
        }
        if mip.width == 0 || mip.height == 0 || mip.payload_len() != mip.expected_len() {
            return Err(malformed(format!(
                "level {level} is {}x{} with {} payload units",
                mip.width,
                mip.height,
                mip.payload_len()
            )));
        }
    }

    let traits = texture.traits;
    match &base.data {
        MipData::Indexed(_) if texture.palette.is_none() => {
            Err(malformed("indexed source without a palette".into()))
        }
        MipData::Indexed(_) if !traits.contains(TextureTraits::PALETTED) => {
            Err(malformed("indexed source not declared PALETTED".into()))
        }
        MipData::Bc1(_) if !traits.contains(TextureTraits::COMPRESSED) => {
            Err(malformed("block data not declared COMPRESSED".into()))
        }
        MipData::Rgba(_) if traits.intersects(TextureTraits::PALETTED | TextureTraits::COMPRESSED) => {
            Err(malformed("RGBA source declared PALETTED or COMPRESSED".into()))
        }
        MipData::Indexed(_) if traits.contains(TextureTraits::COMPRESSED) => {
            Err(malformed("indexed source declared COMPRESSED".into()))
        }
        MipData::Bc1(_) if traits.contains(TextureTraits::PALETTED) => {
            Err(malformed("block data declared PALETTED".into()))
        }
        _ => Ok(()),
    }
}

/// Create the neutral grey texture handed out when a texture can't be
/// made resident.
fn create_fallback<D: TextureDevice + ?Sized>(
    device: &mut D,
    registry: &PixelFormatRegistry,
    upload: &mut UploadPipeline,
    grey: u8,
) -> Result<Fallback, CacheError> {
    let resolved = registry.resolve(TextureTraits::empty(), DynamicFlags::empty())?;
    let format = registry.get(resolved.format);
    let (width, height) = legalize(1, 1, device.caps());
    let key = PoolKey::new(format.id, width, height, 1);
    let handle = device.create_texture(&TextureDesc {
        kind: format.kind,
        width,
        height,
        levels: 1,
    })?;

    let texels = vec![Rgba::grey(grey); (width * height) as usize];
    let source = [SourceMip::rgba(width, height, texels)];
    let job = UploadJob {
        handle,
        kind: format.kind,
        key,
        source: &source,
        palette: None,
        flags: DynamicFlags::empty(),
        translucent: false,
    };
    let report = match upload.run(device, &job) {
        Ok(report) => report,
        Err(e) => {
            device.destroy_texture(handle);
            return Err(e.into());
        }
    };
    Ok(Fallback {
        handle,
        color_scale: report.color_scale,
        width,
        height,
    })
}
