//! Fixed-capacity arenas of physical texture slots.
//!
//! Every slot in a pool has the same format, dimensions and level count,
//! so any slot can take any texture routed to the pool. Slots are
//! created on demand up to the pool's capacity and only destroyed on
//! reset.

use tracing::{debug, warn};

use crate::convert::ColorScale;
use crate::device::{DeviceCaps, TextureDesc, TextureDevice, TextureHandle};
use crate::error::{CacheError, DeviceError};
use crate::evict::EvictionController;
use crate::format::{PixelFormat, PixelFormatId, PixelFormatKind};
use crate::stats::ThrashStats;
use crate::texture::{SourceMip, TextureId, TextureKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolId(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub u32);

/// Where a slot lives: its pool and its index in the pool's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotRef {
    pub pool: PoolId,
    pub slot: SlotId,
}

/// Shape shared by every slot of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub format: PixelFormatId,
    pub log2_width: u8,
    pub log2_height: u8,
    pub levels: u8,
}

impl PoolKey {
    pub fn new(format: PixelFormatId, width: u32, height: u32, levels: u32) -> Self {
        debug_assert!(width.is_power_of_two() && height.is_power_of_two());
        Self {
            format,
            log2_width: width.trailing_zeros() as u8,
            log2_height: height.trailing_zeros() as u8,
            levels: levels as u8,
        }
    }

    pub fn width(&self) -> u32 {
        1 << self.log2_width
    }

    pub fn height(&self) -> u32 {
        1 << self.log2_height
    }

    pub fn level_size(&self, level: u32) -> (u32, u32) {
        ((self.width() >> level).max(1), (self.height() >> level).max(1))
    }
}

/// One physical texture object.
#[derive(Debug, Clone)]
pub struct Slot {
    pub handle: TextureHandle,
    pub occupant: Option<TextureKey>,
    pub last_frame: u64,
    /// Per-pool touch sequence number, breaks same-frame ties.
    pub last_order: u64,
    /// Contents don't match the occupant (failed or pending fill).
    pub unloaded: bool,
    pub fill_frame: Option<u64>,
    pub color_scale: ColorScale,
}

/// Result of asking a pool for room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub slot: SlotId,
    /// Key whose binding the claim displaced.
    pub evicted: Option<TextureKey>,
    pub thrash: bool,
    pub created: bool,
}

// ============================================================
// Sizing
// ============================================================

/// How a texture maps onto a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FitPlan {
    pub key: PoolKey,
    /// Leading source mips skipped because they exceed the format maximum.
    pub first_mip: usize,
}

/// Round a size up to what the device accepts: powers of two, at least
/// the minimum edge, within the aspect limit.
pub fn legalize(width: u32, height: u32, caps: &DeviceCaps) -> (u32, u32) {
    let min = caps.min_texture_size.max(1).next_power_of_two();
    let mut w = width.max(1).next_power_of_two().max(min);
    let mut h = height.max(1).next_power_of_two().max(min);

    let aspect = caps.max_aspect_ratio.max(1);
    if w > h.saturating_mul(aspect) {
        h = w.div_ceil(aspect).next_power_of_two();
    } else if h > w.saturating_mul(aspect) {
        w = h.div_ceil(aspect).next_power_of_two();
    }
    (w, h)
}

/// Number of levels in a full chain down to 1x1.
pub fn full_chain_len(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// Choose the pool shape for a source chain: drop leading mips until the
/// legalized size fits the format.
pub fn fit_texture(
    id: TextureId,
    format: &PixelFormat,
    caps: &DeviceCaps,
    mips: &[SourceMip],
) -> Result<FitPlan, CacheError> {
    for (first, mip) in mips.iter().enumerate() {
        let (w, h) = legalize(mip.width, mip.height, caps);
        if w > format.max_width || h > format.max_height {
            continue;
        }
        let levels = ((mips.len() - first) as u32).min(full_chain_len(w, h));
        return Ok(FitPlan {
            key: PoolKey::new(format.id, w, h, levels),
            first_mip: first,
        });
    }
    Err(CacheError::NoFittingMip {
        id,
        max_width: format.max_width,
        max_height: format.max_height,
    })
}

// ============================================================
// TexturePool
// ============================================================

#[derive(Debug)]
pub struct TexturePool {
    id: PoolId,
    key: PoolKey,
    kind: PixelFormatKind,
    capacity: usize,
    slots: Vec<Slot>,
    free: Vec<SlotId>,
    degraded: bool,
    touch_order: u64,
    evict: EvictionController,
    thrash: ThrashStats,
}

impl TexturePool {
    pub fn new(id: PoolId, key: PoolKey, format: &PixelFormat, capacity: usize, thrash_window: u32) -> Self {
        assert!(
            key.width() <= format.max_width && key.height() <= format.max_height,
            "pool {}x{} exceeds {} maximum {}x{}",
            key.width(),
            key.height(),
            format.tag,
            format.max_width,
            format.max_height,
        );
        assert_eq!(key.format, format.id);
        let capacity = capacity.max(1);
        Self {
            id,
            key,
            kind: format.kind,
            capacity,
            slots: Vec::with_capacity(capacity),
            free: Vec::with_capacity(capacity),
            degraded: false,
            touch_order: 0,
            evict: EvictionController::new(thrash_window, capacity),
            thrash: ThrashStats::default(),
        }
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn key(&self) -> PoolKey {
        self.key
    }

    pub fn kind(&self) -> PixelFormatKind {
        self.kind
    }

    pub fn desc(&self) -> TextureDesc {
        TextureDesc {
            kind: self.kind,
            width: self.key.width(),
            height: self.key.height(),
            levels: self.key.levels as u32,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn slot(&self, id: SlotId) -> &Slot {
        &self.slots[id.0 as usize]
    }

    pub fn slot_mut(&mut self, id: SlotId) -> &mut Slot {
        &mut self.slots[id.0 as usize]
    }

    pub fn slots(&self) -> impl Iterator<Item = (SlotId, &Slot)> {
        self.slots.iter().enumerate().map(|(i, s)| (SlotId(i as u32), s))
    }

    pub fn resident_bytes(&self) -> u64 {
        self.slots.len() as u64 * self.desc().total_bytes() as u64
    }

    pub fn thrash_stats(&self) -> &ThrashStats {
        &self.thrash
    }

    pub fn set_thrash_window(&mut self, window: u32) {
        self.evict.set_window(window);
    }

    pub fn touch(&mut self, id: SlotId, frame: u64) {
        self.touch_order = self.touch_order.saturating_add(1);
        let order = self.touch_order;
        let slot = self.slot_mut(id);
        slot.last_frame = frame;
        slot.last_order = order;
    }

    /// Charge one eviction and the refill it caused to this pool.
    pub fn record_eviction(&mut self, upload_time: std::time::Duration) {
        self.thrash.record(self.key.width(), self.key.height(), upload_time);
    }

    /// Hand `key` a slot: a free one, a new one while below capacity, or
    /// an evicted one. `prefer_reuse` tries eviction before growth.
    /// Returns `None` when the pool is full and every slot was touched
    /// during `frame`.
    pub fn find_free_or_evict<D: TextureDevice + ?Sized>(
        &mut self,
        device: &mut D,
        key: TextureKey,
        frame: u64,
        prefer_reuse: bool,
    ) -> Result<Option<Claim>, DeviceError> {
        if let Some(id) = self.free.pop() {
            return Ok(Some(self.occupy(id, key, frame, None, false, false)));
        }

        if !prefer_reuse {
            if let Some(id) = self.grow(device)? {
                return Ok(Some(self.occupy(id, key, frame, None, false, true)));
            }
        }

        if let Some(victim) = self.evict.choose(&self.slots, frame) {
            let evicted = self.slots[victim.slot.0 as usize].occupant.take();
            debug!(
                "pool {:?}: {:?} evicts {:?} (age {}{})",
                self.id,
                key.id,
                evicted.map(|k| k.id),
                victim.age,
                if victim.thrash { ", thrash" } else { "" },
            );
            return Ok(Some(self.occupy(victim.slot, key, frame, evicted, victim.thrash, false)));
        }

        if prefer_reuse {
            if let Some(id) = self.grow(device)? {
                return Ok(Some(self.occupy(id, key, frame, None, false, true)));
            }
        }
        Ok(None)
    }

    /// Create one more slot if allowed. Running out of video memory puts
    /// the pool in degraded mode instead of failing.
    fn grow<D: TextureDevice + ?Sized>(&mut self, device: &mut D) -> Result<Option<SlotId>, DeviceError> {
        if self.degraded || self.slots.len() >= self.capacity {
            return Ok(None);
        }
        match device.create_texture(&self.desc()) {
            Ok(handle) => {
                let id = SlotId(self.slots.len() as u32);
                self.slots.push(Slot {
                    handle,
                    occupant: None,
                    last_frame: 0,
                    last_order: 0,
                    unloaded: true,
                    fill_frame: None,
                    color_scale: ColorScale::IDENTITY,
                });
                Ok(Some(id))
            }
            Err(DeviceError::OutOfVideoMemory { bytes }) => {
                warn!(
                    "out of video memory creating {} {}x{} ({} bytes); pool {:?} stops growing at {} of {} slots",
                    self.kind.tag(),
                    self.key.width(),
                    self.key.height(),
                    bytes,
                    self.id,
                    self.slots.len(),
                    self.capacity,
                );
                self.degraded = true;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn occupy(
        &mut self,
        id: SlotId,
        key: TextureKey,
        frame: u64,
        evicted: Option<TextureKey>,
        thrash: bool,
        created: bool,
    ) -> Claim {
        let slot = self.slot_mut(id);
        slot.occupant = Some(key);
        slot.unloaded = true;
        slot.fill_frame = None;
        slot.color_scale = ColorScale::IDENTITY;
        self.touch(id, frame);
        Claim {
            slot: id,
            evicted,
            thrash,
            created,
        }
    }

    /// Empty a slot and put it on the free list. Returns the old occupant.
    pub fn release(&mut self, id: SlotId) -> Option<TextureKey> {
        let slot = self.slot_mut(id);
        let old = slot.occupant.take();
        slot.unloaded = true;
        if old.is_some() {
            self.free.push(id);
        }
        old
    }

    /// Destroy every physical texture and forget all slots.
    pub fn on_reset<D: TextureDevice + ?Sized>(&mut self, device: &mut D) {
        for slot in self.slots.drain(..) {
            device.destroy_texture(slot.handle);
        }
        self.free.clear();
        self.degraded = false;
        self.touch_order = 0;
        self.evict.reset();
    }
}
