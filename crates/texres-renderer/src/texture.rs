//! Logical texture descriptors.
//!
//! These describe "a piece of art" as the engine sees it, independent of
//! which physical slot (if any) currently holds it.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

/// Content identity of a logical texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u64);

bitflags! {
    /// Declared traits of the source art. These route a texture to a
    /// physical format.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TextureTraits: u32 {
        /// Carries a real alpha channel (translucent).
        const HAS_ALPHA = 1 << 0;
        /// 8-bit indices into a 256-entry palette.
        const PALETTED = 1 << 1;
        /// Pre-compressed block data.
        const COMPRESSED = 1 << 2;
    }
}

bitflags! {
    /// Per-draw flags that change the physical byte layout. Two draws of
    /// the same art with different flags are separate cache entries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DynamicFlags: u32 {
        /// Binary alpha: palette index 0 is fully transparent.
        const MASKED = 1 << 0;
        /// Upload the palette in 16-bit form.
        const PALETTE_16 = 1 << 1;
    }
}

/// Cache key: identity plus the flags that affect encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureKey {
    pub id: TextureId,
    pub flags: DynamicFlags,
}

impl TextureKey {
    pub fn new(id: u64, flags: DynamicFlags) -> Self {
        Self { id: TextureId(id), flags }
    }

    pub fn plain(id: u64) -> Self {
        Self::new(id, DynamicFlags::empty())
    }
}

/// An 8-bit-per-channel color in memory order R, G, B, A.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba {
    pub const TRANSPARENT: Rgba = Rgba::new(0, 0, 0, 0);

    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub const fn opaque(r: u8, g: u8, b: u8) -> Self {
        Self::new(r, g, b, 255)
    }

    pub const fn grey(v: u8) -> Self {
        Self::opaque(v, v, v)
    }
}

/// 256-entry RGBA palette.
pub type Palette = [Rgba; 256];

/// Pixel payload of one source mip level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MipData {
    /// One palette index per texel.
    Indexed(Vec<u8>),
    /// One RGBA texel per texel.
    Rgba(Vec<Rgba>),
    /// BC1 blocks, 8 bytes per 4x4 block, row-major.
    Bc1(Vec<u8>),
}

/// One level of a source mip chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMip {
    pub width: u32,
    pub height: u32,
    pub data: MipData,
}

impl SourceMip {
    pub fn indexed(width: u32, height: u32, indices: Vec<u8>) -> Self {
        Self { width, height, data: MipData::Indexed(indices) }
    }

    pub fn rgba(width: u32, height: u32, texels: Vec<Rgba>) -> Self {
        Self { width, height, data: MipData::Rgba(texels) }
    }

    pub fn bc1(width: u32, height: u32, blocks: Vec<u8>) -> Self {
        Self { width, height, data: MipData::Bc1(blocks) }
    }

    /// Number of payload units the level must carry for its dimensions.
    pub fn expected_len(&self) -> usize {
        let texels = self.width as usize * self.height as usize;
        match self.data {
            MipData::Indexed(_) | MipData::Rgba(_) => texels,
            MipData::Bc1(_) => bc1_level_bytes(self.width, self.height),
        }
    }

    pub fn payload_len(&self) -> usize {
        match &self.data {
            MipData::Indexed(v) => v.len(),
            MipData::Rgba(v) => v.len(),
            MipData::Bc1(v) => v.len(),
        }
    }
}

/// Bytes needed for a BC1 level of the given size.
pub fn bc1_level_bytes(width: u32, height: u32) -> usize {
    let bw = width.max(1).div_ceil(4) as usize;
    let bh = height.max(1).div_ceil(4) as usize;
    bw * bh * 8
}

/// What a draw call presents to the cache.
#[derive(Debug, Clone, Copy)]
pub struct LogicalTexture<'a> {
    pub key: TextureKey,
    pub traits: TextureTraits,
    /// Finest level first.
    pub mips: &'a [SourceMip],
    pub palette: Option<&'a Palette>,
    /// The pixel content changed since it was last bound.
    pub realtime_changed: bool,
}

impl<'a> LogicalTexture<'a> {
    pub fn new(key: TextureKey, traits: TextureTraits, mips: &'a [SourceMip]) -> Self {
        Self {
            key,
            traits,
            mips,
            palette: None,
            realtime_changed: false,
        }
    }

    pub fn with_palette(mut self, palette: &'a Palette) -> Self {
        self.palette = Some(palette);
        self
    }

    pub fn changed(mut self, realtime_changed: bool) -> Self {
        self.realtime_changed = realtime_changed;
        self
    }
}
