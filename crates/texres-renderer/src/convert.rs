//! Pixel conversion from source mips into physical level layouts.
//!
//! Every filler is a pure function of (source layout, destination layout):
//! it writes exactly `LevelLayout::byte_len()` bytes and touches nothing
//! else. Large levels convert rows in parallel.

use rayon::prelude::*;

use crate::format::PixelFormatKind;
use crate::texture::{DynamicFlags, MipData, Palette, Rgba, SourceMip};

/// Levels with at least this many texels convert rows on the rayon pool.
const PARALLEL_TEXELS: usize = 128 * 128;

/// Alpha at or above this threshold survives masking.
pub const MASK_ALPHA_THRESHOLD: u8 = 128;

// ============================================================
// Layouts
// ============================================================

/// Which conversion routine a source needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillerKind {
    Paletted,
    Rgba,
    Compressed,
}

impl FillerKind {
    pub fn for_source(data: &MipData) -> Self {
        match data {
            MipData::Indexed(_) => FillerKind::Paletted,
            MipData::Rgba(_) => FillerKind::Rgba,
            MipData::Bc1(_) => FillerKind::Compressed,
        }
    }
}

/// Shape of one physical level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelLayout {
    pub kind: PixelFormatKind,
    pub width: u32,
    pub height: u32,
}

impl LevelLayout {
    pub fn new(kind: PixelFormatKind, width: u32, height: u32) -> Self {
        Self {
            kind,
            width: width.max(1),
            height: height.max(1),
        }
    }

    pub fn byte_len(&self) -> usize {
        self.kind.level_bytes(self.width, self.height)
    }

    pub fn row_pitch(&self) -> usize {
        self.kind.row_pitch(self.width)
    }
}

/// Inverse of the max-color normalization applied to a texture, per
/// color channel. Multiplying a sampled color by it restores the art.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorScale {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl ColorScale {
    pub const IDENTITY: ColorScale = ColorScale { r: 1.0, g: 1.0, b: 1.0 };

    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }
}

impl Default for ColorScale {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Per-channel rescale mapping the brightest referenced color to 255.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Normalizer {
    max: [u8; 3],
}

impl Normalizer {
    pub const NONE: Normalizer = Normalizer { max: [255; 3] };

    pub fn from_max(max: [u8; 3]) -> Self {
        // A black channel stays black; don't divide by zero.
        Self {
            max: max.map(|m| if m == 0 { 255 } else { m }),
        }
    }

    #[inline]
    pub fn apply(&self, c: Rgba) -> Rgba {
        #[inline]
        fn scale(v: u8, max: u8) -> u8 {
            ((v as u32 * 255 + max as u32 / 2) / max as u32).min(255) as u8
        }
        if self.max == [255; 3] {
            return c;
        }
        Rgba::new(
            scale(c.r, self.max[0]),
            scale(c.g, self.max[1]),
            scale(c.b, self.max[2]),
            c.a,
        )
    }

    pub fn inverse(&self) -> ColorScale {
        ColorScale {
            r: self.max[0] as f32 / 255.0,
            g: self.max[1] as f32 / 255.0,
            b: self.max[2] as f32 / 255.0,
        }
    }
}

/// Everything a fill needs besides the source and destination.
#[derive(Debug, Clone, Copy)]
pub struct FillParams<'a> {
    pub palette: Option<&'a Palette>,
    pub flags: DynamicFlags,
    /// Keep graded alpha. Off when the device can't show it.
    pub translucent: bool,
    pub normalizer: Normalizer,
}

impl<'a> FillParams<'a> {
    pub fn masked(&self) -> bool {
        self.flags.contains(DynamicFlags::MASKED)
    }
}

// ============================================================
// Max-color
// ============================================================

/// Brightest value per color channel among the texels a mip references.
/// Masked-out texels don't count. Compressed data reports full white.
pub fn max_color(source: &SourceMip, palette: Option<&Palette>, masked: bool) -> [u8; 3] {
    let mut max = [0u8; 3];
    let mut take = |c: Rgba| {
        max[0] = max[0].max(c.r);
        max[1] = max[1].max(c.g);
        max[2] = max[2].max(c.b);
    };

    match &source.data {
        MipData::Indexed(indices) => {
            let Some(palette) = palette else {
                return [255; 3];
            };
            let mut seen = [false; 256];
            for &i in indices {
                seen[i as usize] = true;
            }
            if masked {
                seen[0] = false;
            }
            for (i, _) in seen.iter().enumerate().filter(|(_, s)| **s) {
                take(palette[i]);
            }
        }
        MipData::Rgba(texels) => {
            for &t in texels {
                if !masked || t.a >= MASK_ALPHA_THRESHOLD {
                    take(t);
                }
            }
        }
        MipData::Bc1(_) => return [255; 3],
    }
    max
}

/// Whether a destination gets max-color normalization.
pub fn wants_normalization(kind: PixelFormatKind, flags: DynamicFlags) -> bool {
    kind.is_reduced_precision()
        || (kind == PixelFormatKind::Paletted8 && flags.contains(DynamicFlags::PALETTE_16))
}

// ============================================================
// Texel encoders
// ============================================================

#[inline]
pub fn encode_565(c: Rgba) -> u16 {
    ((c.r as u16 >> 3) << 11) | ((c.g as u16 >> 2) << 5) | (c.b as u16 >> 3)
}

#[inline]
pub fn encode_1555(c: Rgba) -> u16 {
    let a = if c.a >= MASK_ALPHA_THRESHOLD { 1u16 } else { 0 };
    (a << 15) | ((c.r as u16 >> 3) << 10) | ((c.g as u16 >> 3) << 5) | (c.b as u16 >> 3)
}

#[inline]
pub fn encode_4444(c: Rgba) -> u16 {
    ((c.a as u16 >> 4) << 12) | ((c.r as u16 >> 4) << 8) | ((c.g as u16 >> 4) << 4) | (c.b as u16 >> 4)
}

#[inline]
fn expand5(v: u16) -> u8 {
    let v = (v & 0x1f) as u8;
    (v << 3) | (v >> 2)
}

#[inline]
fn expand6(v: u16) -> u8 {
    let v = (v & 0x3f) as u8;
    (v << 2) | (v >> 4)
}

#[inline]
fn expand4(v: u16) -> u8 {
    (v & 0xf) as u8 * 17
}

pub fn decode_565(v: u16) -> Rgba {
    Rgba::opaque(expand5(v >> 11), expand6(v >> 5), expand5(v))
}

pub fn decode_1555(v: u16) -> Rgba {
    let a = if v & 0x8000 != 0 { 255 } else { 0 };
    Rgba::new(expand5(v >> 10), expand5(v >> 5), expand5(v), a)
}

pub fn decode_4444(v: u16) -> Rgba {
    Rgba::new(expand4(v >> 8), expand4(v >> 4), expand4(v), expand4(v >> 12))
}

/// Write one RGBA texel in a linear destination format.
#[inline]
fn put_texel(kind: PixelFormatKind, out: &mut [u8], c: Rgba) {
    match kind {
        PixelFormatKind::Opaque565 => out.copy_from_slice(&encode_565(c).to_le_bytes()),
        PixelFormatKind::Alpha1555 => out.copy_from_slice(&encode_1555(c).to_le_bytes()),
        PixelFormatKind::Alpha4444 => out.copy_from_slice(&encode_4444(c).to_le_bytes()),
        PixelFormatKind::Rgba8888 => out.copy_from_slice(bytemuck::bytes_of(&c)),
        PixelFormatKind::Paletted8 | PixelFormatKind::Bc1 => {
            unreachable!("{kind:?} is not a direct-color format")
        }
    }
}

/// Final alpha for a color-converted texel.
#[inline]
fn resolve_alpha(c: Rgba, params: &FillParams) -> Rgba {
    let a = if params.masked() {
        if c.a >= MASK_ALPHA_THRESHOLD { 255 } else { 0 }
    } else if params.translucent {
        c.a
    } else {
        255
    };
    Rgba { a, ..c }
}

/// Encode a palette for upload: 256 x RGBA8888, or 256 x ARGB1555 under
/// `PALETTE_16`. Masking clears entry 0.
pub fn encode_palette(palette: &Palette, flags: DynamicFlags, normalizer: Normalizer) -> Vec<u8> {
    let masked = flags.contains(DynamicFlags::MASKED);
    let entry = |i: usize| {
        if masked && i == 0 {
            Rgba::TRANSPARENT
        } else {
            Rgba { a: 255, ..normalizer.apply(palette[i]) }
        }
    };

    if flags.contains(DynamicFlags::PALETTE_16) {
        (0..256).flat_map(|i| encode_1555(entry(i)).to_le_bytes()).collect()
    } else {
        (0..256).flat_map(|i| bytemuck::bytes_of(&entry(i)).to_vec()).collect()
    }
}

// ============================================================
// Fill
// ============================================================

/// Run `f(row_index, row_bytes)` over every row of a level.
fn for_each_row<F>(dest: &mut [u8], pitch: usize, texels: usize, f: F)
where
    F: Fn(usize, &mut [u8]) + Sync + Send,
{
    if texels >= PARALLEL_TEXELS {
        dest.par_chunks_mut(pitch).enumerate().for_each(|(y, row)| f(y, row));
    } else {
        dest.chunks_mut(pitch).enumerate().for_each(|(y, row)| f(y, row));
    }
}

/// Convert `source` into `dest`, laid out as `layout`. A source smaller
/// than the layout is tiled; a compressed source is tiled a block at a
/// time.
///
/// `dest` must be exactly `layout.byte_len()` bytes and the source must
/// have passed validation (payload length matches, palette present for
/// indexed data).
pub fn fill(dest: &mut [u8], layout: LevelLayout, source: &SourceMip, params: &FillParams) {
    debug_assert_eq!(dest.len(), layout.byte_len());
    debug_assert_eq!(source.payload_len(), source.expected_len());

    match FillerKind::for_source(&source.data) {
        FillerKind::Paletted => fill_paletted(dest, layout, source, params),
        FillerKind::Rgba => fill_rgba(dest, layout, source, params),
        FillerKind::Compressed => fill_compressed(dest, layout, source, params),
    }
}

fn fill_paletted(dest: &mut [u8], layout: LevelLayout, source: &SourceMip, params: &FillParams) {
    let MipData::Indexed(indices) = &source.data else {
        unreachable!()
    };
    let sw = source.width.max(1) as usize;
    let sh = source.height.max(1) as usize;
    let width = layout.width as usize;
    let texels = width * layout.height as usize;

    if layout.kind == PixelFormatKind::Paletted8 {
        for_each_row(dest, layout.row_pitch(), texels, |y, row| {
            let src_row = &indices[(y % sh) * sw..][..sw];
            for (x, out) in row.iter_mut().enumerate() {
                *out = src_row[x % sw];
            }
        });
        return;
    }

    // Palette lookups happen once per entry, not per texel.
    let Some(palette) = params.palette else {
        return;
    };
    let mut lut = [Rgba::TRANSPARENT; 256];
    for (i, entry) in lut.iter_mut().enumerate() {
        let c = if params.masked() && i == 0 {
            Rgba::TRANSPARENT
        } else {
            let c = params.normalizer.apply(palette[i]);
            if params.masked() { Rgba { a: 255, ..c } } else { c }
        };
        *entry = resolve_alpha(c, params);
    }

    let bpp = layout.kind.bytes_per_texel().unwrap_or(4) as usize;
    let kind = layout.kind;
    for_each_row(dest, layout.row_pitch(), texels, |y, row| {
        let src_row = &indices[(y % sh) * sw..][..sw];
        for (x, out) in row.chunks_exact_mut(bpp).enumerate() {
            put_texel(kind, out, lut[src_row[x % sw] as usize]);
        }
    });
}

fn fill_rgba(dest: &mut [u8], layout: LevelLayout, source: &SourceMip, params: &FillParams) {
    let MipData::Rgba(texels) = &source.data else {
        unreachable!()
    };
    fill_from_rgba(dest, layout, texels, source.width, source.height, params);
}

fn fill_from_rgba(
    dest: &mut [u8],
    layout: LevelLayout,
    texels: &[Rgba],
    width: u32,
    height: u32,
    params: &FillParams,
) {
    let sw = width.max(1) as usize;
    let sh = height.max(1) as usize;
    let count = layout.width as usize * layout.height as usize;

    match layout.kind {
        PixelFormatKind::Bc1 | PixelFormatKind::Paletted8 => {
            // Resolution never routes direct color here.
            dest.fill(0);
        }
        kind => {
            let bpp = kind.bytes_per_texel().unwrap_or(4) as usize;
            for_each_row(dest, layout.row_pitch(), count, |y, row| {
                let src_row = &texels[(y % sh) * sw..][..sw];
                for (x, out) in row.chunks_exact_mut(bpp).enumerate() {
                    let c = src_row[x % sw];
                    let c = resolve_alpha(Rgba { a: c.a, ..params.normalizer.apply(c) }, params);
                    put_texel(kind, out, c);
                }
            });
        }
    }
}

fn fill_compressed(dest: &mut [u8], layout: LevelLayout, source: &SourceMip, params: &FillParams) {
    let MipData::Bc1(blocks) = &source.data else {
        unreachable!()
    };

    if layout.kind == PixelFormatKind::Bc1 {
        let sbw = source.width.max(1).div_ceil(4) as usize;
        let sbh = source.height.max(1).div_ceil(4) as usize;
        let dbw = layout.width.div_ceil(4) as usize;
        for (by, row) in dest.chunks_mut(dbw * 8).enumerate() {
            let src_row = &blocks[(by % sbh) * sbw * 8..][..sbw * 8];
            for (bx, block) in row.chunks_exact_mut(8).enumerate() {
                let s = (bx % sbw) * 8;
                block.copy_from_slice(&src_row[s..s + 8]);
            }
        }
        return;
    }

    let texels = decompress_bc1(blocks, source.width, source.height);
    fill_from_rgba(dest, layout, &texels, source.width, source.height, params);
}

// ============================================================
// BC1
// ============================================================

fn lerp_u8(a: u8, b: u8, num: u32, den: u32) -> u8 {
    debug_assert!(num <= den);
    ((a as u32 * (den - num) + b as u32 * num) / den) as u8
}

fn bc1_palette(color0: u16, color1: u16) -> [Rgba; 4] {
    let c0 = decode_565(color0);
    let c1 = decode_565(color1);
    let mix = |num, den| {
        Rgba::opaque(
            lerp_u8(c0.r, c1.r, num, den),
            lerp_u8(c0.g, c1.g, num, den),
            lerp_u8(c0.b, c1.b, num, den),
        )
    };

    if color0 > color1 {
        [c0, c1, mix(1, 3), mix(2, 3)]
    } else {
        // 3-color mode plus transparent black
        [c0, c1, mix(1, 2), Rgba::TRANSPARENT]
    }
}

/// Expand BC1 blocks into `width * height` RGBA texels.
pub fn decompress_bc1(blocks: &[u8], width: u32, height: u32) -> Vec<Rgba> {
    let width = width.max(1) as usize;
    let height = height.max(1) as usize;
    let blocks_w = width.div_ceil(4);
    let mut out = vec![Rgba::TRANSPARENT; width * height];

    for (i, block) in blocks.chunks_exact(8).enumerate() {
        let bx = (i % blocks_w) * 4;
        let by = (i / blocks_w) * 4;
        if by >= height {
            break;
        }
        let palette = bc1_palette(
            u16::from_le_bytes([block[0], block[1]]),
            u16::from_le_bytes([block[2], block[3]]),
        );
        let indices = u32::from_le_bytes([block[4], block[5], block[6], block[7]]);
        for t in 0..16 {
            let (x, y) = (bx + t % 4, by + t / 4);
            if x < width && y < height {
                out[y * width + x] = palette[((indices >> (2 * t)) & 0b11) as usize];
            }
        }
    }
    out
}

// ============================================================
// Readback
// ============================================================

/// Decode a physical level back to RGBA. `palette` is the encoded
/// palette as uploaded (1024 bytes RGBA8888 or 512 bytes ARGB1555) and
/// only matters for `Paletted8`.
pub fn decode_level(layout: LevelLayout, bytes: &[u8], palette: Option<&[u8]>) -> Vec<Rgba> {
    let count = layout.width as usize * layout.height as usize;
    let halves = || {
        bytes
            .chunks_exact(2)
            .map(|p| u16::from_le_bytes([p[0], p[1]]))
    };

    match layout.kind {
        PixelFormatKind::Opaque565 => halves().map(decode_565).collect(),
        PixelFormatKind::Alpha1555 => halves().map(decode_1555).collect(),
        PixelFormatKind::Alpha4444 => halves().map(decode_4444).collect(),
        PixelFormatKind::Rgba8888 => bytemuck::cast_slice::<u8, Rgba>(&bytes[..count * 4]).to_vec(),
        PixelFormatKind::Bc1 => decompress_bc1(bytes, layout.width, layout.height),
        PixelFormatKind::Paletted8 => {
            let lut: Vec<Rgba> = match palette {
                Some(p) if p.len() == 512 => p
                    .chunks_exact(2)
                    .map(|e| decode_1555(u16::from_le_bytes([e[0], e[1]])))
                    .collect(),
                Some(p) if p.len() == 1024 => p
                    .chunks_exact(4)
                    .map(|e| Rgba::new(e[0], e[1], e[2], e[3]))
                    .collect(),
                _ => (0..=255u8).map(Rgba::grey).collect(),
            };
            bytes.iter().take(count).map(|&i| lut[i as usize]).collect()
        }
    }
}
