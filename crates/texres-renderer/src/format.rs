//! Physical pixel formats and the registry that routes logical textures
//! onto them.
//!
//! The registry is built once per device (and rebuilt on device reset)
//! from the device's advertised formats. Resolution walks a fixed,
//! per-need priority list: the format needing the least conversion work
//! comes first, the general 32-bit format last.

use tracing::{info, warn};

use crate::device::DeviceCaps;
use crate::error::CacheError;
use crate::texture::{bc1_level_bytes, DynamicFlags, TextureTraits};

/// The closed set of physical layouts a device can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PixelFormatKind {
    /// 8-bit indices plus a device palette.
    Paletted8,
    /// 16-bit R5 G6 B5, no alpha.
    Opaque565,
    /// 16-bit A1 R5 G5 B5.
    Alpha1555,
    /// 16-bit A4 R4 G4 B4.
    Alpha4444,
    /// 32-bit R8 G8 B8 A8.
    Rgba8888,
    /// BC1 / DXT1 4x4 blocks.
    Bc1,
}

impl PixelFormatKind {
    pub const ALL: [PixelFormatKind; 6] = [
        PixelFormatKind::Paletted8,
        PixelFormatKind::Opaque565,
        PixelFormatKind::Alpha1555,
        PixelFormatKind::Alpha4444,
        PixelFormatKind::Rgba8888,
        PixelFormatKind::Bc1,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            PixelFormatKind::Paletted8 => "P8",
            PixelFormatKind::Opaque565 => "RGB565",
            PixelFormatKind::Alpha1555 => "ARGB1555",
            PixelFormatKind::Alpha4444 => "ARGB4444",
            PixelFormatKind::Rgba8888 => "RGBA8888",
            PixelFormatKind::Bc1 => "BC1",
        }
    }

    /// Bytes per texel for linear formats, `None` for block formats.
    pub fn bytes_per_texel(self) -> Option<u32> {
        match self {
            PixelFormatKind::Paletted8 => Some(1),
            PixelFormatKind::Opaque565
            | PixelFormatKind::Alpha1555
            | PixelFormatKind::Alpha4444 => Some(2),
            PixelFormatKind::Rgba8888 => Some(4),
            PixelFormatKind::Bc1 => None,
        }
    }

    pub fn is_compressed(self) -> bool {
        matches!(self, PixelFormatKind::Bc1)
    }

    /// Fewer than 8 bits per color channel, so max-color normalization pays off.
    pub fn is_reduced_precision(self) -> bool {
        matches!(
            self,
            PixelFormatKind::Opaque565 | PixelFormatKind::Alpha1555 | PixelFormatKind::Alpha4444
        )
    }

    /// Can represent binary (masked) alpha.
    pub fn supports_mask(self) -> bool {
        !matches!(self, PixelFormatKind::Opaque565)
    }

    /// Can represent graded alpha.
    pub fn supports_translucency(self) -> bool {
        matches!(self, PixelFormatKind::Alpha4444 | PixelFormatKind::Rgba8888)
    }

    /// Bytes in one row of texels (or one row of blocks).
    pub fn row_pitch(self, width: u32) -> usize {
        match self.bytes_per_texel() {
            Some(bpp) => width.max(1) as usize * bpp as usize,
            None => width.max(1).div_ceil(4) as usize * 8,
        }
    }

    /// Number of rows stored for a level of `height` texels.
    pub fn row_count(self, height: u32) -> usize {
        if self.is_compressed() {
            height.max(1).div_ceil(4) as usize
        } else {
            height.max(1) as usize
        }
    }

    pub fn level_bytes(self, width: u32, height: u32) -> usize {
        match self.bytes_per_texel() {
            Some(bpp) => width.max(1) as usize * height.max(1) as usize * bpp as usize,
            None => bc1_level_bytes(width, height),
        }
    }
}

/// What a device advertises for one format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatCaps {
    pub kind: PixelFormatKind,
    pub max_width: u32,
    pub max_height: u32,
}

impl FormatCaps {
    pub fn new(kind: PixelFormatKind, max_size: u32) -> Self {
        Self {
            kind,
            max_width: max_size,
            max_height: max_size,
        }
    }
}

/// Index of a format inside a [`PixelFormatRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PixelFormatId(pub u8);

impl PixelFormatId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A registered physical format. Immutable once the device is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelFormat {
    pub id: PixelFormatId,
    pub kind: PixelFormatKind,
    pub max_width: u32,
    pub max_height: u32,
    pub tag: &'static str,
}

impl PixelFormat {
    /// Bytes per texel; block formats report their average rounded up.
    pub fn byte_depth(&self) -> u32 {
        self.kind.bytes_per_texel().unwrap_or(1)
    }
}

/// Features the device can or cannot render. A missing feature degrades
/// the look of affected textures instead of failing their draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub masked_textures: bool,
    pub translucent_textures: bool,
    pub compressed_textures: bool,
    pub palette16: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            masked_textures: false,
            translucent_textures: false,
            compressed_textures: false,
            palette16: false,
        }
    }
}

/// Result of routing a logical texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub format: PixelFormatId,
    /// Flags after capability degradation (e.g. MASKED dropped on a
    /// device with no alpha formats).
    pub flags: DynamicFlags,
    /// Whether the texture keeps a graded alpha channel.
    pub translucent: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PixelFormatRegistry {
    formats: Vec<PixelFormat>,
    capabilities: Capabilities,
}

impl PixelFormatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry for a device and log its capability gaps once.
    pub fn from_caps(caps: &DeviceCaps) -> Self {
        let mut registry = Self::new();
        for format in &caps.formats {
            registry.register(*format);
        }
        registry.capabilities.palette16 = caps.palette16;

        let c = registry.capabilities;
        info!(
            "texture formats: {}",
            registry.formats.iter().map(|f| f.tag).collect::<Vec<_>>().join(" ")
        );
        if !c.masked_textures {
            warn!("no alpha-capable direct-color format; masked textures may render opaque");
        }
        if !c.translucent_textures {
            warn!("no translucent texture format; alpha channels will be dropped");
        }
        if !c.compressed_textures {
            info!("no compressed texture format; compressed art will be expanded on the CPU");
        }
        registry
    }

    /// Add a format, replacing an earlier registration of the same kind.
    pub fn register(&mut self, caps: FormatCaps) -> PixelFormatId {
        if let Some(existing) = self.formats.iter_mut().find(|f| f.kind == caps.kind) {
            existing.max_width = caps.max_width;
            existing.max_height = caps.max_height;
            return existing.id;
        }

        let id = PixelFormatId(self.formats.len() as u8);
        self.formats.push(PixelFormat {
            id,
            kind: caps.kind,
            max_width: caps.max_width,
            max_height: caps.max_height,
            tag: caps.kind.tag(),
        });

        let kind = caps.kind;
        // Paletted8 masks only paletted art and Bc1 only compressed art.
        self.capabilities.masked_textures |= matches!(
            kind,
            PixelFormatKind::Alpha1555 | PixelFormatKind::Alpha4444 | PixelFormatKind::Rgba8888
        );
        self.capabilities.translucent_textures |= kind.supports_translucency();
        self.capabilities.compressed_textures |= kind.is_compressed();
        id
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn get(&self, id: PixelFormatId) -> &PixelFormat {
        &self.formats[id.index()]
    }

    pub fn find(&self, kind: PixelFormatKind) -> Option<PixelFormatId> {
        self.formats.iter().find(|f| f.kind == kind).map(|f| f.id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PixelFormat> {
        self.formats.iter()
    }

    pub fn len(&self) -> usize {
        self.formats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }

    /// Route a logical texture to exactly one registered format.
    ///
    /// Each need walks its own list. A masked or translucent request
    /// whose list has no registered format falls through to the plain
    /// route, and flags the chosen format can't carry are dropped.
    pub fn resolve(
        &self,
        traits: TextureTraits,
        flags: DynamicFlags,
    ) -> Result<Resolved, CacheError> {
        use PixelFormatKind::*;

        let palette_ok = !flags.contains(DynamicFlags::PALETTE_16) || self.capabilities.palette16;
        let first = |order: &[PixelFormatKind], need: fn(PixelFormatKind) -> bool| {
            order
                .iter()
                .copied()
                .filter(|&kind| need(kind) && (kind != Paletted8 || palette_ok))
                .find_map(|kind| self.find(kind))
        };
        let any: fn(PixelFormatKind) -> bool = |_| true;
        let paletted = traits.contains(TextureTraits::PALETTED);

        let routed = if traits.contains(TextureTraits::COMPRESSED) {
            first(&[Bc1, Rgba8888, Opaque565], any)
        } else {
            let translucent = if traits.contains(TextureTraits::HAS_ALPHA) {
                first(&[Alpha4444, Rgba8888], any)
            } else {
                None
            };
            let masked = || {
                if !flags.contains(DynamicFlags::MASKED) {
                    return None;
                }
                let order: &[PixelFormatKind] = if paletted {
                    &[Paletted8, Alpha1555, Alpha4444, Rgba8888]
                } else {
                    &[Alpha1555, Alpha4444, Rgba8888]
                };
                first(order, PixelFormatKind::supports_mask)
            };
            let plain = || {
                let order: &[PixelFormatKind] = if paletted {
                    &[Paletted8, Opaque565, Alpha1555, Rgba8888]
                } else {
                    &[Opaque565, Alpha1555, Rgba8888]
                };
                first(order, any)
            };
            translucent.or_else(masked).or_else(plain)
        };
        let chosen = routed.or_else(|| self.find(Rgba8888));

        let Some(format) = chosen else {
            return Err(CacheError::UnsupportedFormat { traits });
        };
        let kind = self.get(format).kind;
        let mut flags = flags;
        if !kind.supports_mask() {
            flags.remove(DynamicFlags::MASKED);
        }
        Ok(Resolved {
            format,
            flags,
            translucent: traits.contains(TextureTraits::HAS_ALPHA) && kind.supports_translucency(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(kinds: &[PixelFormatKind]) -> PixelFormatRegistry {
        let mut r = PixelFormatRegistry::new();
        for &k in kinds {
            r.register(FormatCaps::new(k, 256));
        }
        r
    }

    fn kind_of(r: &PixelFormatRegistry, traits: TextureTraits, flags: DynamicFlags) -> PixelFormatKind {
        let resolved = r.resolve(traits, flags).unwrap();
        r.get(resolved.format).kind
    }

    // ============================================================
    // Layout math
    // ============================================================

    #[test]
    fn test_level_bytes() {
        assert_eq!(PixelFormatKind::Paletted8.level_bytes(8, 8), 64);
        assert_eq!(PixelFormatKind::Opaque565.level_bytes(8, 8), 128);
        assert_eq!(PixelFormatKind::Rgba8888.level_bytes(8, 8), 256);
        assert_eq!(PixelFormatKind::Bc1.level_bytes(8, 8), 32);
        assert_eq!(PixelFormatKind::Bc1.level_bytes(1, 1), 8);
    }

    #[test]
    fn test_row_pitch_and_count() {
        assert_eq!(PixelFormatKind::Alpha4444.row_pitch(16), 32);
        assert_eq!(PixelFormatKind::Bc1.row_pitch(16), 32);
        assert_eq!(PixelFormatKind::Bc1.row_count(16), 4);
        assert_eq!(PixelFormatKind::Bc1.row_count(2), 1);
        assert_eq!(PixelFormatKind::Rgba8888.row_count(2), 2);
    }

    // ============================================================
    // Registration
    // ============================================================

    #[test]
    fn test_register_replaces_same_kind() {
        let mut r = PixelFormatRegistry::new();
        let a = r.register(FormatCaps::new(PixelFormatKind::Opaque565, 256));
        let b = r.register(FormatCaps::new(PixelFormatKind::Opaque565, 1024));
        assert_eq!(a, b);
        assert_eq!(r.len(), 1);
        assert_eq!(r.get(a).max_width, 1024);
    }

    #[test]
    fn test_capabilities_from_formats() {
        let r = registry(&[PixelFormatKind::Opaque565]);
        let c = r.capabilities();
        assert!(!c.masked_textures);
        assert!(!c.translucent_textures);
        assert!(!c.compressed_textures);

        let r = registry(&[PixelFormatKind::Opaque565, PixelFormatKind::Alpha1555]);
        assert!(r.capabilities().masked_textures);
        assert!(!r.capabilities().translucent_textures);
    }

    // ============================================================
    // Resolution
    // ============================================================

    #[test]
    fn test_resolve_prefers_cheapest_conversion() {
        let all = registry(&PixelFormatKind::ALL);
        use PixelFormatKind::*;
        assert_eq!(kind_of(&all, TextureTraits::PALETTED, DynamicFlags::empty()), Paletted8);
        assert_eq!(kind_of(&all, TextureTraits::PALETTED, DynamicFlags::MASKED), Paletted8);
        assert_eq!(kind_of(&all, TextureTraits::empty(), DynamicFlags::empty()), Opaque565);
        assert_eq!(kind_of(&all, TextureTraits::empty(), DynamicFlags::MASKED), Alpha1555);
        assert_eq!(kind_of(&all, TextureTraits::HAS_ALPHA, DynamicFlags::empty()), Alpha4444);
        assert_eq!(kind_of(&all, TextureTraits::COMPRESSED, DynamicFlags::empty()), Bc1);
    }

    #[test]
    fn test_resolve_palette16_needs_device_support() {
        use PixelFormatKind::*;
        let mut r = registry(&[Paletted8, Opaque565]);
        assert_eq!(kind_of(&r, TextureTraits::PALETTED, DynamicFlags::PALETTE_16), Opaque565);
        r.capabilities.palette16 = true;
        assert_eq!(kind_of(&r, TextureTraits::PALETTED, DynamicFlags::PALETTE_16), Paletted8);
    }

    #[test]
    fn test_resolve_falls_back_to_rgba8888() {
        use PixelFormatKind::*;
        let r = registry(&[Rgba8888]);
        assert_eq!(kind_of(&r, TextureTraits::PALETTED, DynamicFlags::MASKED), Rgba8888);
        assert_eq!(kind_of(&r, TextureTraits::COMPRESSED, DynamicFlags::empty()), Rgba8888);
        assert_eq!(kind_of(&r, TextureTraits::HAS_ALPHA, DynamicFlags::empty()), Rgba8888);
    }

    #[test]
    fn test_resolve_degrades_masked_without_alpha_formats() {
        let r = registry(&[PixelFormatKind::Opaque565]);
        let resolved = r.resolve(TextureTraits::PALETTED, DynamicFlags::MASKED).unwrap();
        assert_eq!(r.get(resolved.format).kind, PixelFormatKind::Opaque565);
        assert!(!resolved.flags.contains(DynamicFlags::MASKED));

        let resolved = r.resolve(TextureTraits::HAS_ALPHA, DynamicFlags::empty()).unwrap();
        assert!(!resolved.translucent);
    }

    #[test]
    fn test_resolve_opaque_and_block_device_degrades_masked() {
        use PixelFormatKind::*;
        let r = registry(&[Opaque565, Bc1]);
        assert!(!r.capabilities().masked_textures);

        for traits in [TextureTraits::PALETTED, TextureTraits::empty()] {
            let resolved = r.resolve(traits, DynamicFlags::MASKED).unwrap();
            assert_eq!(r.get(resolved.format).kind, Opaque565);
            assert!(!resolved.flags.contains(DynamicFlags::MASKED));
        }

        let resolved = r.resolve(TextureTraits::COMPRESSED, DynamicFlags::MASKED).unwrap();
        assert_eq!(r.get(resolved.format).kind, Bc1);
        assert!(resolved.flags.contains(DynamicFlags::MASKED));
    }

    #[test]
    fn test_resolve_paletted_device_masks_paletted_art_only() {
        use PixelFormatKind::*;
        let r = registry(&[Paletted8, Opaque565]);
        assert!(!r.capabilities().masked_textures);

        let resolved = r.resolve(TextureTraits::PALETTED, DynamicFlags::MASKED).unwrap();
        assert_eq!(r.get(resolved.format).kind, Paletted8);
        assert!(resolved.flags.contains(DynamicFlags::MASKED));

        let resolved = r.resolve(TextureTraits::empty(), DynamicFlags::MASKED).unwrap();
        assert_eq!(r.get(resolved.format).kind, Opaque565);
        assert!(!resolved.flags.contains(DynamicFlags::MASKED));
    }

    #[test]
    fn test_resolve_compressed_on_opaque_drops_mask() {
        let r = registry(&[PixelFormatKind::Opaque565]);
        let resolved = r.resolve(TextureTraits::COMPRESSED, DynamicFlags::MASKED).unwrap();
        assert_eq!(r.get(resolved.format).kind, PixelFormatKind::Opaque565);
        assert!(!resolved.flags.contains(DynamicFlags::MASKED));
    }

    #[test]
    fn test_resolve_translucent_without_alpha_formats_uses_mask_route() {
        use PixelFormatKind::*;
        let r = registry(&[Opaque565, Alpha1555]);
        let resolved = r.resolve(TextureTraits::HAS_ALPHA, DynamicFlags::MASKED).unwrap();
        assert_eq!(r.get(resolved.format).kind, Alpha1555);
        assert!(resolved.flags.contains(DynamicFlags::MASKED));
        assert!(!resolved.translucent);
    }

    #[test]
    fn test_resolve_unsupported() {
        let r = registry(&[PixelFormatKind::Bc1]);
        let err = r.resolve(TextureTraits::empty(), DynamicFlags::empty()).unwrap_err();
        assert!(matches!(err, CacheError::UnsupportedFormat { .. }));
    }
}
