// texres-replay: drive the texture cache with a synthetic frame workload
// against the software device and report what stayed resident.
//
// Each frame draws a random subset of a fixed art set, so the working set
// can be pushed past pool capacity to watch eviction and thrash handling.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context};
use clap::{Parser, ValueEnum};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use texres_common::cvar::CvarContext;
use texres_common::logging;
use texres_common::wildcards::wildcardfit;
use texres_renderer::config::{CVAR_POOL_SLOTS, LATCHED_PATTERN};
use texres_renderer::convert::{decode_level, LevelLayout};
use texres_renderer::texture::{bc1_level_bytes, MipData};
use texres_renderer::{
    CacheConfig, DeviceCaps, DynamicFlags, LogicalTexture, Palette, Rgba, SoftwareDevice, SourceMip,
    TextureCache, TextureKey, TextureTraits,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CapsPreset {
    /// Every format, large textures, mappable memory.
    Full,
    /// No paletted textures.
    D3d,
    /// Paletted plus 16-bit formats, 256 texel limit, 16-bit palettes.
    Glide,
    /// A single opaque 16-bit format.
    Opaque,
}

impl CapsPreset {
    fn caps(self, video_memory_bytes: u64) -> DeviceCaps {
        match self {
            CapsPreset::Full => DeviceCaps::full(video_memory_bytes),
            CapsPreset::D3d => DeviceCaps::d3d_like(video_memory_bytes),
            CapsPreset::Glide => DeviceCaps::glide_like(video_memory_bytes),
            CapsPreset::Opaque => DeviceCaps::opaque_only(video_memory_bytes),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "texres-replay", about = "Replay a synthetic texture workload through the residency cache")]
struct Args {
    /// Config file of `set <name> <value>` lines, applied before startup
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Number of frames to run
    #[arg(long, default_value_t = 300)]
    frames: u64,

    /// Distinct textures in the art set
    #[arg(long, default_value_t = 96)]
    keys: u64,

    /// Textures drawn per frame
    #[arg(long, default_value_t = 24)]
    visible: usize,

    /// Force every pool to this many slots (sets tex_pool_slots)
    #[arg(long)]
    slots: Option<u32>,

    /// Device capability preset
    #[arg(long, value_enum, default_value_t = CapsPreset::Full)]
    caps: CapsPreset,

    /// Video memory in KiB
    #[arg(long, default_value_t = 16 * 1024)]
    video_kb: u64,

    /// Change tex_pool_slots to this value partway through the run
    #[arg(long, requires = "resize_at")]
    resize_slots: Option<u32>,

    /// Frame at which --resize-slots takes effect
    #[arg(long, requires = "resize_slots")]
    resize_at: Option<u64>,

    /// Workload seed
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Write level 0 of every resident slot here as PNG after the run
    #[arg(long, value_name = "DIR")]
    dump: Option<PathBuf>,

    /// Print per-frame statistics
    #[arg(long, action = clap::ArgAction::SetTrue)]
    verbose: bool,

    /// Developer logging
    #[arg(long, action = clap::ArgAction::SetTrue)]
    developer: bool,
}

// ============================================================
// Workload
// ============================================================

/// One piece of source art.
struct Art {
    id: u64,
    traits: TextureTraits,
    flags: DynamicFlags,
    mips: Vec<SourceMip>,
    palette: Option<Box<Palette>>,
    /// Redrawn every frame (e.g. a scrolling or animated surface).
    realtime: bool,
}

impl Art {
    fn logical(&self, frame: u64) -> LogicalTexture<'_> {
        let tex = LogicalTexture::new(TextureKey::new(self.id, self.flags), self.traits, &self.mips)
            .changed(self.realtime && frame > 1);
        match &self.palette {
            Some(p) => tex.with_palette(p),
            None => tex,
        }
    }

    /// Realtime surfaces shift their content one texel per frame.
    fn animate(&mut self) {
        if !self.realtime {
            return;
        }
        for mip in &mut self.mips {
            if let MipData::Indexed(indices) = &mut mip.data {
                indices.rotate_left(1);
            }
        }
    }
}

fn random_palette(rng: &mut StdRng) -> Box<Palette> {
    let mut palette = Box::new([Rgba::TRANSPARENT; 256]);
    let base = Rgba::opaque(rng.gen(), rng.gen(), rng.gen());
    for (i, entry) in palette.iter_mut().enumerate() {
        let shade = |c: u8| ((c as u32 * i as u32) / 255) as u8;
        *entry = Rgba::opaque(shade(base.r), shade(base.g), shade(base.b));
    }
    palette
}

fn mip_chain(width: u32, height: u32, mut level: impl FnMut(u32, u32) -> SourceMip) -> Vec<SourceMip> {
    let mut mips = Vec::new();
    let (mut w, mut h) = (width, height);
    loop {
        mips.push(level(w, h));
        if w == 1 && h == 1 {
            break;
        }
        w = (w / 2).max(1);
        h = (h / 2).max(1);
    }
    mips
}

fn checker(w: u32, h: u32, cell: u32) -> impl Iterator<Item = bool> {
    (0..h).flat_map(move |y| (0..w).map(move |x| ((x / cell) + (y / cell)) % 2 == 0))
}

fn build_art(rng: &mut StdRng, id: u64) -> Art {
    let log2w = rng.gen_range(3..=7);
    let log2h = (log2w as i32 + rng.gen_range(-1..=1)).clamp(3, 7) as u32;
    let (width, height) = (1u32 << log2w, 1u32 << log2h);

    match rng.gen_range(0..100) {
        0..=59 => {
            let palette = random_palette(rng);
            let masked = rng.gen_bool(0.2);
            let mips = mip_chain(width, height, |w, h| {
                let indices = checker(w, h, (w / 4).max(1))
                    .map(|on| if on { 255 } else if masked { 0 } else { 96 })
                    .collect();
                SourceMip::indexed(w, h, indices)
            });
            Art {
                id,
                traits: TextureTraits::PALETTED,
                flags: if masked { DynamicFlags::MASKED } else { DynamicFlags::empty() },
                mips,
                palette: Some(palette),
                realtime: id % 17 == 0,
            }
        }
        60..=84 => {
            let translucent = rng.gen_bool(0.5);
            let tint = Rgba::new(rng.gen(), rng.gen(), rng.gen(), if translucent { 160 } else { 255 });
            let mips = mip_chain(width, height, |w, h| {
                let texels = checker(w, h, (w / 8).max(1))
                    .map(|on| if on { tint } else { Rgba::grey(32) })
                    .collect();
                SourceMip::rgba(w, h, texels)
            });
            Art {
                id,
                traits: if translucent { TextureTraits::HAS_ALPHA } else { TextureTraits::empty() },
                flags: DynamicFlags::empty(),
                mips,
                palette: None,
                realtime: false,
            }
        }
        _ => {
            let mips = mip_chain(width, height, |w, h| {
                let mut blocks = vec![0u8; bc1_level_bytes(w, h)];
                rng.fill(&mut blocks[..]);
                SourceMip::bc1(w, h, blocks)
            });
            Art {
                id,
                traits: TextureTraits::COMPRESSED,
                flags: DynamicFlags::empty(),
                mips,
                palette: None,
                realtime: false,
            }
        }
    }
}

// ============================================================
// Setup
// ============================================================

fn setup_cvars(args: &Args) -> anyhow::Result<CvarContext> {
    let mut cvars = CvarContext::new();
    CacheConfig::register_cvars(&mut cvars);

    if let Some(path) = &args.config {
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let count = cvars.exec_config(&text);
        info!("execing {} ({} variables)", path.display(), count);
    }
    if let Some(slots) = args.slots {
        cvars.set(CVAR_POOL_SLOTS, &slots.to_string());
    }
    Ok(cvars)
}

fn dump_slots(cache: &TextureCache<SoftwareDevice>, dir: &Path) -> anyhow::Result<usize> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let device = cache.device();
    let mut written = 0;
    for tex in cache.resident_textures().iter().filter(|t| !t.unloaded) {
        let Some(bytes) = device.read_back(tex.handle, 0) else {
            warn!("{:?}: no level 0 on the device", tex.key.id);
            continue;
        };
        let layout = LevelLayout::new(tex.kind, tex.width, tex.height);
        let texels = decode_level(layout, bytes, device.palette(tex.handle));
        let rgba = bytemuck::cast_slice::<Rgba, u8>(&texels).to_vec();
        let image = image::RgbaImage::from_raw(tex.width, tex.height, rgba)
            .ok_or_else(|| anyhow!("{:?}: invalid image data", tex.key.id))?;

        let path = dir.join(format!(
            "tex{:04}_{:x}_{}_{}x{}.png",
            tex.key.id.0,
            tex.key.flags.bits(),
            tex.format,
            tex.width,
            tex.height
        ));
        image.save(&path).with_context(|| format!("writing {}", path.display()))?;
        written += 1;
    }
    Ok(written)
}

// ============================================================
// Main loop
// ============================================================

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(args.developer);

    let mut cvars = setup_cvars(&args)?;
    let config = CacheConfig::from_cvars(&cvars);
    cvars.set_latch_active(true);

    let device = SoftwareDevice::new(args.caps.caps(args.video_kb * 1024));
    let mut cache = TextureCache::new(device, config).context("starting texture cache")?;

    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut art: Vec<Art> = (0..args.keys.max(1)).map(|id| build_art(&mut rng, id)).collect();
    info!(
        "{} textures, {} drawn per frame, {} frames",
        art.len(),
        args.visible,
        args.frames
    );

    let start = Instant::now();
    let (mut binds, mut fallbacks) = (0u64, 0u64);
    for _ in 0..args.frames {
        cache.on_frame_begin();
        let frame = cache.frame();

        if Some(frame) == args.resize_at {
            if let Some(slots) = args.resize_slots {
                cvars.set(CVAR_POOL_SLOTS, &slots.to_string());
            }
        }

        for a in art.iter_mut() {
            a.animate();
        }
        for _ in 0..args.visible {
            let a = &art[rng.gen_range(0..art.len())];
            let bound = cache.bind_texture(&a.logical(frame))?;
            binds += 1;
            fallbacks += bound.fallback as u64;
        }

        if args.verbose {
            for s in cache.stats().iter().filter(|s| s.frame.binds > 0) {
                info!("frame {:>5} {}", frame, s);
            }
        }
        cache.on_frame_end();

        // Latched pool settings apply between frames.
        let latched = cvars.get_latched_vars();
        if latched.iter().any(|name| wildcardfit(LATCHED_PATTERN, name)) {
            info!("{} changed; rebuilding pools", latched.join(", "));
        }
        if !cvars.check_modified("tex_*").is_empty() {
            cache.apply_config(CacheConfig::from_cvars(&cvars))?;
        }
    }
    let elapsed = start.elapsed();

    println!(
        "{} frames in {:.1}ms, {} binds, {} fallbacks",
        args.frames,
        elapsed.as_secs_f64() * 1000.0,
        binds,
        fallbacks
    );
    for s in cache.stats() {
        println!("{}", s);
    }
    println!("video memory full: {}", cache.video_memory_full());
    for t in cache.resident_textures() {
        println!(
            "{:>5} {:<9} {:>4}x{:<4} x{:<2} {:?}{}",
            t.key.id.0,
            t.format,
            t.width,
            t.height,
            t.levels,
            t.key.flags,
            if t.unloaded { " (unloaded)" } else { "" }
        );
    }
    if let Err(e) = cache.check_invariants() {
        warn!("cache invariants violated: {}", e);
    }

    if let Some(dir) = &args.dump {
        let written = dump_slots(&cache, dir)?;
        println!("wrote {} slots to {}", written, dir.display());
    }
    Ok(())
}
