use std::collections::HashSet;

use proptest::prelude::*;
use proptest::test_runner::TestCaseResult;

use crate::cache::TextureCache;
use crate::config::CacheConfig;
use crate::device::{DeviceCaps, SoftwareDevice};
use crate::texture::{DynamicFlags, LogicalTexture, Palette, Rgba, SourceMip, TextureKey, TextureTraits};

#[derive(Debug, Clone)]
enum Op {
    Bind { id: u64, masked: bool },
    Forget { id: u64 },
    NextFrame,
}

const MAX_KEYS: u64 = 12;
const MAX_OPS: usize = 96;

fn palette() -> Palette {
    let mut p = [Rgba::TRANSPARENT; 256];
    for (i, e) in p.iter_mut().enumerate() {
        *e = Rgba::opaque(i as u8, 255 - i as u8, 7);
    }
    p
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        8 => (0..MAX_KEYS, any::<bool>()).prop_map(|(id, masked)| Op::Bind { id, masked }),
        1 => (0..MAX_KEYS).prop_map(|id| Op::Forget { id }),
        3 => Just(Op::NextFrame),
    ]
}

fn key(id: u64, masked: bool) -> TextureKey {
    let flags = if masked { DynamicFlags::MASKED } else { DynamicFlags::empty() };
    TextureKey::new(id, flags)
}

fn run_ops(capacity: u32, ops: &[Op]) -> TestCaseResult {
    let mut cache = TextureCache::new(
        SoftwareDevice::new(DeviceCaps::d3d_like(1 << 24)),
        CacheConfig::with_slots(capacity),
    )
    .unwrap();
    let palette = palette();
    let mips = vec![SourceMip::indexed(4, 4, (0..16).collect())];

    // Keys made resident during the current frame; none may lose its slot
    // before the frame ends.
    let mut held: HashSet<TextureKey> = HashSet::new();
    cache.on_frame_begin();

    for op in ops {
        match op {
            Op::Bind { id, masked } => {
                let k = key(*id, *masked);
                let tex = LogicalTexture::new(k, TextureTraits::PALETTED, &mips).with_palette(&palette);
                let bound = cache.bind_texture(&tex).unwrap();
                if !bound.fallback {
                    held.insert(k);
                }
            }
            Op::Forget { id } => {
                for masked in [false, true] {
                    let k = key(*id, masked);
                    cache.forget(&k);
                    held.remove(&k);
                }
            }
            Op::NextFrame => {
                cache.on_frame_end();
                cache.on_frame_begin();
                held.clear();
            }
        }

        prop_assert!(cache.check_invariants().is_ok(), "{:?}", cache.check_invariants());
        for k in &held {
            prop_assert!(cache.lookup(k).is_some(), "{:?} evicted in the frame it was used", k);
        }
        for s in cache.stats() {
            prop_assert!(s.slots <= s.capacity);
        }
    }
    cache.on_frame_end();
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_random_binds_keep_invariants(
        capacity in 1u32..6,
        ops in prop::collection::vec(op_strategy(), 1..MAX_OPS),
    ) {
        run_ops(capacity, &ops)?;
    }

    #[test]
    fn prop_capacity_ceiling_in_one_frame(capacity in 1u32..8, extra in 0u64..10) {
        let mut cache = TextureCache::new(
            SoftwareDevice::new(DeviceCaps::opaque_only(1 << 24)),
            CacheConfig::with_slots(capacity),
        )
        .unwrap();
        let palette = palette();
        let mips = vec![SourceMip::indexed(8, 8, vec![3; 64])];

        cache.on_frame_begin();
        let mut resident = 0u64;
        for id in 0..capacity as u64 + extra {
            let tex = LogicalTexture::new(TextureKey::plain(id), TextureTraits::PALETTED, &mips)
                .with_palette(&palette);
            if !cache.bind_texture(&tex).unwrap().fallback {
                resident += 1;
            }
        }
        cache.on_frame_end();

        let stats = &cache.stats()[0];
        prop_assert_eq!(resident, capacity as u64);
        prop_assert_eq!(stats.slots, capacity as usize);
        prop_assert_eq!(stats.frame.fallbacks, extra);
        // pool slots plus the fallback texture
        prop_assert_eq!(cache.device().live_textures(), capacity as usize + 1);
    }
}
