//! Victim selection for a full pool.
//!
//! Plain LRU over the slots not touched this frame. When even the least
//! recent candidate was used in the previous frame, the working set is
//! bigger than the pool and LRU would evict exactly the texture needed
//! next. In that case the controller cycles through the most recently
//! used candidates instead, which leaves the older ones resident.

use tracing::trace;

use crate::pool::{Slot, SlotId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Victim {
    pub slot: SlotId,
    /// Frames since the victim was last touched.
    pub age: u64,
    /// Chosen by the thrash round-robin rather than LRU.
    pub thrash: bool,
}

#[derive(Debug)]
pub struct EvictionController {
    window: usize,
    cursor: u64,
    /// (last frame, last order, slot); reserved once so choosing never allocates.
    scratch: Vec<(u64, u64, SlotId)>,
}

impl EvictionController {
    pub fn new(window: u32, capacity: usize) -> Self {
        Self {
            window: window.max(1) as usize,
            cursor: 0,
            scratch: Vec::with_capacity(capacity),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn set_window(&mut self, window: u32) {
        self.window = window.max(1) as usize;
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
        self.scratch.clear();
    }

    /// Pick a slot to evict, or `None` when every occupied slot was
    /// touched during `frame`.
    pub fn choose(&mut self, slots: &[Slot], frame: u64) -> Option<Victim> {
        let eligible = |s: &Slot| s.occupant.is_some() && s.last_frame < frame;

        let mut best: Option<&Slot> = None;
        let mut best_id = SlotId(0);
        for (i, slot) in slots.iter().enumerate() {
            if !eligible(slot) {
                continue;
            }
            let better = match best {
                None => true,
                Some(b) => {
                    let (age, best_age) = (frame - slot.last_frame, frame - b.last_frame);
                    if age != best_age {
                        age > best_age
                    } else if slot.unloaded != b.unloaded {
                        slot.unloaded
                    } else {
                        slot.last_order < b.last_order
                    }
                }
            };
            if better {
                best = Some(slot);
                best_id = SlotId(i as u32);
            }
        }

        let age = frame - best?.last_frame;
        if age > 1 {
            return Some(Victim {
                slot: best_id,
                age,
                thrash: false,
            });
        }

        self.scratch.clear();
        self.scratch.extend(
            slots
                .iter()
                .enumerate()
                .filter(|(_, s)| eligible(*s))
                .map(|(i, s)| (s.last_frame, s.last_order, SlotId(i as u32))),
        );
        self.scratch.sort_unstable_by(|a, b| (b.0, b.1).cmp(&(a.0, a.1)));
        self.scratch.truncate(self.window);

        let pick = self.scratch[(self.cursor % self.scratch.len() as u64) as usize];
        self.cursor = self.cursor.saturating_add(1);
        trace!("thrash pick {:?} of {} (cursor {})", pick.2, self.scratch.len(), self.cursor);

        Some(Victim {
            slot: pick.2,
            age: frame - pick.0,
            thrash: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::ColorScale;
    use crate::device::TextureHandle;
    use crate::texture::TextureKey;

    fn slot(id: u64, last_frame: u64, last_order: u64) -> Slot {
        Slot {
            handle: TextureHandle(id),
            occupant: Some(TextureKey::plain(id)),
            last_frame,
            last_order,
            unloaded: false,
            fill_frame: Some(last_frame),
            color_scale: ColorScale::IDENTITY,
        }
    }

    // ============================================================
    // LRU
    // ============================================================

    #[test]
    fn test_choose_least_recent() {
        let slots = vec![slot(0, 4, 40), slot(1, 2, 20), slot(2, 3, 30)];
        let mut ctl = EvictionController::new(4, 3);
        let v = ctl.choose(&slots, 5).unwrap();
        assert_eq!(v, Victim { slot: SlotId(1), age: 3, thrash: false });
    }

    #[test]
    fn test_touched_this_frame_is_never_chosen() {
        let slots = vec![slot(0, 5, 1), slot(1, 5, 2)];
        let mut ctl = EvictionController::new(4, 2);
        assert!(ctl.choose(&slots, 5).is_none());
    }

    #[test]
    fn test_tie_prefers_unloaded_then_touch_order() {
        let mut slots = vec![slot(0, 2, 21), slot(1, 2, 20), slot(2, 2, 22)];
        let mut ctl = EvictionController::new(4, 3);
        assert_eq!(ctl.choose(&slots, 6).unwrap().slot, SlotId(1));

        slots[2].unloaded = true;
        assert_eq!(ctl.choose(&slots, 6).unwrap().slot, SlotId(2));
    }

    #[test]
    fn test_free_slots_are_not_candidates() {
        let mut slots = vec![slot(0, 1, 1), slot(1, 3, 3)];
        slots[0].occupant = None;
        let mut ctl = EvictionController::new(4, 2);
        assert_eq!(ctl.choose(&slots, 5).unwrap().slot, SlotId(1));
    }

    // ============================================================
    // Thrash round-robin
    // ============================================================

    #[test]
    fn test_thrash_round_robins_most_recent() {
        // All candidates touched last frame; window of 2 covers the two
        // most recent (orders 13 and 12).
        let slots = vec![slot(0, 9, 10), slot(1, 9, 11), slot(2, 9, 12), slot(3, 9, 13)];
        let mut ctl = EvictionController::new(2, 4);
        let picks: Vec<SlotId> = (0..4).map(|_| ctl.choose(&slots, 10).unwrap().slot).collect();
        assert_eq!(picks, vec![SlotId(3), SlotId(2), SlotId(3), SlotId(2)]);
        assert!(ctl.choose(&slots, 10).unwrap().thrash);
    }

    #[test]
    fn test_thrash_window_larger_than_candidates() {
        let slots = vec![slot(0, 9, 10), slot(1, 10, 11)];
        let mut ctl = EvictionController::new(8, 2);
        let v = ctl.choose(&slots, 10).unwrap();
        assert_eq!(v.slot, SlotId(0));
        assert!(v.thrash);
        assert_eq!(v.age, 1);
    }

    #[test]
    fn test_thrash_cursor_saturates() {
        let slots = vec![slot(0, 9, 10), slot(1, 9, 11)];
        let mut ctl = EvictionController::new(2, 2);
        ctl.cursor = u64::MAX - 1;
        for _ in 0..3 {
            assert!(ctl.choose(&slots, 10).unwrap().thrash);
        }
        assert_eq!(ctl.cursor, u64::MAX);
    }

    #[test]
    fn test_set_window_clamps_to_one() {
        let mut ctl = EvictionController::new(4, 1);
        ctl.set_window(0);
        assert_eq!(ctl.window(), 1);
    }
}
