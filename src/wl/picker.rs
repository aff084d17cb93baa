//! Strategies for picking a free PEB
//!
//! [PlainPicker] implements the ordinary policy. [AnchorPicker] additionally holds back low
//! numbered PEBs until a checkpoint has been written, so that a checkpoint anchor can always be
//! placed near the start of the device.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};

use super::registry::EcTree;
use crate::Pnum;

pub trait PebPicker: Debug + Send + Sync {
    /// Should this (otherwise best) candidate be held back in favor of the next one?
    fn hold_back(&self, pnum: Pnum) -> bool;

    /// Called once a checkpoint has been persisted
    fn checkpoint_written(&self) {}

    /// The free entry with the highest EC still below `min + diff`
    fn find_wl_entry(&self, free: &EcTree, diff: u64) -> Option<(u64, Pnum)> {
        let &(min_ec, _) = free.first()?;
        let mut below = free.range(..(min_ec.saturating_add(diff), 0)).rev();
        let best = *below.next()?;

        match below.next() {
            Some(&second) if self.hold_back(best.1) => Some(second),
            _ => Some(best),
        }
    }

    /// The free entry to hand out on allocation
    ///
    /// When the free ECs are close together, the median is taken; otherwise the pick is bounded
    /// to half of `free_max_diff` above the minimum, so the most worn blocks rest.
    fn find_mean(&self, free: &EcTree, free_max_diff: u64) -> Option<(u64, Pnum)> {
        let &(first_ec, _) = free.first()?;
        let &(last_ec, _) = free.last()?;

        if last_ec - first_ec < free_max_diff {
            let mut from_median = free.iter().skip(free.len() / 2);
            let median = *from_median.next()?;
            match from_median.next() {
                Some(&next) if self.hold_back(median.1) => Some(next),
                _ => Some(median),
            }
        } else {
            self.find_wl_entry(free, free_max_diff / 2)
        }
    }
}

/// Pick purely by erase count
#[derive(Debug, Default)]
pub struct PlainPicker;

impl PebPicker for PlainPicker {
    fn hold_back(&self, _pnum: Pnum) -> bool {
        false
    }
}

/// Keep PEBs below `anchor_max_start` in reserve until the first checkpoint is written
#[derive(Debug)]
pub struct AnchorPicker {
    anchor_max_start: Pnum,
    written: AtomicBool,
}

impl AnchorPicker {
    pub fn new(anchor_max_start: Pnum) -> Self {
        Self {
            anchor_max_start,
            written: AtomicBool::new(false),
        }
    }
}

impl PebPicker for AnchorPicker {
    fn hold_back(&self, pnum: Pnum) -> bool {
        !self.written.load(Ordering::Acquire) && pnum < self.anchor_max_start
    }

    fn checkpoint_written(&self) {
        self.written.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn tree(entries: &[(u64, Pnum)]) -> EcTree {
        entries.iter().copied().collect()
    }

    #[test]
    fn test_find_wl_entry() {
        let free = tree(&[(10, 1), (12, 2), (20, 3), (30, 4)]);
        assert_eq!(PlainPicker.find_wl_entry(&free, 5), Some((12, 2)));
        assert_eq!(PlainPicker.find_wl_entry(&free, 11), Some((20, 3)));
        assert_eq!(PlainPicker.find_wl_entry(&free, 100), Some((30, 4)));
        assert_eq!(PlainPicker.find_wl_entry(&free, 1), Some((10, 1)));
        assert_eq!(PlainPicker.find_wl_entry(&EcTree::new(), 1), None);
    }

    #[test]
    fn test_find_mean() {
        // Narrow spread: the median
        let free = tree(&[(10, 1), (11, 2), (12, 3), (13, 4), (14, 5)]);
        assert_eq!(PlainPicker.find_mean(&free, 8), Some((12, 3)));

        // Wide spread: bounded to min + diff / 2
        let free = tree(&[(10, 1), (11, 2), (13, 3), (50, 4), (90, 5)]);
        assert_eq!(PlainPicker.find_mean(&free, 8), Some((13, 3)));
    }

    #[test]
    fn test_anchor_hold_back() {
        let picker = AnchorPicker::new(4);
        let free = tree(&[(10, 7), (11, 2), (12, 9)]);

        // PEB 2 is the best pick, but is an anchor candidate
        assert_eq!(picker.find_wl_entry(&free, 2), Some((10, 7)));
        assert_eq!(picker.find_mean(&free, 8), Some((12, 9)));

        // A lone candidate is never held back
        assert_eq!(picker.find_wl_entry(&tree(&[(3, 1)]), 10), Some((3, 1)));

        picker.checkpoint_written();
        assert_eq!(picker.find_wl_entry(&free, 2), Some((11, 2)));
        assert_eq!(picker.find_mean(&free, 8), Some((11, 2)));
    }
}
