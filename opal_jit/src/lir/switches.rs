//! Switch-range construction.
//!
//! A switch range is a maximal contiguous run of keys dispatching to one
//! successor. Ranges whose successor is the explicit default are dropped
//! while scanning (the trailing default jump covers them), except that the
//! final open range is always kept so the emitted compare chain stays a
//! faithful partition of the key set.

use crate::hir::BlockId;

/// One contiguous key range and its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchRange {
    pub low_key: i32,
    pub high_key: i32,
    pub sux: BlockId,
}

impl SwitchRange {
    fn new(key: i32, sux: BlockId) -> SwitchRange {
        SwitchRange {
            low_key: key,
            high_key: key,
            sux,
        }
    }

    /// Number of keys the range covers.
    pub fn width(&self) -> u32 {
        (self.high_key as i64 - self.low_key as i64 + 1) as u32
    }
}

/// Ranges for a lookup switch. Keys must be strictly ascending (the builder
/// validated this).
pub fn lookup_ranges(keys: &[i32], suxs: &[BlockId], default: BlockId) -> Vec<SwitchRange> {
    debug_assert_eq!(keys.len(), suxs.len());
    let mut res: Vec<SwitchRange> = Vec::with_capacity(keys.len());
    if keys.is_empty() {
        return res;
    }
    let mut range = SwitchRange::new(keys[0], suxs[0]);
    for i in 1..keys.len() {
        let key = keys[i];
        let sux = suxs[i];
        if range.high_key.checked_add(1) == Some(key) && sux == range.sux {
            range.high_key = key;
        } else {
            if range.sux != default {
                res.push(range);
            }
            range = SwitchRange::new(key, sux);
        }
    }
    if res.last() != Some(&range) {
        res.push(range);
    }
    res
}

/// Ranges for a table switch with dense keys starting at `lo_key`.
pub fn table_ranges(lo_key: i32, suxs: &[BlockId], default: BlockId) -> Vec<SwitchRange> {
    let mut res: Vec<SwitchRange> = Vec::with_capacity(suxs.len());
    if suxs.is_empty() {
        return res;
    }
    let mut range = SwitchRange::new(lo_key, suxs[0]);
    let mut key = lo_key;
    for &sux in &suxs[1..] {
        key = key.wrapping_add(1);
        if sux == range.sux {
            range.high_key = key;
        } else {
            if range.sux != default {
                res.push(range);
            }
            range = SwitchRange::new(key, sux);
        }
    }
    if res.last() != Some(&range) {
        res.push(range);
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: BlockId = BlockId(1);
    const B: BlockId = BlockId(2);
    const C: BlockId = BlockId(3);

    #[test]
    fn test_contiguous_keys_same_successor_merge() {
        // case 0, 1 -> A; case 5 -> B
        let ranges = lookup_ranges(&[0, 1, 5], &[A, A, B], C);
        assert_eq!(
            ranges,
            vec![
                SwitchRange { low_key: 0, high_key: 1, sux: A },
                SwitchRange { low_key: 5, high_key: 5, sux: B },
            ]
        );
    }

    #[test]
    fn test_gap_breaks_range_despite_same_successor() {
        let ranges = lookup_ranges(&[0, 2], &[A, A], C);
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].width(), 1);
        assert_eq!(ranges[1].width(), 1);
    }

    #[test]
    fn test_explicit_default_cases_dropped_mid_scan() {
        // case 0 -> C (the default), case 1 -> A
        let ranges = lookup_ranges(&[0, 1], &[C, A], C);
        assert_eq!(
            ranges,
            vec![SwitchRange { low_key: 1, high_key: 1, sux: A }]
        );
    }

    #[test]
    fn test_trailing_default_range_is_kept() {
        let ranges = lookup_ranges(&[0, 1], &[A, C], C);
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[1].sux, C);
    }

    #[test]
    fn test_table_ranges_dense() {
        // keys 0..=4 -> [A, A, B, B, B]
        let ranges = table_ranges(0, &[A, A, B, B, B], C);
        assert_eq!(
            ranges,
            vec![
                SwitchRange { low_key: 0, high_key: 1, sux: A },
                SwitchRange { low_key: 2, high_key: 4, sux: B },
            ]
        );
    }

    #[test]
    fn test_partition_covers_all_keys() {
        // Invariant: ranges plus default partition the key set.
        let keys = [-3, -2, 0, 1, 2, 9];
        let suxs = [A, A, B, B, C, A];
        let ranges = lookup_ranges(&keys, &suxs, C);
        for (&key, &sux) in keys.iter().zip(&suxs) {
            let covered = ranges
                .iter()
                .find(|r| r.low_key <= key && key <= r.high_key);
            match covered {
                Some(r) => assert_eq!(r.sux, sux, "key {key}"),
                None => assert_eq!(sux, C, "key {key} must dispatch to default"),
            }
        }
        for r in &ranges {
            assert!(r.low_key <= r.high_key);
        }
    }

    #[test]
    fn test_empty_switch() {
        assert!(lookup_ranges(&[], &[], C).is_empty());
        assert!(table_ranges(0, &[], C).is_empty());
    }
}
