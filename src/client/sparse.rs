//! Sparse boolean array for byte-granularity download bookkeeping.
//!
//! Instead of one bit per byte, the array stores the sorted indices at which
//! the value flips. Index 0 starts out false, so `[2, 6]` means bytes 2..6 are
//! set. A torrent that is received mostly in order has only a handful of
//! runs no matter how large it is.

use std::cell::Cell;
use std::fmt;
use std::ops::Range;

#[derive(Clone)]
pub struct RangeBitset {
    len: usize,
    // Strictly increasing, every entry < len.
    flips: Vec<usize>,
    ones: Cell<Option<usize>>,
}

impl RangeBitset {
    pub fn new(len: usize) -> Self {
        RangeBitset {
            len,
            flips: Vec::new(),
            ones: Cell::new(Some(0)),
        }
    }

    #[cfg(test)]
    pub fn full(len: usize) -> Self {
        let mut bitset = RangeBitset::new(len);
        bitset.set_range(0, len, true);
        bitset
    }

    pub(crate) fn from_flips(len: usize, flips: Vec<usize>) -> Self {
        debug_assert!(flips.windows(2).all(|w| w[0] < w[1]));
        debug_assert!(flips.last().map_or(true, |&f| f < len));
        RangeBitset {
            len,
            flips,
            ones: Cell::new(None),
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.len, "index {} out of range {}", index, self.len);
        self.flips.partition_point(|&f| f <= index) % 2 == 1
    }

    pub fn get_range(&self, start: usize, end: usize) -> RangeBitset {
        assert!(start <= end && end <= self.len, "bad range {}..{}", start, end);
        let lo = self.flips.partition_point(|&f| f <= start);
        let hi = self.flips.partition_point(|&f| f < end);

        let mut flips = Vec::with_capacity(hi.saturating_sub(lo) + 1);
        if start < end && self.get(start) {
            flips.push(0);
        }
        flips.extend(self.flips[lo..hi.max(lo)].iter().map(|f| f - start));
        RangeBitset::from_flips(end - start, flips)
    }

    pub fn set_range(&mut self, start: usize, end: usize, value: bool) {
        assert!(start <= end && end <= self.len, "bad range {}..{}", start, end);
        if start == end {
            return;
        }
        self.ones.set(None);

        let lo = self.flips.partition_point(|&f| f < start);
        let hi = self.flips.partition_point(|&f| f <= end);
        let before = lo % 2 == 1;
        let after = hi % 2 == 1;

        let mut boundary = Vec::with_capacity(2);
        if before != value {
            boundary.push(start);
        }
        if end < self.len && after != value {
            boundary.push(end);
        }
        self.flips.splice(lo..hi, boundary);
    }

    pub fn set_all(&mut self, value: bool) {
        let len = self.len;
        self.set_range(0, len, value);
    }

    /// First index holding `value`.
    pub fn find_first(&self, value: bool) -> Option<usize> {
        if self.len == 0 {
            return None;
        }
        match (value, self.flips.first()) {
            (true, first) => first.copied(),
            (false, Some(0)) => self.flips.get(1).copied(),
            (false, _) => Some(0),
        }
    }

    /// End (exclusive) of the run of equal values that contains `index`.
    pub fn run_end(&self, index: usize) -> usize {
        let next = self.flips.partition_point(|&f| f <= index);
        self.flips.get(next).copied().unwrap_or(self.len)
    }

    /// Iterates the `[start, end)` ranges whose value is true.
    pub fn ones(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        self.flips
            .chunks(2)
            .map(move |pair| pair[0]..pair.get(1).copied().unwrap_or(self.len))
    }

    pub fn count(&self, value: bool) -> usize {
        let ones = match self.ones.get() {
            Some(ones) => ones,
            None => {
                let ones = self.ones().map(|run| run.len()).sum();
                self.ones.set(Some(ones));
                ones
            }
        };
        if value {
            ones
        } else {
            self.len - ones
        }
    }

    pub fn all(&self) -> bool {
        self.len == 0 || self.flips == [0]
    }

    #[cfg(test)]
    pub fn none(&self) -> bool {
        self.flips.is_empty()
    }

    pub fn complement(&self) -> RangeBitset {
        let mut flips = self.flips.clone();
        if flips.first() == Some(&0) {
            flips.remove(0);
        } else if self.len > 0 {
            flips.insert(0, 0);
        }
        RangeBitset::from_flips(self.len, flips)
    }

    pub fn union(&self, other: &RangeBitset) -> RangeBitset {
        self.merge(other, |a, b| a || b)
    }

    pub fn intersect(&self, other: &RangeBitset) -> RangeBitset {
        self.merge(other, |a, b| a && b)
    }

    // Walks both flip sequences together, emitting a flip whenever the
    // combined value changes.
    fn merge(&self, other: &RangeBitset, op: impl Fn(bool, bool) -> bool) -> RangeBitset {
        assert_eq!(self.len, other.len, "length mismatch");
        let mut flips = Vec::with_capacity(self.flips.len() + other.flips.len());
        let (mut i, mut j) = (0, 0);
        let (mut a, mut b, mut out) = (false, false, false);

        while i < self.flips.len() || j < other.flips.len() {
            let x = self.flips.get(i).copied().unwrap_or(usize::MAX);
            let y = other.flips.get(j).copied().unwrap_or(usize::MAX);
            let at = x.min(y);
            if x == at {
                a = !a;
                i += 1;
            }
            if y == at {
                b = !b;
                j += 1;
            }
            if op(a, b) != out {
                out = !out;
                flips.push(at);
            }
        }
        RangeBitset::from_flips(self.len, flips)
    }
}

impl PartialEq for RangeBitset {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.flips == other.flips
    }
}

impl Eq for RangeBitset {}

impl fmt::Debug for RangeBitset {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.len <= 64 {
            let bits: String = (0..self.len)
                .map(|i| if self.get(i) { '1' } else { '0' })
                .collect();
            write!(f, "RangeBitset('{}')", bits)
        } else {
            write!(f, "RangeBitset(len={}, flips={:?})", self.len, self.flips)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_str(bits: &str) -> RangeBitset {
        let mut bitset = RangeBitset::new(bits.len());
        for (i, c) in bits.chars().enumerate() {
            if c == '1' {
                bitset.set_range(i, i + 1, true);
            }
        }
        bitset
    }

    fn render(bitset: &RangeBitset) -> String {
        (0..bitset.len())
            .map(|i| if bitset.get(i) { '1' } else { '0' })
            .collect()
    }

    fn assert_normalized(bitset: &RangeBitset) {
        assert!(bitset.flips.windows(2).all(|w| w[0] < w[1]), "{:?}", bitset.flips);
        assert!(bitset.flips.iter().all(|&f| f < bitset.len));
    }

    #[test]
    fn set_range_sequence() {
        let mut s = RangeBitset::new(20);
        let steps: &[(usize, usize, bool, &str)] = &[
            (2, 6, true, "00111100000000000000"),
            (4, 10, true, "00111111110000000000"),
            (3, 11, false, "00100000000000000000"),
            (4, 14, true, "00101111111111000000"),
            (8, 11, false, "00101111000111000000"),
            (5, 7, true, "00101111000111000000"),
            (15, 18, false, "00101111000111000000"),
            (14, 16, false, "00101111000111000000"),
            (14, 16, true, "00101111000111110000"),
            (4, 20, true, "00101111111111111111"),
            (0, 10, false, "00000000001111111111"),
            (0, 20, false, "00000000000000000000"),
            (0, 20, true, "11111111111111111111"),
        ];
        for &(start, end, value, expected) in steps {
            s.set_range(start, end, value);
            assert_eq!(render(&s), expected, "after {}..{} = {}", start, end, value);
            assert_normalized(&s);
        }
        assert!(s.all());
    }

    #[test]
    fn set_range_round_trip() {
        let base = from_str("0011101100011110000011");
        for start in 0..base.len() {
            for end in start..=base.len() {
                for &value in &[true, false] {
                    let mut s = base.clone();
                    s.set_range(start, end, value);
                    assert_normalized(&s);
                    for i in 0..s.len() {
                        let expected = if (start..end).contains(&i) {
                            value
                        } else {
                            base.get(i)
                        };
                        assert_eq!(s.get(i), expected);
                    }
                }
            }
        }
    }

    #[test]
    fn get_range_slices() {
        let mut s = RangeBitset::new(20);
        s.set_range(2, 6, true);
        assert_eq!(render(&s.get_range(2, 6)), "1111");
        assert_eq!(render(&s.get_range(4, 10)), "110000");
        s.set_range(9, 14, true);
        s.set_range(17, 19, true);
        assert_eq!(render(&s), "00111100011111000110");
        assert_eq!(render(&s.get_range(2, 18)), "1111000111110001");
        assert!(!s.get(1));
        assert!(s.get(10));
    }

    #[test]
    fn get_range_reinsertion_reproduces_original() {
        let base = from_str("1100111000101111");
        for start in 0..base.len() {
            for end in start..=base.len() {
                let slice = base.get_range(start, end);
                assert_normalized(&slice);
                let mut rebuilt = base.clone();
                rebuilt.set_range(start, end, false);
                for run in slice.ones() {
                    rebuilt.set_range(start + run.start, start + run.end, true);
                }
                assert_eq!(rebuilt, base);
            }
        }
    }

    #[test]
    fn count_is_cached_and_consistent() {
        let mut s = from_str("111000000111111000000111");
        assert_eq!(s.count(true), 12);
        assert_eq!(s.count(false), 12);
        s.set_range(3, 5, true);
        assert_eq!(s.count(true), 14);
        assert_eq!(s.count(true) + s.count(false), s.len());
        assert!(!s.all() && !s.none());
        s.set_all(false);
        assert!(s.none());
        assert_eq!(s.count(false), 24);
    }

    #[test]
    fn find_first_and_run_end() {
        let s = from_str("0011100");
        assert_eq!(s.find_first(true), Some(2));
        assert_eq!(s.find_first(false), Some(0));
        assert_eq!(s.run_end(2), 5);
        assert_eq!(s.run_end(5), 7);

        let s = from_str("1110011");
        assert_eq!(s.find_first(false), Some(3));
        assert_eq!(RangeBitset::full(4).find_first(false), None);
        assert_eq!(RangeBitset::new(4).find_first(true), None);
    }

    #[test]
    fn complement() {
        let a = from_str("00001100001111110000");
        assert_eq!(render(&a.complement()), "11110011110000001111");
        assert_eq!(RangeBitset::full(20).complement(), RangeBitset::new(20));
        assert_eq!(RangeBitset::new(20).complement(), RangeBitset::full(20));
    }

    #[test]
    fn intersect_and_union() {
        let a = from_str("00001100001111110000");
        let b = from_str("00000111100111111100");
        assert_eq!(render(&a.intersect(&b)), "00000100000111110000");
        assert_eq!(render(&a.union(&b)), "00001111101111111100");

        let c = from_str("11110000");
        let d = from_str("00001111");
        assert!(c.intersect(&d).none());
        assert!(c.union(&d).all());
        assert_normalized(&c.union(&d));
    }
}
