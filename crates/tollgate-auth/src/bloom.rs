use sha2::{Digest, Sha256};

/// Bits allocated per expected element, about 1% false positives at seven hashes
const BITS_PER_ELEMENT: usize = 10;
const HASHES: u32 = 7;

/// Probabilistic set answering "definitely absent" or "possibly present"
///
/// Bit positions come from double hashing over a SHA-256 of the item.
/// The filter is built once and never mutated after it is published.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u64>,
    bit_len: u64,
    items: usize,
}

impl BloomFilter {
    /// Empty filter sized for `capacity` elements
    pub fn with_capacity(capacity: usize) -> Self {
        let bit_len = capacity.max(1).saturating_mul(BITS_PER_ELEMENT);
        let words = bit_len.div_ceil(64);
        Self {
            bits: vec![0; words],
            bit_len: (words * 64) as u64,
            items: 0,
        }
    }

    /// Filter over `items`, sized `max(min_capacity, 5 * items.len())`
    pub fn build<'a>(items: impl ExactSizeIterator<Item = &'a str>, min_capacity: usize) -> Self {
        let mut filter = Self::with_capacity(min_capacity.max(items.len().saturating_mul(5)));
        for item in items {
            filter.insert(item);
        }
        filter
    }

    pub fn insert(&mut self, item: &str) {
        for bit in self.positions(item) {
            self.bits[(bit / 64) as usize] |= 1 << (bit % 64);
        }
        self.items += 1;
    }

    pub fn might_contain(&self, item: &str) -> bool {
        self.positions(item)
            .all(|bit| self.bits[(bit / 64) as usize] & (1 << (bit % 64)) != 0)
    }

    /// Number of inserted items
    pub const fn len(&self) -> usize {
        self.items
    }

    pub const fn is_empty(&self) -> bool {
        self.items == 0
    }

    pub const fn bit_len(&self) -> u64 {
        self.bit_len
    }

    fn positions(&self, item: &str) -> impl Iterator<Item = u64> + use<> {
        let digest = Sha256::digest(item.as_bytes());
        let mut first = [0u8; 8];
        let mut second = [0u8; 8];
        first.copy_from_slice(&digest[..8]);
        second.copy_from_slice(&digest[8..16]);
        let h1 = u64::from_le_bytes(first);
        // Odd step so positions cycle through distinct positions
        let h2 = u64::from_le_bytes(second) | 1;
        let bit_len = self.bit_len;

        (0..u64::from(HASHES)).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % bit_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{i:064x}")).collect()
    }

    #[test]
    fn no_false_negatives() {
        let members = items(5_000);
        let filter = BloomFilter::build(members.iter().map(String::as_str), 100);

        assert_eq!(filter.len(), 5_000);
        assert!(members.iter().all(|m| filter.might_contain(m)));
    }

    #[test]
    fn false_positive_rate_is_low() {
        let members = items(1_000);
        let filter = BloomFilter::build(members.iter().map(String::as_str), 1_000);

        let false_positives = (0..10_000)
            .map(|i| format!("absent-{i}"))
            .filter(|key| filter.might_contain(key))
            .count();

        assert!(false_positives < 200, "false positives: {false_positives}");
    }

    #[test]
    fn sizing_honors_floor_and_scale() {
        let small = BloomFilter::build(std::iter::empty(), 10_000);
        assert!(small.bit_len() >= 100_000);

        let members = items(4_000);
        let large = BloomFilter::build(members.iter().map(String::as_str), 10);
        assert!(large.bit_len() >= 4_000 * 5 * 10);
    }

    #[test]
    fn empty_filter_contains_nothing() {
        let filter = BloomFilter::with_capacity(0);
        assert!(filter.is_empty());
        assert!(!filter.might_contain("anything"));
    }
}
