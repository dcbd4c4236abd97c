//! Rolling bloom filter for recently rejected transaction ids.

use smartd_consensus::Hash256;

/// Two-generation bloom filter: inserts land in the current generation,
/// lookups consult both, and filling the current generation retires the
/// older one. Capacity is therefore honored over a sliding window.
pub struct RollingBloomFilter {
    bits: [Vec<u64>; 2],
    current: usize,
    inserted: usize,
    capacity: usize,
    hash_funcs: u32,
    bit_len: usize,
    tweak: u64,
}

impl RollingBloomFilter {
    /// `capacity` elements at roughly `fp_rate` false positives.
    pub fn new(capacity: usize, fp_rate: f64) -> Self {
        let capacity = capacity.max(1);
        let ln2 = std::f64::consts::LN_2;
        let bit_len = ((-(capacity as f64) * fp_rate.ln()) / (ln2 * ln2)).ceil() as usize;
        let bit_len = bit_len.max(64);
        let hash_funcs = ((bit_len as f64 / capacity as f64) * ln2).round().max(1.0) as u32;
        let words = bit_len.div_ceil(64);
        Self {
            bits: [vec![0u64; words], vec![0u64; words]],
            current: 0,
            inserted: 0,
            capacity,
            hash_funcs,
            bit_len,
            tweak: 0x9e37_79b9_7f4a_7c15,
        }
    }

    fn bit_index(&self, item: &Hash256, round: u32) -> usize {
        // FNV-style mix over the item with a per-round seed; the item is
        // already uniform (a txid), so cheap mixing suffices.
        let mut acc = self.tweak ^ (round as u64).wrapping_mul(0xff51_afd7_ed55_8ccd);
        for chunk in item.chunks(8) {
            let mut word = [0u8; 8];
            word[..chunk.len()].copy_from_slice(chunk);
            acc ^= u64::from_le_bytes(word);
            acc = acc.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
            acc ^= acc >> 33;
        }
        (acc % self.bit_len as u64) as usize
    }

    pub fn insert(&mut self, item: &Hash256) {
        if self.inserted >= self.capacity {
            // Retire the old generation and start filling a fresh one.
            let retired = 1 - self.current;
            self.bits[retired].iter_mut().for_each(|word| *word = 0);
            self.current = retired;
            self.inserted = 0;
        }
        for round in 0..self.hash_funcs {
            let bit = self.bit_index(item, round);
            self.bits[self.current][bit / 64] |= 1u64 << (bit % 64);
        }
        self.inserted += 1;
    }

    pub fn contains(&self, item: &Hash256) -> bool {
        'generation: for generation in &self.bits {
            for round in 0..self.hash_funcs {
                let bit = self.bit_index(item, round);
                if generation[bit / 64] & (1u64 << (bit % 64)) == 0 {
                    continue 'generation;
                }
            }
            return true;
        }
        false
    }

    pub fn reset(&mut self) {
        for generation in &mut self.bits {
            generation.iter_mut().for_each(|word| *word = 0);
        }
        self.inserted = 0;
    }
}
