use serde::{Deserialize, Serialize};

/// Seeded PCG-style generator driving every choice the simulator makes.
///
/// Same seed, same run, on every platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimRng {
    state: u64,
}

impl SimRng {
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self {
            state: seed ^ 0x4B59_5249_455F_5345,
        }
    }

    /// Independent stream for a sub-component, e.g. one client's network link.
    #[must_use]
    pub fn fork(&mut self, salt: u64) -> Self {
        Self::new(self.next_u64() ^ salt.wrapping_mul(0x9E37_79B9_7F4A_7C15))
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state = self
            .state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        let x = self.state;
        (x ^ (x >> 29)).wrapping_mul(0xBF58_476D_1CE4_E5B9) ^ (x >> 32)
    }

    /// Value in `[0, upper)`; `0` when `upper` is `0`.
    pub fn below(&mut self, upper: u64) -> u64 {
        if upper == 0 {
            return 0;
        }
        self.next_u64() % upper
    }

    /// Value in `[0, upper]`.
    pub fn up_to(&mut self, upper: u8) -> u64 {
        self.below(u64::from(upper) + 1)
    }

    /// Index into a collection of `len` items, or `None` if it is empty.
    pub fn index(&mut self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        let len_u64 = u64::try_from(len).unwrap_or(u64::MAX);
        usize::try_from(self.below(len_u64)).ok()
    }

    pub fn pick<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        self.index(items.len()).and_then(|i| items.get(i))
    }

    /// Bernoulli trial with an integer percentage.
    pub fn chance(&mut self, percent: u8) -> bool {
        match percent {
            0 => false,
            100.. => true,
            _ => self.below(100) < u64::from(percent),
        }
    }
}
