#[derive(Debug, Clone)]
pub(crate) struct Rand {
    state: u64,
}

impl Rand {
    pub(crate) const fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Seed from the given value, or from the system clock when there is none.
    pub(crate) fn from_seed(seed: Option<u64>) -> Self {
        let seed = seed.unwrap_or_else(|| {
            crate::time::Instant::now().total_micros() as u64 ^ 0x9e37_79b9_7f4a_7c15
        });
        Self::new(seed)
    }

    pub(crate) fn rand_u32(&mut self) -> u32 {
        // sPCG32 from https://www.pcg-random.org/paper.html
        // see also https://nullprogram.com/blog/2017/09/21/
        const M: u64 = 0xbb2efcec3c39611d;
        const A: u64 = 0x7a7cd1f7e0db16f1;
        self.state = self.state.wrapping_mul(M).wrapping_add(A);

        const ROTATE: u32 = 59; // 64 - 5
        const XSHIFT: u32 = 18; // (5 + 32) / 2
        const SPARE: u32 = 27; // 64 - 32 - 5

        let rot = (self.state >> ROTATE) as u32;
        let xsh = (((self.state >> XSHIFT) ^ self.state) >> SPARE) as u32;
        xsh.rotate_right(rot)
    }

    pub(crate) fn rand_u16(&mut self) -> u16 {
        let val = self.rand_u32();
        (val ^ (val >> 16)) as u16
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_same_seed_same_sequence() {
        let mut a = Rand::new(1234);
        let mut b = Rand::new(1234);
        for _ in 0..16 {
            assert_eq!(a.rand_u32(), b.rand_u32());
        }
    }

    #[test]
    fn test_different_seed_different_sequence() {
        let mut a = Rand::new(1);
        let mut b = Rand::new(2);
        let a: Vec<u32> = (0..4).map(|_| a.rand_u32()).collect();
        let b: Vec<u32> = (0..4).map(|_| b.rand_u32()).collect();
        assert_ne!(a, b);
    }
}
