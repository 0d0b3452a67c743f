use candle_core::{DType, Device, Result, Shape, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use std::sync::atomic::{AtomicU64, Ordering};

const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(GOLDEN_GAMMA);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Deterministic key source for lazy parameter initialization.
///
/// Every draw advances an internal counter, so a source built from the same
/// seed replays the same key sequence. The counter is atomic because lazy
/// state creation happens inside `forward(&self)` calls.
pub struct RngSource {
    seed: u64,
    counter: AtomicU64,
}

impl RngSource {
    pub fn new(seed: u64) -> Self {
        Self { seed, counter: AtomicU64::new(0) }
    }

    /// The next key in the stream; deterministic given the seed.
    pub fn next_key(&self) -> u64 {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        splitmix64(self.seed.wrapping_add(n.wrapping_mul(GOLDEN_GAMMA)))
    }

    /// Draws a standard-normal tensor using the next key.
    pub fn normal<S: Into<Shape>>(
        &self,
        shape: S,
        dtype: DType,
        device: &Device,
    ) -> Result<Tensor> {
        let shape: Shape = shape.into();
        let mut rng = StdRng::seed_from_u64(self.next_key());
        let data: Vec<f32> = (0..shape.elem_count())
            .map(|_| StandardNormal.sample(&mut rng))
            .collect();
        Tensor::from_vec(data, shape, device)?.to_dtype(dtype)
    }
}

impl Clone for RngSource {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            counter: AtomicU64::new(self.counter.load(Ordering::Relaxed)),
        }
    }
}
