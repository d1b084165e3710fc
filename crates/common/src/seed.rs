use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

const GAMMA: u64 = 0x9e37_79b9_7f4a_7c15;

/// One splitmix64 step.
/// Identical on every platform, so derived seeds reproduce anywhere.
pub fn splitmix64(mut state: u64) -> u64 {
    state = state.wrapping_add(GAMMA);
    let mut z = state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Fold `value` into `seed`.
pub fn mix_seed(seed: u64, value: u64) -> u64 {
    splitmix64(seed ^ splitmix64(value))
}

/// Seeded generator for procedural content.
///
/// ChaCha8 output is fixed by its algorithm, so content stays reproducible
/// across `rand` releases.
pub type ContentRng = ChaCha8Rng;

pub fn content_rng(seed: u64) -> ContentRng {
    ChaCha8Rng::seed_from_u64(seed)
}
