//! Random helpers shared by generation and mutation.

use rand::Rng;

/// Largest element count for arrays without declared bounds.
pub(crate) const MAX_ARRAY_LEN: u64 = 10;

/// Byte values that tend to hit edge cases in parsers and size checks.
const INTERESTING_BYTES: [u8; 9] = [0x00, 0x01, 0x10, 0x20, 0x40, 0x7f, 0x80, 0xfe, 0xff];

/// True with probability `1/n`.
pub(crate) fn one_of<R: Rng + ?Sized>(rng: &mut R, n: u32) -> bool {
    rng.random_ratio(1, n.max(1))
}

/// Index in `0..n` skewed towards `n - 1`; larger `k` means a stronger skew.
pub(crate) fn biased_rand<R: Rng + ?Sized>(rng: &mut R, n: usize, k: f64) -> usize {
    if n <= 1 {
        return 0;
    }
    let r: f64 = rng.random::<f64>().powf(1.0 / k.max(1.0));
    ((r * n as f64) as usize).min(n - 1)
}

fn mask(size: u64) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (size * 8)) - 1
    }
}

/// Random integer of `size` bytes, favouring boundary and small values.
pub(crate) fn rand_int<R: Rng + ?Sized>(rng: &mut R, size: u64) -> u64 {
    let m = mask(size);
    let sign = 1u64 << (size.clamp(1, 8) * 8 - 1);
    let v = match rng.random_range(0..100) {
        0..10 => *[0, 1, m, m - 1, sign, sign - 1]
            .get(rng.random_range(0..6))
            .unwrap_or(&0),
        10..60 => rng.random_range(0..16),
        60..80 => rng.random_range(0..=0xff),
        80..90 => rng.random_range(0..0x1000),
        _ => rng.random::<u64>(),
    };
    v & m
}

/// Random integer inside the inclusive range `lo..=hi`.
pub(crate) fn rand_range<R: Rng + ?Sized>(rng: &mut R, lo: u64, hi: u64) -> u64 {
    if lo >= hi {
        return lo;
    }
    rng.random_range(lo..=hi)
}

/// A single flag, a union of several, zero, or a few random bits.
pub(crate) fn rand_flags<R: Rng + ?Sized>(rng: &mut R, vals: &[u64], size: u64) -> u64 {
    if vals.is_empty() {
        return rand_int(rng, size);
    }
    let pick = |rng: &mut R| vals[rng.random_range(0..vals.len())];
    let v = match rng.random_range(0..10) {
        0 => 0,
        1 => rand_int(rng, size),
        2..6 => pick(&mut *rng),
        _ => {
            let mut v = 0;
            loop {
                v |= pick(&mut *rng);
                if one_of(rng, 3) {
                    break v;
                }
            }
        }
    };
    v & mask(size)
}

/// Length within `min..=max`, usually small.
pub(crate) fn rand_buf_len<R: Rng + ?Sized>(rng: &mut R, min: u64, max: u64) -> u64 {
    let hi = if one_of(rng, 10) { max } else { max.min(min + 16) };
    rand_range(rng, min, hi)
}

pub(crate) fn rand_array_len<R: Rng + ?Sized>(rng: &mut R) -> u64 {
    let n = rng.random_range(0..=MAX_ARRAY_LEN);
    if n > 4 && !one_of(rng, 3) { n / 2 } else { n }
}

pub(crate) fn interesting_byte<R: Rng + ?Sized>(rng: &mut R) -> u8 {
    INTERESTING_BYTES[rng.random_range(0..INTERESTING_BYTES.len())]
}

/// Index chosen with probability proportional to `weights[i]`.
pub(crate) fn choose_weighted<R: Rng + ?Sized>(rng: &mut R, weights: &[u32]) -> Option<usize> {
    let total: u64 = weights.iter().map(|&w| u64::from(w)).sum();
    if total == 0 {
        return None;
    }
    let mut x = rng.random_range(0..total);
    for (i, &w) in weights.iter().enumerate() {
        if x < u64::from(w) {
            return Some(i);
        }
        x -= u64::from(w);
    }
    None
}
