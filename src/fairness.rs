//! Provably fair commitment for crash rounds.
//!
//! Flow:
//! - A 32-byte server seed is drawn from the OS CSPRNG when a round is created.
//! - Only `sha256(seed)` is published while bets are open.
//! - The crash point is derived from `sha256("{seed}:{nonce}")`, so it is fixed
//!   the moment the seed exists.
//! - After the crash the raw seed is revealed and anyone can recompute both
//!   the hash and the crash point with [`verify`].

use crate::errors::{CrashError, CrashResult};
use crate::types::Multiplier;
use rand::{rngs::OsRng, Rng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Upper bound (exclusive) for generated nonces
const NONCE_RANGE: u64 = 1_000_000;

/// Largest absolute bias accepted by [`derive_crash_point`]
pub const MAX_BIAS: f64 = 0.5;

/// Bucket boundaries of the crash curve: (draw upper bound, crash point at
/// bucket start, crash point at bucket end). The last bucket ends at the
/// configured ceiling.
const CURVE: [(f64, f64, f64); 4] = [
    (0.40, 1.0, 1.8),
    (0.70, 1.8, 3.0),
    (0.90, 3.0, 7.0),
    (0.98, 7.0, 16.0),
];

/// Lower end of the tail bucket
const TAIL_START: f64 = 16.0;

/// Round fairness data. The seed stays private until the round has crashed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Commitment {
    pub server_seed: String,
    pub server_seed_hash: String,
    pub nonce: u64,
    pub bias: f64,
    /// Ceiling in force when the round was created; needed to re-derive.
    pub ceiling: Multiplier,
    pub crash_point: Multiplier,
}

impl Commitment {
    /// Generate a fresh seed and nonce and derive the crash point.
    pub fn generate(bias: f64, ceiling: Multiplier) -> CrashResult<Self> {
        let server_seed = generate_server_seed();
        let nonce = OsRng.gen_range(0..NONCE_RANGE);
        Self::from_seed(server_seed, nonce, bias, ceiling)
    }

    /// Rebuild a commitment from a known seed. Used for verification and replays.
    pub fn from_seed(server_seed: String, nonce: u64, bias: f64, ceiling: Multiplier) -> CrashResult<Self> {
        let crash_point = derive_crash_point(&server_seed, nonce, bias, ceiling)?;
        Ok(Self {
            server_seed_hash: hash_server_seed(&server_seed),
            server_seed,
            nonce,
            bias,
            ceiling,
            crash_point,
        })
    }

    /// Check this commitment against its own revealed data.
    pub fn verify(&self) -> CrashResult<Verification> {
        verify(
            &self.server_seed,
            &self.server_seed_hash,
            self.nonce,
            self.bias,
            self.ceiling,
            self.crash_point,
        )
    }

    #[cfg(test)]
    pub(crate) fn fixed(crash_point: Multiplier) -> Self {
        let server_seed = "00".repeat(32);
        Self {
            server_seed_hash: hash_server_seed(&server_seed),
            server_seed,
            nonce: 0,
            bias: 0.0,
            ceiling: Multiplier::from_hundredths(10_000),
            crash_point,
        }
    }
}

/// 32 random bytes, hex-encoded
pub fn generate_server_seed() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Public commitment to a server seed
pub fn hash_server_seed(server_seed: &str) -> String {
    hex::encode(Sha256::digest(server_seed.as_bytes()))
}

/// Uniform draw in `[0, 1)` from the first 32 bits of `sha256("{seed}:{nonce}")`
pub fn raw_draw(server_seed: &str, nonce: u64) -> f64 {
    let digest = Sha256::digest(format!("{}:{}", server_seed, nonce).as_bytes());
    let word = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    word as f64 / 4_294_967_296.0
}

/// Skew a draw with `u^(1 + bias)`.
///
/// Monotonic and identity at zero; positive bias pulls draws towards zero
/// (earlier crashes), negative bias pushes them towards one.
pub fn apply_bias(draw: f64, bias: f64) -> f64 {
    if bias == 0.0 {
        return draw;
    }
    draw.powf(1.0 + bias)
}

/// Map a draw onto the crash curve, floored to hundredths and clamped to
/// `[1.00, ceiling]`.
pub fn map_draw(draw: f64, ceiling: Multiplier) -> Multiplier {
    let mut lower_draw = 0.0;
    let mut value = None;
    for (upper_draw, start, end) in CURVE {
        if draw < upper_draw {
            let t = (draw - lower_draw) / (upper_draw - lower_draw);
            value = Some(start + t * (end - start));
            break;
        }
        lower_draw = upper_draw;
    }
    let value = value.unwrap_or_else(|| {
        let top = ceiling.as_f64().max(TAIL_START);
        let t = (draw - lower_draw) / (1.0 - lower_draw);
        TAIL_START + t * (top - TAIL_START)
    });
    Multiplier::from_f64_floor(value).min(ceiling).max(Multiplier::ONE)
}

/// Deterministically derive a round's crash point.
pub fn derive_crash_point(
    server_seed: &str,
    nonce: u64,
    bias: f64,
    ceiling: Multiplier,
) -> CrashResult<Multiplier> {
    if !bias.is_finite() || bias.abs() > MAX_BIAS {
        return Err(CrashError::Validation(format!(
            "crash bias {} outside [-{}, {}]",
            bias, MAX_BIAS, MAX_BIAS
        )));
    }
    if ceiling < Multiplier::ONE {
        return Err(CrashError::Validation(format!("crash ceiling {} below 1.00x", ceiling)));
    }
    let draw = apply_bias(raw_draw(server_seed, nonce), bias);
    Ok(map_draw(draw, ceiling))
}

/// Outcome of checking a revealed round
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Verification {
    pub hash_matches: bool,
    pub crash_point_matches: bool,
    pub computed_crash_point: Multiplier,
}

impl Verification {
    pub fn is_valid(&self) -> bool {
        self.hash_matches && self.crash_point_matches
    }
}

/// Recompute the commitment and crash point from revealed round data.
pub fn verify(
    server_seed: &str,
    server_seed_hash: &str,
    nonce: u64,
    bias: f64,
    ceiling: Multiplier,
    crash_point: Multiplier,
) -> CrashResult<Verification> {
    let computed = derive_crash_point(server_seed, nonce, bias, ceiling)?;
    Ok(Verification {
        hash_matches: hash_server_seed(server_seed) == server_seed_hash,
        crash_point_matches: computed == crash_point,
        computed_crash_point: computed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CEILING: Multiplier = Multiplier::from_hundredths(10_000);

    #[test]
    fn test_seed_shape() {
        let seed = generate_server_seed();
        assert_eq!(seed.len(), 64);
        assert!(hex::decode(&seed).is_ok());
        assert_ne!(seed, generate_server_seed());
    }

    #[test]
    fn test_hash_is_sha256_hex() {
        // sha256("abc")
        assert_eq!(
            hash_server_seed("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let a = derive_crash_point("seed", 42, 0.0, CEILING).unwrap();
        let b = derive_crash_point("seed", 42, 0.0, CEILING).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_curve_bucket_edges() {
        assert_eq!(map_draw(0.0, CEILING), Multiplier::ONE);
        assert_eq!(map_draw(0.2, CEILING), Multiplier::from_hundredths(140));
        assert_eq!(map_draw(0.4, CEILING), Multiplier::from_hundredths(180));
        assert_eq!(map_draw(0.7, CEILING), Multiplier::from_hundredths(300));
        assert_eq!(map_draw(0.9, CEILING), Multiplier::from_hundredths(700));
        assert_eq!(map_draw(0.98, CEILING), Multiplier::from_hundredths(1_600));
        assert!(map_draw(0.999_999, CEILING) <= CEILING);
    }

    #[test]
    fn test_lower_ceiling_clamps_tail() {
        let ceiling = Multiplier::from_hundredths(1_000);
        assert_eq!(map_draw(0.95, ceiling), ceiling);
        assert_eq!(map_draw(0.995, ceiling), ceiling);
    }

    #[test]
    fn test_distribution_roughly_matches_buckets() {
        let seed = "distribution-check";
        let mut buckets = [0u32; 5];
        let samples = 20_000;
        for nonce in 0..samples {
            let cp = derive_crash_point(seed, nonce, 0.0, CEILING).unwrap().hundredths();
            let idx = match cp {
                0..=179 => 0,
                180..=299 => 1,
                300..=699 => 2,
                700..=1_599 => 3,
                _ => 4,
            };
            buckets[idx] += 1;
        }
        let share = |n: u32| n as f64 / samples as f64;
        assert!((share(buckets[0]) - 0.40).abs() < 0.02);
        assert!((share(buckets[1]) - 0.30).abs() < 0.02);
        assert!((share(buckets[2]) - 0.20).abs() < 0.02);
        assert!((share(buckets[3]) - 0.08).abs() < 0.015);
        assert!((share(buckets[4]) - 0.02).abs() < 0.01);
    }

    #[test]
    fn test_bias_skews_without_touching_commitment() {
        let neutral = Commitment::from_seed("s".repeat(64), 7, 0.0, CEILING).unwrap();
        let biased = Commitment::from_seed("s".repeat(64), 7, 0.5, CEILING).unwrap();
        assert_eq!(neutral.server_seed_hash, biased.server_seed_hash);
        assert!(biased.crash_point <= neutral.crash_point);
        assert_eq!(apply_bias(0.25, 0.0), 0.25);
        assert!(apply_bias(0.25, 0.5) < 0.25);
        assert!(apply_bias(0.25, -0.5) > 0.25);
    }

    #[test]
    fn test_bias_out_of_range_rejected() {
        assert!(derive_crash_point("seed", 1, 0.8, CEILING).is_err());
        assert!(derive_crash_point("seed", 1, f64::NAN, CEILING).is_err());
    }

    #[test]
    fn test_verify_detects_tampering() {
        let c = Commitment::generate(0.0, CEILING).unwrap();
        let ok = verify(&c.server_seed, &c.server_seed_hash, c.nonce, c.bias, CEILING, c.crash_point).unwrap();
        assert!(ok.is_valid());

        let forged = Multiplier::from_hundredths(c.crash_point.hundredths() + 1);
        let bad = verify(&c.server_seed, &c.server_seed_hash, c.nonce, c.bias, CEILING, forged).unwrap();
        assert!(bad.hash_matches);
        assert!(!bad.crash_point_matches);

        let wrong_hash = verify(&c.server_seed, "deadbeef", c.nonce, c.bias, CEILING, c.crash_point).unwrap();
        assert!(!wrong_hash.is_valid());
    }

    #[test]
    fn test_commitment_self_verifies() {
        let c = Commitment::generate(0.2, Multiplier::from_hundredths(5_000)).unwrap();
        assert_eq!(c.ceiling, Multiplier::from_hundredths(5_000));
        assert!(c.crash_point <= c.ceiling);
        assert!(c.verify().unwrap().is_valid());
    }
}
