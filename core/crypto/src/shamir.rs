//! Threshold secret sharing over GF(257).
//!
//! Each secret byte is the constant term of its own random polynomial of
//! degree `k - 1`; share `i` holds that polynomial evaluated at `x = i` for
//! every byte position. 257 is the smallest prime above 256, so every byte
//! value is a field element, and share coordinates need two bytes since the
//! field has one element more than a byte can hold.
//!
//! Shares from different `split` calls are not distinguishable here. Mixing
//! them reconstructs garbage without error; callers that need detection must
//! authenticate the reconstructed value (the key store does, by unwrapping).

use chacha20poly1305::aead::{rand_core::RngCore, OsRng};
use std::collections::HashSet;
use std::fmt;
use zeroize::Zeroize;

use mediaguard_common::{Error, Result, SensitiveBytes};

/// Field modulus.
pub const PRIME: u32 = 257;

/// Largest share count; x-coordinates are 1..=255.
pub const MAX_SHARES: usize = 255;

/// Smallest threshold that actually splits anything.
pub const MIN_THRESHOLD: usize = 2;

/// Bytes used to encode one field element.
pub const ELEMENT_SIZE: usize = 2;

/// One share of a split secret.
#[derive(Clone, PartialEq, Eq, Zeroize)]
pub struct Share {
    index: u8,
    values: Vec<u16>,
}

impl Share {
    /// Build a share from its x-coordinate and y-values.
    ///
    /// # Errors
    /// - `Error::Validation` if `index` is zero or any value exceeds 256
    pub fn new(index: u8, values: Vec<u16>) -> Result<Self> {
        if index == 0 {
            return Err(Error::Validation("Share index must be nonzero".to_string()));
        }
        if values.iter().any(|&v| u32::from(v) >= PRIME) {
            return Err(Error::Validation(
                "Share value outside GF(257)".to_string(),
            ));
        }
        Ok(Self { index, values })
    }

    /// The x-coordinate of this share.
    pub fn index(&self) -> u8 {
        self.index
    }

    /// The y-values, one per secret byte.
    pub fn values(&self) -> &[u16] {
        &self.values
    }

    /// Number of secret bytes this share covers.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the share covers an empty secret.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Encode as `index || y0 (BE u16) || y1 || ...`.
    pub fn to_bytes(&self) -> SensitiveBytes {
        let mut out = Vec::with_capacity(1 + self.values.len() * ELEMENT_SIZE);
        out.push(self.index);
        for v in &self.values {
            out.extend_from_slice(&v.to_be_bytes());
        }
        SensitiveBytes::new(out)
    }

    /// Decode the form produced by [`Share::to_bytes`].
    ///
    /// # Errors
    /// - `Error::Validation` on a missing index, odd payload, or out-of-field value
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let Some((&index, payload)) = bytes.split_first() else {
            return Err(Error::Validation("Empty share".to_string()));
        };
        if payload.len() % ELEMENT_SIZE != 0 {
            return Err(Error::Validation(
                "Share payload must be a whole number of field elements".to_string(),
            ));
        }
        let values = payload
            .chunks_exact(ELEMENT_SIZE)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        Self::new(index, values)
    }
}

impl Drop for Share {
    fn drop(&mut self) {
        self.values.zeroize();
    }
}

impl fmt::Debug for Share {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Share(index={}, [REDACTED; {}])", self.index, self.values.len())
    }
}

/// Check split parameters.
///
/// # Errors
/// - `Error::Validation` unless `2 <= k <= n <= 255`
pub fn validate_params(n: usize, k: usize) -> Result<()> {
    if k < MIN_THRESHOLD {
        return Err(Error::Validation(format!(
            "Threshold must be at least {}, got {}",
            MIN_THRESHOLD, k
        )));
    }
    if k > n {
        return Err(Error::Validation(format!(
            "Threshold {} cannot exceed share count {}",
            k, n
        )));
    }
    if n > MAX_SHARES {
        return Err(Error::Validation(format!(
            "At most {} shares supported, got {}",
            MAX_SHARES, n
        )));
    }
    Ok(())
}

/// Uniform field element by rejection sampling.
///
/// 65536 = 255 * 257 + 1, so only the single value 0xFFFF is rejected.
fn random_element() -> u32 {
    loop {
        let candidate = OsRng.next_u32() & 0xFFFF;
        if candidate < 255 * PRIME {
            return candidate % PRIME;
        }
    }
}

fn eval_poly(coeffs: &[u32], x: u32) -> u32 {
    coeffs
        .iter()
        .rev()
        .fold(0, |acc, &c| (acc * x + c) % PRIME)
}

fn pow_mod(mut base: u32, mut exp: u32) -> u32 {
    let mut result = 1;
    base %= PRIME;
    while exp > 0 {
        if exp & 1 == 1 {
            result = result * base % PRIME;
        }
        base = base * base % PRIME;
        exp >>= 1;
    }
    result
}

/// Multiplicative inverse via Fermat's little theorem. `a` must be nonzero.
fn inv_mod(a: u32) -> u32 {
    pow_mod(a, PRIME - 2)
}

/// Split `secret` into `n` shares, any `k` of which reconstruct it.
///
/// # Errors
/// - `Error::Validation` unless `2 <= k <= n <= 255`; checked before any
///   randomness is drawn
pub fn split(secret: &[u8], n: usize, k: usize) -> Result<Vec<Share>> {
    validate_params(n, k)?;

    let mut columns: Vec<Vec<u16>> = (0..n).map(|_| Vec::with_capacity(secret.len())).collect();
    let mut coeffs = vec![0u32; k];

    for &byte in secret {
        coeffs[0] = u32::from(byte);
        for c in coeffs.iter_mut().skip(1) {
            *c = random_element();
        }

        for (i, column) in columns.iter_mut().enumerate() {
            let x = (i + 1) as u32;
            column.push(eval_poly(&coeffs, x) as u16);
        }
    }
    coeffs.zeroize();

    Ok(columns
        .into_iter()
        .enumerate()
        .map(|(i, values)| Share {
            index: (i + 1) as u8,
            values,
        })
        .collect())
}

/// Recover the secret from at least `k` shares with distinct indices.
///
/// Shares repeating an index already seen are ignored. All distinct shares
/// supplied take part in the interpolation.
///
/// # Errors
/// - `Error::Validation` if `k < 2` or the shares differ in length
/// - `Error::InsufficientShares` if fewer than `k` distinct indices are given
/// - `Error::Validation` if interpolation lands on 256, which only happens
///   when the shares did not come from one split
pub fn reconstruct(shares: &[Share], k: usize) -> Result<SensitiveBytes> {
    if k < MIN_THRESHOLD {
        return Err(Error::Validation(format!(
            "Threshold must be at least {}, got {}",
            MIN_THRESHOLD, k
        )));
    }

    let mut seen = HashSet::new();
    let distinct: Vec<&Share> = shares.iter().filter(|s| seen.insert(s.index)).collect();

    if distinct.len() < k {
        return Err(Error::InsufficientShares {
            required: k,
            provided: distinct.len(),
        });
    }

    let len = distinct[0].values.len();
    if distinct.iter().any(|s| s.values.len() != len) {
        return Err(Error::Validation(
            "All shares must cover the same number of bytes".to_string(),
        ));
    }

    // Lagrange basis at x = 0: L_i(0) = prod_{j != i} x_j / (x_j - x_i)
    let xs: Vec<u32> = distinct.iter().map(|s| u32::from(s.index)).collect();
    let basis: Vec<u32> = xs
        .iter()
        .enumerate()
        .map(|(i, &xi)| {
            let mut num = 1;
            let mut den = 1;
            for (j, &xj) in xs.iter().enumerate() {
                if i != j {
                    num = num * xj % PRIME;
                    den = den * ((xj + PRIME - xi) % PRIME) % PRIME;
                }
            }
            num * inv_mod(den) % PRIME
        })
        .collect();

    let mut secret = Vec::with_capacity(len);
    for pos in 0..len {
        let value = distinct
            .iter()
            .zip(&basis)
            .fold(0, |acc, (share, &l)| {
                (acc + u32::from(share.values[pos]) * l) % PRIME
            });
        if value > u32::from(u8::MAX) {
            secret.zeroize();
            return Err(Error::Validation(
                "Shares do not reconstruct a byte string".to_string(),
            ));
        }
        secret.push(value as u8);
    }

    Ok(SensitiveBytes::new(secret))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn subsets(n: usize, k: usize) -> Vec<Vec<usize>> {
        fn go(start: usize, n: usize, k: usize, cur: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
            if cur.len() == k {
                out.push(cur.clone());
                return;
            }
            for i in start..n {
                cur.push(i);
                go(i + 1, n, k, cur, out);
                cur.pop();
            }
        }
        let mut out = Vec::new();
        go(0, n, k, &mut Vec::new(), &mut out);
        out
    }

    fn pick(shares: &[Share], idx: &[usize]) -> Vec<Share> {
        idx.iter().map(|&i| shares[i].clone()).collect()
    }

    #[test]
    fn test_every_three_of_five_reconstructs() {
        let secret = b"0123456789abcdef0123456789abcdef";
        let shares = split(secret, 5, 3).unwrap();
        assert_eq!(shares.len(), 5);

        let combos = subsets(5, 3);
        assert_eq!(combos.len(), 10);
        for combo in combos {
            let recovered = reconstruct(&pick(&shares, &combo), 3).unwrap();
            assert_eq!(recovered.as_bytes(), secret, "subset {:?}", combo);
        }
    }

    #[test]
    fn test_more_than_threshold() {
        let secret = b"32_byte_secret_for_testing_!!!";
        let shares = split(secret, 5, 3).unwrap();

        assert_eq!(reconstruct(&shares, 3).unwrap().as_bytes(), secret);
    }

    #[test]
    fn test_share_indices_and_lengths() {
        let secret = b"abc";
        let shares = split(secret, 4, 2).unwrap();

        let indices: Vec<u8> = shares.iter().map(Share::index).collect();
        assert_eq!(indices, vec![1, 2, 3, 4]);
        assert!(shares.iter().all(|s| s.len() == secret.len()));
        assert!(shares
            .iter()
            .all(|s| s.to_bytes().len() == 1 + secret.len() * ELEMENT_SIZE));
    }

    #[test]
    fn test_invalid_params() {
        assert!(matches!(split(b"secret", 3, 5), Err(Error::Validation(_))));
        assert!(matches!(split(b"secret", 3, 1), Err(Error::Validation(_))));
        assert!(matches!(split(b"secret", 256, 3), Err(Error::Validation(_))));
        assert!(split(b"secret", 255, 255).is_ok());
    }

    #[test]
    fn test_too_few_shares() {
        let shares = split(b"secret", 5, 3).unwrap();

        let result = reconstruct(&shares[..2], 3);
        assert!(matches!(
            result,
            Err(Error::InsufficientShares { required: 3, provided: 2 })
        ));
    }

    #[test]
    fn test_duplicate_indices_do_not_count() {
        let shares = split(b"secret", 5, 3).unwrap();
        let dupes = vec![shares[0].clone(), shares[0].clone(), shares[1].clone()];

        assert!(matches!(
            reconstruct(&dupes, 3),
            Err(Error::InsufficientShares { required: 3, provided: 2 })
        ));
    }

    #[test]
    fn test_mismatched_lengths_rejected() {
        let a = split(b"four", 3, 2).unwrap();
        let b = split(b"three", 3, 2).unwrap();

        let mixed = vec![a[0].clone(), b[1].clone()];
        assert!(matches!(reconstruct(&mixed, 2), Err(Error::Validation(_))));
    }

    #[test]
    fn test_empty_secret() {
        let shares = split(b"", 3, 2).unwrap();
        assert!(reconstruct(&shares[1..], 2).unwrap().is_empty());
    }

    #[test]
    fn test_share_bytes_roundtrip_and_validation() {
        let shares = split(b"\x00\xff\x80", 3, 2).unwrap();
        let encoded = shares[2].to_bytes();
        let decoded = Share::from_bytes(encoded.as_bytes()).unwrap();
        assert_eq!(decoded, shares[2]);

        assert!(Share::from_bytes(&[]).is_err());
        assert!(Share::from_bytes(&[0, 0, 1]).is_err());
        assert!(Share::from_bytes(&[1, 0]).is_err());
        assert!(Share::from_bytes(&[1, 0x01, 0x01]).is_err());
        assert!(Share::from_bytes(&[1, 0x01, 0x00]).is_ok());
    }

    #[test]
    fn test_field_inverse() {
        for a in 1..PRIME {
            assert_eq!(a * inv_mod(a) % PRIME, 1);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_any_k_subset_reconstructs(
            secret in proptest::collection::vec(any::<u8>(), 0..48),
            (n, k) in (2usize..8).prop_flat_map(|n| (Just(n), 2..=n)),
            seed in any::<u64>(),
        ) {
            let shares = split(&secret, n, k).unwrap();

            // Two different k-subsets chosen from the seed.
            let mut order: Vec<usize> = (0..n).collect();
            order.rotate_left((seed % n as u64) as usize);
            let first: Vec<usize> = order[..k].to_vec();
            order.reverse();
            let second: Vec<usize> = order[..k].to_vec();

            let a = reconstruct(&pick(&shares, &first), k).unwrap();
            let b = reconstruct(&pick(&shares, &second), k).unwrap();
            prop_assert_eq!(a.as_bytes(), &secret[..]);
            prop_assert_eq!(a.as_bytes(), b.as_bytes());
        }
    }
}
