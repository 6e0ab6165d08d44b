//! GF(256) arithmetic (the Rijndael-style field, primitive polynomial `0x11D`,
//! generator `2`) backing the systematic Reed-Solomon erasure coder in
//! [`crate::fec`].
//!
//! No erasure-coding crate appears anywhere in the retrieval pack for this
//! exercise, so this module is written from scratch rather than imported.

use lazy_static::lazy_static;

const PRIMITIVE_POLY: u16 = 0x11D;
const GENERATOR: u8 = 2;

struct Tables {
    exp: [u8; 512],
    log: [u8; 256],
}

fn build_tables() -> Tables {
    let mut exp = [0u8; 512];
    let mut log = [0u8; 256];

    let mut x: u16 = 1;
    for i in 0..255usize {
        exp[i] = x as u8;
        log[x as usize] = i as u8;
        x <<= 1;
        if x & 0x100 != 0 {
            x ^= PRIMITIVE_POLY;
        }
    }
    // Duplicate the table so `exp[i]` for `i in 255..510` wraps without a modulo.
    for i in 255..510 {
        exp[i] = exp[i - 255];
    }
    Tables { exp, log }
}

lazy_static! {
    static ref TABLES: Tables = build_tables();
}

#[inline]
pub fn add(a: u8, b: u8) -> u8 {
    a ^ b
}

#[inline]
pub fn mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    let la = TABLES.log[a as usize] as usize;
    let lb = TABLES.log[b as usize] as usize;
    TABLES.exp[la + lb]
}

#[inline]
pub fn pow(a: u8, n: u32) -> u8 {
    if n == 0 {
        return 1;
    }
    if a == 0 {
        return 0;
    }
    let la = TABLES.log[a as usize] as usize;
    let e = (la * n as usize) % 255;
    TABLES.exp[e]
}

#[inline]
pub fn inv(a: u8) -> u8 {
    assert!(a != 0, "GF(256) inverse of zero is undefined");
    let la = TABLES.log[a as usize] as usize;
    TABLES.exp[255 - la]
}

#[inline]
pub fn div(a: u8, b: u8) -> u8 {
    if a == 0 {
        return 0;
    }
    mul(a, inv(b))
}

/// Evaluation point for generator-matrix row `i` (`i` starting at 0). Distinct and nonzero
/// for `i in 0..255`, which is always enough given `MAX_TOTAL_PACKETS`-bounded shard counts.
#[inline]
pub fn point(i: usize) -> u8 {
    debug_assert!(i < 255, "GF(256) evaluation points exhausted");
    (i + 1) as u8
}

#[inline]
pub fn generator() -> u8 {
    GENERATOR
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mul_by_one_is_identity() {
        for a in 1..=255u8 {
            assert_eq!(mul(a, 1), a);
        }
    }

    #[test]
    fn mul_inverse_round_trips() {
        for a in 1..=255u8 {
            let inverse = inv(a);
            assert_eq!(mul(a, inverse), 1, "a={a} inv={inverse}");
        }
    }

    #[test]
    fn mul_is_commutative_and_distributive() {
        for a in [1u8, 3, 7, 200, 255] {
            for b in [1u8, 2, 9, 100, 254] {
                assert_eq!(mul(a, b), mul(b, a));
            }
        }
        let (a, b, c) = (3u8, 5u8, 9u8);
        assert_eq!(mul(a, add(b, c)), add(mul(a, b), mul(a, c)));
    }

    #[test]
    fn pow_matches_repeated_mul() {
        let a = 7u8;
        let mut acc = 1u8;
        for n in 0..10u32 {
            assert_eq!(pow(a, n), acc);
            acc = mul(acc, a);
        }
    }

    #[test]
    fn points_are_distinct_and_nonzero() {
        let mut seen = std::collections::HashSet::new();
        for i in 0..254 {
            let p = point(i);
            assert_ne!(p, 0);
            assert!(seen.insert(p));
        }
    }
}
