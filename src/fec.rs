//! Systematic Reed-Solomon erasure coding over GF(256).
//!
//! Builds a `(k+p) x k` generator matrix as a Vandermonde matrix over `k+p`
//! distinct nonzero evaluation points, then right-multiplies it by the
//! inverse of its own top `k x k` submatrix. That submatrix is invertible
//! because a Vandermonde matrix's determinant is the product of pairwise
//! differences of its evaluation points, which is nonzero for distinct
//! points; right-multiplying by an invertible matrix preserves the
//! property that *every* `k x k` submatrix (not just the top one) is
//! invertible, while also making the top `k` rows the identity — i.e. the
//! code becomes systematic (data shards pass through unencoded) without
//! losing the "any k of k+p shards reconstruct the rest" MDS property.
//!
//! This is the standard construction used by production Reed-Solomon
//! erasure-coding libraries; it is implemented from scratch here because no
//! such crate appears in the retrieval pack.

use crate::error::{Result, TransportError};
use crate::gf256;

/// A `rows x cols` matrix over GF(256), row-major.
struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<u8>,
}

impl Matrix {
    fn zero(rows: usize, cols: usize) -> Self {
        Matrix { rows, cols, data: vec![0; rows * cols] }
    }

    #[inline]
    fn get(&self, r: usize, c: usize) -> u8 {
        self.data[r * self.cols + c]
    }

    #[inline]
    fn set(&mut self, r: usize, c: usize, v: u8) {
        self.data[r * self.cols + c] = v;
    }

    /// Vandermonde matrix: `M[r][c] = point(r)^c`.
    fn vandermonde(rows: usize, cols: usize) -> Self {
        let mut m = Matrix::zero(rows, cols);
        for r in 0..rows {
            let p = gf256::point(r);
            for c in 0..cols {
                m.set(r, c, gf256::pow(p, c as u32));
            }
        }
        m
    }

    /// Select an arbitrary subset of rows, preserving order.
    fn select_rows(&self, rows: &[usize]) -> Self {
        let mut m = Matrix::zero(rows.len(), self.cols);
        for (out_r, &src_r) in rows.iter().enumerate() {
            for c in 0..self.cols {
                m.set(out_r, c, self.get(src_r, c));
            }
        }
        m
    }

    /// Multiply `self` (rows x cols) by `other` (cols x other.cols).
    fn mul(&self, other: &Matrix) -> Matrix {
        assert_eq!(self.cols, other.rows);
        let mut out = Matrix::zero(self.rows, other.cols);
        for r in 0..self.rows {
            for c in 0..other.cols {
                let mut acc = 0u8;
                for k in 0..self.cols {
                    acc = gf256::add(acc, gf256::mul(self.get(r, k), other.get(k, c)));
                }
                out.set(r, c, acc);
            }
        }
        out
    }

    /// Invert a square matrix via Gauss-Jordan elimination over GF(256).
    fn invert(&self) -> Result<Matrix> {
        assert_eq!(self.rows, self.cols, "only square matrices are invertible");
        let n = self.rows;

        // Augmented [self | I], n x 2n.
        let mut aug = vec![0u8; n * 2 * n];
        for r in 0..n {
            for c in 0..n {
                aug[r * 2 * n + c] = self.get(r, c);
            }
            aug[r * 2 * n + n + r] = 1;
        }

        for col in 0..n {
            // Find a pivot with a nonzero entry in this column.
            let mut pivot = None;
            for r in col..n {
                if aug[r * 2 * n + col] != 0 {
                    pivot = Some(r);
                    break;
                }
            }
            let pivot = pivot.ok_or_else(|| {
                TransportError::RecoverableFlow("FEC decode matrix is singular".into())
            })?;

            if pivot != col {
                for c in 0..2 * n {
                    aug.swap(col * 2 * n + c, pivot * 2 * n + c);
                }
            }

            let inv_pivot = gf256::inv(aug[col * 2 * n + col]);
            for c in 0..2 * n {
                aug[col * 2 * n + c] = gf256::mul(aug[col * 2 * n + c], inv_pivot);
            }

            for r in 0..n {
                if r == col {
                    continue;
                }
                let factor = aug[r * 2 * n + col];
                if factor == 0 {
                    continue;
                }
                for c in 0..2 * n {
                    let sub = gf256::mul(factor, aug[col * 2 * n + c]);
                    aug[r * 2 * n + c] = gf256::add(aug[r * 2 * n + c], sub);
                }
            }
        }

        let mut out = Matrix::zero(n, n);
        for r in 0..n {
            for c in 0..n {
                out.set(r, c, aug[r * 2 * n + n + c]);
            }
        }
        Ok(out)
    }
}

/// A systematic `(k, k+p)` Reed-Solomon code: the first `k` shards of an encoded set are the
/// original data unmodified; the remaining `p` are parity.
pub struct ReedSolomon {
    k: usize,
    n: usize,
    /// The full `n x k` systematic generator matrix (top `k` rows are the identity).
    generator: Matrix,
}

impl ReedSolomon {
    pub fn new(k: usize, p: usize) -> Result<Self> {
        if k == 0 {
            return Err(TransportError::Malformed("FEC data-shard count is zero".into()));
        }
        let n = k + p;
        if n > 250 {
            return Err(TransportError::Malformed(format!(
                "FEC shard count {n} exceeds the GF(256) evaluation-point budget"
            )));
        }

        let vandermonde = Matrix::vandermonde(n, k);
        let top = vandermonde.select_rows(&(0..k).collect::<Vec<_>>());
        let top_inv = top.invert()?;
        let generator = vandermonde.mul(&top_inv);

        Ok(ReedSolomon { k, n, generator })
    }

    pub fn data_shards(&self) -> usize {
        self.k
    }

    pub fn total_shards(&self) -> usize {
        self.n
    }

    /// Compute the `p = n - k` parity shards for a frame already split into `k` equal-length
    /// data shards (the caller zero-pads the last one).
    pub fn encode_parity(&self, data_shards: &[Vec<u8>]) -> Result<Vec<Vec<u8>>> {
        assert_eq!(data_shards.len(), self.k);
        let shard_len = data_shards[0].len();
        for s in data_shards {
            assert_eq!(s.len(), shard_len, "FEC shards must be equal length");
        }

        let p = self.n - self.k;
        let mut parity = vec![vec![0u8; shard_len]; p];

        for byte_idx in 0..shard_len {
            for (parity_row, parity_shard) in parity.iter_mut().enumerate() {
                let gen_row = self.k + parity_row;
                let mut acc = 0u8;
                for (col, data_shard) in data_shards.iter().enumerate() {
                    acc = gf256::add(acc, gf256::mul(self.generator.get(gen_row, col), data_shard[byte_idx]));
                }
                parity_shard[byte_idx] = acc;
            }
        }

        Ok(parity)
    }

    /// Reconstruct the `k` data shards given any `>= k` of the `n` shards.
    ///
    /// `present` is a list of `(shard_index, bytes)` pairs, `shard_index < n`, all of equal
    /// length, with at least `k` distinct entries.
    pub fn decode(&self, present: &[(usize, &[u8])]) -> Result<Vec<Vec<u8>>> {
        if present.len() < self.k {
            return Err(TransportError::RecoverableFlow(format!(
                "FEC decode needs >= {} shards, got {}",
                self.k,
                present.len()
            )));
        }

        // Fast path: all k data shards (indices 0..k) are directly present.
        if present.len() >= self.k
            && (0..self.k).all(|i| present.iter().any(|&(idx, _)| idx == i))
        {
            let mut out = vec![Vec::new(); self.k];
            for &(idx, bytes) in present {
                if idx < self.k {
                    out[idx] = bytes.to_vec();
                }
            }
            return Ok(out);
        }

        let chosen: Vec<(usize, &[u8])> = present.iter().take(self.k).cloned().collect();
        let shard_len = chosen[0].1.len();
        for &(_, bytes) in &chosen {
            if bytes.len() != shard_len {
                return Err(TransportError::Malformed("FEC shards have mismatched length".into()));
            }
        }

        let rows: Vec<usize> = chosen.iter().map(|&(idx, _)| idx).collect();
        let sub = self.generator.select_rows(&rows);
        let sub_inv = sub.invert()?;

        let mut out = vec![vec![0u8; shard_len]; self.k];
        for byte_idx in 0..shard_len {
            for data_row in 0..self.k {
                let mut acc = 0u8;
                for (col, &(_, bytes)) in chosen.iter().enumerate() {
                    acc = gf256::add(acc, gf256::mul(sub_inv.get(data_row, col), bytes[byte_idx]));
                }
                out[data_row][byte_idx] = acc;
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shards(data: &[u8], k: usize) -> Vec<Vec<u8>> {
        let shard_len = data.len().div_ceil(k);
        let mut out = Vec::with_capacity(k);
        for i in 0..k {
            let start = i * shard_len;
            let mut shard = vec![0u8; shard_len];
            let end = (start + shard_len).min(data.len());
            if start < data.len() {
                shard[..end - start].copy_from_slice(&data[start..end]);
            }
            out.push(shard);
        }
        out
    }

    #[test]
    fn encode_then_decode_with_no_loss() {
        let rs = ReedSolomon::new(4, 2).unwrap();
        let data: Vec<u8> = (0..64u32).map(|i| (i & 0xff) as u8).collect();
        let data_shards = shards(&data, 4);
        let parity = rs.encode_parity(&data_shards).unwrap();

        let mut present: Vec<(usize, &[u8])> = Vec::new();
        for (i, s) in data_shards.iter().enumerate() {
            present.push((i, s.as_slice()));
        }
        for (i, s) in parity.iter().enumerate() {
            present.push((4 + i, s.as_slice()));
        }

        let recovered = rs.decode(&present).unwrap();
        assert_eq!(recovered, data_shards);
    }

    #[test]
    fn recovers_from_any_k_of_n_shards() {
        let rs = ReedSolomon::new(5, 3).unwrap();
        let data: Vec<u8> = (0..200u32).map(|i| ((i * 7) & 0xff) as u8).collect();
        let data_shards = shards(&data, 5);
        let parity = rs.encode_parity(&data_shards).unwrap();

        let all_shards: Vec<Vec<u8>> = data_shards.iter().cloned().chain(parity.iter().cloned()).collect();

        // Drop three of the eight shards (any 3, as long as 5 remain): lose shards 0, 2, 6.
        let dropped = [0usize, 2, 6];
        let present: Vec<(usize, &[u8])> = all_shards
            .iter()
            .enumerate()
            .filter(|(i, _)| !dropped.contains(i))
            .map(|(i, s)| (i, s.as_slice()))
            .collect();

        let recovered = rs.decode(&present).unwrap();
        assert_eq!(recovered, data_shards);
    }

    #[test]
    fn decode_fails_with_too_few_shards() {
        let rs = ReedSolomon::new(4, 2).unwrap();
        let data_shards = shards(&[1, 2, 3, 4, 5, 6, 7, 8], 4);
        let present: Vec<(usize, &[u8])> = vec![(0, &data_shards[0]), (1, &data_shards[1])];
        assert!(rs.decode(&present).is_err());
    }

    #[test]
    fn parity_shards_differ_from_data() {
        let rs = ReedSolomon::new(3, 2).unwrap();
        let data_shards = shards(b"hello world this is a test!", 3);
        let parity = rs.encode_parity(&data_shards).unwrap();
        assert_eq!(parity.len(), 2);
        for p in &parity {
            assert_eq!(p.len(), data_shards[0].len());
        }
    }
}
