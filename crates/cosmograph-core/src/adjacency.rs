use crate::error::{Error, Result};

/// Per-sample sparse adjacency in CSR form.
///
/// Row `i` lists the neighbors of particle `i` in emission order (nearest
/// first for K-NN). Columns are always in `[0, n)`; duplicates are allowed
/// and kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseAdjacency {
    n: usize,
    indptr: Vec<usize>,
    indices: Vec<usize>,
}

impl SparseAdjacency {
    /// Build from raw CSR arrays.
    pub fn new(n: usize, indptr: Vec<usize>, indices: Vec<usize>) -> Result<Self> {
        if indptr.len() != n + 1 {
            return Err(Error::DimensionMismatch { expected: n + 1, got: indptr.len() });
        }
        if indptr.first() != Some(&0) || indptr.windows(2).any(|w| w[0] > w[1]) {
            return Err(Error::InvalidData("indptr must start at 0 and be non-decreasing".into()));
        }
        if indptr[n] != indices.len() {
            return Err(Error::DimensionMismatch { expected: indptr[n], got: indices.len() });
        }
        if let Some(&bad) = indices.iter().find(|&&c| c >= n) {
            return Err(Error::IndexOutOfRange { index: bad, bound: n });
        }
        Ok(Self { n, indptr, indices })
    }

    /// Build from one neighbor list per row.
    pub fn from_rows(rows: Vec<Vec<usize>>) -> Result<Self> {
        let n = rows.len();
        let nnz = rows.iter().map(Vec::len).sum();
        let mut indptr = Vec::with_capacity(n + 1);
        let mut indices = Vec::with_capacity(nnz);
        indptr.push(0);
        for row in rows {
            indices.extend(row);
            indptr.push(indices.len());
        }
        Self::new(n, indptr, indices)
    }

    /// Number of rows (particles).
    pub fn num_rows(&self) -> usize {
        self.n
    }

    /// Number of stored entries.
    pub fn nnz(&self) -> usize {
        self.indices.len()
    }

    pub fn indptr(&self) -> &[usize] {
        &self.indptr
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Columns of row `i`.
    #[inline]
    pub fn row(&self, i: usize) -> &[usize] {
        &self.indices[self.indptr[i]..self.indptr[i + 1]]
    }

    pub fn degree(&self, i: usize) -> usize {
        self.indptr[i + 1] - self.indptr[i]
    }

    /// `Some(k)` when every row has exactly `k` entries.
    pub fn uniform_degree(&self) -> Option<usize> {
        let k = if self.n == 0 { 0 } else { self.degree(0) };
        (0..self.n).all(|i| self.degree(i) == k).then_some(k)
    }

    pub fn contains(&self, row: usize, col: usize) -> bool {
        row < self.n && self.row(row).contains(&col)
    }

    /// Entries as `(row, col)` in CSR emission order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..self.n).flat_map(move |i| self.row(i).iter().map(move |&c| (i, c)))
    }

    /// Relabel particles: particle `i` becomes `perm[i]`.
    ///
    /// Row `perm[i]` of the result holds the relabelled columns of row `i`,
    /// in the same order.
    pub fn permuted(&self, perm: &[usize]) -> Result<Self> {
        if perm.len() != self.n {
            return Err(Error::DimensionMismatch { expected: self.n, got: perm.len() });
        }
        let mut seen = vec![false; self.n];
        for &p in perm {
            if p >= self.n || std::mem::replace(&mut seen[p], true) {
                return Err(Error::InvalidData("not a permutation".into()));
            }
        }
        let mut rows = vec![Vec::new(); self.n];
        for i in 0..self.n {
            rows[perm[i]] = self.row(i).iter().map(|&c| perm[c]).collect();
        }
        Self::from_rows(rows)
    }
}
