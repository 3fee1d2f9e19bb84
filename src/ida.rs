//! # Information Dispersal Codec
//!
//! Values are never stored whole. Each value is padded to a fixed-length
//! numeric vector and dispersed into [`FRAGMENT_COUNT`] fragments, any
//! [`DECODE_THRESHOLD`] of which reconstruct the original (Rabin's
//! information dispersal algorithm over a Vandermonde matrix).
//!
//! | Constant | Value | Meaning |
//! |----------|-------|---------|
//! | `FRAGMENT_COUNT` (N) | 14 | fragments produced per block |
//! | `DECODE_THRESHOLD` (M) | 10 | fragments needed to reconstruct |
//! | `BLOCK_LEN` (L) | 40 | padded length of the source vector |
//!
//! Arithmetic is `f64`. Every intermediate value during encoding is an exact
//! integer well inside the 53-bit mantissa, so the only rounding happens in
//! the matrix inversion during decode and is undone by rounding the output
//! to the nearest integer.

use std::fmt;

/// Fragments produced per block (replication degree N).
pub const FRAGMENT_COUNT: usize = 14;

/// Fragments required to reconstruct a block (threshold M).
pub const DECODE_THRESHOLD: usize = 10;

/// Length of the padded source vector (L).
pub const BLOCK_LEN: usize = 40;

/// Values carried by each fragment (L / M).
pub const FRAGMENT_LEN: usize = BLOCK_LEN / DECODE_THRESHOLD;

/// Codepoints at or above this limit are rejected at encode time; the
/// dispersal arithmetic needs source values to stay small so that encoded
/// coefficients remain exactly representable.
const MAX_CODEPOINT: u32 = 1000;

/// Pivots smaller than this make the decode matrix singular.
const SINGULAR_EPSILON: f64 = 1e-9;

/// Failures raised by the codec.
#[derive(Debug, Clone, PartialEq)]
pub enum CodecError {
    /// Source text longer than [`BLOCK_LEN`] bytes.
    ValueTooLong(usize),
    /// Source text contains a character outside codepoint 0..1000.
    UnencodableChar(char),
    /// Fewer than [`DECODE_THRESHOLD`] fragments supplied.
    TooFewFragments(usize),
    /// The decode matrix is degenerate (cannot happen for distinct indices).
    SingularMatrix,
    /// A serialized fragment or block did not parse.
    Malformed(String),
    /// Encoding produced fragments that do not decode back to the source.
    RoundTripMismatch,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::ValueTooLong(len) => {
                write!(f, "value is {len} bytes, limit is {BLOCK_LEN}")
            }
            CodecError::UnencodableChar(c) => {
                write!(f, "character {c:?} is outside the encodable range")
            }
            CodecError::TooFewFragments(n) => {
                write!(f, "{n} fragments supplied, {DECODE_THRESHOLD} required")
            }
            CodecError::SingularMatrix => write!(f, "decode matrix is singular"),
            CodecError::Malformed(detail) => write!(f, "malformed fragment data: {detail}"),
            CodecError::RoundTripMismatch => {
                write!(f, "encoded fragments failed the decode sanity check")
            }
        }
    }
}

impl std::error::Error for CodecError {}

/// Disperse a padded source vector into `FRAGMENT_COUNT` coefficient rows.
///
/// Row `i` is the product of the Vandermonde row `[(i+1)^0 .. (i+1)^(M-1)]`
/// with the source reshaped into M-value columns.
fn encode(message: &[f64]) -> Vec<Vec<f64>> {
    debug_assert_eq!(message.len(), BLOCK_LEN);

    let mut rows = vec![vec![0.0; FRAGMENT_LEN]; FRAGMENT_COUNT];
    for (i, row) in rows.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            for k in 0..DECODE_THRESHOLD {
                let coefficient = ((i + 1) as f64).powi(k as i32);
                *cell += coefficient * message[j * DECODE_THRESHOLD + k];
            }
        }
    }
    rows
}

/// Reconstruct the padded source vector from `DECODE_THRESHOLD` rows and
/// their 1-based fragment indices. Extra rows beyond the threshold are
/// ignored.
fn decode(rows: &[Vec<f64>], indices: &[usize]) -> Result<Vec<f64>, CodecError> {
    if rows.len() < DECODE_THRESHOLD || indices.len() < DECODE_THRESHOLD {
        return Err(CodecError::TooFewFragments(rows.len().min(indices.len())));
    }

    let mut matrix = vec![vec![0.0; DECODE_THRESHOLD]; DECODE_THRESHOLD];
    for (i, row) in matrix.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            *cell = (indices[i] as f64).powi(j as i32);
        }
    }
    let inverse = invert(&matrix)?;

    let mut message = vec![0.0; BLOCK_LEN];
    for (i, value) in message.iter_mut().enumerate() {
        for k in 0..DECODE_THRESHOLD {
            *value += inverse[i % DECODE_THRESHOLD][k] * rows[k][i / DECODE_THRESHOLD];
        }
    }
    for value in message.iter_mut() {
        *value = value.round();
    }
    Ok(message)
}

/// Invert a square matrix by Gauss-Jordan elimination with partial pivoting.
fn invert(matrix: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, CodecError> {
    let n = matrix.len();

    // Augment [A | I] and reduce A to the identity in place.
    let mut work: Vec<Vec<f64>> = matrix
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let mut augmented = row.clone();
            augmented.extend((0..n).map(|j| if i == j { 1.0 } else { 0.0 }));
            augmented
        })
        .collect();

    for col in 0..n {
        let pivot_row = (col..n)
            .max_by(|&a, &b| {
                work[a][col]
                    .abs()
                    .partial_cmp(&work[b][col].abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(col);
        if work[pivot_row][col].abs() < SINGULAR_EPSILON {
            return Err(CodecError::SingularMatrix);
        }
        work.swap(col, pivot_row);

        let pivot = work[col][col];
        for cell in work[col].iter_mut() {
            *cell /= pivot;
        }
        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = work[row][col];
            if factor == 0.0 {
                continue;
            }
            for cell_col in 0..2 * n {
                work[row][cell_col] -= factor * work[col][cell_col];
            }
        }
    }

    Ok(work.into_iter().map(|mut row| row.split_off(n)).collect())
}

/// One erasure-coded row of a block, tagged with its 1-based index.
///
/// Serialized form: `"index:v1 v2 … vk"`.
#[derive(Debug, Clone, PartialEq)]
pub struct DataFragment {
    pub index: usize,
    pub values: Vec<f64>,
}

impl DataFragment {
    /// Parse the `"index:v1 v2 …"` form.
    pub fn parse(text: &str) -> Result<Self, CodecError> {
        let line = text.trim_end_matches('\n');
        let (index_part, values_part) = line
            .split_once(':')
            .ok_or_else(|| CodecError::Malformed(format!("missing ':' in {line:?}")))?;
        let index: usize = index_part
            .trim()
            .parse()
            .map_err(|_| CodecError::Malformed(format!("bad index {index_part:?}")))?;
        if index == 0 || index > FRAGMENT_COUNT {
            return Err(CodecError::Malformed(format!("index {index} out of range")));
        }

        let mut values = Vec::with_capacity(FRAGMENT_LEN);
        for token in values_part.split_whitespace() {
            let value: f64 = token
                .parse()
                .map_err(|_| CodecError::Malformed(format!("bad value {token:?}")))?;
            values.push(value);
        }
        if values.len() != FRAGMENT_LEN {
            return Err(CodecError::Malformed(format!(
                "fragment carries {} values, expected {FRAGMENT_LEN}",
                values.len()
            )));
        }
        Ok(DataFragment { index, values })
    }
}

impl fmt::Display for DataFragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.index)?;
        for (i, value) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{value}")?;
        }
        Ok(())
    }
}

/// A complete dispersed value: the padded source vector together with all
/// `FRAGMENT_COUNT` fragments derived from it.
///
/// A block can be rebuilt from any `DECODE_THRESHOLD` of its fragments; the
/// remaining fragments are regenerated by re-encoding, so every constructor
/// yields the same three equivalent views.
#[derive(Debug, Clone, PartialEq)]
pub struct DataBlock {
    original: Vec<f64>,
    fragments: Vec<DataFragment>,
}

impl DataBlock {
    /// Encode a source text of at most [`BLOCK_LEN`] bytes, padding with
    /// zeros. With `sanity_check` the first `DECODE_THRESHOLD` fragments are
    /// decoded again and creation fails unless the round trip is exact.
    pub fn from_text(input: &str, sanity_check: bool) -> Result<Self, CodecError> {
        if input.len() > BLOCK_LEN {
            return Err(CodecError::ValueTooLong(input.len()));
        }

        let mut original = Vec::with_capacity(BLOCK_LEN);
        for c in input.chars() {
            let code = c as u32;
            if code >= MAX_CODEPOINT {
                return Err(CodecError::UnencodableChar(c));
            }
            original.push(code as f64);
        }
        original.resize(BLOCK_LEN, 0.0);

        let fragments = fragments_from_rows(encode(&original));

        if sanity_check {
            let rows: Vec<Vec<f64>> = fragments
                .iter()
                .take(DECODE_THRESHOLD)
                .map(|frag| frag.values.clone())
                .collect();
            let indices: Vec<usize> = (1..=DECODE_THRESHOLD).collect();
            if decode(&rows, &indices)? != original {
                return Err(CodecError::RoundTripMismatch);
            }
        }

        Ok(DataBlock { original, fragments })
    }

    /// Rebuild a block from its multi-line serialized form. Only the first
    /// `DECODE_THRESHOLD` lines are needed.
    pub fn from_serialized(text: &str) -> Result<Self, CodecError> {
        let fragments = text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(DataFragment::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_fragments(&fragments)
    }

    /// Rebuild a block from at least `DECODE_THRESHOLD` indexed fragments.
    pub fn from_fragments(fragments: &[DataFragment]) -> Result<Self, CodecError> {
        if fragments.len() < DECODE_THRESHOLD {
            return Err(CodecError::TooFewFragments(fragments.len()));
        }

        let rows: Vec<Vec<f64>> = fragments.iter().map(|frag| frag.values.clone()).collect();
        let indices: Vec<usize> = fragments.iter().map(|frag| frag.index).collect();
        let original = decode(&rows, &indices)?;
        let fragments = fragments_from_rows(encode(&original));
        Ok(DataBlock { original, fragments })
    }

    /// All `FRAGMENT_COUNT` fragments of this block.
    pub fn fragments(&self) -> &[DataFragment] {
        &self.fragments
    }

    /// Recover the source text: codes up to the first zero pad.
    pub fn decode(&self) -> String {
        self.original
            .iter()
            .take_while(|&&code| code != 0.0)
            .filter_map(|&code| char::from_u32(code as u32))
            .collect()
    }
}

impl fmt::Display for DataBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, fragment) in self.fragments.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{fragment}")?;
        }
        Ok(())
    }
}

fn fragments_from_rows(rows: Vec<Vec<f64>>) -> Vec<DataFragment> {
    rows.into_iter()
        .enumerate()
        .map(|(i, values)| DataFragment { index: i + 1, values })
        .collect()
}
