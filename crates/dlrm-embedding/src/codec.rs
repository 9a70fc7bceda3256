//! Row-wise affine quantization of embedding tables.
//!
//! Every row carries its own scale and bias, so a value `v` is stored as
//! the code `round((v - bias) / scale)` and read back as
//! `code * scale + bias`. The reconstruction error of any element is at most
//! `scale / 2`.
//!
//! # Row layouts
//!
//! | encoding | codes | trailer |
//! |---|---|---|
//! | int8 | `cols` bytes | f32 scale, f32 bias (little endian) |
//! | int4 | `ceil(cols / 2)` bytes, low nibble first | f16 scale, f16 bias (little endian) |
//!
//! # Example
//!
//! ```
//! use dlrm_embedding::codec::{dequantize_row, quantize, row_scale};
//! use dlrm_embedding::table::EmbeddingTable;
//!
//! let table = EmbeddingTable::from_weights(1, 4, vec![0.1, -0.5, 0.25, 0.0]).unwrap();
//! let packed = quantize(&table, 8).unwrap();
//! let row = dequantize_row(&packed, 0).unwrap();
//! let step = row_scale(&packed, 0).unwrap();
//! for (orig, decoded) in table.row(0).unwrap().iter().zip(&row) {
//!     assert!((orig - decoded).abs() <= step / 2.0 + 1e-6);
//! }
//! ```

use half::f16;
use tracing::debug;

use crate::error::{EmbeddingError, Result};
use crate::table::{EmbeddingTable, TableStorage};

/// Scale and bias of one quantized row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RowParams {
    /// Quantization step.
    pub scale: f32,
    /// Value of code 0.
    pub bias: f32,
}

/// Encoding and decoding of a single packed row.
pub trait RowCodec: Send + Sync {
    /// Bits per code.
    fn bits(&self) -> u32;

    /// Packed bytes per row of width `cols`, trailer included.
    fn row_bytes(&self, cols: usize) -> usize;

    /// Chooses scale and bias for `row`, or `None` if the row holds values
    /// that cannot be represented.
    fn params(&self, row: &[f32]) -> Option<RowParams>;

    /// Appends the packed form of `row` to `out`.
    fn encode(&self, row: &[f32], params: RowParams, out: &mut Vec<u8>);

    /// Reads the trailer of a packed row of width `cols`.
    fn read_params(&self, packed: &[u8], cols: usize) -> RowParams;

    /// Decodes a packed row and adds it into `out`.
    fn accumulate(&self, packed: &[u8], out: &mut [f32]);
}

fn min_max(row: &[f32]) -> Option<(f32, f32)> {
    if row.is_empty() {
        return Some((0.0, 0.0));
    }
    let min = row.iter().copied().fold(f32::INFINITY, f32::min);
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if min.is_finite() && max.is_finite() && row.iter().all(|v| v.is_finite()) {
        Some((min, max))
    } else {
        None
    }
}

/// 8-bit codes with an f32 scale and bias per row.
#[derive(Debug, Clone, Copy, Default)]
pub struct Int8RowCodec;

impl Int8RowCodec {
    const LEVELS: f32 = 255.0;
}

impl RowCodec for Int8RowCodec {
    fn bits(&self) -> u32 {
        8
    }

    fn row_bytes(&self, cols: usize) -> usize {
        cols + 8
    }

    fn params(&self, row: &[f32]) -> Option<RowParams> {
        let (min, max) = min_max(row)?;
        let range = max - min;
        if !range.is_finite() {
            return None;
        }
        let scale = if range > 0.0 { range / Self::LEVELS } else { 1.0 };
        Some(RowParams { scale, bias: min })
    }

    fn encode(&self, row: &[f32], params: RowParams, out: &mut Vec<u8>) {
        for &v in row {
            let code = ((v - params.bias) / params.scale)
                .round()
                .clamp(0.0, Self::LEVELS);
            out.push(code as u8);
        }
        out.extend_from_slice(&params.scale.to_le_bytes());
        out.extend_from_slice(&params.bias.to_le_bytes());
    }

    fn read_params(&self, packed: &[u8], cols: usize) -> RowParams {
        let mut scale = [0u8; 4];
        let mut bias = [0u8; 4];
        scale.copy_from_slice(&packed[cols..cols + 4]);
        bias.copy_from_slice(&packed[cols + 4..cols + 8]);
        RowParams {
            scale: f32::from_le_bytes(scale),
            bias: f32::from_le_bytes(bias),
        }
    }

    fn accumulate(&self, packed: &[u8], out: &mut [f32]) {
        let cols = out.len();
        let p = self.read_params(packed, cols);
        for (o, &code) in out.iter_mut().zip(&packed[..cols]) {
            *o += code as f32 * p.scale + p.bias;
        }
    }
}

/// 4-bit codes, two per byte, with an f16 scale and bias per row.
#[derive(Debug, Clone, Copy, Default)]
pub struct Int4RowCodec;

impl Int4RowCodec {
    const LEVELS: f32 = 15.0;
}

/// Nearest f16 that is `>= x` (when `up`) or `<= x`.
fn f16_toward(x: f32, up: bool) -> f16 {
    let h = f16::from_f32(x);
    let v = h.to_f32();
    if !v.is_finite() || (up && v >= x) || (!up && v <= x) {
        return h;
    }
    if v == 0.0 {
        return if up {
            f16::from_bits(0x0001)
        } else {
            f16::from_bits(0x8001)
        };
    }
    // Adjacent f16 values differ by one in their bit pattern; the sign
    // decides which direction increments move.
    let bits = h.to_bits();
    let positive = bits & 0x8000 == 0;
    if positive == up {
        f16::from_bits(bits + 1)
    } else {
        f16::from_bits(bits - 1)
    }
}

impl RowCodec for Int4RowCodec {
    fn bits(&self) -> u32 {
        4
    }

    fn row_bytes(&self, cols: usize) -> usize {
        cols.div_ceil(2) + 4
    }

    fn params(&self, row: &[f32]) -> Option<RowParams> {
        let (min, max) = min_max(row)?;
        let bias = f16_toward(min, false).to_f32();
        if !bias.is_finite() {
            return None;
        }
        let step = (max - bias) / Self::LEVELS;
        let scale = if step > 0.0 {
            f16_toward(step, true).to_f32()
        } else {
            1.0
        };
        if !scale.is_finite() {
            return None;
        }
        Some(RowParams { scale, bias })
    }

    fn encode(&self, row: &[f32], params: RowParams, out: &mut Vec<u8>) {
        let code = |v: f32| {
            ((v - params.bias) / params.scale)
                .round()
                .clamp(0.0, Self::LEVELS) as u8
        };
        for pair in row.chunks(2) {
            let lo = code(pair[0]);
            let hi = pair.get(1).map(|&v| code(v)).unwrap_or(0);
            out.push(lo | (hi << 4));
        }
        out.extend_from_slice(&f16::from_f32(params.scale).to_le_bytes());
        out.extend_from_slice(&f16::from_f32(params.bias).to_le_bytes());
    }

    fn read_params(&self, packed: &[u8], cols: usize) -> RowParams {
        let at = cols.div_ceil(2);
        let scale = f16::from_le_bytes([packed[at], packed[at + 1]]);
        let bias = f16::from_le_bytes([packed[at + 2], packed[at + 3]]);
        RowParams {
            scale: scale.to_f32(),
            bias: bias.to_f32(),
        }
    }

    fn accumulate(&self, packed: &[u8], out: &mut [f32]) {
        let cols = out.len();
        let p = self.read_params(packed, cols);
        for (k, o) in out.iter_mut().enumerate() {
            let byte = packed[k / 2];
            let code = if k % 2 == 0 { byte & 0x0f } else { byte >> 4 };
            *o += code as f32 * p.scale + p.bias;
        }
    }
}

fn codec_for(bits: u32) -> Result<(&'static dyn RowCodec, fn(Vec<u8>) -> TableStorage)> {
    match bits {
        8 => Ok((
            &Int8RowCodec as &'static dyn RowCodec,
            TableStorage::Int8 as fn(Vec<u8>) -> TableStorage,
        )),
        4 => Ok((
            &Int4RowCodec as &'static dyn RowCodec,
            TableStorage::Int4 as fn(Vec<u8>) -> TableStorage,
        )),
        other => Err(EmbeddingError::UnsupportedBitWidth { bits: other }),
    }
}

/// Quantizes a full-precision table to `bits` (4 or 8), returning a new table.
///
/// The input table is never modified.
///
/// # Errors
///
/// - [`EmbeddingError::UnsupportedBitWidth`] if `bits` is not 4 or 8
/// - [`EmbeddingError::Config`] if the table is already quantized
/// - [`EmbeddingError::NonFinite`] if a row cannot be represented
pub fn quantize(table: &EmbeddingTable, bits: u32) -> Result<EmbeddingTable> {
    let (codec, wrap) = codec_for(bits)?;
    let weights = table.weights().ok_or_else(|| EmbeddingError::Config {
        message: format!("table is already quantized as {}", table.encoding()),
    })?;

    let cols = table.cols();
    let mut packed = Vec::with_capacity(table.rows() * codec.row_bytes(cols));
    for (r, row) in weights.chunks(cols.max(1)).take(table.rows()).enumerate() {
        let params = codec.params(row).ok_or(EmbeddingError::NonFinite { row: r })?;
        codec.encode(row, params, &mut packed);
    }
    if cols == 0 {
        for _ in 0..table.rows() {
            codec.encode(&[], RowParams { scale: 1.0, bias: 0.0 }, &mut packed);
        }
    }
    debug!(
        rows = table.rows(),
        cols,
        bits,
        bytes = packed.len(),
        "quantized embedding table"
    );
    Ok(EmbeddingTable::from_packed(table.rows(), cols, wrap(packed)))
}

/// Reconstructs row `index` of a table in f32.
///
/// # Errors
///
/// Returns [`EmbeddingError::RowOutOfBounds`] if `index >= rows`.
pub fn dequantize_row(table: &EmbeddingTable, index: usize) -> Result<Vec<f32>> {
    table.row(index)
}

/// Quantization step of row `index`; 0 for full-precision tables.
pub fn row_scale(table: &EmbeddingTable, index: usize) -> Result<f32> {
    if index >= table.rows() {
        return Err(EmbeddingError::RowOutOfBounds {
            index,
            rows: table.rows(),
        });
    }
    let cols = table.cols();
    let scale = match table.storage() {
        TableStorage::Int8(bytes) => {
            let stride = Int8RowCodec.row_bytes(cols);
            Int8RowCodec
                .read_params(&bytes[index * stride..(index + 1) * stride], cols)
                .scale
        }
        TableStorage::Int4(bytes) => {
            let stride = Int4RowCodec.row_bytes(cols);
            Int4RowCodec
                .read_params(&bytes[index * stride..(index + 1) * stride], cols)
                .scale
        }
        TableStorage::Full(_) => 0.0,
    };
    Ok(scale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Encoding;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_table(rows: usize, cols: usize, seed: u64) -> EmbeddingTable {
        let mut rng = StdRng::seed_from_u64(seed);
        let w = (0..rows * cols).map(|_| rng.gen_range(-2.0..2.0)).collect();
        EmbeddingTable::from_weights(rows, cols, w).unwrap()
    }

    fn assert_within_half_step(full: &EmbeddingTable, packed: &EmbeddingTable) {
        for r in 0..full.rows() {
            let step = row_scale(packed, r).unwrap();
            let orig = full.row(r).unwrap();
            let back = dequantize_row(packed, r).unwrap();
            for (a, b) in orig.iter().zip(&back) {
                assert!(
                    (a - b).abs() <= step / 2.0 + 1e-5,
                    "row {r}: |{a} - {b}| > {step}/2"
                );
            }
        }
    }

    #[test]
    fn test_int8_error_bound() {
        let table = random_table(16, 13, 1);
        let packed = quantize(&table, 8).unwrap();
        assert_eq!(packed.encoding(), Encoding::Int8);
        assert_eq!(packed.byte_size(), 16 * (13 + 8));
        assert_within_half_step(&table, &packed);
    }

    #[test]
    fn test_int4_error_bound_odd_width() {
        let table = random_table(16, 7, 2);
        let packed = quantize(&table, 4).unwrap();
        assert_eq!(packed.encoding(), Encoding::Int4);
        assert_eq!(packed.byte_size(), 16 * (4 + 4));
        assert_within_half_step(&table, &packed);
    }

    #[test]
    fn test_constant_row_is_exact() {
        let table = EmbeddingTable::from_weights(1, 4, vec![0.5; 4]).unwrap();
        for bits in [4, 8] {
            let packed = quantize(&table, bits).unwrap();
            assert_eq!(dequantize_row(&packed, 0).unwrap(), vec![0.5; 4]);
        }
    }

    #[test]
    fn test_unsupported_bits_leave_table_untouched() {
        let table = random_table(4, 4, 3);
        let before = table.clone();
        for bits in [0, 2, 16, 32] {
            assert!(matches!(
                quantize(&table, bits),
                Err(EmbeddingError::UnsupportedBitWidth { .. })
            ));
        }
        assert_eq!(table, before);
    }

    #[test]
    fn test_requantize_rejected() {
        let packed = quantize(&random_table(2, 2, 4), 8).unwrap();
        assert!(matches!(
            quantize(&packed, 4),
            Err(EmbeddingError::Config { .. })
        ));
    }

    #[test]
    fn test_non_finite_row() {
        let table = EmbeddingTable::from_weights(2, 2, vec![0.0, 1.0, f32::NAN, 0.0]).unwrap();
        assert!(matches!(
            quantize(&table, 8),
            Err(EmbeddingError::NonFinite { row: 1 })
        ));
    }

    #[test]
    fn test_f16_toward() {
        for &x in &[0.1f32, -0.1, 1.0e-3, -3.3, 0.0] {
            assert!(f16_toward(x, true).to_f32() >= x);
            assert!(f16_toward(x, false).to_f32() <= x);
        }
    }

    #[test]
    fn test_nibble_order() {
        let table = EmbeddingTable::from_weights(1, 3, vec![0.0, 15.0, 0.0]).unwrap();
        let packed = quantize(&table, 4).unwrap();
        match packed.storage() {
            TableStorage::Int4(bytes) => {
                assert_eq!(bytes[0], 0xf0);
                assert_eq!(bytes[1], 0x00);
            }
            other => panic!("unexpected storage {other:?}"),
        }
    }
}
