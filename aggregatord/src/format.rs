//! Typed decoding for `/data`: big-endian integers taken from consecutive
//! queued bytes in arrival order.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Binary,
}

impl DataFormat {
    /// Bytes consumed per output value (`binary` streams single bytes).
    pub fn value_size(&self) -> usize {
        match self {
            DataFormat::Int8 | DataFormat::Uint8 | DataFormat::Binary => 1,
            DataFormat::Int16 | DataFormat::Uint16 => 2,
            DataFormat::Int32 | DataFormat::Uint32 => 4,
            DataFormat::Int64 | DataFormat::Uint64 => 8,
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, DataFormat::Binary)
    }
}

/// Decode up to `limit` big-endian values from `bytes`; a trailing partial
/// value is discarded.
pub fn decode_values(bytes: &[u8], format: DataFormat, limit: usize) -> Vec<Value> {
    let size = format.value_size();
    bytes
        .chunks_exact(size)
        .take(limit)
        .map(|chunk| match format {
            DataFormat::Int8 => Value::from(chunk[0] as i8),
            DataFormat::Uint8 | DataFormat::Binary => Value::from(chunk[0]),
            DataFormat::Int16 => Value::from(i16::from_be_bytes([chunk[0], chunk[1]])),
            DataFormat::Uint16 => Value::from(u16::from_be_bytes([chunk[0], chunk[1]])),
            DataFormat::Int32 => {
                Value::from(i32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            }
            DataFormat::Uint32 => {
                Value::from(u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            }
            DataFormat::Int64 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(chunk);
                Value::from(i64::from_be_bytes(buf))
            }
            DataFormat::Uint64 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(chunk);
                Value::from(u64::from_be_bytes(buf))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uint16_values_are_big_endian_across_the_block() {
        let bytes: Vec<u8> = (1..=16u8).collect();
        let values = decode_values(&bytes, DataFormat::Uint16, 4);
        assert_eq!(
            values,
            vec![
                Value::from(0x0102u16),
                Value::from(0x0304u16),
                Value::from(0x0506u16),
                Value::from(0x0708u16),
            ]
        );
    }

    #[test]
    fn signed_formats_interpret_the_top_bit() {
        assert_eq!(
            decode_values(&[0xFF], DataFormat::Int8, 1),
            vec![Value::from(-1i8)]
        );
        assert_eq!(
            decode_values(&[0x80, 0x00], DataFormat::Int16, 1),
            vec![Value::from(i16::MIN)]
        );
    }

    #[test]
    fn uint64_survives_json_number_range() {
        let bytes = u64::MAX.to_be_bytes();
        assert_eq!(
            decode_values(&bytes, DataFormat::Uint64, 1),
            vec![Value::from(u64::MAX)]
        );
    }

    #[test]
    fn trailing_partial_value_is_discarded() {
        let values = decode_values(&[1, 2, 3], DataFormat::Uint16, 10);
        assert_eq!(values.len(), 1);
    }

    #[test]
    fn limit_caps_the_output() {
        let bytes = [0u8; 64];
        assert_eq!(decode_values(&bytes, DataFormat::Uint32, 3).len(), 3);
    }

    #[test]
    fn format_names_deserialize_lowercase() {
        let f: DataFormat = serde_json::from_str("\"uint16\"").unwrap();
        assert_eq!(f, DataFormat::Uint16);
        assert!(serde_json::from_str::<DataFormat>("\"virtio\"").is_err());
    }
}
