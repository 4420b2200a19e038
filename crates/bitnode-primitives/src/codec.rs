//! Consensus encoding of blocks and transactions, shared with the on-disk records.
//!
//! All integers are little-endian. Variable-length integers use the compact size form:
//! a single byte below `0xFD`, otherwise a marker byte (`0xFD`, `0xFE`, `0xFF`) followed
//! by a 2, 4 or 8 byte integer. The [`Writer`] always picks the smallest form, while the
//! [`Reader`] accepts any of them.

use crate::hash::Hash256;

/// Upper bound of the elements preallocated for a decoded vector.
///
/// The declared length of a vector comes from untrusted input, the actual allocation
/// grows as the elements are decoded.
const MAX_VEC_PREALLOC: usize = 4096;

/// Errors that can occur while decoding.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("Unexpected end of input: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEnd { needed: usize, remaining: usize },
    #[error("Vector of {requested} elements exceeds the remaining input")]
    OversizedVector { requested: u64 },
    #[error("Superfluous witness record")]
    SuperfluousWitnessRecord,
    #[error("Unknown transaction optional data: {0:#04x}")]
    UnknownOptionalData(u8),
    #[error("{0} trailing bytes after the decoded value")]
    TrailingBytes(usize),
    #[error("Invalid length, expected {expected}, got {got}")]
    InvalidLength { expected: usize, got: usize },
    #[error(transparent)]
    Hex(#[from] hex::FromHexError),
}

/// Types that can be written into a [`Writer`].
pub trait Encodable {
    fn encode(&self, writer: &mut Writer);
}

/// Types that can be read from a [`Reader`].
pub trait Decodable: Sized {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError>;
}

/// Growable output buffer with a fluent interface.
#[derive(Debug, Default, Clone)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_i32(&mut self, value: i32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_i64(&mut self, value: i64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Writes `value` using the smallest compact size form.
    pub fn write_var_int(&mut self, value: u64) -> &mut Self {
        match value {
            0..=0xFC => self.write_u8(value as u8),
            0xFD..=0xFFFF => self.write_u8(0xFD).write_u16(value as u16),
            0x10000..=0xFFFF_FFFF => self.write_u8(0xFE).write_u32(value as u32),
            _ => self.write_u8(0xFF).write_u64(value),
        }
    }

    pub fn write_hash(&mut self, hash: &Hash256) -> &mut Self {
        self.buf.extend_from_slice(hash.as_bytes());
        self
    }

    /// Writes raw bytes without a length prefix.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Writes a length-prefixed byte string.
    pub fn write_var_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.write_var_int(bytes.len() as u64);
        self.write_bytes(bytes)
    }

    /// Writes a length-prefixed vector using each item's own [`Encodable`] impl.
    pub fn write_vec<T: Encodable>(&mut self, items: &[T]) -> &mut Self {
        self.write_vec_with(items, |writer, item| item.encode(writer))
    }

    /// Writes a length-prefixed vector, delegating each element to `f`.
    pub fn write_vec_with<T>(&mut self, items: &[T], mut f: impl FnMut(&mut Self, &T)) -> &mut Self {
        self.write_var_int(items.len() as u64);
        for item in items {
            f(self, item);
        }
        self
    }

    pub fn write<T: Encodable + ?Sized>(&mut self, value: &T) -> &mut Self {
        value.encode(self);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a byte slice.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Number of bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Consumes `len` bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let remaining = self.remaining();
        if len > remaining {
            return Err(DecodeError::UnexpectedEnd {
                needed: len,
                remaining,
            });
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.read_bytes(N)?);
        Ok(array)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        self.read_array().map(u16::from_le_bytes)
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        self.read_array().map(u32::from_le_bytes)
    }

    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        self.read_array().map(i32::from_le_bytes)
    }

    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        self.read_array().map(u64::from_le_bytes)
    }

    pub fn read_i64(&mut self) -> Result<i64, DecodeError> {
        self.read_array().map(i64::from_le_bytes)
    }

    /// Reads a compact size integer.
    ///
    /// Non-minimal forms (e.g. `5` in the 3-byte form) are accepted.
    pub fn read_var_int(&mut self) -> Result<u64, DecodeError> {
        match self.read_u8()? {
            0xFD => self.read_u16().map(u64::from),
            0xFE => self.read_u32().map(u64::from),
            0xFF => self.read_u64(),
            n => Ok(u64::from(n)),
        }
    }

    pub fn read_hash(&mut self) -> Result<Hash256, DecodeError> {
        self.read_array().map(Hash256::from_bytes)
    }

    /// Reads a length-prefixed byte string.
    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_var_int()?;
        let remaining = self.remaining();
        if len > remaining as u64 {
            return Err(DecodeError::UnexpectedEnd {
                needed: len.try_into().unwrap_or(usize::MAX),
                remaining,
            });
        }
        self.read_bytes(len as usize).map(<[u8]>::to_vec)
    }

    /// Reads a length-prefixed vector using each item's own [`Decodable`] impl.
    pub fn read_vec<T: Decodable>(&mut self) -> Result<Vec<T>, DecodeError> {
        self.read_vec_with(T::decode)
    }

    /// Reads a length-prefixed vector, delegating each element to `f`.
    pub fn read_vec_with<T>(
        &mut self,
        mut f: impl FnMut(&mut Self) -> Result<T, DecodeError>,
    ) -> Result<Vec<T>, DecodeError> {
        let len = self.read_var_int()?;
        // Every element occupies at least one byte.
        if len > self.remaining() as u64 {
            return Err(DecodeError::OversizedVector { requested: len });
        }
        let len = len as usize;
        let mut items = Vec::with_capacity(len.min(MAX_VEC_PREALLOC));
        for _ in 0..len {
            items.push(f(self)?);
        }
        Ok(items)
    }

    pub fn read<T: Decodable>(&mut self) -> Result<T, DecodeError> {
        T::decode(self)
    }
}

/// Encodes `value` into a new byte vector.
pub fn serialize<T: Encodable + ?Sized>(value: &T) -> Vec<u8> {
    let mut writer = Writer::new();
    value.encode(&mut writer);
    writer.into_inner()
}

/// Decodes a value that must span the whole input.
pub fn deserialize<T: Decodable>(data: &[u8]) -> Result<T, DecodeError> {
    let (value, consumed) = deserialize_partial(data)?;
    if consumed != data.len() {
        return Err(DecodeError::TrailingBytes(data.len() - consumed));
    }
    Ok(value)
}

/// Decodes a value from the front of `data`, returning it with the number of bytes consumed.
pub fn deserialize_partial<T: Decodable>(data: &[u8]) -> Result<(T, usize), DecodeError> {
    let mut reader = Reader::new(data);
    let value = T::decode(&mut reader)?;
    Ok((value, reader.position()))
}

/// Returns the encoded size of a compact size integer.
pub fn var_int_size(value: u64) -> usize {
    match value {
        0..=0xFC => 1,
        0xFD..=0xFFFF => 3,
        0x10000..=0xFFFF_FFFF => 5,
        _ => 9,
    }
}

impl Encodable for u8 {
    fn encode(&self, writer: &mut Writer) {
        writer.write_u8(*self);
    }
}

impl Decodable for u8 {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        reader.read_u8()
    }
}

impl Encodable for u32 {
    fn encode(&self, writer: &mut Writer) {
        writer.write_u32(*self);
    }
}

impl Decodable for u32 {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        reader.read_u32()
    }
}

impl Encodable for u64 {
    fn encode(&self, writer: &mut Writer) {
        writer.write_u64(*self);
    }
}

impl Decodable for u64 {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        reader.read_u64()
    }
}

impl Encodable for Hash256 {
    fn encode(&self, writer: &mut Writer) {
        writer.write_hash(self);
    }
}

impl Decodable for Hash256 {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        reader.read_hash()
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode(&self, writer: &mut Writer) {
        writer.write_vec(self);
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        reader.read_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn var_int_uses_smallest_form() {
        let cases: [(u64, usize); 7] = [
            (0, 1),
            (0xFC, 1),
            (0xFD, 3),
            (0xFFFF, 3),
            (0x10000, 5),
            (0xFFFF_FFFF, 5),
            (0x1_0000_0000, 9),
        ];

        for (value, size) in cases {
            let mut writer = Writer::new();
            writer.write_var_int(value);
            assert_eq!(writer.len(), size, "encoded size of {value:#x}");
            assert_eq!(var_int_size(value), size);

            let mut reader = Reader::new(writer.as_bytes());
            assert_eq!(reader.read_var_int().unwrap(), value);
            assert_eq!(reader.position(), size);
        }
    }

    #[test]
    fn var_int_accepts_non_minimal_forms() {
        let mut reader = Reader::new(&[0xFD, 0xFC, 0x00]);
        assert_eq!(reader.read_var_int().unwrap(), 0xFC);
        assert_eq!(reader.position(), 3);

        let mut reader = Reader::new(&[0xFF, 0x05, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(reader.read_var_int().unwrap(), 5);
        assert_eq!(reader.position(), 9);
    }

    #[test]
    fn short_input_is_an_error() {
        let mut reader = Reader::new(&[0x01, 0x02]);
        assert_eq!(
            reader.read_u32(),
            Err(DecodeError::UnexpectedEnd {
                needed: 4,
                remaining: 2
            })
        );

        let mut reader = Reader::new(&[0xFE, 0x01]);
        assert!(matches!(
            reader.read_var_int(),
            Err(DecodeError::UnexpectedEnd { .. })
        ));

        // Declared string length larger than the input.
        let mut reader = Reader::new(&[0x05, 0xAA]);
        assert!(reader.read_var_bytes().is_err());
    }

    #[test]
    fn oversized_vector_is_rejected_before_allocation() {
        let mut writer = Writer::new();
        writer.write_var_int(u64::MAX).write_u8(0);
        let mut reader = Reader::new(writer.as_bytes());
        assert_eq!(
            reader.read_vec::<u8>(),
            Err(DecodeError::OversizedVector {
                requested: u64::MAX
            })
        );
    }

    #[test]
    fn vectors_with_custom_element_codec() {
        let items = vec![(1u32, 2u8), (3, 4)];
        let mut writer = Writer::new();
        writer.write_vec_with(&items, |w, (a, b)| {
            w.write_u32(*a).write_u8(*b);
        });

        let bytes = writer.into_inner();
        assert_eq!(bytes.len(), 1 + 2 * 5);

        let mut reader = Reader::new(&bytes);
        let decoded = reader
            .read_vec_with(|r| Ok((r.read_u32()?, r.read_u8()?)))
            .unwrap();
        assert_eq!(decoded, items);
        assert!(reader.is_empty());
    }

    #[test]
    fn deserialize_rejects_trailing_bytes() {
        assert_eq!(deserialize::<u32>(&[1, 0, 0, 0]), Ok(1));
        assert_eq!(
            deserialize::<u32>(&[1, 0, 0, 0, 9]),
            Err(DecodeError::TrailingBytes(1))
        );
        assert_eq!(deserialize_partial::<u32>(&[1, 0, 0, 0, 9]), Ok((1, 4)));
    }
}
