//! Minimal AIDL parcel reader/writer for intercepted call payloads.
//!
//! Layout conventions (little-endian, 4-byte aligned):
//! - nullable byte arrays: `i32` length (`-1` = null), bytes, zero padding
//! - nullable strings: `i32` UTF-16 unit count (`-1` = null), units, NUL unit, padding
//! - typed parcelables: `i32` presence marker, then a self-describing body
//!   (structured parcelables lead with an `i32` size that includes itself)
//! - binder references: `u64` handle, `0` = null

use thiserror::Error;

const INTERFACE_HEADER_SYST: i32 = 0x5359_5354;
const UNSET_WORK_SOURCE: i32 = -1;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParcelError {
    #[error("parcel truncated: need {needed} bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },
    #[error("invalid length {0}")]
    InvalidLength(i32),
    #[error("invalid UTF-16 string")]
    InvalidString,
    #[error("interface mismatch: expected {expected}, found {found}")]
    InterfaceMismatch { expected: String, found: String },
    #[error("remote exception code {0}")]
    RemoteException(i32),
    #[error("unknown union tag {0}")]
    UnknownUnionTag(i32),
    #[error("missing required field {0}")]
    Missing(&'static str),
    #[error("malformed certificate chain: {0}")]
    MalformedCertificate(&'static str),
}

/// A value that can be flattened into a parcel body.
pub trait Parcelable: Sized {
    /// Structured parcelables carry a size header; unions do not.
    const SIZED: bool = true;

    fn write_body(&self, out: &mut ParcelWriter);
    fn read_body(input: &mut ParcelReader<'_>) -> Result<Self, ParcelError>;
}

#[derive(Clone, Debug, Default)]
pub struct ParcelWriter {
    buf: Vec<u8>,
}

impl ParcelWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply parcel that starts with a "no exception" header.
    pub fn reply() -> Self {
        let mut out = Self::new();
        out.write_no_exception();
        out
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_i32(value as i32);
    }

    pub fn write_no_exception(&mut self) {
        self.write_i32(0);
    }

    pub fn write_binder(&mut self, handle: Option<u64>) {
        self.buf
            .extend_from_slice(&handle.unwrap_or(0).to_le_bytes());
    }

    pub fn write_byte_array(&mut self, bytes: Option<&[u8]>) {
        match bytes {
            Some(bytes) => {
                self.write_i32(bytes.len() as i32);
                self.buf.extend_from_slice(bytes);
                self.pad();
            }
            None => self.write_i32(-1),
        }
    }

    pub fn write_string(&mut self, value: Option<&str>) {
        match value {
            Some(value) => {
                let units: Vec<u16> = value.encode_utf16().collect();
                self.write_i32(units.len() as i32);
                for unit in units.iter().chain(std::iter::once(&0u16)) {
                    self.buf.extend_from_slice(&unit.to_le_bytes());
                }
                self.pad();
            }
            None => self.write_i32(-1),
        }
    }

    pub fn write_interface_token(&mut self, descriptor: &str) {
        self.write_i32(0);
        self.write_i32(UNSET_WORK_SOURCE);
        self.write_i32(INTERFACE_HEADER_SYST);
        self.write_string(Some(descriptor));
    }

    pub fn write_parcelable<T: Parcelable>(&mut self, value: Option<&T>) {
        let Some(value) = value else {
            self.write_i32(0);
            return;
        };
        self.write_i32(1);
        if T::SIZED {
            let start = self.buf.len();
            self.write_i32(0);
            value.write_body(self);
            let size = (self.buf.len() - start) as i32;
            self.buf[start..start + 4].copy_from_slice(&size.to_le_bytes());
        } else {
            value.write_body(self);
        }
    }

    pub fn write_typed_array<T: Parcelable>(&mut self, values: Option<&[T]>) {
        match values {
            Some(values) => {
                self.write_i32(values.len() as i32);
                for value in values {
                    self.write_parcelable(Some(value));
                }
            }
            None => self.write_i32(-1),
        }
    }

    fn pad(&mut self) {
        while self.buf.len() % 4 != 0 {
            self.buf.push(0);
        }
    }
}

#[derive(Clone, Debug)]
pub struct ParcelReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ParcelReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ParcelError> {
        if len > self.remaining() {
            return Err(ParcelError::Truncated {
                offset: self.pos,
                needed: len,
            });
        }
        let out = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn skip_padding(&mut self, len: usize) -> Result<(), ParcelError> {
        let padded = (len + 3) & !3;
        self.take(padded - len).map(|_| ())
    }

    pub fn read_i32(&mut self) -> Result<i32, ParcelError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i64(&mut self) -> Result<i64, ParcelError> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(i64::from_le_bytes(buf))
    }

    pub fn read_bool(&mut self) -> Result<bool, ParcelError> {
        Ok(self.read_i32()? != 0)
    }

    pub fn read_binder(&mut self) -> Result<Option<u64>, ParcelError> {
        let handle = self.read_i64()? as u64;
        Ok((handle != 0).then_some(handle))
    }

    /// Reads the reply exception header; any non-zero code is an error.
    pub fn read_exception(&mut self) -> Result<(), ParcelError> {
        match self.read_i32()? {
            0 => Ok(()),
            code => Err(ParcelError::RemoteException(code)),
        }
    }

    pub fn read_byte_array(&mut self) -> Result<Option<Vec<u8>>, ParcelError> {
        let len = self.read_i32()?;
        if len == -1 {
            return Ok(None);
        }
        if len < 0 {
            return Err(ParcelError::InvalidLength(len));
        }
        let len = len as usize;
        let bytes = self.take(len)?.to_vec();
        self.skip_padding(len)?;
        Ok(Some(bytes))
    }

    pub fn read_string(&mut self) -> Result<Option<String>, ParcelError> {
        let units = self.read_i32()?;
        if units == -1 {
            return Ok(None);
        }
        if units < 0 {
            return Err(ParcelError::InvalidLength(units));
        }
        let byte_len = (units as usize + 1) * 2;
        let raw = self.take(byte_len)?;
        self.skip_padding(byte_len)?;
        let decoded: Vec<u16> = raw
            .chunks_exact(2)
            .take(units as usize)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        String::from_utf16(&decoded)
            .map(Some)
            .map_err(|_| ParcelError::InvalidString)
    }

    pub fn enforce_interface(&mut self, descriptor: &str) -> Result<(), ParcelError> {
        let _strict_mode = self.read_i32()?;
        let _work_source = self.read_i32()?;
        let _header = self.read_i32()?;
        let found = self.read_string()?.unwrap_or_default();
        if found != descriptor {
            return Err(ParcelError::InterfaceMismatch {
                expected: descriptor.to_string(),
                found,
            });
        }
        Ok(())
    }

    pub fn read_parcelable<T: Parcelable>(&mut self) -> Result<Option<T>, ParcelError> {
        if self.read_i32()? == 0 {
            return Ok(None);
        }
        if !T::SIZED {
            return T::read_body(self).map(Some);
        }
        let start = self.pos;
        let size = self.read_i32()?;
        if size < 4 {
            return Err(ParcelError::InvalidLength(size));
        }
        let end = start + size as usize;
        if end > self.bytes.len() {
            return Err(ParcelError::Truncated {
                offset: start,
                needed: size as usize,
            });
        }
        let mut body = ParcelReader {
            bytes: &self.bytes[..end],
            pos: self.pos,
        };
        let value = T::read_body(&mut body)?;
        self.pos = end;
        Ok(Some(value))
    }

    pub fn read_required<T: Parcelable>(&mut self, field: &'static str) -> Result<T, ParcelError> {
        self.read_parcelable()?.ok_or(ParcelError::Missing(field))
    }

    pub fn read_typed_array<T: Parcelable>(&mut self) -> Result<Option<Vec<T>>, ParcelError> {
        let count = self.read_i32()?;
        if count == -1 {
            return Ok(None);
        }
        if count < 0 || count as usize > self.remaining() / 4 {
            return Err(ParcelError::InvalidLength(count));
        }
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            out.push(self.read_required("array element")?);
        }
        Ok(Some(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Sample {
        id: i32,
        name: Option<String>,
    }

    impl Parcelable for Sample {
        fn write_body(&self, out: &mut ParcelWriter) {
            out.write_i32(self.id);
            out.write_string(self.name.as_deref());
        }

        fn read_body(input: &mut ParcelReader<'_>) -> Result<Self, ParcelError> {
            Ok(Self {
                id: input.read_i32()?,
                name: input.read_string()?,
            })
        }
    }

    #[test]
    fn strings_are_utf16_with_terminator_and_padding() {
        let mut out = ParcelWriter::new();
        out.write_string(Some("abc"));
        let bytes = out.into_bytes();
        // count + 4 units (incl. NUL) = 4 + 8
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[..4], &3i32.to_le_bytes());
        assert_eq!(ParcelReader::new(&bytes).read_string().unwrap().as_deref(), Some("abc"));
    }

    #[test]
    fn byte_arrays_are_padded_and_nullable() {
        let mut out = ParcelWriter::new();
        out.write_byte_array(Some(&[1, 2, 3, 4, 5][..]));
        out.write_byte_array(None);
        out.write_i32(42);
        let bytes = out.into_bytes();
        assert_eq!(bytes.len(), 4 + 8 + 4 + 4);

        let mut input = ParcelReader::new(&bytes);
        assert_eq!(input.read_byte_array().unwrap(), Some(vec![1, 2, 3, 4, 5]));
        assert_eq!(input.read_byte_array().unwrap(), None);
        assert_eq!(input.read_i32().unwrap(), 42);
        assert_eq!(input.remaining(), 0);
    }

    #[test]
    fn sized_parcelable_skips_unknown_trailing_fields() {
        let mut out = ParcelWriter::new();
        out.write_i32(1);
        let start = out.len();
        out.write_i32(0);
        out.write_i32(7);
        out.write_string(None);
        out.write_i64(99); // field added by a newer interface version
        let size = (out.len() - start) as i32;
        let mut bytes = out.into_bytes();
        bytes[start..start + 4].copy_from_slice(&size.to_le_bytes());
        bytes.extend_from_slice(&5i32.to_le_bytes());

        let mut input = ParcelReader::new(&bytes);
        let sample: Sample = input.read_required("sample").unwrap();
        assert_eq!(sample, Sample { id: 7, name: None });
        assert_eq!(input.read_i32().unwrap(), 5);
    }

    #[test]
    fn interface_token_is_enforced() {
        let mut out = ParcelWriter::new();
        out.write_interface_token("android.test.IFoo");
        let bytes = out.into_bytes();
        assert!(ParcelReader::new(&bytes)
            .enforce_interface("android.test.IFoo")
            .is_ok());
        let err = ParcelReader::new(&bytes)
            .enforce_interface("android.test.IBar")
            .unwrap_err();
        assert!(matches!(err, ParcelError::InterfaceMismatch { .. }));
    }

    #[test]
    fn typed_array_rejects_impossible_counts() {
        let mut out = ParcelWriter::new();
        out.write_i32(1_000_000);
        let bytes = out.into_bytes();
        let err = ParcelReader::new(&bytes)
            .read_typed_array::<Sample>()
            .unwrap_err();
        assert_eq!(err, ParcelError::InvalidLength(1_000_000));
    }

    #[test]
    fn exception_header_surfaces_remote_errors() {
        let mut out = ParcelWriter::new();
        out.write_i32(-8);
        let bytes = out.into_bytes();
        assert_eq!(
            ParcelReader::new(&bytes).read_exception().unwrap_err(),
            ParcelError::RemoteException(-8)
        );
        assert!(ParcelReader::new(&ParcelWriter::reply().into_bytes())
            .read_exception()
            .is_ok());
    }
}
