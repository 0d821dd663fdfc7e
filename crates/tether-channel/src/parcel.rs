//! Transaction payload container.
//!
//! A [`Parcel`] carries the byte payload of one transaction plus an ordered
//! side table of strong object references (receiver handles passed across the
//! channel, the way the kernel primitive flattens object references out of
//! band from the data). Multi-byte integers are big-endian.

use crate::channel::{Endpoint, Uid};
use crate::error::ParcelError;

/// A transaction payload: bytes plus object references.
///
/// Writes append at the end; reads consume from a cursor that starts at the
/// beginning. Object references are read back in the order they were written.
#[derive(Default, Clone)]
pub struct Parcel {
    data: Vec<u8>,
    objects: Vec<Endpoint>,
    cursor: usize,
    object_cursor: usize,
}

impl Parcel {
    /// Create an empty parcel.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Size of the byte payload. Object references do not count; flow control
    /// is byte-granular over the data section only.
    #[must_use]
    pub fn data_size(&self) -> usize {
        self.data.len()
    }

    /// Append a signed 32-bit integer.
    pub fn write_i32(&mut self, value: i32) {
        self.data.extend_from_slice(&value.to_be_bytes());
    }

    /// Append a signed 64-bit integer.
    pub fn write_i64(&mut self, value: i64) {
        self.data.extend_from_slice(&value.to_be_bytes());
    }

    /// Append a length-prefixed UTF-8 string.
    pub fn write_str(&mut self, value: &str) {
        self.write_i32(value.len() as i32);
        self.data.extend_from_slice(value.as_bytes());
    }

    /// Append raw bytes with no length prefix.
    pub fn write_bytes(&mut self, value: &[u8]) {
        self.data.extend_from_slice(value);
    }

    /// Append a strong object reference.
    pub fn write_object(&mut self, endpoint: Endpoint) {
        self.objects.push(endpoint);
    }

    /// Read a signed 32-bit integer at the cursor.
    pub fn read_i32(&mut self) -> Result<i32, ParcelError> {
        let bytes = self.take(4)?;
        Ok(i32::from_be_bytes(bytes.try_into().expect("4 bytes")))
    }

    /// Read a signed 64-bit integer at the cursor.
    pub fn read_i64(&mut self) -> Result<i64, ParcelError> {
        let bytes = self.take(8)?;
        Ok(i64::from_be_bytes(bytes.try_into().expect("8 bytes")))
    }

    /// Read a length-prefixed UTF-8 string at the cursor.
    pub fn read_str(&mut self) -> Result<String, ParcelError> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err(ParcelError::UnexpectedEof);
        }
        let bytes = self.take(len as usize)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ParcelError::InvalidString)
    }

    /// Read the remaining bytes at the cursor.
    pub fn read_remaining(&mut self) -> Vec<u8> {
        let rest = self.data[self.cursor..].to_vec();
        self.cursor = self.data.len();
        rest
    }

    /// Read the next object reference, if one was written.
    pub fn read_object(&mut self) -> Option<Endpoint> {
        let endpoint = self.objects.get(self.object_cursor).cloned()?;
        self.object_cursor += 1;
        Some(endpoint)
    }

    /// Rebind every object reference so that it is held by `holder_uid`.
    ///
    /// The kernel primitive does this as references cross a process boundary;
    /// the loopback dispatcher calls it on delivery.
    #[must_use]
    pub fn rebound_to(mut self, holder_uid: Uid) -> Self {
        self.objects = self
            .objects
            .into_iter()
            .map(|o| o.with_caller(holder_uid))
            .collect();
        self
    }

    fn take(&mut self, n: usize) -> Result<&[u8], ParcelError> {
        if self.cursor + n > self.data.len() {
            return Err(ParcelError::UnexpectedEof);
        }
        let slice = &self.data[self.cursor..self.cursor + n];
        self.cursor += n;
        Ok(slice)
    }
}

impl PartialEq for Parcel {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
            && self.cursor == other.cursor
            && self.object_cursor == other.object_cursor
            && self.objects.len() == other.objects.len()
            && self
                .objects
                .iter()
                .zip(other.objects.iter())
                .all(|(a, b)| std::sync::Arc::ptr_eq(a, b))
    }
}

impl std::fmt::Debug for Parcel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parcel")
            .field("data_size", &self.data.len())
            .field("objects", &self.objects.len())
            .field("cursor", &self.cursor)
            .finish()
    }
}
