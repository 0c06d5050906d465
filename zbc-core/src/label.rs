// vim: tw=80
//! Framing for persisted emulation metadata

use byteorder::{BigEndian, ByteOrder};
use metrohash::MetroHash64;
use nix::errno::Errno;
use serde::{de::DeserializeOwned, Serialize};
use std::{hash::{Hash, Hasher}, io::{self, Seek, SeekFrom}};

use crate::types::*;

/*
 * On-disk Label Format:
 *
 * Magic:       16 bytes
 * Checksum:    8 bytes     MetroHash64.  Covers all of Length and Contents.
 * Length:      8 bytes     Length of Contents in bytes
 * Contents:    variable    bincode-encoded structs, in the order written
 */
/// The file magic is "ZBC Emulation\0\0\0"
const MAGIC: &[u8; MAGIC_LEN] = b"ZBC Emulation\0\0\0";
const MAGIC_LEN: usize = 16;
const CHECKSUM_LEN: usize = 8;
const LENGTH_LEN: usize = 8;
pub const HEADER_LEN: usize = MAGIC_LEN + CHECKSUM_LEN + LENGTH_LEN;

/// Corrupt or foreign labels all look the same to callers.
pub(crate) const CORRUPT: Error = Error::IoFailure(Errno::EBADMSG);

fn checksum(contents: &[u8]) -> u64 {
    let mut hasher = MetroHash64::new();
    (contents.len() as u64).to_be().hash(&mut hasher);
    hasher.write(contents);
    hasher.finish()
}

/// Used to read successive structs out of the label
#[derive(Debug)]
pub struct LabelReader {
    cursor: io::Cursor<Vec<u8>>,
    /// Length of the framed label, header included
    framed_len: usize,
}

impl LabelReader {
    /// Attempt to read a `T` out of the label
    pub fn deserialize<T>(&mut self) -> Result<T>
        where T: DeserializeOwned
    {
        bincode::deserialize_from(&mut self.cursor)
            .map_err(|_| CORRUPT)
    }

    /// Construct a `LabelReader` using the raw buffer read from disk
    pub fn new(buffer: Vec<u8>) -> Result<Self> {
        if buffer.len() < HEADER_LEN {
            return Err(CORRUPT);
        }
        if MAGIC[..] != buffer[0..MAGIC_LEN] {
            return Err(CORRUPT);
        }

        let stored = BigEndian::read_u64(
            &buffer[MAGIC_LEN..MAGIC_LEN + CHECKSUM_LEN]);
        let length_start = MAGIC_LEN + CHECKSUM_LEN;
        let contents_len = BigEndian::read_u64(
            &buffer[length_start .. HEADER_LEN]);
        let contents_end = usize::try_from(contents_len).ok()
            .and_then(|l| l.checked_add(HEADER_LEN))
            .filter(|end| *end <= buffer.len())
            .ok_or(CORRUPT)?;
        if stored != checksum(&buffer[HEADER_LEN..contents_end]) {
            return Err(CORRUPT);
        }

        let mut cursor = io::Cursor::new(buffer);
        // Seek past header
        cursor.seek(SeekFrom::Start(HEADER_LEN as u64))
            .map_err(Error::from)?;
        Ok(LabelReader { cursor, framed_len: contents_end })
    }

    /// How many bytes of the raw buffer belong to the label?
    pub fn framed_len(&self) -> usize {
        self.framed_len
    }
}

/// Successively writes serialized structs into the label
#[derive(Clone, Debug, Default)]
pub struct LabelWriter {
    contents: Vec<u8>,
}

impl LabelWriter {
    pub fn new() -> Self {
        LabelWriter::default()
    }

    /// Write a `T` into the label, after anything already written.
    pub fn serialize<T: Serialize>(&mut self, t: &T) -> Result<()> {
        bincode::serialize_into(&mut self.contents, t)
            .map_err(|_| Error::IoFailure(Errno::EINVAL))
    }

    /// Consume the `LabelWriter` and return the framed label, ready to be
    /// written at the start of a metadata file.
    pub fn into_bytes(self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.contents.len());
        buf.extend_from_slice(&MAGIC[..]);
        buf.resize(HEADER_LEN, 0);
        BigEndian::write_u64(&mut buf[MAGIC_LEN..MAGIC_LEN + CHECKSUM_LEN],
                             checksum(&self.contents));
        BigEndian::write_u64(&mut buf[MAGIC_LEN + CHECKSUM_LEN..HEADER_LEN],
                             self.contents.len() as u64);
        buf.extend_from_slice(&self.contents);
        buf
    }
}

// LCOV_EXCL_STOP
