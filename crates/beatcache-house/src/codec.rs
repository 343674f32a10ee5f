//! Binary encoding of the registry state
//!
//! State file layout:
//! ```text
//! +----------+-------------+----------+----------+-----
//! | Magic    | Record size | Record 0 | Record 1 | ...
//! | 8B       | 1B          | 47B      | 47B      |
//! +----------+-------------+----------+----------+-----
//! ```
//!
//! Record layout (all integers big-endian):
//! ```text
//! +----+----------+----------------+----------------+-----------+
//! | ID | No video | Source version | Last requested | File size |
//! | 8B | 1B       | 15B            | 15B            | 8B        |
//! +----+----------+----------------+----------------+-----------+
//! ```
//!
//! Timestamps take 15 bytes: a version byte, seconds since
//! 0001-01-01T00:00:00Z as i64, nanoseconds as u32 and the zone offset in
//! minutes as i16, where `-1` stands for UTC.

use beatcache_common::{Error, Fingerprint, Result, Timestamp};
use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, FixedOffset};
use std::io::{self, Read, Write};

/// Magic and format version at the start of every state file
pub const MAGIC: [u8; 8] = *b"CGBIN001";

/// Encoded timestamp size
pub const TIMESTAMP_SIZE: usize = 15;

/// Size of one encoded record
pub const RECORD_SIZE: usize = 8 + 1 + TIMESTAMP_SIZE + TIMESTAMP_SIZE + 8;

/// Header size (magic + record size byte)
pub const HEADER_SIZE: usize = MAGIC.len() + 1;

const TIMESTAMP_VERSION: u8 = 1;

/// Zone offset marker for UTC
///
/// The marker shares its value with a real offset of -1 minute, so such a
/// timestamp reads back as UTC. Offsets are stored in whole minutes and any
/// seconds part is dropped. In both cases the instant is kept exactly; only
/// the zone label changes.
const UTC_OFFSET_MARKER: i16 = -1;

/// Seconds between 0001-01-01T00:00:00Z and the Unix epoch
const SECONDS_TO_UNIX: i64 = 62_135_596_800;

/// Persisted shape of one downloaded cache entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryRecord {
    pub fingerprint: Fingerprint,
    pub source_version: Timestamp,
    pub last_requested: Timestamp,
    pub file_size: u64,
}

impl EntryRecord {
    /// Serialize the record into `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.fingerprint.id);
        buf.put_u8(u8::from(self.fingerprint.no_video));
        put_timestamp(buf, &self.source_version);
        put_timestamp(buf, &self.last_requested);
        buf.put_u64(self.file_size);
    }

    /// Parse a record from the first [`RECORD_SIZE`] bytes of `data`
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < RECORD_SIZE {
            return Err(Error::deserialization(format!(
                "record too small: {} bytes",
                data.len()
            )));
        }

        let mut buf = &data[..RECORD_SIZE];
        let id = buf.get_u64();
        let no_video = buf.get_u8() == 1;
        let source_version = get_timestamp(&mut buf)?;
        let last_requested = get_timestamp(&mut buf)?;
        let file_size = buf.get_u64();

        Ok(Self {
            fingerprint: Fingerprint::new(id, no_video),
            source_version,
            last_requested,
            file_size,
        })
    }
}

fn put_timestamp(buf: &mut BytesMut, t: &Timestamp) {
    let offset_secs = t.offset().local_minus_utc();
    let offset_min = if offset_secs == 0 {
        UTC_OFFSET_MARKER
    } else {
        // Sub-minute offsets are truncated; the instant itself is unaffected.
        (offset_secs / 60) as i16
    };

    buf.put_u8(TIMESTAMP_VERSION);
    buf.put_i64(t.timestamp() + SECONDS_TO_UNIX);
    buf.put_u32(t.timestamp_subsec_nanos());
    buf.put_i16(offset_min);
}

fn get_timestamp(buf: &mut &[u8]) -> Result<Timestamp> {
    let version = buf.get_u8();
    if version != TIMESTAMP_VERSION {
        return Err(Error::deserialization(format!(
            "unsupported timestamp version: {version}"
        )));
    }

    let secs = buf.get_i64();
    let nanos = buf.get_u32();
    let offset_min = buf.get_i16();

    let offset_secs = if offset_min == UTC_OFFSET_MARKER {
        0
    } else {
        i32::from(offset_min) * 60
    };
    let offset = FixedOffset::east_opt(offset_secs)
        .ok_or_else(|| Error::deserialization(format!("invalid zone offset: {offset_min}")))?;
    let utc = secs
        .checked_sub(SECONDS_TO_UNIX)
        .and_then(|unix| DateTime::from_timestamp(unix, nanos))
        .ok_or_else(|| Error::deserialization(format!("timestamp out of range: {secs}.{nanos}")))?;

    Ok(utc.with_timezone(&offset))
}

/// Write a complete state stream: header followed by every record
pub fn write_records<W: Write>(w: &mut W, records: &[EntryRecord]) -> Result<()> {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + records.len() * RECORD_SIZE);
    buf.put_slice(&MAGIC);
    buf.put_u8(RECORD_SIZE as u8);
    for record in records {
        record.encode(&mut buf);
    }
    w.write_all(&buf)?;
    Ok(())
}

/// Read a complete state stream.
///
/// A short trailing record marks the end of valid data and is ignored.
pub fn read_records<R: Read>(mut r: R) -> Result<Vec<EntryRecord>> {
    let mut header = [0u8; HEADER_SIZE];
    let n = read_full(&mut r, &mut header)?;
    if n < MAGIC.len() {
        return Err(Error::deserialization("state header truncated"));
    }
    if header[..MAGIC.len()] != MAGIC {
        return Err(Error::UnknownStateVersion {
            found: String::from_utf8_lossy(&header[..MAGIC.len()]).into_owned(),
        });
    }
    if n < HEADER_SIZE {
        return Err(Error::deserialization("state header truncated"));
    }

    let record_size = header[MAGIC.len()];
    if record_size == 0 {
        return Ok(Vec::new());
    }
    if usize::from(record_size) < RECORD_SIZE {
        return Err(Error::UnsupportedRecordSize {
            size: record_size,
            min: RECORD_SIZE as u8,
        });
    }

    let mut chunk = vec![0u8; usize::from(record_size)];
    let mut records = Vec::with_capacity(64);
    loop {
        let n = read_full(&mut r, &mut chunk)?;
        if n != chunk.len() {
            return Ok(records);
        }
        records.push(EntryRecord::decode(&chunk)?);
    }
}

/// Fill `buf` as far as the reader allows, returning the number of bytes read
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
