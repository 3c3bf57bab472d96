//! Inode log inside the segment's journal region
//!
//! Every inode mutation rewrites the file's full record at a fresh spot in
//! the log region and releases the previous copy, so the latest record for
//! each file is always intact on disk. Placement within the region uses a
//! dedicated bitmap allocator; records are copy-on-write, never updated in
//! place.

use crate::allocator::bitmap::BitmapAllocator;
use crate::allocator::{Extent, SpaceAllocator};
use crate::error::{Result, SegspaceError};
use crate::segment::file::{FileExtent, Inode};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use tracing::debug;

/// Append-only inode journal
pub struct Log {
    allocator: BitmapAllocator,
    /// Physical byte offset of the log region in the segment file
    region_offset: u64,
    /// Monotonic record sequence number
    seq: u64,
}

impl Log {
    pub fn new(region_offset: u64, region_bytes: u64, page_size: u32) -> Self {
        Log {
            allocator: BitmapAllocator::new(region_bytes, page_size),
            region_offset,
            seq: 0,
        }
    }

    /// Journal the current state of `inode`
    ///
    /// Writes a fresh record, then frees the inode's previous record. The
    /// order matters: the old copy stays valid until the new one is on
    /// disk.
    pub fn append(&mut self, file: &mut File, inode: &mut Inode) -> Result<Extent> {
        self.seq += 1;
        let record = encode_record(self.seq, inode);

        let ext = self.allocator.allocate(record.len() as u64)?;
        file.seek(SeekFrom::Start(self.region_offset + ext.offset))?;
        file.write_all(&record)?;
        file.write_all(&vec![0u8; (ext.length as usize) - record.len()])?;

        if let Some(prev) = inode.log_extent.take() {
            self.allocator.free(prev.offset, prev.length);
        }
        inode.log_extent = Some(ext);

        debug!(ino = inode.ino, seq = self.seq, offset = ext.offset, "journalled inode");
        Ok(ext)
    }

    /// Drop the journalled record of a removed file
    pub fn release(&mut self, inode: &mut Inode) {
        if let Some(prev) = inode.log_extent.take() {
            self.allocator.free(prev.offset, prev.length);
        }
    }

    /// Read back the record an inode's `log_extent` points at
    pub fn read_record(&self, file: &mut File, ext: Extent) -> Result<(u64, Inode)> {
        file.seek(SeekFrom::Start(self.region_offset + ext.offset))?;
        let mut buf = vec![0u8; ext.length as usize];
        file.read_exact(&mut buf)?;
        decode_record(&buf)
    }

    /// Bytes of log region capacity currently holding records
    pub fn allocated_bytes(&self) -> u64 {
        self.allocator.allocated_bytes()
    }

    /// Metadata footprint of the log's own allocator
    pub fn metadata_bytes(&self) -> u64 {
        self.allocator.metadata_bytes()
    }

    /// Cross-check the log allocator's bitmaps and counters
    pub fn check_consistency(&self) -> Result<()> {
        self.allocator.check_consistency()
    }
}

/// Serialize an inode record: seq, ino, size, extent count, extents
///
/// All fields are little-endian u64 so replay can walk records without a
/// schema.
fn encode_record(seq: u64, inode: &Inode) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32 + inode.extents.len() * 32);
    buf.extend_from_slice(&seq.to_le_bytes());
    buf.extend_from_slice(&inode.ino.to_le_bytes());
    buf.extend_from_slice(&inode.size.to_le_bytes());
    buf.extend_from_slice(&(inode.extents.len() as u64).to_le_bytes());
    for ext in &inode.extents {
        buf.extend_from_slice(&ext.offset.to_le_bytes());
        buf.extend_from_slice(&ext.length.to_le_bytes());
        buf.extend_from_slice(&ext.page_offset.to_le_bytes());
        buf.extend_from_slice(&ext.page_count.to_le_bytes());
    }
    buf
}

fn decode_record(buf: &[u8]) -> Result<(u64, Inode)> {
    let mut fields = FieldReader::new(buf);
    let seq = fields.u64()?;
    let ino = fields.u64()?;
    let size = fields.u64()?;
    let count = fields.u64()? as usize;

    let mut inode = Inode::new(ino);
    inode.size = size;
    for _ in 0..count {
        inode.extents.push(FileExtent {
            offset: fields.u64()?,
            length: fields.u64()?,
            page_offset: fields.u64()?,
            page_count: fields.u64()?,
        });
    }
    Ok((seq, inode))
}

struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        FieldReader { buf, pos: 0 }
    }

    fn u64(&mut self) -> Result<u64> {
        let end = self.pos + 8;
        let bytes = self.buf.get(self.pos..end).ok_or_else(|| {
            SegspaceError::Corrupt("truncated inode log record".to_string())
        })?;
        self.pos = end;
        Ok(u64::from_le_bytes(bytes.try_into().expect("8-byte slice")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_inode() -> Inode {
        let mut inode = Inode::new(42);
        inode.size = 8192;
        inode.extents.push(FileExtent {
            offset: 0,
            length: 4096,
            page_offset: 0,
            page_count: 1,
        });
        inode.extents.push(FileExtent {
            offset: 65536,
            length: 4096,
            page_offset: 1,
            page_count: 1,
        });
        inode
    }

    #[test]
    fn test_record_round_trip() {
        let inode = sample_inode();
        let record = encode_record(9, &inode);
        let (seq, decoded) = decode_record(&record).unwrap();

        assert_eq!(seq, 9);
        assert_eq!(decoded.ino, 42);
        assert_eq!(decoded.size, 8192);
        assert_eq!(decoded.extents, inode.extents);
    }

    #[test]
    fn test_decode_rejects_truncated_record() {
        let record = encode_record(1, &sample_inode());
        assert!(matches!(
            decode_record(&record[..record.len() - 4]),
            Err(SegspaceError::Corrupt(_))
        ));
    }

    #[test]
    fn test_append_recycles_previous_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.seg");
        let mut file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();
        file.set_len(1 << 20).unwrap();

        let mut log = Log::new(0, 1 << 20, 4096);
        let mut inode = sample_inode();

        let first = log.append(&mut file, &mut inode).unwrap();
        assert_eq!(inode.log_extent, Some(first));
        let held = log.allocated_bytes();

        let second = log.append(&mut file, &mut inode).unwrap();
        assert_eq!(inode.log_extent, Some(second));
        assert_ne!(first.offset, second.offset);
        // Old record was freed; the footprint did not grow.
        assert_eq!(log.allocated_bytes(), held);

        let (seq, decoded) = log.read_record(&mut file, second).unwrap();
        assert_eq!(seq, 2);
        assert_eq!(decoded.extents, inode.extents);
        log.check_consistency().unwrap();
    }

    #[test]
    fn test_release_frees_log_space() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.seg");
        let mut file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .unwrap();
        file.set_len(1 << 20).unwrap();

        let mut log = Log::new(0, 1 << 20, 4096);
        let mut inode = sample_inode();
        log.append(&mut file, &mut inode).unwrap();
        assert!(log.allocated_bytes() > 0);

        log.release(&mut inode);
        assert_eq!(log.allocated_bytes(), 0);
        assert!(inode.log_extent.is_none());
    }
}
