//! Registered memory regions.
//!
//! Bytes are individually atomic. Stores are `Release` and loads `Acquire`,
//! and every copy runs in ascending address order, so a reader that observes
//! the last byte of a span also observes everything written before it.

use core::sync::atomic::{AtomicU8, Ordering};

use super::{RegionDescriptor, RegionId, TransportError};
use crate::wire::{LogStat, LOGSTAT_OFFSET};

pub struct MemoryRegion {
    id: RegionId,
    base_addr: u64,
    remote_key: u32,
    bytes: Box<[AtomicU8]>,
}

impl MemoryRegion {
    pub fn new(id: RegionId, base_addr: u64, remote_key: u32, size: u32) -> Self {
        let bytes = (0..size).map(|_| AtomicU8::new(0)).collect();
        Self {
            id,
            base_addr,
            remote_key,
            bytes,
        }
    }

    #[inline(always)]
    pub fn id(&self) -> RegionId {
        self.id
    }

    #[inline(always)]
    pub fn base_addr(&self) -> u64 {
        self.base_addr
    }

    #[inline(always)]
    pub fn remote_key(&self) -> u32 {
        self.remote_key
    }

    #[inline(always)]
    pub fn len(&self) -> u32 {
        self.bytes.len() as u32
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn descriptor(&self) -> RegionDescriptor {
        RegionDescriptor {
            addr: self.base_addr,
            size: self.len(),
            remote_key: self.remote_key,
        }
    }

    /// Address of byte `offset` as seen by the fabric.
    #[inline(always)]
    pub fn addr_of(&self, offset: u32) -> u64 {
        self.base_addr + offset as u64
    }

    /// Whether `[addr, addr + len)` lies inside this region.
    #[inline]
    pub fn contains(&self, addr: u64, len: u32) -> bool {
        addr >= self.base_addr && addr + len as u64 <= self.base_addr + self.len() as u64
    }

    fn span(&self, offset: u32, len: usize) -> Result<&[AtomicU8], TransportError> {
        let start = offset as usize;
        let end = start.checked_add(len).filter(|&e| e <= self.bytes.len()).ok_or(
            TransportError::OutOfBounds {
                offset: offset as u64,
                len,
                size: self.len(),
            },
        )?;
        Ok(&self.bytes[start..end])
    }

    pub fn write(&self, offset: u32, src: &[u8]) -> Result<(), TransportError> {
        for (cell, byte) in self.span(offset, src.len())?.iter().zip(src) {
            cell.store(*byte, Ordering::Release);
        }
        Ok(())
    }

    pub fn read(&self, offset: u32, dst: &mut [u8]) -> Result<(), TransportError> {
        let span = self.span(offset, dst.len())?;
        for (byte, cell) in dst.iter_mut().zip(span) {
            *byte = cell.load(Ordering::Acquire);
        }
        Ok(())
    }

    pub fn read_vec(&self, offset: u32, len: usize) -> Result<Vec<u8>, TransportError> {
        let mut out = vec![0u8; len];
        self.read(offset, &mut out)?;
        Ok(out)
    }

    pub fn fill(&self, offset: u32, len: usize, value: u8) -> Result<(), TransportError> {
        for cell in self.span(offset, len)? {
            cell.store(value, Ordering::Release);
        }
        Ok(())
    }

    pub fn read_u32(&self, offset: u32) -> Result<u32, TransportError> {
        let mut buf = [0u8; 4];
        self.read(offset, &mut buf)?;
        Ok(u32::from_ne_bytes(buf))
    }

    pub fn write_u32(&self, offset: u32, value: u32) -> Result<(), TransportError> {
        self.write(offset, &value.to_ne_bytes())
    }

    pub fn read_log_stat_at(&self, offset: u32) -> Result<LogStat, TransportError> {
        let mut buf = [0u8; LogStat::SIZE];
        self.read(offset, &mut buf)?;
        Ok(LogStat::from_bytes(&buf).unwrap_or_default())
    }

    pub fn log_stat(&self) -> Result<LogStat, TransportError> {
        self.read_log_stat_at(LOGSTAT_OFFSET)
    }

    pub fn publish_log_stat(&self, stat: &LogStat) -> Result<(), TransportError> {
        self.write(LOGSTAT_OFFSET, &stat.to_bytes())
    }
}

impl core::fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("id", &self.id)
            .field("base_addr", &format_args!("{:#x}", self.base_addr))
            .field("remote_key", &format_args!("{:#x}", self.remote_key))
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::division::Division;

    fn region(size: u32) -> MemoryRegion {
        MemoryRegion::new(RegionId::new(0, Division::Writer), 0x1000, 7, size)
    }

    #[test]
    fn test_read_write_roundtrip() {
        let r = region(256);
        r.write(130, b"frame").unwrap();
        assert_eq!(r.read_vec(130, 5).unwrap(), b"frame");
        r.write_u32(200, 0xdead_beef).unwrap();
        assert_eq!(r.read_u32(200).unwrap(), 0xdead_beef);
    }

    #[test]
    fn test_out_of_bounds() {
        let r = region(64);
        assert!(matches!(
            r.write(60, &[0u8; 8]),
            Err(TransportError::OutOfBounds { offset: 60, len: 8, size: 64 })
        ));
        assert!(r.read(u32::MAX, &mut [0u8; 2]).is_err());
    }

    #[test]
    fn test_log_stat_publish() {
        let r = region(256);
        assert!(!r.log_stat().unwrap().is_ready());
        r.publish_log_stat(&LogStat::ready(3, 192)).unwrap();
        let stat = r.log_stat().unwrap();
        assert!(stat.is_ready());
        assert_eq!({ stat.write_offset }, 192);
    }

    #[test]
    fn test_contains() {
        let r = region(128);
        assert!(r.contains(0x1000, 128));
        assert!(!r.contains(0x1001, 128));
        assert!(!r.contains(0xfff, 1));
    }
}
