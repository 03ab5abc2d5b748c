//! Guest address space.
//!
//! The address space is a small set of flat regions: the guest's loadable segments and a private
//! stack. Accesses must fit within a single region. The whole address space is `Clone` so it can be
//! checkpointed before a wrong path and restored on recovery.

use std::ops::Range;

use crate::error::*;
use crate::loader::{GuestImage, MemPerms};

/// Address right above the guest stack.
pub const STACK_TOP: u64 = 0x7fff_f000_0000;
/// Maximum length of an x86 instruction.
pub const MAX_INSN_SIZE: usize = 15;

/// A contiguous mapping.
#[derive(Clone, Debug, Eq, PartialEq)]
struct Region {
    range: Range<u64>,
    perms: MemPerms,
    data: Vec<u8>,
}

impl Region {
    #[inline]
    fn contains(&self, addr: u64, size: usize) -> bool {
        addr >= self.range.start
            && addr
                .checked_add(size as u64)
                .map_or(false, |end| end <= self.range.end)
    }
}

/// The guest address space.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct GuestMemory {
    regions: Vec<Region>,
}

impl GuestMemory {
    /// Creates an empty address space.
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps the segments of `image` and a `stack_size`-byte stack ending at [`STACK_TOP`].
    pub fn from_image(image: &GuestImage, stack_size: usize) -> Result<Self> {
        let mut memory = Self::new();
        for segment in image.segments.iter() {
            memory.map(segment.range.start, segment.data.clone(), segment.perms)?;
        }
        memory.map(STACK_TOP - stack_size as u64, vec![0; stack_size], MemPerms::RW)?;
        Ok(memory)
    }

    /// Maps `data` at `addr`.
    pub fn map(&mut self, addr: u64, data: Vec<u8>, perms: MemPerms) -> Result<()> {
        let end = addr
            .checked_add(data.len() as u64)
            .ok_or(AgentError::UnmappedMemory(addr))?;
        if self
            .regions
            .iter()
            .any(|r| addr < r.range.end && r.range.start < end)
        {
            return Err(AgentError::Generic(format!(
                "mapping {:#x}-{:#x} overlaps an existing one",
                addr, end
            ))
            .into());
        }
        self.regions.push(Region {
            range: addr..end,
            perms,
            data,
        });
        Ok(())
    }

    fn region(&self, addr: u64, size: usize) -> Result<&Region> {
        self.regions
            .iter()
            .find(|r| r.contains(addr, size))
            .ok_or_else(|| AgentError::UnmappedMemory(addr).into())
    }

    /// Reads a little-endian value of `size` bytes (at most 8), zero-extended.
    pub fn read(&self, addr: u64, size: u8) -> Result<u64> {
        let region = self.region(addr, size as usize)?;
        let offset = (addr - region.range.start) as usize;
        let mut bytes = [0u8; 8];
        bytes[..size as usize].copy_from_slice(&region.data[offset..offset + size as usize]);
        Ok(u64::from_le_bytes(bytes))
    }

    /// Writes the lowest `size` bytes (at most 8) of `value`.
    pub fn write(&mut self, addr: u64, size: u8, value: u64) -> Result<()> {
        let region = self
            .regions
            .iter_mut()
            .find(|r| r.contains(addr, size as usize))
            .ok_or(AgentError::UnmappedMemory(addr))?;
        if !region.perms.writable() {
            return Err(AgentError::ReadOnlyMemory(addr).into());
        }
        let offset = (addr - region.range.start) as usize;
        region.data[offset..offset + size as usize]
            .copy_from_slice(&value.to_le_bytes()[..size as usize]);
        Ok(())
    }

    /// Returns the bytes an instruction at `addr` can be decoded from. Only executable regions can
    /// be fetched from.
    pub fn fetch(&self, addr: u64) -> Result<&[u8]> {
        let region = self.region(addr, 1)?;
        if !region.perms.executable() {
            return Err(AgentError::UnmappedMemory(addr).into());
        }
        let offset = (addr - region.range.start) as usize;
        let end = region.data.len().min(offset + MAX_INSN_SIZE);
        Ok(&region.data[offset..end])
    }
}
