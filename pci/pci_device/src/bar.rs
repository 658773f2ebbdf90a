// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! BAR size discovery and memory-mapped MMIO access.

use pci_core::DeviceError;
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;

/// One line of the sysfs `resource` table: `start end flags`, in hex.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct BarResource {
    pub start: u64,
    pub end: u64,
    pub flags: u64,
}

impl BarResource {
    /// The region's size in bytes; unimplemented BARs report zero.
    pub fn size(&self) -> u64 {
        if self.end < self.start || (self.start == 0 && self.end == 0) {
            0
        } else {
            self.end - self.start + 1
        }
    }
}

/// Parses the `resource` table, one entry per line in BAR order.
pub(crate) fn parse_resource_table(text: &str) -> Result<Vec<BarResource>, DeviceError> {
    text.lines().map(parse_resource_line).collect()
}

fn parse_resource_line(line: &str) -> Result<BarResource, DeviceError> {
    let mut fields = line.split_whitespace();
    let start = parse_hex(fields.next())?;
    let end = parse_hex(fields.next())?;
    let flags = parse_hex(fields.next())?;
    Ok(BarResource { start, end, flags })
}

fn parse_hex(field: Option<&str>) -> Result<u64, DeviceError> {
    let field = field.ok_or(DeviceError::DataLoss)?;
    let digits = field.strip_prefix("0x").unwrap_or(field);
    u64::from_str_radix(digits, 16).map_err(|_| DeviceError::DataLoss)
}

/// An exclusively owned mapping of one BAR's MMIO region.
///
/// The region is unmapped, and then the backing descriptor closed, exactly
/// once, when the mapping drops. The raw base pointer is never exposed;
/// all access is bounds-checked and volatile, because the backing memory
/// is device MMIO, not ordinary RAM.
pub struct MappedBar {
    addr: *mut libc::c_void,
    len: u64,
    // Dropped after the unmap in `Drop::drop`.
    _file: File,
}

// SAFETY: The result of an mmap is safe to share amongst threads.
unsafe impl Send for MappedBar {}
// SAFETY: The result of an mmap is safe to share amongst threads.
unsafe impl Sync for MappedBar {}

impl MappedBar {
    /// Maps `len` bytes of `file` starting at offset 0.
    pub(crate) fn map(file: File, len: u64) -> Result<Self, DeviceError> {
        // SAFETY: No address is being passed, and the result is validated.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(DeviceError::Io(io::Error::last_os_error()));
        }
        Ok(Self {
            addr,
            len,
            _file: file,
        })
    }

    /// The mapped size in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check(&self, offset: u64, len: u64) -> Result<(), DeviceError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(DeviceError::OutOfRange),
        }
    }

    fn check_aligned(&self, offset: u64, width: u64) -> Result<(), DeviceError> {
        self.check(offset, width)?;
        // Volatile scalar access requires natural alignment.
        if offset % width != 0 {
            return Err(DeviceError::InvalidArgument);
        }
        Ok(())
    }

    /// Reads the DWord at `offset`.
    pub fn read_u32(&self, offset: u64) -> Result<u32, DeviceError> {
        self.check_aligned(offset, 4)?;
        // SAFETY: the offset is validated to be in bounds and aligned.
        Ok(unsafe { std::ptr::read_volatile(self.addr.byte_add(offset as usize).cast()) })
    }

    /// Reads the QWord at `offset`.
    pub fn read_u64(&self, offset: u64) -> Result<u64, DeviceError> {
        self.check_aligned(offset, 8)?;
        // SAFETY: the offset is validated to be in bounds and aligned.
        Ok(unsafe { std::ptr::read_volatile(self.addr.byte_add(offset as usize).cast()) })
    }

    /// Writes the DWord at `offset`.
    pub fn write_u32(&self, offset: u64, value: u32) -> Result<(), DeviceError> {
        self.check_aligned(offset, 4)?;
        // SAFETY: the offset is validated to be in bounds and aligned.
        unsafe {
            std::ptr::write_volatile(self.addr.byte_add(offset as usize).cast(), value);
        }
        Ok(())
    }

    /// Writes the QWord at `offset`.
    pub fn write_u64(&self, offset: u64, value: u64) -> Result<(), DeviceError> {
        self.check_aligned(offset, 8)?;
        // SAFETY: the offset is validated to be in bounds and aligned.
        unsafe {
            std::ptr::write_volatile(self.addr.byte_add(offset as usize).cast(), value);
        }
        Ok(())
    }

    /// Fills `buf` from the region starting at `offset`.
    pub fn read_buffer(&self, offset: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        if buf.is_empty() {
            return Err(DeviceError::InvalidArgument);
        }
        self.check(offset, buf.len() as u64)?;
        for (i, b) in buf.iter_mut().enumerate() {
            // SAFETY: in bounds per the check above.
            *b = unsafe {
                std::ptr::read_volatile(self.addr.byte_add(offset as usize + i).cast::<u8>())
            };
        }
        Ok(())
    }

    /// Writes `buf` to the region starting at `offset`.
    pub fn write_buffer(&self, offset: u64, buf: &[u8]) -> Result<(), DeviceError> {
        if buf.is_empty() {
            return Err(DeviceError::InvalidArgument);
        }
        self.check(offset, buf.len() as u64)?;
        for (i, &b) in buf.iter().enumerate() {
            // SAFETY: in bounds per the check above.
            unsafe {
                std::ptr::write_volatile(self.addr.byte_add(offset as usize + i).cast::<u8>(), b);
            }
        }
        Ok(())
    }
}

impl Drop for MappedBar {
    fn drop(&mut self) {
        // Unmap before the backing descriptor closes.
        // SAFETY: The address and length are a valid mmap result.
        unsafe {
            libc::munmap(self.addr, self.len as usize);
        }
    }
}
