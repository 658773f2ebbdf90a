// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Positioned access to a device's `config` pseudo-file, plus the standard
//! and extended capability-chain walkers.

use pci_core::spec::caps::CapabilityId;
use pci_core::spec::caps::ExtCapabilityHeader;
use pci_core::spec::caps::ExtCapabilityId;
use pci_core::spec::caps::CAP_PTR_MASK;
use pci_core::spec::caps::EXT_CAP_MAX_HOPS;
use pci_core::spec::caps::EXT_CAP_PTR_MASK;
use pci_core::spec::caps::EXT_CAP_START;
use pci_core::spec::caps::STD_CAP_MAX_HOPS;
use pci_core::spec::cfg_space;
use pci_core::spec::cfg_space::ConfigOffset;
use pci_core::spec::dvsec::DvsecHeader1;
use pci_core::spec::dvsec::DvsecHeader2;
use pci_core::spec::dvsec::DVSEC_HEADER1;
use pci_core::spec::dvsec::DVSEC_HEADER2;
use pci_core::DeviceError;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// A device's configuration space, backed by its sysfs `config` file.
///
/// Cheap to clone; clones share the underlying descriptor, which closes
/// when the last clone drops.
#[derive(Debug, Clone)]
pub struct ConfigSpace {
    file: Arc<File>,
    writable: bool,
}

impl ConfigSpace {
    /// Opens `path` read-write, degrading to read-only when write access is
    /// denied.
    pub fn open(path: &Path) -> Result<Self, DeviceError> {
        match std::fs::OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => Ok(Self {
                file: Arc::new(file),
                writable: true,
            }),
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                tracing::debug!(
                    path = %path.display(),
                    "config space degraded to read-only"
                );
                Self::open_read_only(path)
            }
            Err(err) => Err(DeviceError::from_io(err)),
        }
    }

    /// Opens `path` read-only. Writes through the handle fail with
    /// `PermissionDenied`.
    pub fn open_read_only(path: &Path) -> Result<Self, DeviceError> {
        let file = File::open(path).map_err(DeviceError::from_io)?;
        Ok(Self {
            file: Arc::new(file),
            writable: false,
        })
    }

    /// Whether the handle was opened with write access.
    pub fn writable(&self) -> bool {
        self.writable
    }

    fn read_at(&self, offset: ConfigOffset, buf: &mut [u8]) -> Result<(), DeviceError> {
        if offset as usize + buf.len() > cfg_space::EXT_CONFIG_SIZE as usize {
            return Err(DeviceError::InvalidArgument);
        }
        let n = self
            .file
            .read_at(buf, offset.into())
            .map_err(DeviceError::from_io)?;
        if n != buf.len() {
            return Err(DeviceError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "short config space read",
            )));
        }
        Ok(())
    }

    fn write_at(&self, offset: ConfigOffset, buf: &[u8]) -> Result<(), DeviceError> {
        if offset as usize + buf.len() > cfg_space::EXT_CONFIG_SIZE as usize {
            return Err(DeviceError::InvalidArgument);
        }
        if !self.writable {
            return Err(DeviceError::PermissionDenied(io::Error::from(
                io::ErrorKind::PermissionDenied,
            )));
        }
        let n = self
            .file
            .write_at(buf, offset.into())
            .map_err(DeviceError::from_io)?;
        if n != buf.len() {
            return Err(DeviceError::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                "short config space write",
            )));
        }
        Ok(())
    }

    /// Reads the byte at `offset`.
    pub fn read_u8(&self, offset: ConfigOffset) -> Result<u8, DeviceError> {
        let mut buf = [0; 1];
        self.read_at(offset, &mut buf)?;
        Ok(buf[0])
    }

    /// Reads the little-endian word at `offset`.
    pub fn read_u16(&self, offset: ConfigOffset) -> Result<u16, DeviceError> {
        let mut buf = [0; 2];
        self.read_at(offset, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Reads the little-endian DWord at `offset`.
    pub fn read_u32(&self, offset: ConfigOffset) -> Result<u32, DeviceError> {
        let mut buf = [0; 4];
        self.read_at(offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Writes the byte at `offset`.
    pub fn write_u8(&self, offset: ConfigOffset, value: u8) -> Result<(), DeviceError> {
        self.write_at(offset, &[value])
    }

    /// Writes the little-endian word at `offset`.
    pub fn write_u16(&self, offset: ConfigOffset, value: u16) -> Result<(), DeviceError> {
        self.write_at(offset, &value.to_le_bytes())
    }

    /// Writes the little-endian DWord at `offset`.
    pub fn write_u32(&self, offset: ConfigOffset, value: u32) -> Result<(), DeviceError> {
        self.write_at(offset, &value.to_le_bytes())
    }

    /// Reads the device's vendor and device ids.
    pub fn ids(&self) -> Result<(u16, u16), DeviceError> {
        Ok((
            self.read_u16(cfg_space::VENDOR_ID)?,
            self.read_u16(cfg_space::DEVICE_ID)?,
        ))
    }

    /// Finds a standard capability by walking the linked list from the
    /// Capabilities Pointer.
    pub fn find_capability(
        &self,
        id: CapabilityId,
    ) -> Result<Option<ConfigOffset>, DeviceError> {
        let status = cfg_space::Status::from(self.read_u16(cfg_space::STATUS)?);
        if !status.capabilities_list() {
            return Ok(None);
        }
        let mut offset = self.read_u8(cfg_space::CAP_PTR)? & CAP_PTR_MASK;
        for _ in 0..STD_CAP_MAX_HOPS {
            if offset == 0 {
                return Ok(None);
            }
            if CapabilityId(self.read_u8(offset.into())?) == id {
                return Ok(Some(offset.into()));
            }
            offset = self.read_u8(offset as ConfigOffset + 1)? & CAP_PTR_MASK;
        }
        // Hop bound exhausted: the chain loops. Treat the id as absent.
        Ok(None)
    }

    /// Finds an extended capability by walking the list from 0x100.
    pub fn find_ext_capability(
        &self,
        id: ExtCapabilityId,
    ) -> Result<Option<ConfigOffset>, DeviceError> {
        self.walk_ext_caps(|_, header| Ok(ExtCapabilityId(header.id()) == id))
    }

    /// Finds the DVSEC instance with the given vendor and DVSEC id.
    pub fn find_dvsec(
        &self,
        vendor_id: u16,
        dvsec_id: u16,
    ) -> Result<Option<ConfigOffset>, DeviceError> {
        self.walk_ext_caps(|offset, header| {
            if ExtCapabilityId(header.id()) != ExtCapabilityId::DVSEC {
                return Ok(false);
            }
            let header1 = DvsecHeader1::from(self.read_u32(offset + DVSEC_HEADER1)?);
            if header1.vendor_id() != vendor_id {
                return Ok(false);
            }
            let header2 = DvsecHeader2::from(self.read_u32(offset + DVSEC_HEADER2)?);
            Ok(header2.id() == dvsec_id)
        })
    }

    /// Walks the extended capability list, stopping at the first node
    /// `visit` accepts. Offsets must strictly increase; a non-increasing
    /// next pointer ends the walk rather than looping.
    fn walk_ext_caps(
        &self,
        mut visit: impl FnMut(ConfigOffset, ExtCapabilityHeader) -> Result<bool, DeviceError>,
    ) -> Result<Option<ConfigOffset>, DeviceError> {
        let mut offset = EXT_CAP_START;
        for _ in 0..EXT_CAP_MAX_HOPS {
            let raw = self.read_u32(offset)?;
            // All-zeros means no extended capabilities; all-ones is what a
            // device that ignores the access returns.
            if raw == 0 || raw == !0 {
                return Ok(None);
            }
            let header = ExtCapabilityHeader::from(raw);
            if visit(offset, header)? {
                return Ok(Some(offset));
            }
            let next = header.next() & EXT_CAP_PTR_MASK;
            if next == 0 || next <= offset {
                return Ok(None);
            }
            offset = next;
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn put16(image: &mut [u8], offset: usize, value: u16) {
        image[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn put32(image: &mut [u8], offset: usize, value: u32) {
        image[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn write_config(image: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(image).unwrap();
        file.flush().unwrap();
        file
    }

    // PCIe capability at 0x40 chaining to MSI at 0x50.
    fn chained_image() -> Vec<u8> {
        let mut image = vec![0u8; 0x1000];
        put16(&mut image, 0x00, 0x8086);
        put16(&mut image, 0x02, 0x0d93);
        put16(&mut image, 0x06, 0x0010); // capabilities list
        image[0x34] = 0x40;
        image[0x40] = 0x10; // PCI Express
        image[0x41] = 0x50;
        image[0x50] = 0x05; // MSI
        image[0x51] = 0x00;
        image
    }

    #[test]
    fn finds_capability_in_chain() {
        let file = write_config(&chained_image());
        let config = ConfigSpace::open_read_only(file.path()).unwrap();
        assert_eq!(
            config.find_capability(CapabilityId::MSI).unwrap(),
            Some(0x50)
        );
        assert_eq!(
            config.find_capability(CapabilityId::PCI_EXPRESS).unwrap(),
            Some(0x40)
        );
        assert_eq!(config.find_capability(CapabilityId::MSIX).unwrap(), None);
    }

    #[test]
    fn capability_walk_requires_status_bit() {
        let mut image = chained_image();
        put16(&mut image, 0x06, 0x0000);
        let file = write_config(&image);
        let config = ConfigSpace::open_read_only(file.path()).unwrap();
        assert_eq!(config.find_capability(CapabilityId::MSI).unwrap(), None);
    }

    #[test]
    fn capability_walk_survives_loop() {
        let mut image = chained_image();
        image[0x51] = 0x40; // MSI points back at PCIe
        let file = write_config(&image);
        let config = ConfigSpace::open_read_only(file.path()).unwrap();
        assert_eq!(config.find_capability(CapabilityId::MSIX).unwrap(), None);
    }

    #[test]
    fn finds_ext_capability() {
        let mut image = vec![0u8; 0x1000];
        put32(&mut image, 0x100, 0x1401_0001); // AER, next 0x140
        put32(&mut image, 0x140, 0x0001_002e); // DOE, end of list
        let file = write_config(&image);
        let config = ConfigSpace::open_read_only(file.path()).unwrap();
        assert_eq!(
            config.find_ext_capability(ExtCapabilityId::DOE).unwrap(),
            Some(0x140)
        );
        assert_eq!(
            config.find_ext_capability(ExtCapabilityId::DVSEC).unwrap(),
            None
        );
    }

    #[test]
    fn ext_capability_walk_stops_on_non_increasing_next() {
        let mut image = vec![0u8; 0x1000];
        put32(&mut image, 0x100, 0x1401_0001); // next 0x140
        put32(&mut image, 0x140, 0x1001_0003); // next 0x100: goes backwards
        let file = write_config(&image);
        let config = ConfigSpace::open_read_only(file.path()).unwrap();
        assert_eq!(
            config.find_ext_capability(ExtCapabilityId::DOE).unwrap(),
            None
        );
    }

    #[test]
    fn finds_cxl_dvsec() {
        let mut image = vec![0u8; 0x1000];
        put32(&mut image, 0x100, 0x1401_0023); // DVSEC, next 0x140
        put32(&mut image, 0x104, 0x0381_ffff); // some other vendor
        put32(&mut image, 0x108, 0x0000_0000);
        put32(&mut image, 0x140, 0x0001_0023); // DVSEC, end of list
        put32(&mut image, 0x144, 0x03a1_1e98); // CXL vendor
        put32(&mut image, 0x148, 0x0000_0000); // DVSEC id 0
        let file = write_config(&image);
        let config = ConfigSpace::open_read_only(file.path()).unwrap();
        assert_eq!(config.find_dvsec(0x1e98, 0).unwrap(), Some(0x140));
        assert_eq!(config.find_dvsec(0x1e98, 8).unwrap(), None);
    }

    #[test]
    fn reads_and_writes_are_positioned() {
        let file = write_config(&chained_image());
        let config = ConfigSpace::open(file.path()).unwrap();
        assert!(config.writable());
        assert_eq!(config.ids().unwrap(), (0x8086, 0x0d93));
        config.write_u32(0x80, 0xdead_beef).unwrap();
        assert_eq!(config.read_u32(0x80).unwrap(), 0xdead_beef);
        assert_eq!(config.read_u16(0x82).unwrap(), 0xdead);
        assert_eq!(config.read_u8(0x83).unwrap(), 0xde);
    }

    #[test]
    fn read_only_handle_rejects_writes() {
        let file = write_config(&chained_image());
        let config = ConfigSpace::open_read_only(file.path()).unwrap();
        assert!(!config.writable());
        assert!(matches!(
            config.write_u8(0x80, 1),
            Err(DeviceError::PermissionDenied(_))
        ));
    }

    #[test]
    fn access_beyond_extended_space_is_rejected() {
        let file = write_config(&chained_image());
        let config = ConfigSpace::open_read_only(file.path()).unwrap();
        assert!(matches!(
            config.read_u32(0xffe),
            Err(DeviceError::InvalidArgument)
        ));
        assert!(config.read_u32(0xffc).is_ok());
    }

    #[test]
    fn short_read_is_an_io_error() {
        let file = write_config(&[0u8; 4]);
        let config = ConfigSpace::open_read_only(file.path()).unwrap();
        assert!(matches!(config.read_u16(0x06), Err(DeviceError::Io(_))));
    }
}
