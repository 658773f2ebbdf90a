// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Sysfs-backed PCI/CXL device facade.
//!
//! [`PciDevice`] owns the OS resources for one device (the lazily opened
//! config-space descriptor, the per-index cached BAR mappings, and the
//! lazily located DOE engine) and implements the capability traits a
//! concrete driver wires into the surrounding device framework.

#![cfg(target_os = "linux")]
// UNSAFETY: Manual memory management with mmap for BAR MMIO regions.
#![expect(unsafe_code)]

mod bar;

use bar::MappedBar;
use parking_lot::Mutex;
use pci_core::access::BarAccess;
use pci_core::access::ConfigAccess;
use pci_core::access::CxlDvsecAccess;
use pci_core::access::DoeAccess;
use pci_core::addr::PciAddress;
use pci_core::spec::caps::CapabilityId;
use pci_core::spec::caps::ExtCapabilityId;
use pci_core::spec::cfg_space::ConfigOffset;
use pci_core::spec::doe::DoeProtocolId;
use pci_core::spec::dvsec::CXL_DVSEC_VENDOR_ID;
use pci_core::DeviceError;
use pci_doe::DoeConfig;
use pci_doe::DoeEngine;
use pci_doe::DoeRegisterIo;
use pci_sysfs::ConfigSpace;
use pci_sysfs::PciDeviceNode;
use pci_sysfs::SysfsPci;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::OnceLock;

/// An open handle to one PCI/CXL device.
///
/// The handle exclusively owns its OS resources: resource acquisition is
/// lazy and idempotent (re-access returns the cached resource), and each
/// resource is released exactly once when the handle drops. BAR mappings
/// unmap before their descriptors close.
pub struct PciDevice {
    sysfs: SysfsPci,
    address: PciAddress,
    sysfs_path: PathBuf,
    config: OnceLock<ConfigSpace>,
    bars: Mutex<[Option<Arc<MappedBar>>; 6]>,
    doe: OnceLock<Option<DoeEngine<ConfigRegs>>>,
    doe_config: DoeConfig,
}

impl PciDevice {
    /// Opens the device at `address`.
    pub fn new(sysfs: &SysfsPci, address: PciAddress) -> Result<Self, DeviceError> {
        if !sysfs.device_exists(address) {
            return Err(DeviceError::NotFound);
        }
        tracing::debug!(%address, "opening pci device");
        Ok(Self {
            sysfs: sysfs.clone(),
            address,
            sysfs_path: sysfs.device_path(address),
            config: OnceLock::new(),
            bars: Mutex::new(Default::default()),
            doe: OnceLock::new(),
            doe_config: DoeConfig::default(),
        })
    }

    /// Opens the device named by a `driver://DDDD:BB:DD.F` configuration
    /// URI.
    pub fn from_uri(sysfs: &SysfsPci, uri: &str) -> Result<Self, DeviceError> {
        let address = PciAddress::from_uri(uri).map_err(|err| {
            tracing::debug!(
                uri,
                error = &err as &dyn std::error::Error,
                "malformed device uri"
            );
            DeviceError::InvalidArgument
        })?;
        Self::new(sysfs, address)
    }

    /// Overrides the DOE poll pacing. Takes effect when the engine is
    /// first used.
    pub fn with_doe_config(mut self, config: DoeConfig) -> Self {
        self.doe_config = config;
        self
    }

    /// The device's address.
    pub fn address(&self) -> PciAddress {
        self.address
    }

    /// The device's sysfs directory.
    pub fn sysfs_path(&self) -> &Path {
        &self.sysfs_path
    }

    /// Re-queries the device's topology classification snapshot.
    pub fn node(&self) -> Result<PciDeviceNode, DeviceError> {
        self.sysfs.device_info(self.address)
    }

    /// The config space, opened on first use and held for the facade's
    /// lifetime.
    fn config(&self) -> Result<&ConfigSpace, DeviceError> {
        if let Some(config) = self.config.get() {
            return Ok(config);
        }
        let config = ConfigSpace::open(&self.sysfs_path.join("config"))?;
        Ok(self.config.get_or_init(|| config))
    }

    /// The mapping for `index`, created on first use and cached.
    fn bar(&self, index: u8) -> Result<Arc<MappedBar>, DeviceError> {
        if index >= 6 {
            return Err(DeviceError::InvalidArgument);
        }
        let mut bars = self.bars.lock();
        if let Some(bar) = &bars[index as usize] {
            return Ok(bar.clone());
        }
        let bar = Arc::new(self.map_bar(index)?);
        bars[index as usize] = Some(bar.clone());
        Ok(bar)
    }

    fn map_bar(&self, index: u8) -> Result<MappedBar, DeviceError> {
        let table = fs_err::read_to_string(self.sysfs_path.join("resource"))
            .map_err(DeviceError::from_io)?;
        let resources = bar::parse_resource_table(&table)?;
        let resource = *resources.get(index as usize).ok_or(DeviceError::NotFound)?;
        let size = resource.size();
        if size == 0 {
            return Err(DeviceError::NotFound);
        }
        let path = self.sysfs_path.join(format!("resource{index}"));
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(DeviceError::from_io)?;
        tracing::debug!(
            address = %self.address,
            index,
            size,
            flags = resource.flags,
            "mapping bar"
        );
        MappedBar::map(file, size)
    }

    /// The DOE engine, located via the extended capability walk on first
    /// use. `NotFound` when the device has no DOE capability.
    fn doe_engine(&self) -> Result<&DoeEngine<ConfigRegs>, DeviceError> {
        if self.doe.get().is_none() {
            let config = self.config()?.clone();
            let engine = config.find_ext_capability(ExtCapabilityId::DOE)?.map(|base| {
                tracing::debug!(address = %self.address, base, "doe capability located");
                DoeEngine::with_config(ConfigRegs(config), base, self.doe_config)
            });
            // A racing initializer may win; its engine is equivalent.
            let _ = self.doe.set(engine);
        }
        match self.doe.get() {
            Some(Some(engine)) => Ok(engine),
            _ => Err(DeviceError::NotFound),
        }
    }
}

/// Adapter exposing a device's config space as DOE mailbox registers.
struct ConfigRegs(ConfigSpace);

impl DoeRegisterIo for ConfigRegs {
    fn read_dword(&self, offset: u16) -> Result<u32, DeviceError> {
        self.0.read_u32(offset)
    }

    fn write_dword(&self, offset: u16, value: u32) -> Result<(), DeviceError> {
        self.0.write_u32(offset, value)
    }
}

impl ConfigAccess for PciDevice {
    fn config_read_u8(&self, offset: ConfigOffset) -> Result<u8, DeviceError> {
        self.config()?.read_u8(offset)
    }

    fn config_read_u16(&self, offset: ConfigOffset) -> Result<u16, DeviceError> {
        self.config()?.read_u16(offset)
    }

    fn config_read_u32(&self, offset: ConfigOffset) -> Result<u32, DeviceError> {
        self.config()?.read_u32(offset)
    }

    fn config_write_u8(&self, offset: ConfigOffset, value: u8) -> Result<(), DeviceError> {
        self.config()?.write_u8(offset, value)
    }

    fn config_write_u16(&self, offset: ConfigOffset, value: u16) -> Result<(), DeviceError> {
        self.config()?.write_u16(offset, value)
    }

    fn config_write_u32(&self, offset: ConfigOffset, value: u32) -> Result<(), DeviceError> {
        self.config()?.write_u32(offset, value)
    }

    fn find_capability(&self, id: CapabilityId) -> Result<Option<ConfigOffset>, DeviceError> {
        self.config()?.find_capability(id)
    }

    fn find_ext_capability(
        &self,
        id: ExtCapabilityId,
    ) -> Result<Option<ConfigOffset>, DeviceError> {
        self.config()?.find_ext_capability(id)
    }
}

impl BarAccess for PciDevice {
    fn bar_read_u32(&self, bar: u8, offset: u64) -> Result<u32, DeviceError> {
        self.bar(bar)?.read_u32(offset)
    }

    fn bar_read_u64(&self, bar: u8, offset: u64) -> Result<u64, DeviceError> {
        self.bar(bar)?.read_u64(offset)
    }

    fn bar_write_u32(&self, bar: u8, offset: u64, value: u32) -> Result<(), DeviceError> {
        self.bar(bar)?.write_u32(offset, value)
    }

    fn bar_write_u64(&self, bar: u8, offset: u64, value: u64) -> Result<(), DeviceError> {
        self.bar(bar)?.write_u64(offset, value)
    }

    fn bar_read_buffer(&self, bar: u8, offset: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        self.bar(bar)?.read_buffer(offset, buf)
    }

    fn bar_write_buffer(&self, bar: u8, offset: u64, buf: &[u8]) -> Result<(), DeviceError> {
        self.bar(bar)?.write_buffer(offset, buf)
    }
}

impl DoeAccess for PciDevice {
    fn doe_discover(&self) -> Result<Vec<DoeProtocolId>, DeviceError> {
        self.doe_engine()?.discover()
    }

    fn doe_exchange(
        &self,
        protocol: DoeProtocolId,
        request: &[u32],
    ) -> Result<Vec<u32>, DeviceError> {
        self.doe_engine()?.exchange(protocol, request)
    }
}

impl CxlDvsecAccess for PciDevice {
    fn find_cxl_dvsec(&self, dvsec_id: u16) -> Result<Option<ConfigOffset>, DeviceError> {
        self.config()?.find_dvsec(CXL_DVSEC_VENDOR_ID, dvsec_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn addr(s: &str) -> PciAddress {
        s.parse().unwrap()
    }

    fn put16(image: &mut [u8], offset: usize, value: u16) {
        image[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn put32(image: &mut [u8], offset: usize, value: u32) {
        image[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    struct Fixture {
        _temp: tempfile::TempDir,
        sysfs: SysfsPci,
    }

    /// One endpoint with a 4 KiB BAR0, an unimplemented BAR1, and a CXL
    /// DVSEC in its config space.
    fn endpoint_fixture() -> Fixture {
        let temp = tempfile::tempdir().unwrap();
        let device = temp.path().join("bus/pci/devices/0000:03:00.0");
        fs::create_dir_all(&device).unwrap();

        let mut image = vec![0u8; 0x1000];
        put16(&mut image, 0x00, 0x1e98);
        put16(&mut image, 0x02, 0x0123);
        put32(&mut image, 0x100, 0x0001_0023); // DVSEC, end of list
        put32(&mut image, 0x104, 0x0081_1e98); // CXL vendor
        put32(&mut image, 0x108, 0x0000_0003); // DVSEC id 3
        fs::write(device.join("config"), &image).unwrap();

        fs::write(
            device.join("resource"),
            "0x00000000fe000000 0x00000000fe000fff 0x0000000000040200\n\
             0x0000000000000000 0x0000000000000000 0x0000000000000000\n",
        )
        .unwrap();
        fs::write(device.join("resource0"), vec![0u8; 0x1000]).unwrap();

        let sysfs = SysfsPci::with_root(temp.path());
        Fixture { _temp: temp, sysfs }
    }

    /// The endpoint fixture with a DOE capability whose registers are inert
    /// file bytes: Ready never rises, so transactions must time out.
    fn doe_fixture() -> Fixture {
        let fixture = endpoint_fixture();
        let config = fixture
            .sysfs
            .device_path(addr("0000:03:00.0"))
            .join("config");
        let mut image = fs::read(&config).unwrap();
        put32(&mut image, 0x100, 0x1401_0023); // DVSEC, next 0x140
        put32(&mut image, 0x140, 0x0001_002e); // DOE, end of list
        fs::write(&config, &image).unwrap();
        fixture
    }

    #[test]
    fn missing_device_is_not_found() {
        let fixture = endpoint_fixture();
        assert!(matches!(
            PciDevice::new(&fixture.sysfs, addr("0000:7f:00.0")),
            Err(DeviceError::NotFound)
        ));
    }

    #[test]
    fn uri_entry_point() {
        let fixture = endpoint_fixture();
        let device = PciDevice::from_uri(&fixture.sysfs, "cxl://0000:03:00.0").unwrap();
        assert_eq!(device.address(), addr("0000:03:00.0"));
        assert!(matches!(
            PciDevice::from_uri(&fixture.sysfs, "0000:03:00.0"),
            Err(DeviceError::InvalidArgument)
        ));
    }

    #[test]
    fn config_access_through_facade() {
        let fixture = endpoint_fixture();
        let device = PciDevice::new(&fixture.sysfs, addr("0000:03:00.0")).unwrap();
        assert_eq!(device.config_read_u16(0x00).unwrap(), 0x1e98);
        device.config_write_u32(0x80, 0x0102_0304).unwrap();
        assert_eq!(device.config_read_u32(0x80).unwrap(), 0x0102_0304);
        assert_eq!(device.config_read_u8(0x81).unwrap(), 0x03);
        assert_eq!(device.find_capability(CapabilityId::MSI).unwrap(), None);
    }

    #[test]
    fn bar_access_through_facade() {
        let fixture = endpoint_fixture();
        let device = PciDevice::new(&fixture.sysfs, addr("0000:03:00.0")).unwrap();
        device.bar_write_u64(0, 0x40, 0x0123_4567_89ab_cdef).unwrap();
        assert_eq!(device.bar_read_u64(0, 0x40).unwrap(), 0x0123_4567_89ab_cdef);
        assert!(matches!(
            device.bar_read_u32(0, 0x1000 - 3),
            Err(DeviceError::OutOfRange)
        ));
        // The mapping is created once and cached.
        assert!(device.bars.lock()[0].is_some());
        assert!(device.bars.lock()[1].is_none());
    }

    #[test]
    fn invalid_bar_indexes() {
        let fixture = endpoint_fixture();
        let device = PciDevice::new(&fixture.sysfs, addr("0000:03:00.0")).unwrap();
        assert!(matches!(
            device.bar_read_u32(6, 0),
            Err(DeviceError::InvalidArgument)
        ));
        // BAR1's resource line is all zeros: unimplemented.
        assert!(matches!(
            device.bar_read_u32(1, 0),
            Err(DeviceError::NotFound)
        ));
    }

    #[test]
    fn dvsec_lookup_through_facade() {
        let fixture = endpoint_fixture();
        let device = PciDevice::new(&fixture.sysfs, addr("0000:03:00.0")).unwrap();
        assert_eq!(device.find_cxl_dvsec(3).unwrap(), Some(0x100));
        assert_eq!(device.find_cxl_dvsec(8).unwrap(), None);
    }

    #[test]
    fn missing_doe_capability_is_not_found() {
        let fixture = endpoint_fixture();
        let device = PciDevice::new(&fixture.sysfs, addr("0000:03:00.0")).unwrap();
        assert!(matches!(device.doe_discover(), Err(DeviceError::NotFound)));
    }

    #[test]
    fn dead_doe_mailbox_times_out() {
        let fixture = doe_fixture();
        let device = PciDevice::new(&fixture.sysfs, addr("0000:03:00.0"))
            .unwrap()
            .with_doe_config(DoeConfig {
                timeout: std::time::Duration::from_millis(20),
                poll_interval: std::time::Duration::from_micros(100),
            });
        assert!(matches!(device.doe_discover(), Err(DeviceError::Timeout)));
    }

    #[test]
    fn node_snapshot() {
        let fixture = endpoint_fixture();
        let device = PciDevice::new(&fixture.sysfs, addr("0000:03:00.0")).unwrap();
        let node = device.node().unwrap();
        assert_eq!(node.address, addr("0000:03:00.0"));
        assert!(!node.is_bridge);
        assert_eq!(node.sysfs_path, device.sysfs_path());
    }
}
