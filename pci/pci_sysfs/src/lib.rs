// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Sysfs-based PCI topology discovery.
//!
//! Resolves PCI addresses to kernel device nodes, classifies devices from
//! their config space, walks parent/child/root-port relationships, and
//! drives the kernel's remove/rescan control files. All paths hang off an
//! injectable sysfs root so the engine is testable against a synthetic
//! tree.

#![cfg(target_os = "linux")]
#![forbid(unsafe_code)]

mod cfg;

pub use cfg::ConfigSpace;

use pci_core::addr::PciAddress;
use pci_core::spec::caps::CapabilityId;
use pci_core::spec::cfg_space;
use pci_core::spec::cfg_space::HeaderType;
use pci_core::spec::pcie;
use pci_core::spec::pcie::DevicePortType;
use pci_core::spec::pcie::PcieCapabilities;
use pci_core::DeviceError;
use std::collections::BTreeSet;
use std::path::PathBuf;

/// A classification snapshot of one PCI device.
///
/// Recomputed on demand; never cached across calls except within a single
/// traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PciDeviceNode {
    /// The device's address.
    pub address: PciAddress,
    /// The PCIe port type, or `Unknown` when the device is conventional
    /// PCI or its config space is unreadable.
    pub port_type: DevicePortType,
    /// Whether the header type declares a PCI-to-PCI bridge.
    pub is_bridge: bool,
    /// The device's sysfs directory.
    pub sysfs_path: PathBuf,
}

/// Handle to a sysfs tree exposing the PCI bus.
///
/// Production use points at `/sys`; tests inject a synthetic root.
#[derive(Debug, Clone)]
pub struct SysfsPci {
    root: PathBuf,
}

impl Default for SysfsPci {
    fn default() -> Self {
        Self::new()
    }
}

impl SysfsPci {
    /// Returns a handle rooted at `/sys`.
    pub fn new() -> Self {
        Self::with_root("/sys")
    }

    /// Returns a handle rooted at `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The sysfs directory for `addr` (pure path construction).
    pub fn device_path(&self, addr: PciAddress) -> PathBuf {
        self.root.join("bus/pci/devices").join(addr.to_string())
    }

    /// Whether the sysfs entry for `addr` exists.
    pub fn device_exists(&self, addr: PciAddress) -> bool {
        fs_err::symlink_metadata(self.device_path(addr)).is_ok()
    }

    /// Classifies `addr`, degrading to `Unknown`/non-bridge when its config
    /// space cannot be inspected. Only a missing device is an error.
    pub fn device_info(&self, addr: PciAddress) -> Result<PciDeviceNode, DeviceError> {
        let path = self.device_path(addr);
        fs_err::symlink_metadata(&path).map_err(DeviceError::from_io)?;
        let (port_type, is_bridge) = match ConfigSpace::open_read_only(&path.join("config")) {
            Ok(config) => classify(&config),
            // Restricted config access must not hide the topology shape.
            Err(_) => (DevicePortType::Unknown, false),
        };
        Ok(PciDeviceNode {
            address: addr,
            port_type,
            is_bridge,
            sysfs_path: path,
        })
    }

    /// The device's upstream bridge, or `None` when it sits directly under
    /// a root complex (which is not itself a PCI device).
    pub fn parent(&self, addr: PciAddress) -> Result<Option<PciAddress>, DeviceError> {
        let chain = self.ancestor_chain(addr)?;
        if chain.len() < 2 {
            return Ok(None);
        }
        Ok(Some(chain[chain.len() - 2]))
    }

    /// The devices directly downstream of `bridge`.
    pub fn children(&self, bridge: PciAddress) -> Result<BTreeSet<PciAddress>, DeviceError> {
        let mut children = BTreeSet::new();
        for entry in fs_err::read_dir(self.device_path(bridge)).map_err(DeviceError::from_io)? {
            let entry = entry.map_err(DeviceError::from_io)?;
            if let Some(child) = entry.file_name().to_str().and_then(|name| name.parse().ok()) {
                children.insert(child);
            }
        }
        Ok(children)
    }

    /// The root port above `addr`: the first ancestor (scanning from the
    /// root) classified as a root port, or the topmost ancestor when the
    /// topology omits explicit typing.
    pub fn root_port(&self, addr: PciAddress) -> Result<PciAddress, DeviceError> {
        let chain = self.ancestor_chain(addr)?;
        let topmost = *chain.first().ok_or(DeviceError::NotFound)?;
        for entry in &chain {
            if self.device_info(*entry)?.port_type == DevicePortType::RootPort {
                return Ok(*entry);
            }
        }
        Ok(topmost)
    }

    /// Classification snapshots for `addr` and each of its ancestors,
    /// device-first, root-last.
    pub fn path_to_root(&self, addr: PciAddress) -> Result<Vec<PciDeviceNode>, DeviceError> {
        let chain = self.ancestor_chain(addr)?;
        chain
            .iter()
            .rev()
            .map(|entry| self.device_info(*entry))
            .collect()
    }

    /// Detaches the device from the kernel.
    pub fn remove_device(&self, addr: PciAddress) -> Result<(), DeviceError> {
        self.control_write(self.device_path(addr).join("remove"))
    }

    /// Rescans the bus below a bridge for new devices.
    pub fn rescan_bridge(&self, addr: PciAddress) -> Result<(), DeviceError> {
        self.control_write(self.device_path(addr).join("rescan"))
    }

    /// Rescans every PCI bus in the system.
    pub fn rescan_all(&self) -> Result<(), DeviceError> {
        self.control_write(self.root.join("bus/pci/rescan"))
    }

    fn control_write(&self, path: PathBuf) -> Result<(), DeviceError> {
        tracing::debug!(path = %path.display(), "pci control write");
        fs_err::write(path, "1").map_err(DeviceError::from_io)
    }

    /// The device's ancestors, root-first, ending with the device itself.
    ///
    /// The canonical sysfs path of a device nests each function under its
    /// upstream bridge; the BDF-shaped segments of that path are exactly
    /// the ancestor chain.
    fn ancestor_chain(&self, addr: PciAddress) -> Result<Vec<PciAddress>, DeviceError> {
        let real = fs_err::canonicalize(self.device_path(addr)).map_err(DeviceError::from_io)?;
        Ok(real
            .iter()
            .filter_map(|segment| segment.to_str())
            .filter_map(|segment| segment.parse().ok())
            .collect())
    }
}

fn classify(config: &ConfigSpace) -> (DevicePortType, bool) {
    let port_type = port_type_of(config).unwrap_or(DevicePortType::Unknown);
    let is_bridge = match config.read_u8(cfg_space::HEADER_TYPE) {
        Ok(header) => HeaderType::from(header).layout() == cfg_space::HEADER_LAYOUT_BRIDGE,
        Err(_) => false,
    };
    (port_type, is_bridge)
}

fn port_type_of(config: &ConfigSpace) -> Result<DevicePortType, DeviceError> {
    match config.find_capability(CapabilityId::PCI_EXPRESS)? {
        Some(base) => {
            let caps = PcieCapabilities::from(config.read_u16(base + pcie::PCIE_CAPS)?);
            Ok(caps.device_port_type())
        }
        None => Ok(DevicePortType::Unknown),
    }
}
