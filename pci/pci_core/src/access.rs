// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Capability-interface contracts implemented by concrete device backends.
//!
//! The surrounding device framework discovers these interfaces dynamically
//! at its own layer; this crate only defines the operation sets. A backend
//! implements the roles its hardware actually has, and callers query for
//! them explicitly rather than downcasting.

use crate::spec::caps::CapabilityId;
use crate::spec::caps::ExtCapabilityId;
use crate::spec::cfg_space::ConfigOffset;
use crate::spec::doe::DoeProtocolId;
use crate::DeviceError;

/// Positioned access to a device's configuration space.
pub trait ConfigAccess {
    /// Reads the byte at `offset`.
    fn config_read_u8(&self, offset: ConfigOffset) -> Result<u8, DeviceError>;
    /// Reads the little-endian word at `offset`.
    fn config_read_u16(&self, offset: ConfigOffset) -> Result<u16, DeviceError>;
    /// Reads the little-endian DWord at `offset`.
    fn config_read_u32(&self, offset: ConfigOffset) -> Result<u32, DeviceError>;
    /// Writes the byte at `offset`.
    fn config_write_u8(&self, offset: ConfigOffset, value: u8) -> Result<(), DeviceError>;
    /// Writes the little-endian word at `offset`.
    fn config_write_u16(&self, offset: ConfigOffset, value: u16) -> Result<(), DeviceError>;
    /// Writes the little-endian DWord at `offset`.
    fn config_write_u32(&self, offset: ConfigOffset, value: u32) -> Result<(), DeviceError>;
    /// Finds a standard capability by id.
    fn find_capability(&self, id: CapabilityId) -> Result<Option<ConfigOffset>, DeviceError>;
    /// Finds an extended capability by id.
    fn find_ext_capability(&self, id: ExtCapabilityId)
        -> Result<Option<ConfigOffset>, DeviceError>;
}

/// Bounds-checked MMIO access to a device's BARs.
pub trait BarAccess {
    /// Reads a DWord from BAR `bar` at `offset`.
    fn bar_read_u32(&self, bar: u8, offset: u64) -> Result<u32, DeviceError>;
    /// Reads a QWord from BAR `bar` at `offset`.
    fn bar_read_u64(&self, bar: u8, offset: u64) -> Result<u64, DeviceError>;
    /// Writes a DWord to BAR `bar` at `offset`.
    fn bar_write_u32(&self, bar: u8, offset: u64, value: u32) -> Result<(), DeviceError>;
    /// Writes a QWord to BAR `bar` at `offset`.
    fn bar_write_u64(&self, bar: u8, offset: u64, value: u64) -> Result<(), DeviceError>;
    /// Fills `buf` from BAR `bar` starting at `offset`.
    fn bar_read_buffer(&self, bar: u8, offset: u64, buf: &mut [u8]) -> Result<(), DeviceError>;
    /// Writes `buf` to BAR `bar` starting at `offset`.
    fn bar_write_buffer(&self, bar: u8, offset: u64, buf: &[u8]) -> Result<(), DeviceError>;
}

/// DOE mailbox transactions.
pub trait DoeAccess {
    /// Enumerates the data object protocols the device's mailbox supports.
    fn doe_discover(&self) -> Result<Vec<DoeProtocolId>, DeviceError>;
    /// Runs one request/response exchange. `request` and the returned
    /// payload exclude the two-DWord object header.
    fn doe_exchange(
        &self,
        protocol: DoeProtocolId,
        request: &[u32],
    ) -> Result<Vec<u32>, DeviceError>;
}

/// CXL DVSEC discovery, layered on the extended capability walk.
pub trait CxlDvsecAccess {
    /// Finds the CXL DVSEC instance with the given id.
    fn find_cxl_dvsec(&self, dvsec_id: u16) -> Result<Option<ConfigOffset>, DeviceError>;
}
