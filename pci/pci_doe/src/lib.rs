// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! DOE (Data Object Exchange) mailbox protocol engine.
//!
//! Drives the register set of a DOE extended capability: object framing,
//! discovery iteration, and request/response exchange with busy/ready
//! polling. The engine is generic over [`DoeRegisterIo`] so the same state
//! machine runs against real config space and against a mock mailbox in
//! tests.

#![forbid(unsafe_code)]

use parking_lot::Mutex;
use pci_core::spec::doe::DiscoveryRequest;
use pci_core::spec::doe::DiscoveryResponse;
use pci_core::spec::doe::DoeControl;
use pci_core::spec::doe::DoeHeader1;
use pci_core::spec::doe::DoeHeader2;
use pci_core::spec::doe::DoeProtocolId;
use pci_core::spec::doe::DoeStatus;
use pci_core::spec::doe::CONTROL;
use pci_core::spec::doe::HEADER_DWORDS;
use pci_core::spec::doe::MAX_OBJECT_DWORDS;
use pci_core::spec::doe::READ_MAILBOX;
use pci_core::spec::doe::STATUS;
use pci_core::spec::doe::WRITE_MAILBOX;
use pci_core::DeviceError;
use std::io;
use std::time::Duration;
use std::time::Instant;

/// Register-level access to the DWords of a DOE capability.
///
/// Offsets are absolute config-space offsets; a production implementation
/// sits directly on a device's config space.
pub trait DoeRegisterIo {
    /// Reads the DWord register at `offset`.
    fn read_dword(&self, offset: u16) -> Result<u32, DeviceError>;
    /// Writes the DWord register at `offset`.
    fn write_dword(&self, offset: u16, value: u32) -> Result<(), DeviceError>;
}

/// Poll pacing for mailbox transactions.
#[derive(Debug, Copy, Clone)]
pub struct DoeConfig {
    /// Deadline for each busy-clear or response-ready wait.
    pub timeout: Duration,
    /// Park interval between status polls.
    pub poll_interval: Duration,
}

impl Default for DoeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1000),
            poll_interval: Duration::from_micros(100),
        }
    }
}

/// The discovery `next_index` space is 8 bits; a conforming mailbox
/// terminates within 256 steps, so anything longer is replaying indices.
const DISCOVERY_MAX_HOPS: usize = 256;

/// A DOE mailbox engine bound to one capability instance of one device.
pub struct DoeEngine<T> {
    regs: T,
    base: u16,
    config: DoeConfig,
    // One discover or exchange is atomic with respect to the mailbox.
    transaction: Mutex<()>,
}

impl<T: DoeRegisterIo> DoeEngine<T> {
    /// Creates an engine for the capability at `base` with default poll
    /// pacing.
    pub fn new(regs: T, base: u16) -> Self {
        Self::with_config(regs, base, DoeConfig::default())
    }

    /// Creates an engine with explicit poll pacing.
    pub fn with_config(regs: T, base: u16, config: DoeConfig) -> Self {
        Self {
            regs,
            base,
            config,
            transaction: Mutex::new(()),
        }
    }

    /// Enumerates the data object protocols the mailbox supports, in the
    /// order the device advertises them.
    pub fn discover(&self) -> Result<Vec<DoeProtocolId>, DeviceError> {
        let _guard = self.transaction.lock();
        let mut protocols = Vec::new();
        let mut index = 0u8;
        for _ in 0..DISCOVERY_MAX_HOPS {
            let request = [
                DoeHeader1::new()
                    .with_vendor_id(DoeProtocolId::DISCOVERY.vendor_id)
                    .with_data_object_type(DoeProtocolId::DISCOVERY.data_object_type)
                    .into(),
                DoeHeader2::new().with_length(3).into(),
                DiscoveryRequest::new().with_index(index).into(),
            ];
            let response = self.transact(&request)?;
            let entry =
                DiscoveryResponse::from(*response.get(2).ok_or(DeviceError::DataLoss)?);
            let protocol = DoeProtocolId {
                vendor_id: entry.vendor_id(),
                data_object_type: entry.data_object_type(),
            };
            tracing::debug!(
                vendor_id = protocol.vendor_id,
                data_object_type = protocol.data_object_type,
                next_index = entry.next_index(),
                "doe protocol discovered"
            );
            protocols.push(protocol);
            if entry.next_index() == 0 {
                return Ok(protocols);
            }
            index = entry.next_index();
        }
        Err(DeviceError::DataLoss)
    }

    /// Runs one request/response exchange for `protocol`.
    ///
    /// `request` and the returned payload exclude the two-DWord object
    /// header; framing happens here.
    pub fn exchange(
        &self,
        protocol: DoeProtocolId,
        request: &[u32],
    ) -> Result<Vec<u32>, DeviceError> {
        let _guard = self.transaction.lock();
        let total = request.len() + HEADER_DWORDS;
        if total > MAX_OBJECT_DWORDS {
            return Err(DeviceError::InvalidArgument);
        }
        let mut object = Vec::with_capacity(total);
        object.push(
            DoeHeader1::new()
                .with_vendor_id(protocol.vendor_id)
                .with_data_object_type(protocol.data_object_type)
                .into(),
        );
        // A maximum-length object wraps to the zero encoding.
        object.push(
            DoeHeader2::new()
                .with_length((total % MAX_OBJECT_DWORDS) as u32)
                .into(),
        );
        object.extend_from_slice(request);
        let mut response = self.transact(&object)?;
        Ok(response.split_off(HEADER_DWORDS))
    }

    /// One full mailbox transaction: busy check, write, go, ready wait,
    /// response read.
    fn transact(&self, object: &[u32]) -> Result<Vec<u32>, DeviceError> {
        self.clear_busy()?;
        for &dw in object {
            self.regs.write_dword(self.base + WRITE_MAILBOX, dw)?;
        }
        self.regs
            .write_dword(self.base + CONTROL, DoeControl::new().with_go(true).into())?;
        self.wait_status(|status| status.ready())?;
        self.read_object()
    }

    /// Aborts any transaction a previous owner left behind and waits for
    /// the mailbox to go idle.
    fn clear_busy(&self) -> Result<(), DeviceError> {
        if !self.status()?.busy() {
            return Ok(());
        }
        tracing::warn!(base = self.base, "doe mailbox busy, aborting");
        self.regs.write_dword(
            self.base + CONTROL,
            DoeControl::new().with_abort(true).into(),
        )?;
        self.wait_status(|status| !status.busy())
    }

    fn status(&self) -> Result<DoeStatus, DeviceError> {
        Ok(DoeStatus::from(self.regs.read_dword(self.base + STATUS)?))
    }

    /// Polls the status register until `done` accepts it, the device
    /// reports an error, or the deadline passes.
    fn wait_status(&self, done: impl Fn(DoeStatus) -> bool) -> Result<(), DeviceError> {
        let deadline = Instant::now() + self.config.timeout;
        loop {
            let status = self.status()?;
            if status.error() {
                return Err(DeviceError::Io(io::Error::other("doe error status")));
            }
            if done(status) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DeviceError::Timeout);
            }
            std::thread::sleep(self.config.poll_interval);
        }
    }

    /// Pops one complete object from the read mailbox. The header's length
    /// field tells us how many DWords follow it.
    fn read_object(&self) -> Result<Vec<u32>, DeviceError> {
        let dw0 = self.regs.read_dword(self.base + READ_MAILBOX)?;
        let dw1 = self.regs.read_dword(self.base + READ_MAILBOX)?;
        let length = match DoeHeader2::from(dw1).length() as usize {
            0 => MAX_OBJECT_DWORDS,
            length if length < HEADER_DWORDS => return Err(DeviceError::DataLoss),
            length => length,
        };
        let mut object = Vec::with_capacity(length);
        object.push(dw0);
        object.push(dw1);
        for _ in 0..length - HEADER_DWORDS {
            object.push(self.regs.read_dword(self.base + READ_MAILBOX)?);
        }
        Ok(object)
    }
}
