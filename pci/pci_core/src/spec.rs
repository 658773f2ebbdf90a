// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Types and constants specified by the PCI, PCI Express, and CXL specs.
//!
//! This module MUST NOT contain any vendor-specific constants; the CXL
//! DVSEC vendor id is defined by the CXL spec itself and is the one
//! carve-out.

/// Configuration space header registers.
///
/// Sources: PCI 2.3 Spec - Chapter 6
pub mod cfg_space {
    use bitfield_struct::bitfield;

    /// A byte offset into (extended) configuration space, `0x000..=0xfff`.
    pub type ConfigOffset = u16;

    /// Size of the extended configuration space, in bytes.
    pub const EXT_CONFIG_SIZE: u16 = 0x1000;

    /// Offset of the Vendor ID register.
    pub const VENDOR_ID: u16 = 0x00;
    /// Offset of the Device ID register.
    pub const DEVICE_ID: u16 = 0x02;
    /// Offset of the Status register.
    pub const STATUS: u16 = 0x06;
    /// Offset of the Header Type register.
    pub const HEADER_TYPE: u16 = 0x0e;
    /// Offset of the Capabilities Pointer register.
    pub const CAP_PTR: u16 = 0x34;

    /// Header layout value (Header Type bits `[6:0]`) for a PCI-to-PCI
    /// bridge.
    pub const HEADER_LAYOUT_BRIDGE: u8 = 0x01;

    /// Status register.
    #[bitfield(u16)]
    pub struct Status {
        #[bits(3)]
        _reserved: u16,
        pub interrupt_status: bool,
        pub capabilities_list: bool,
        pub capable_mhz_66: bool,
        _reserved2: bool,
        pub capable_fast_b2b: bool,
        pub err_master_parity: bool,
        #[bits(2)]
        pub devsel: u16,
        pub abort_target_signaled: bool,
        pub abort_target_received: bool,
        pub abort_master_received: bool,
        pub err_signaled: bool,
        pub err_detected_parity: bool,
    }

    /// Header Type register. Bits `[6:0]` select the header layout; bit 7
    /// flags a multi-function device.
    #[bitfield(u8)]
    pub struct HeaderType {
        #[bits(7)]
        pub layout: u8,
        pub multi_function: bool,
    }
}

/// Capability ids and chain layout.
///
/// Sources: PCI 2.3 Spec - Appendix H; PCIe 6.0 Spec - 7.6, 7.9
pub mod caps {
    use bitfield_struct::bitfield;

    /// A standard capability id.
    ///
    /// NOTE: this is a non-exhaustive list, so don't be afraid to add new
    /// ids on an as-needed basis!
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct CapabilityId(pub u8);

    impl CapabilityId {
        pub const POWER_MANAGEMENT: Self = Self(0x01);
        pub const MSI: Self = Self(0x05);
        pub const VENDOR_SPECIFIC: Self = Self(0x09);
        pub const PCI_EXPRESS: Self = Self(0x10);
        pub const MSIX: Self = Self(0x11);
    }

    /// An extended capability id.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct ExtCapabilityId(pub u16);

    impl ExtCapabilityId {
        pub const ADVANCED_ERROR_REPORTING: Self = Self(0x0001);
        pub const DEVICE_SERIAL_NUMBER: Self = Self(0x0003);
        pub const DVSEC: Self = Self(0x0023);
        pub const DOE: Self = Self(0x002e);
    }

    /// Standard capability pointers are DWord aligned; the low two bits are
    /// reserved.
    pub const CAP_PTR_MASK: u8 = 0xfc;
    /// First extended capability header offset.
    pub const EXT_CAP_START: u16 = 0x100;
    /// Extended capability next-pointers are DWord aligned.
    pub const EXT_CAP_PTR_MASK: u16 = 0xffc;

    /// Hop bound tolerating looping standard chains exposed by broken
    /// hardware.
    pub const STD_CAP_MAX_HOPS: usize = 48;
    /// Hop bound for extended capability walks.
    pub const EXT_CAP_MAX_HOPS: usize = 256;

    /// An extended capability header DWord.
    #[bitfield(u32)]
    pub struct ExtCapabilityHeader {
        pub id: u16,
        #[bits(4)]
        pub version: u8,
        /// Byte offset of the next capability, or 0 at the end of the list.
        #[bits(12)]
        pub next: u16,
    }
}

/// PCI Express capability registers.
///
/// Sources: PCIe 6.0 Spec - 7.5.3
pub mod pcie {
    use bitfield_struct::bitfield;

    /// Offset of the PCI Express Capabilities register from the capability
    /// base.
    pub const PCIE_CAPS: u16 = 0x02;

    /// Device/port type codes from the PCI Express Capabilities register.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub enum DevicePortType {
        Endpoint,
        LegacyEndpoint,
        RootPort,
        UpstreamSwitchPort,
        DownstreamSwitchPort,
        PcieToPciBridge,
        PciToPcieBridge,
        RcIntegratedEndpoint,
        RcEventCollector,
        /// An unrecognized code, a conventional PCI function, or a device
        /// whose config space could not be read.
        Unknown,
    }

    impl DevicePortType {
        const fn from_bits(bits: u16) -> Self {
            match bits {
                0x0 => DevicePortType::Endpoint,
                0x1 => DevicePortType::LegacyEndpoint,
                0x4 => DevicePortType::RootPort,
                0x5 => DevicePortType::UpstreamSwitchPort,
                0x6 => DevicePortType::DownstreamSwitchPort,
                0x7 => DevicePortType::PcieToPciBridge,
                0x8 => DevicePortType::PciToPcieBridge,
                0x9 => DevicePortType::RcIntegratedEndpoint,
                0xa => DevicePortType::RcEventCollector,
                _ => DevicePortType::Unknown,
            }
        }

        const fn into_bits(self) -> u16 {
            match self {
                DevicePortType::Endpoint => 0x0,
                DevicePortType::LegacyEndpoint => 0x1,
                DevicePortType::RootPort => 0x4,
                DevicePortType::UpstreamSwitchPort => 0x5,
                DevicePortType::DownstreamSwitchPort => 0x6,
                DevicePortType::PcieToPciBridge => 0x7,
                DevicePortType::PciToPcieBridge => 0x8,
                DevicePortType::RcIntegratedEndpoint => 0x9,
                DevicePortType::RcEventCollector => 0xa,
                DevicePortType::Unknown => 0xf,
            }
        }
    }

    /// PCI Express Capabilities register.
    #[bitfield(u16)]
    pub struct PcieCapabilities {
        #[bits(4)]
        pub version: u8,
        #[bits(4)]
        pub device_port_type: DevicePortType,
        pub slot_implemented: bool,
        #[bits(5)]
        pub interrupt_message_number: u8,
        #[bits(2)]
        _reserved: u8,
    }
}

/// DOE capability registers and data object framing.
///
/// Sources: PCIe 6.0 Spec - 6.30, 7.9.24
pub mod doe {
    use bitfield_struct::bitfield;

    /// Offset of the DOE Control register from the capability base.
    pub const CONTROL: u16 = 0x08;
    /// Offset of the DOE Status register.
    pub const STATUS: u16 = 0x0c;
    /// Offset of the DOE Write Data Mailbox register. Each write pushes one
    /// DWord into the outgoing FIFO.
    pub const WRITE_MAILBOX: u16 = 0x10;
    /// Offset of the DOE Read Data Mailbox register. Each read pops one
    /// DWord from the incoming FIFO.
    pub const READ_MAILBOX: u16 = 0x14;

    /// DOE Control register.
    #[bitfield(u32)]
    pub struct DoeControl {
        pub abort: bool,
        pub interrupt_enable: bool,
        #[bits(29)]
        _reserved: u32,
        pub go: bool,
    }

    /// DOE Status register.
    #[bitfield(u32)]
    pub struct DoeStatus {
        pub busy: bool,
        pub interrupt_status: bool,
        pub error: bool,
        #[bits(28)]
        _reserved: u32,
        /// A response object is available in the read mailbox.
        pub ready: bool,
    }

    /// First header DWord of a data object.
    #[bitfield(u32)]
    pub struct DoeHeader1 {
        pub vendor_id: u16,
        pub data_object_type: u8,
        _reserved: u8,
    }

    /// Second header DWord of a data object: object length in DWords,
    /// including the two header DWords. Zero encodes 2^18.
    #[bitfield(u32)]
    pub struct DoeHeader2 {
        #[bits(18)]
        pub length: u32,
        #[bits(14)]
        _reserved: u32,
    }

    /// DWords in the object header.
    pub const HEADER_DWORDS: usize = 2;
    /// Maximum object length in DWords (the zero encoding of the length
    /// field).
    pub const MAX_OBJECT_DWORDS: usize = 1 << 18;

    /// Request payload DWord of the DOE discovery protocol.
    #[bitfield(u32)]
    pub struct DiscoveryRequest {
        pub index: u8,
        #[bits(24)]
        _reserved: u32,
    }

    /// Response payload DWord of the DOE discovery protocol.
    #[bitfield(u32)]
    pub struct DiscoveryResponse {
        pub vendor_id: u16,
        pub data_object_type: u8,
        /// Index of the next protocol to query, or 0 at the end of the
        /// enumeration.
        pub next_index: u8,
    }

    /// A data object protocol identity, as advertised by discovery.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct DoeProtocolId {
        pub vendor_id: u16,
        pub data_object_type: u8,
    }

    impl DoeProtocolId {
        /// DOE discovery itself. Every mailbox supports it.
        pub const DISCOVERY: Self = Self {
            vendor_id: 0x0001,
            data_object_type: 0x00,
        };
        /// CMA/SPDM.
        pub const CMA_SPDM: Self = Self {
            vendor_id: 0x0001,
            data_object_type: 0x01,
        };
        /// Secured CMA/SPDM.
        pub const SECURED_CMA_SPDM: Self = Self {
            vendor_id: 0x0001,
            data_object_type: 0x02,
        };
    }
}

/// Designated Vendor-Specific Extended Capability layout.
///
/// Sources: PCIe 6.0 Spec - 7.9.6; CXL 2.0 Spec - 8.1
pub mod dvsec {
    use bitfield_struct::bitfield;

    /// Offset of DVSEC header 1 from the capability base.
    pub const DVSEC_HEADER1: u16 = 0x04;
    /// Offset of DVSEC header 2 from the capability base.
    pub const DVSEC_HEADER2: u16 = 0x08;

    /// The CXL designated vendor id.
    pub const CXL_DVSEC_VENDOR_ID: u16 = 0x1e98;

    /// DVSEC header 1.
    #[bitfield(u32)]
    pub struct DvsecHeader1 {
        pub vendor_id: u16,
        #[bits(4)]
        pub revision: u8,
        #[bits(12)]
        pub length: u16,
    }

    /// DVSEC header 2.
    #[bitfield(u32)]
    pub struct DvsecHeader2 {
        pub id: u16,
        _reserved: u16,
    }
}

#[cfg(test)]
mod tests {
    use super::doe::DiscoveryResponse;
    use super::doe::DoeHeader1;
    use super::doe::DoeStatus;
    use super::pcie::DevicePortType;
    use super::pcie::PcieCapabilities;

    #[test]
    fn pcie_port_type_decode() {
        let caps = PcieCapabilities::from(0x0042u16);
        assert_eq!(caps.device_port_type(), DevicePortType::RootPort);
        assert_eq!(caps.version(), 2);
        let caps = PcieCapabilities::from(0x00f2u16);
        assert_eq!(caps.device_port_type(), DevicePortType::Unknown);
    }

    #[test]
    fn doe_register_bits() {
        let status = DoeStatus::from(0x8000_0005u32);
        assert!(status.busy());
        assert!(status.error());
        assert!(status.ready());
        assert!(!status.interrupt_status());

        let header = DoeHeader1::new()
            .with_vendor_id(0x1e98)
            .with_data_object_type(0x02);
        assert_eq!(u32::from(header), 0x0002_1e98);
    }

    #[test]
    fn discovery_response_fields() {
        let dw = DiscoveryResponse::from(0x0301_0001u32);
        assert_eq!(dw.vendor_id(), 0x0001);
        assert_eq!(dw.data_object_type(), 0x01);
        assert_eq!(dw.next_index(), 0x03);
    }
}
