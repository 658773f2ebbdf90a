// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! PCI addressing value types.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A PCI bus/device/function triple.
///
/// The device number carries 5 valid bits and the function number 3; both
/// are masked on construction, so a `Bdf` never holds an out-of-range
/// component.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bdf {
    bus: u8,
    device: u8,
    function: u8,
}

impl Bdf {
    /// Creates a BDF, masking `device` to 5 bits and `function` to 3.
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device: device & 0x1f,
            function: function & 0x7,
        }
    }

    /// The bus number.
    pub const fn bus(&self) -> u8 {
        self.bus
    }

    /// The device number (5 bits).
    pub const fn device(&self) -> u8 {
        self.device
    }

    /// The function number (3 bits).
    pub const fn function(&self) -> u8 {
        self.function
    }

    /// Packs to `bus << 8 | device << 3 | function`.
    pub const fn pack(&self) -> u16 {
        (self.bus as u16) << 8 | (self.device as u16) << 3 | self.function as u16
    }

    /// Unpacks a 16-bit BDF value.
    pub const fn from_packed(value: u16) -> Self {
        Self::new((value >> 8) as u8, (value >> 3) as u8 & 0x1f, value as u8 & 0x7)
    }
}

impl fmt::Display for Bdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{:x}", self.bus, self.device, self.function)
    }
}

/// A domain-qualified PCI address, canonically rendered `DDDD:BB:DD.F` in
/// lowercase hex (the form sysfs uses for device directory names).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PciAddress {
    /// The PCI domain (segment group).
    pub domain: u16,
    /// The bus/device/function within the domain.
    pub bdf: Bdf,
}

impl PciAddress {
    /// Creates an address from a domain and BDF.
    pub const fn new(domain: u16, bdf: Bdf) -> Self {
        Self { domain, bdf }
    }

    /// Parses the address portion of a `scheme://DDDD:BB:DD.F` device URI.
    ///
    /// The scheme names the driver and is routed by the configuration
    /// layer; only its presence is checked here.
    pub fn from_uri(uri: &str) -> Result<Self, ParseAddressError> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or(ParseAddressError::MissingScheme)?;
        if scheme.is_empty() {
            return Err(ParseAddressError::MissingScheme);
        }
        rest.parse()
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{}", self.domain, self.bdf)
    }
}

/// An error parsing a PCI address string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseAddressError {
    /// The input was empty.
    #[error("empty address")]
    Empty,
    /// A `:` or `.` separator was missing.
    #[error("expected `domain:bus:device.function`")]
    MissingSeparator,
    /// A field was not valid hex for its width.
    #[error("invalid hex field")]
    InvalidHex,
    /// The device number exceeds 0x1f.
    #[error("device number out of range")]
    DeviceOutOfRange,
    /// The function number exceeds 0x7.
    #[error("function number out of range")]
    FunctionOutOfRange,
    /// A device URI was missing its `scheme://` prefix.
    #[error("expected `scheme://` prefix")]
    MissingScheme,
}

impl FromStr for PciAddress {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseAddressError::Empty);
        }
        let (domain, rest) = s.split_once(':').ok_or(ParseAddressError::MissingSeparator)?;
        let (bus, devfn) = rest
            .split_once(':')
            .ok_or(ParseAddressError::MissingSeparator)?;
        let (device, function) = devfn
            .split_once('.')
            .ok_or(ParseAddressError::MissingSeparator)?;

        let domain = u16::from_str_radix(domain, 16).map_err(|_| ParseAddressError::InvalidHex)?;
        let bus = u8::from_str_radix(bus, 16).map_err(|_| ParseAddressError::InvalidHex)?;
        let device = u8::from_str_radix(device, 16).map_err(|_| ParseAddressError::InvalidHex)?;
        let function =
            u8::from_str_radix(function, 16).map_err(|_| ParseAddressError::InvalidHex)?;
        if device > 0x1f {
            return Err(ParseAddressError::DeviceOutOfRange);
        }
        if function > 0x7 {
            return Err(ParseAddressError::FunctionOutOfRange);
        }
        Ok(Self::new(domain, Bdf::new(bus, device, function)))
    }
}
