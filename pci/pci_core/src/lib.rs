// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Core PCI/CXL infrastructure.
//!
//! A collection of constants, value types, and capability traits shared by
//! the sysfs topology engine, the device facade, and the DOE protocol
//! engine.

#![forbid(unsafe_code)]

pub mod access;
pub mod addr;
pub mod spec;

use std::io;
use thiserror::Error;

/// Error taxonomy for device operations.
///
/// Every fallible operation across the PCI/CXL crates resolves to one of
/// these kinds; nothing is signaled via panics on fallible paths.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The sysfs entry, BAR, or capability does not exist.
    #[error("device, resource, or capability not found")]
    NotFound,
    /// The request failed due to invalid input.
    #[error("invalid argument")]
    InvalidArgument,
    /// Access was denied, even read-only.
    #[error("permission denied")]
    PermissionDenied(#[source] io::Error),
    /// The request failed due to an unrecovered I/O error.
    #[error("io error")]
    Io(#[source] io::Error),
    /// The access falls outside the mapped region.
    #[error("access out of range")]
    OutOfRange,
    /// A poll deadline elapsed before the device became ready.
    #[error("timed out waiting for device")]
    Timeout,
    /// The device returned a truncated or malformed response.
    #[error("truncated or malformed device data")]
    DataLoss,
}

impl DeviceError {
    /// Classifies an OS error into the taxonomy.
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(err),
            _ => Self::Io(err),
        }
    }
}

impl From<io::Error> for DeviceError {
    fn from(err: io::Error) -> Self {
        Self::from_io(err)
    }
}
