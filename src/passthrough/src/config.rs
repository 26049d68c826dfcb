// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Configuration of the devices handed to the guest.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::warn;
use serde::{Deserialize, Serialize};

/// Root of the sysfs PCI device tree.
pub const SYSFS_PCI_DEVICES: &str = "/sys/bus/pci/devices";

/// Errors associated with parsing the passthrough configuration.
#[derive(Debug, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum ConfigError {
    /// Invalid PCI address `{0}`: expected [domain:]bus:device.function
    InvalidAddress(String),
    /// PCI device number out of range in `{0}`
    DeviceOutOfRange(String),
    /// PCI function number out of range in `{0}`
    FunctionOutOfRange(String),
}

/// Host PCI address of a passthrough function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PciAddress {
    /// PCI segment.
    pub domain: u16,
    /// Bus number.
    pub bus: u8,
    /// Device number (0..=0x1f).
    pub device: u8,
    /// Function number (0..=7).
    pub function: u8,
}

impl PciAddress {
    /// Device and function packed the way the kernel reports them.
    pub fn devfn(&self) -> u8 {
        (self.device << 3) | self.function
    }

    /// The sysfs directory of this function.
    pub fn sysfs_path(&self) -> PathBuf {
        Path::new(SYSFS_PCI_DEVICES).join(self.to_string())
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

impl FromStr for PciAddress {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidAddress(s.to_string());

        let (slot, function) = s.rsplit_once('.').ok_or_else(invalid)?;
        let mut parts = slot.split(':').rev();
        let device = parts.next().ok_or_else(invalid)?;
        let bus = parts.next().ok_or_else(invalid)?;
        let domain = parts.next().unwrap_or("0");
        if parts.next().is_some() {
            return Err(invalid());
        }

        let domain = u16::from_str_radix(domain, 16).map_err(|_| invalid())?;
        let bus = u8::from_str_radix(bus, 16).map_err(|_| invalid())?;
        let device = u8::from_str_radix(device, 16).map_err(|_| invalid())?;
        let function = u8::from_str_radix(function, 16).map_err(|_| invalid())?;

        if device > 0x1f {
            return Err(ConfigError::DeviceOutOfRange(s.to_string()));
        }
        if function > 7 {
            return Err(ConfigError::FunctionOutOfRange(s.to_string()));
        }

        Ok(PciAddress {
            domain,
            bus,
            device,
            function,
        })
    }
}

impl TryFrom<String> for PciAddress {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PciAddress> for String {
    fn from(address: PciAddress) -> Self {
        address.to_string()
    }
}

/// One host function to pass through.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeviceConfig {
    /// Host address of the function.
    pub address: PciAddress,
    /// Optional file replacing the device's expansion ROM.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rom_path: Option<PathBuf>,
}

/// Passthrough configuration for the whole machine.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PassthroughConfig {
    /// Functions to pass through, in bus insertion order.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl PassthroughConfig {
    /// Builds the configuration from the emulator's device list, a string of
    /// `bus:device.function` tokens separated by commas or whitespace. `rom_lookup`
    /// returns the ROM file configured for a given address, if any.
    ///
    /// Tokens that do not parse are skipped with a warning.
    pub fn from_tokens<F>(list: &str, mut rom_lookup: F) -> Self
    where
        F: FnMut(&PciAddress) -> Option<PathBuf>,
    {
        let mut devices: Vec<DeviceConfig> = Vec::new();
        for token in list
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|t| !t.is_empty())
        {
            match token.parse::<PciAddress>() {
                Ok(address) => {
                    if devices.iter().any(|d| d.address == address) {
                        warn!("passthrough: {address}: listed more than once, ignoring duplicate");
                        continue;
                    }
                    let rom_path = rom_lookup(&address);
                    devices.push(DeviceConfig { address, rom_path });
                }
                Err(err) => warn!("passthrough: skipping device entry: {err}"),
            }
        }

        PassthroughConfig { devices }
    }
}
