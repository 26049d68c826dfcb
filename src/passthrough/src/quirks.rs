// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Vendor specific behavior layered over region handlers.
//!
//! A quirk wraps the plain handler of a region and is installed in its place when the region is
//! mapped. Unmapping removes the wrapper along with the region, so the next mapping starts from
//! the plain handler again.

use std::sync::{Arc, Mutex, Weak};

use crate::bus::IoHandler;
use crate::device::PassthroughDevice;
use crate::region::{AddressSpace, Region, RegionIo, RegionKind};

/// PCI vendor id of NVIDIA.
pub const PCI_VENDOR_ID_NVIDIA: u16 = 0x10de;

// BAR0 windows mirroring configuration space.
const NVIDIA_MIRROR_LEGACY_BASE: u64 = 0x1800;
const NVIDIA_MIRROR_LEGACY_SIZE: u64 = 0x100;
const NVIDIA_MIRROR_PCIE_BASE: u64 = 0x88000;
const NVIDIA_MIRROR_PCIE_SIZE: u64 = 0x1000;

// Ports 0x3d4 and 0x3d0, relative to the high VGA window at 0x3c0.
const NVIDIA_3D4: u64 = 0x14;
const NVIDIA_3D0: u64 = 0x10;

const NVIDIA_3D0_SELECT: u32 = 0x338;
const NVIDIA_3D0_READ: u32 = 0x538;
const NVIDIA_3D0_WRITE: u32 = 0x738;

/// Returns the handler to install for BAR `region` of `dev`.
pub(crate) fn bar_handler(dev: &PassthroughDevice, region: &Region) -> Arc<dyn IoHandler> {
    if dev.vendor_id != PCI_VENDOR_ID_NVIDIA
        || region.kind() != RegionKind::Bar(0)
        || region.space() != AddressSpace::Memory
    {
        return region.plain_handler();
    }

    let mut windows = Vec::new();
    // The legacy window is only decoded by cards that also decode VGA.
    if !dev.vga.is_empty()
        && region.size() >= NVIDIA_MIRROR_LEGACY_BASE + NVIDIA_MIRROR_LEGACY_SIZE
    {
        windows.push((NVIDIA_MIRROR_LEGACY_BASE, NVIDIA_MIRROR_LEGACY_SIZE));
    }
    let pcie_size = dev.config_size().min(NVIDIA_MIRROR_PCIE_SIZE);
    if region.size() >= NVIDIA_MIRROR_PCIE_BASE + pcie_size {
        windows.push((NVIDIA_MIRROR_PCIE_BASE, pcie_size));
    }
    if windows.is_empty() {
        return region.plain_handler();
    }

    Arc::new(ConfigMirror {
        inner: region.io().clone(),
        device: dev.this.clone(),
        windows,
    })
}

/// Returns the handler to install for VGA window `region` of `dev`.
pub(crate) fn vga_handler(dev: &PassthroughDevice, region: &Region) -> Arc<dyn IoHandler> {
    if dev.vendor_id != PCI_VENDOR_ID_NVIDIA || region.kind() != RegionKind::VgaIoHi {
        return region.plain_handler();
    }
    Arc::new(Nvidia3d0Handler {
        inner: region.io().clone(),
        device: dev.this.clone(),
    })
}

// BAR0 with windows that alias configuration space.
struct ConfigMirror {
    inner: Arc<RegionIo>,
    device: Weak<Mutex<PassthroughDevice>>,
    windows: Vec<(u64, u64)>,
}

impl ConfigMirror {
    fn config_offset(&self, offset: u64, len: usize) -> Option<u16> {
        let end = offset.checked_add(len as u64)?;
        self.windows
            .iter()
            .find(|(base, size)| offset >= *base && end <= base + size)
            .and_then(|(base, _)| u16::try_from(offset - base).ok())
    }
}

impl IoHandler for ConfigMirror {
    fn read(&self, base: u64, offset: u64, data: &mut [u8]) {
        let Some(cfg) = self.config_offset(offset, data.len()) else {
            return self.inner.read(base, offset, data);
        };
        self.inner.note_access(data.len(), false);
        match self.device.upgrade() {
            Some(device) => device
                .lock()
                .expect("Poisoned lock")
                .config_read(cfg, data),
            None => data.fill(0xff),
        }
    }

    fn write(&self, base: u64, offset: u64, data: &[u8]) {
        let Some(cfg) = self.config_offset(offset, data.len()) else {
            return self.inner.write(base, offset, data);
        };
        self.inner.note_access(data.len(), true);
        if let Some(device) = self.device.upgrade() {
            device
                .lock()
                .expect("Poisoned lock")
                .config_write(cfg, data);
        }
    }
}

/// State of the NVIDIA "3d0" configuration back door.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Nvidia3d0State {
    /// Idle.
    #[default]
    None,
    /// 0x338 was written to 0x3d4; the next write to 0x3d0 selects an offset.
    Select,
    /// An offset was selected.
    Window,
    /// 0x538 was written to 0x3d4; the next read of 0x3d0 reads the selected offset.
    Read,
    /// 0x738 was written to 0x3d4; the next write to 0x3d0 writes the selected offset.
    Write,
}

/// The back door sequence tracker, owned by the device.
///
/// Any access to 0x3d4 or 0x3d0 that does not continue the sequence drops it back to idle, as
/// does the data access completing it.
#[derive(Debug, Default)]
pub struct Nvidia3d0 {
    state: Nvidia3d0State,
    offset: u32,
}

impl Nvidia3d0 {
    /// Current state.
    pub fn state(&self) -> Nvidia3d0State {
        self.state
    }

    fn config_offset(&self) -> Option<u16> {
        (self.offset & !0xff == NVIDIA_MIRROR_LEGACY_BASE as u32)
            .then_some((self.offset & 0xff) as u16)
    }

    /// Tracks a read of `port`. Returns the configuration offset to read instead of the port.
    pub fn read(&mut self, port: u64) -> Option<u16> {
        let old = std::mem::take(&mut self.state);
        if port == NVIDIA_3D0 && old == Nvidia3d0State::Read {
            return self.config_offset();
        }
        None
    }

    /// Tracks a write of `value` to `port`. Returns the configuration offset to write instead of
    /// the port.
    pub fn write(&mut self, port: u64, value: u32) -> Option<u16> {
        let old = std::mem::take(&mut self.state);
        match port {
            NVIDIA_3D4 => {
                self.state = match (old, value) {
                    (Nvidia3d0State::None, NVIDIA_3D0_SELECT) => Nvidia3d0State::Select,
                    (Nvidia3d0State::Window, NVIDIA_3D0_READ) => Nvidia3d0State::Read,
                    (Nvidia3d0State::Window, NVIDIA_3D0_WRITE) => Nvidia3d0State::Write,
                    _ => Nvidia3d0State::None,
                };
                None
            }
            NVIDIA_3D0 => match old {
                Nvidia3d0State::Select => {
                    self.offset = value;
                    self.state = Nvidia3d0State::Window;
                    None
                }
                Nvidia3d0State::Write => self.config_offset(),
                _ => None,
            },
            _ => None,
        }
    }
}

fn le_value(data: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    let len = data.len().min(4);
    bytes[..len].copy_from_slice(&data[..len]);
    u32::from_le_bytes(bytes)
}

// High VGA port window with the back door in front of it.
struct Nvidia3d0Handler {
    inner: Arc<RegionIo>,
    device: Weak<Mutex<PassthroughDevice>>,
}

impl IoHandler for Nvidia3d0Handler {
    fn read(&self, base: u64, offset: u64, data: &mut [u8]) {
        if offset == NVIDIA_3D0 || offset == NVIDIA_3D4 {
            if let Some(device) = self.device.upgrade() {
                let mut dev = device.lock().expect("Poisoned lock");
                if let Some(cfg) = dev.quirk_3d0.read(offset) {
                    self.inner.note_access(data.len(), false);
                    dev.config_read(cfg, data);
                    return;
                }
            }
        }
        self.inner.read(base, offset, data);
    }

    fn write(&self, base: u64, offset: u64, data: &[u8]) {
        if offset == NVIDIA_3D0 || offset == NVIDIA_3D4 {
            if let Some(device) = self.device.upgrade() {
                let mut dev = device.lock().expect("Poisoned lock");
                if let Some(cfg) = dev.quirk_3d0.write(offset, le_value(data)) {
                    self.inner.note_access(data.len(), true);
                    dev.config_write(cfg, data);
                    return;
                }
            }
        }
        self.inner.write(base, offset, data);
    }
}
