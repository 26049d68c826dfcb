// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! A host PCI function presented to the guest as a card on the emulated PCI bus.

use std::fs;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use vfio_bindings::bindings::vfio::{
    VFIO_PCI_CONFIG_REGION_INDEX, VFIO_PCI_INTX_IRQ_INDEX, VFIO_PCI_ROM_REGION_INDEX,
    VFIO_PCI_VGA_REGION_INDEX,
};

use crate::config::PciAddress;
use crate::config_space::*;
use crate::host::{HostDevice, HostDeviceError};
use crate::irq::IntxBridge;
use crate::metrics::METRICS;
use crate::platform::Platform;
use crate::quirks::Nvidia3d0;
use crate::region::{AddressSpace, Region, RegionKind};

/// Number of base address registers in a type 0 header.
pub const NUM_BARS: usize = 6;
/// Smallest ROM shadow handed to the guest.
pub const MIN_ROM_SIZE: usize = 0x800;
/// Time a function needs after a power state transition.
pub const PM_SETTLE_DELAY: Duration = Duration::from_millis(10);

/// Errors associated with opening a passthrough device.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum DeviceError {
    /// Host device error: {0}
    Host(#[from] HostDeviceError),
    /// {0} has no readable configuration space
    NoConfigSpace(PciAddress),
    /// Configuration space of {0} reads as all-ones
    ConfigSpaceUnreadable(PciAddress),
}

/// Result type for device operations.
pub type Result<T> = std::result::Result<T, DeviceError>;

/// A passthrough PCI function.
///
/// Lives behind an `Arc<Mutex<_>>` shared with the emulated PCI bus; quirk handlers installed on
/// the dispatch tables reach back into it through a weak reference.
#[derive(Debug)]
pub struct PassthroughDevice {
    pub(crate) address: PciAddress,
    pub(crate) group_id: u32,
    pub(crate) host: Option<Arc<dyn HostDevice>>,
    pub(crate) platform: Arc<Platform>,
    pub(crate) this: Weak<Mutex<PassthroughDevice>>,
    pub(crate) vendor_id: u16,
    pub(crate) slot: u8,
    pub(crate) irq_pin: u8,
    pub(crate) intx_supported: bool,
    pub(crate) pm_cap: u16,
    pub(crate) pm_reset_safe: bool,
    pub(crate) mem_enabled: bool,
    pub(crate) io_enabled: bool,
    pub(crate) rom_enabled: bool,
    pub(crate) config: Option<Region>,
    pub(crate) bars: [Option<Region>; NUM_BARS],
    pub(crate) bar_types: [u32; NUM_BARS],
    pub(crate) bar_regs: [u32; NUM_BARS],
    pub(crate) rom: Option<Region>,
    pub(crate) rom_reg: u32,
    pub(crate) vga: Vec<Region>,
    pub(crate) vga_claimed: bool,
    pub(crate) quirk_3d0: Nvidia3d0,
    pub(crate) irq: IntxBridge,
    pub(crate) closing: bool,
}

impl std::fmt::Debug for dyn HostDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HostDevice({:?})", self.info())
    }
}

impl PassthroughDevice {
    /// Sets up every region of the function behind `host`.
    ///
    /// Fails only when configuration space is unusable. Missing BARs, ROM or VGA windows just
    /// leave the corresponding resource absent.
    pub fn open(
        address: PciAddress,
        group_id: u32,
        host: Arc<dyn HostDevice>,
        rom_path: Option<&Path>,
        platform: Arc<Platform>,
    ) -> Result<Arc<Mutex<Self>>> {
        let info = host.info();
        let file = host.file();
        let irq_active = Arc::new(AtomicBool::new(false));
        let clock = platform.clock.clone();

        let cfg_info = host.region_info(VFIO_PCI_CONFIG_REGION_INDEX)?;
        if !cfg_info.readable() || cfg_info.size < PCI_CONFIG_HEADER_SIZE {
            return Err(DeviceError::NoConfigSpace(address));
        }
        let config = Region::from_host(
            RegionKind::Config,
            AddressSpace::Memory,
            &cfg_info,
            file.clone(),
            irq_active.clone(),
            clock.clone(),
        );
        let read_cfg = |offset: u64, data: &mut [u8]| {
            if config.io().read_at(offset, data).is_err() {
                data.fill(0xff);
            }
        };

        let mut id = [0u8; 2];
        read_cfg(u64::from(PCI_VENDOR_ID), &mut id);
        let vendor_id = u16::from_le_bytes(id);
        if vendor_id == 0xffff {
            return Err(DeviceError::ConfigSpaceUnreadable(address));
        }

        let mut bars: [Option<Region>; NUM_BARS] = Default::default();
        let mut bar_types = [0u32; NUM_BARS];
        for (index, bar) in bars.iter_mut().enumerate() {
            let reg = host.region_info(index as u32)?;
            if reg.size == 0 {
                continue;
            }
            // Type bits are fixed by the hardware; query them once.
            let mut low = [0u8; 1];
            read_cfg(u64::from(bar_offset(index)), &mut low);
            let (space, ty) = if u32::from(low[0]) & PCI_BAR_IO != 0 {
                (AddressSpace::Io, u32::from(low[0]) & !PCI_BAR_IO_MASK)
            } else {
                (AddressSpace::Memory, u32::from(low[0]) & !PCI_BAR_MEM_MASK)
            };
            bar_types[index] = ty;
            *bar = Some(Region::from_host(
                RegionKind::Bar(index as u8),
                space,
                &reg,
                file.clone(),
                irq_active.clone(),
                clock.clone(),
            ));
        }

        let rom = read_rom_image(address, host.as_ref(), rom_path)
            .map(|image| Region::rom_shadow(image, irq_active.clone(), clock.clone()));

        let mut vga = Vec::new();
        if info.num_regions > VFIO_PCI_VGA_REGION_INDEX {
            match host.region_info(VFIO_PCI_VGA_REGION_INDEX) {
                Ok(reg) if reg.size > 0 => {
                    vga.extend(Region::vga_split(
                        &reg,
                        file.clone(),
                        irq_active.clone(),
                        clock.clone(),
                    ));
                }
                Ok(_) => {}
                Err(err) => debug!("passthrough: {}: no VGA region: {}", address, err),
            }
        }

        let mut pin = [0u8; 1];
        read_cfg(u64::from(PCI_INTERRUPT_PIN), &mut pin);
        let irq_pin = pin[0];
        let intx_supported = match host.irq_count(VFIO_PCI_INTX_IRQ_INDEX) {
            Ok(count) => count > 0,
            Err(err) => {
                warn!("passthrough: {}: {}", address, err);
                false
            }
        };
        let pm_cap = find_capability(&read_cfg, PCI_CAP_ID_PM);

        let irq = IntxBridge::new(
            address.to_string(),
            host.clone(),
            platform.irq.clone(),
            irq_active,
        );

        info!(
            "passthrough: {}: vendor {:#06x}, {} BARs, ROM {}, VGA {}, pin {}",
            address,
            vendor_id,
            bars.iter().flatten().count(),
            rom.as_ref().map_or(0, Region::size),
            !vga.is_empty(),
            irq_pin
        );

        Ok(Arc::new_cyclic(|this| {
            Mutex::new(PassthroughDevice {
                address,
                group_id,
                host: Some(host),
                platform,
                this: this.clone(),
                vendor_id,
                slot: 0,
                irq_pin,
                intx_supported,
                pm_cap,
                pm_reset_safe: false,
                mem_enabled: false,
                io_enabled: false,
                rom_enabled: false,
                config: Some(config),
                bars,
                bar_types,
                bar_regs: [0; NUM_BARS],
                rom,
                rom_reg: 0,
                vga,
                vga_claimed: false,
                quirk_3d0: Nvidia3d0::default(),
                irq,
                closing: false,
            })
        }))
    }

    /// Host address of the function.
    pub fn address(&self) -> PciAddress {
        self.address
    }

    /// IOMMU group the function belongs to.
    pub fn group_id(&self) -> u32 {
        self.group_id
    }

    /// Slot on the emulated bus, 0 until the card is plugged in.
    pub fn slot(&self) -> u8 {
        self.slot
    }

    /// Records the slot the emulated bus assigned.
    pub fn set_slot(&mut self, slot: u8) {
        self.slot = slot;
        self.irq.set_route(slot, self.irq_pin);
    }

    /// Starts INTx bridging if the function uses an interrupt pin the host can deliver.
    pub fn enable_interrupts(&mut self) {
        if !self.intx_supported || self.irq_pin == 0 {
            debug!("passthrough: {}: no INTx", self.address);
            return;
        }
        if let Err(err) = self.irq.enable() {
            warn!("passthrough: {}: interrupts unavailable: {}", self.address, err);
        }
    }

    /// Drives the virtual interrupt line. Called from the emulator's periodic timer.
    pub fn poll_interrupts(&mut self) {
        self.irq.poll();
    }

    /// Stops interrupt bridging, takes every region off the dispatch tables and releases the
    /// host device.
    ///
    /// The card stays on the emulated bus but reads as absent from then on. Once every region
    /// and the interrupt bridge are gone nothing holds the device fd, so the kernel gets the
    /// function back even while the bus keeps the card.
    pub fn close(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;
        self.irq.release();
        self.unmap_all();
        self.bars = Default::default();
        self.rom = None;
        self.vga.clear();
        self.config = None;
        self.host = None;
        debug!("passthrough: {}: closed", self.address);
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closing
    }

    pub(crate) fn host_config_read(&self, offset: u16, data: &mut [u8]) {
        let Some(config) = self.config.as_ref() else {
            data.fill(0xff);
            return;
        };
        if let Err(err) = config.io().read_at(u64::from(offset), data) {
            METRICS.config_access_fails.inc();
            debug!(
                "passthrough: {}: config read at {:#x}: {}",
                self.address, offset, err
            );
            data.fill(0xff);
        }
    }

    pub(crate) fn host_config_write(&self, offset: u16, data: &[u8]) {
        let Some(config) = self.config.as_ref() else {
            return;
        };
        if let Err(err) = config.io().write_at(u64::from(offset), data) {
            METRICS.config_access_fails.inc();
            debug!(
                "passthrough: {}: config write at {:#x}: {}",
                self.address, offset, err
            );
        }
    }

    pub(crate) fn host_config_read_u16(&self, offset: u16) -> u16 {
        let mut data = [0u8; 2];
        self.host_config_read(offset, &mut data);
        u16::from_le_bytes(data)
    }

    /// Moves the function to power state `state` (0 = D0, 3 = D3hot) and waits for it to settle.
    pub(crate) fn set_power_state(&self, state: u16) {
        if self.pm_cap == 0 {
            return;
        }
        let ctrl = self.pm_cap + PCI_PM_CTRL;
        let pmcsr = self.host_config_read_u16(ctrl);
        let new = (pmcsr & !PCI_PM_CTRL_STATE_MASK) | (state & PCI_PM_CTRL_STATE_MASK);
        self.host_config_write(ctrl, &new.to_le_bytes());
        thread::sleep(PM_SETTLE_DELAY);
    }

    /// Size of host configuration space.
    pub(crate) fn config_size(&self) -> u64 {
        self.config.as_ref().map_or(0, Region::size)
    }
}

/// Walks the capability list once, returning the offset of capability `id` or 0.
fn find_capability(read_cfg: &dyn Fn(u64, &mut [u8]), id: u8) -> u16 {
    let mut status = [0u8; 2];
    read_cfg(u64::from(PCI_STATUS), &mut status);
    if u16::from_le_bytes(status) & PCI_STATUS_CAP_LIST == 0 {
        return 0;
    }
    let mut ptr = [0u8; 1];
    read_cfg(u64::from(PCI_CAPABILITY_LIST), &mut ptr);
    let mut pos = ptr[0] & !0x3;
    // A well formed list cannot hold more entries than fit in the header's remaining space.
    for _ in 0..PCI_CAP_MAX_ENTRIES {
        if pos < 0x40 {
            break;
        }
        let mut cap = [0u8; 2];
        read_cfg(u64::from(pos), &mut cap);
        if cap[0] == 0xff {
            break;
        }
        if cap[0] == id {
            return u16::from(pos);
        }
        pos = cap[1] & !0x3;
    }
    0
}

/// Reads the ROM image handed to the guest: the configured file if any, else the host ROM BAR.
///
/// The result is padded to a power of two no smaller than [`MIN_ROM_SIZE`].
fn read_rom_image(
    address: PciAddress,
    host: &dyn HostDevice,
    rom_path: Option<&Path>,
) -> Option<Vec<u8>> {
    let host_rom = host
        .region_info(VFIO_PCI_ROM_REGION_INDEX)
        .ok()
        .filter(|info| info.size > 0);

    let mut image = None;
    if let Some(path) = rom_path {
        match fs::read(path) {
            Ok(data) if !data.is_empty() => image = Some(data),
            Ok(_) => warn!("passthrough: {}: ROM file {:?} is empty", address, path),
            Err(err) => warn!(
                "passthrough: {}: cannot read ROM file {:?}: {}",
                address, path, err
            ),
        }
    }
    if image.is_none() {
        if let Some(info) = host_rom.filter(|info| info.readable()) {
            let mut data = vec![0u8; usize::try_from(info.size).ok()?];
            match host.file().read_exact_at(&mut data, info.offset) {
                Ok(()) => image = Some(data),
                Err(err) => warn!("passthrough: {}: cannot read host ROM: {}", address, err),
            }
        }
    }

    let mut image = image?;
    let host_size = host_rom.map_or(0, |info| info.size as usize);
    let size = image
        .len()
        .max(host_size)
        .next_power_of_two()
        .max(MIN_ROM_SIZE);
    image.resize(size, 0);
    Some(image)
}
