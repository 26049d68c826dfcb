// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Configuration space emulation of passthrough devices and the remapping it drives.
//!
//! Every access is decomposed into byte accesses. Each byte is passed through to the host
//! first and then interpreted locally, so that base address registers, the ROM register and the
//! command register reflect what the guest programmed rather than what the host holds.

use log::debug;

use crate::device::{PassthroughDevice, NUM_BARS};
use crate::platform::PciCard;
use crate::quirks;
use crate::region::{AddressSpace, RegionKind, VGA_IO_HI_BASE, VGA_IO_LO_BASE, VGA_MEM_BASE};

pub(crate) const PCI_CONFIG_HEADER_SIZE: u64 = 0x40;
pub(crate) const PCI_VENDOR_ID: u16 = 0x00;
pub(crate) const PCI_COMMAND: u16 = 0x04;
pub(crate) const PCI_COMMAND_IO: u8 = 0x01;
pub(crate) const PCI_COMMAND_MEMORY: u8 = 0x02;
pub(crate) const PCI_COMMAND_MASTER: u8 = 0x04;
pub(crate) const PCI_STATUS: u16 = 0x06;
pub(crate) const PCI_STATUS_CAP_LIST: u16 = 0x10;
pub(crate) const PCI_HEADER_TYPE: u16 = 0x0e;
pub(crate) const PCI_HEADER_TYPE_MULTI_FUNCTION: u8 = 0x80;
pub(crate) const PCI_BAR0_OFFSET: u16 = 0x10;
pub(crate) const PCI_BAR_IO: u32 = 0x1;
pub(crate) const PCI_BAR_IO_MASK: u32 = !0x3;
pub(crate) const PCI_BAR_MEM_MASK: u32 = !0xf;
pub(crate) const PCI_ROM_ADDRESS: u16 = 0x30;
pub(crate) const PCI_ROM_ADDRESS_ENABLE: u32 = 0x1;
pub(crate) const PCI_ROM_ADDRESS_MASK: u32 = !0x7ff;
pub(crate) const PCI_CAPABILITY_LIST: u16 = 0x34;
pub(crate) const PCI_INTERRUPT_PIN: u16 = 0x3d;
pub(crate) const PCI_CAP_ID_PM: u8 = 0x01;
pub(crate) const PCI_CAP_MAX_ENTRIES: usize = 48;
pub(crate) const PCI_PM_CTRL: u16 = 0x04;
pub(crate) const PCI_PM_CTRL_STATE_MASK: u16 = 0x3;
pub(crate) const PCI_PM_CTRL_NO_SOFT_RESET: u16 = 0x8;

const PCI_BAR_LAST: u16 = PCI_BAR0_OFFSET + 4 * NUM_BARS as u16 - 1;
const PCI_ROM_ADDRESS_LAST: u16 = PCI_ROM_ADDRESS + 3;

pub(crate) fn bar_offset(index: usize) -> u16 {
    PCI_BAR0_OFFSET + 4 * index as u16
}

fn replace_byte(reg: u32, byte: u16, value: u8) -> u32 {
    let shift = 8 * u32::from(byte);
    (reg & !(0xff << shift)) | (u32::from(value) << shift)
}

// Clears the address bits below a power of two `size`.
fn align_to(reg: u32, size: u64) -> u32 {
    let align = !(size.max(1) - 1);
    (u64::from(reg) & align) as u32
}

impl PassthroughDevice {
    /// Reads configuration byte `offset` as the guest sees it.
    pub fn config_read_byte(&mut self, offset: u16) -> u8 {
        let mut data = [0xffu8; 1];
        self.host_config_read(offset, &mut data);
        let value = data[0];

        match offset {
            PCI_HEADER_TYPE => value & !PCI_HEADER_TYPE_MULTI_FUNCTION,
            PCI_BAR0_OFFSET..=PCI_BAR_LAST => {
                let index = usize::from((offset - PCI_BAR0_OFFSET) / 4);
                (self.bar_register(index) >> (8 * ((offset - PCI_BAR0_OFFSET) % 4))) as u8
            }
            PCI_ROM_ADDRESS..=PCI_ROM_ADDRESS_LAST => {
                (self.rom_register() >> (8 * (offset - PCI_ROM_ADDRESS))) as u8
            }
            _ => value,
        }
    }

    /// Writes configuration byte `offset` on behalf of the guest.
    pub fn config_write_byte(&mut self, offset: u16, value: u8) {
        self.host_config_write(offset, &[value]);

        match offset {
            PCI_COMMAND => {
                self.mem_enabled = value & PCI_COMMAND_MEMORY != 0;
                self.io_enabled = value & PCI_COMMAND_IO != 0;
                self.remap_all();
            }
            PCI_BAR0_OFFSET..=PCI_BAR_LAST => {
                let index = usize::from((offset - PCI_BAR0_OFFSET) / 4);
                let Some(region) = self.bars[index].as_ref() else {
                    return;
                };
                let mask = match region.space() {
                    AddressSpace::Io => PCI_BAR_IO_MASK,
                    AddressSpace::Memory => PCI_BAR_MEM_MASK,
                };
                let reg = replace_byte(
                    self.bar_regs[index],
                    (offset - PCI_BAR0_OFFSET) % 4,
                    value,
                );
                self.bar_regs[index] = align_to(reg & mask, region.size());
                self.remap_bar(index);
            }
            PCI_ROM_ADDRESS..=PCI_ROM_ADDRESS_LAST => {
                let Some(rom) = self.rom.as_ref() else {
                    return;
                };
                let reg = replace_byte(self.rom_register(), offset - PCI_ROM_ADDRESS, value);
                self.rom_enabled = reg & PCI_ROM_ADDRESS_ENABLE != 0;
                self.rom_reg = align_to(reg & PCI_ROM_ADDRESS_MASK, rom.size());
                self.remap_rom();
            }
            PCI_INTERRUPT_PIN => {
                let mut pin = [0u8; 1];
                self.host_config_read(PCI_INTERRUPT_PIN, &mut pin);
                self.irq_pin = pin[0];
                self.irq.set_route(self.slot, self.irq_pin);
            }
            _ => {}
        }
    }

    /// Reads `data.len()` bytes at `offset`, little-endian, one byte at a time.
    pub fn config_read(&mut self, offset: u16, data: &mut [u8]) {
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = self.config_read_byte(offset.wrapping_add(i as u16));
        }
    }

    /// Writes `data` at `offset`, little-endian, one byte at a time.
    pub fn config_write(&mut self, offset: u16, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            self.config_write_byte(offset.wrapping_add(i as u16), *byte);
        }
    }

    fn bar_register(&self, index: usize) -> u32 {
        match self.bars[index] {
            Some(_) => self.bar_regs[index] | self.bar_types[index],
            None => 0,
        }
    }

    fn rom_register(&self) -> u32 {
        match self.rom {
            Some(_) if self.rom_enabled => self.rom_reg | PCI_ROM_ADDRESS_ENABLE,
            Some(_) => self.rom_reg,
            None => 0,
        }
    }

    /// Re-evaluates where every BAR, the ROM and the VGA windows belong.
    pub(crate) fn remap_all(&mut self) {
        for index in 0..NUM_BARS {
            self.remap_bar(index);
        }
        self.remap_rom();
        self.remap_vga();
    }

    /// Takes every region off the dispatch tables.
    pub(crate) fn unmap_all(&mut self) {
        let platform = self.platform.clone();
        for region in self.bars.iter_mut().flatten() {
            region.uninstall(&platform);
        }
        if let Some(rom) = self.rom.as_mut() {
            rom.uninstall(&platform);
        }
        for region in self.vga.iter_mut() {
            region.uninstall(&platform);
        }
        self.set_vga_claimed(false);
    }

    fn remap_bar(&mut self, index: usize) {
        let platform = self.platform.clone();
        let Some(space) = self.bars[index].as_mut().map(|region| {
            region.uninstall(&platform);
            region.space()
        }) else {
            return;
        };

        let enabled = match space {
            AddressSpace::Memory => self.mem_enabled,
            AddressSpace::Io => self.io_enabled,
        };
        let base = u64::from(self.bar_regs[index]);
        if !enabled || base == 0 {
            return;
        }

        let Some(handler) = self.bars[index]
            .as_ref()
            .map(|region| quirks::bar_handler(self, region))
        else {
            return;
        };
        if let Some(region) = self.bars[index].as_mut() {
            if let Err(err) = region.install(&platform, base, handler) {
                debug!(
                    "passthrough: {}: BAR{} not mapped at {:#x}: {}",
                    self.address, index, base, err
                );
            }
        }
    }

    fn remap_rom(&mut self) {
        let platform = self.platform.clone();
        let Some(rom) = self.rom.as_mut() else {
            return;
        };
        rom.uninstall(&platform);

        let base = u64::from(self.rom_reg);
        if !self.rom_enabled || !self.mem_enabled || base == 0 {
            return;
        }
        let handler = rom.plain_handler();
        if let Err(err) = rom.install(&platform, base, handler) {
            debug!(
                "passthrough: {}: ROM not mapped at {:#x}: {}",
                self.address, base, err
            );
        }
    }

    fn remap_vga(&mut self) {
        if self.vga.is_empty() {
            return;
        }
        let platform = self.platform.clone();
        for region in self.vga.iter_mut() {
            region.uninstall(&platform);
        }

        let mut claimed = false;
        for index in 0..self.vga.len() {
            let region = &self.vga[index];
            let (enabled, base) = match region.kind() {
                RegionKind::VgaMem => (self.mem_enabled, VGA_MEM_BASE),
                RegionKind::VgaIoLo => (self.io_enabled, VGA_IO_LO_BASE),
                _ => (self.io_enabled, VGA_IO_HI_BASE),
            };
            if !enabled {
                continue;
            }
            let handler = quirks::vga_handler(self, region);
            match self.vga[index].install(&platform, base, handler) {
                Ok(()) => claimed = true,
                Err(err) => debug!(
                    "passthrough: {}: VGA window {:#x} not mapped: {}",
                    self.address, base, err
                ),
            }
        }
        self.set_vga_claimed(claimed);
    }

    fn set_vga_claimed(&mut self, claimed: bool) {
        if claimed != self.vga_claimed {
            self.vga_claimed = claimed;
            self.platform.vga.set_passthrough_vga(claimed);
        }
    }
}

impl PciCard for PassthroughDevice {
    fn config_read(&mut self, func: u8, offset: u8) -> u8 {
        // Only function 0 of the host device is presented.
        if func != 0 || self.closing {
            return 0xff;
        }
        self.config_read_byte(u16::from(offset))
    }

    fn config_write(&mut self, func: u8, offset: u8, value: u8) {
        if func != 0 || self.closing {
            return;
        }
        self.config_write_byte(u16::from(offset), value);
    }
}
