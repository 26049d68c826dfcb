// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Interfaces of the surrounding emulator that passthrough devices call into or are called by.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::bus::Bus;

/// A card on the emulated PCI bus, addressed with byte granularity.
pub trait PciCard: Send {
    /// Reads the configuration byte at `offset` of function `func`.
    fn config_read(&mut self, func: u8, offset: u8) -> u8;
    /// Writes the configuration byte at `offset` of function `func`.
    fn config_write(&mut self, func: u8, offset: u8, value: u8);
}

/// The emulated PCI bus cards get plugged into.
pub trait PciBus {
    /// Adds `card` to the bus, returning the slot it was given or `None` if the bus is full.
    fn add_card(&mut self, card: Arc<Mutex<dyn PciCard>>) -> Option<u8>;
}

/// The emulated interrupt controller's view of a PCI INTx line.
pub trait InterruptLine: Send + Sync {
    /// Asserts the line routed to interrupt `pin` (1 = INTA) of the card in `slot`.
    fn raise(&self, slot: u8, pin: u8);
    /// Deasserts the line routed to interrupt `pin` of the card in `slot`.
    fn lower(&self, slot: u8, pin: u8);
}

/// The video subsystem, which must stop decoding legacy VGA when a passthrough device claims it.
pub trait VgaArbiter: Send + Sync {
    /// Called with `true` when a passthrough device starts decoding the legacy VGA ranges and
    /// `false` once it stops.
    fn set_passthrough_vga(&self, claimed: bool);
}

/// The CPU cycle accounting passthrough accesses are charged against.
pub trait CycleClock: Send + Sync {
    /// CPU cycles per PCI bus clock at the current speed settings.
    fn bus_timing(&self) -> u64;
    /// Removes `cycles` from the running CPU's budget.
    fn consume(&self, cycles: u64);
}

/// Everything a passthrough device needs from the emulator.
pub struct Platform {
    /// Memory dispatch table.
    pub mmio: Bus,
    /// Port I/O dispatch table.
    pub pio: Bus,
    /// Interrupt controller.
    pub irq: Arc<dyn InterruptLine>,
    /// Video subsystem.
    pub vga: Arc<dyn VgaArbiter>,
    /// Cycle accounting.
    pub clock: Arc<dyn CycleClock>,
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform")
            .field("mmio", &self.mmio)
            .field("pio", &self.pio)
            .finish_non_exhaustive()
    }
}
