// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Reset of passthrough devices.
//!
//! A bus reset reaches every function behind the same bridge, so it is coordinated across all
//! passthrough devices the kernel lists as dependents: they are quiesced first, reset together
//! by a single ioctl and brought back afterwards. When a bus reset is not possible the initiating
//! device falls back to a function-level or power-management reset.

use std::collections::{BTreeMap, HashSet};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use crate::config::PciAddress;
use crate::config_space::{
    bar_offset, PCI_COMMAND, PCI_COMMAND_IO, PCI_COMMAND_MASTER, PCI_COMMAND_MEMORY,
    PCI_PM_CTRL, PCI_PM_CTRL_NO_SOFT_RESET, PCI_PM_CTRL_STATE_MASK,
};
use crate::device::{PassthroughDevice, NUM_BARS};
use crate::group::Group;
use crate::host::{DependentDevice, HostDevice, HostDeviceError};
use crate::metrics::METRICS;
use crate::quirks::Nvidia3d0;

const PCI_PM_STATE_D0: u16 = 0;
const PCI_PM_STATE_D3HOT: u16 = 3;

/// Errors associated with a bus reset.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum ResetError {
    /// Cannot list the functions affected by the reset: {0}
    Info(HostDeviceError),
    /// {0} is in group {1}, which this process does not own
    GroupNotOwned(PciAddress, u32),
    /// Bus reset failed: {0}
    HotReset(HostDeviceError),
}

impl PassthroughDevice {
    /// Quiesces the function ahead of a reset.
    ///
    /// Stops interrupt bridging, brings the function to D0 and turns off decoding and bus
    /// mastering.
    pub(crate) fn pre_reset(&mut self) {
        self.irq.disable();

        if self.pm_cap != 0 {
            let pmcsr = self.host_config_read_u16(self.pm_cap + PCI_PM_CTRL);
            self.pm_reset_safe = pmcsr & PCI_PM_CTRL_NO_SOFT_RESET == 0;
            if pmcsr & PCI_PM_CTRL_STATE_MASK != PCI_PM_STATE_D0 {
                debug!("passthrough: {}: waking to D0", self.address);
                self.set_power_state(PCI_PM_STATE_D0);
            }
        }

        let command = self.config_read_byte(PCI_COMMAND);
        self.config_write_byte(
            PCI_COMMAND,
            command & !(PCI_COMMAND_IO | PCI_COMMAND_MEMORY | PCI_COMMAND_MASTER),
        );
    }

    /// Brings the function back after a reset with every BAR unprogrammed.
    pub(crate) fn post_reset(&mut self) {
        if self.closing {
            return;
        }
        self.enable_interrupts();

        for index in 0..NUM_BARS {
            self.host_config_write(bar_offset(index), &[0u8; 4]);
        }
        self.bar_regs = [0; NUM_BARS];
        self.rom_reg = 0;
        self.rom_enabled = false;
        self.quirk_3d0 = Nvidia3d0::default();
        self.unmap_all();
    }

    /// Resets the function alone: a function-level reset if the host offers one, else a
    /// D3hot/D0 cycle if that actually resets the function.
    pub(crate) fn fallback_reset(&mut self) {
        let host = self.host.as_ref().filter(|host| host.info().supports_reset());
        if let Some(host) = host {
            match host.reset() {
                Ok(()) => {
                    debug!("passthrough: {}: function reset", self.address);
                    return;
                }
                Err(err) => warn!("passthrough: {}: {}", self.address, err),
            }
        }
        if self.pm_cap != 0 && self.pm_reset_safe {
            self.set_power_state(PCI_PM_STATE_D3HOT);
            self.set_power_state(PCI_PM_STATE_D0);
            debug!("passthrough: {}: power management reset", self.address);
            return;
        }
        warn!(
            "passthrough: {}: no reset method, continuing in current state",
            self.address
        );
    }
}

fn clear_marks(groups: &mut BTreeMap<u32, Group>) {
    for group in groups.values_mut() {
        group.resetting = false;
    }
}

// Marks the group of every dependent and returns their fds, each group once.
fn mark_groups(
    groups: &mut BTreeMap<u32, Group>,
    deps: &[DependentDevice],
) -> Result<Vec<RawFd>, ResetError> {
    if let Some(dep) = deps
        .iter()
        .find(|dep| !groups.get(&dep.group_id).is_some_and(Group::is_attached))
    {
        return Err(ResetError::GroupNotOwned(dep.address, dep.group_id));
    }

    let mut fds = Vec::new();
    for dep in deps {
        if let Some(group) = groups.get_mut(&dep.group_id) {
            if !group.resetting {
                group.resetting = true;
                fds.push(group.as_raw_fd());
            }
        }
    }
    Ok(fds)
}

// Quiesces the other dependents and resets the bus. `others` collects the devices quiesced.
fn reset_bus(
    groups: &mut BTreeMap<u32, Group>,
    devices: &[Arc<Mutex<PassthroughDevice>>],
    index: usize,
    host: &dyn HostDevice,
    others: &mut Vec<usize>,
) -> Result<(), ResetError> {
    let deps = host.hot_reset_info().map_err(ResetError::Info)?;
    let fds = mark_groups(groups, &deps)?;

    for (i, device) in devices.iter().enumerate() {
        if i == index {
            continue;
        }
        let mut dev = device.lock().expect("Poisoned lock");
        if deps.iter().any(|dep| dep.address == dev.address) {
            dev.pre_reset();
            others.push(i);
        }
    }

    host.pci_hot_reset(&fds).map_err(ResetError::HotReset)
}

/// Resets device `index` of `devices`, together with every passthrough device sharing its bus.
///
/// Returns the addresses of all devices that went through the reset.
pub(crate) fn hot_reset(
    groups: &mut BTreeMap<u32, Group>,
    devices: &[Arc<Mutex<PassthroughDevice>>],
    index: usize,
) -> Vec<PciAddress> {
    let Some(initiator) = devices.get(index) else {
        return Vec::new();
    };
    let (address, host) = {
        let mut dev = initiator.lock().expect("Poisoned lock");
        let Some(host) = dev.host.clone() else {
            debug!("passthrough: {}: closed, not reset", dev.address);
            return Vec::new();
        };
        dev.pre_reset();
        (dev.address, host)
    };

    let mut others = Vec::new();
    let result = reset_bus(groups, devices, index, host.as_ref(), &mut others);
    clear_marks(groups);

    match result {
        Ok(()) => {
            METRICS.hot_resets.inc();
            info!(
                "passthrough: {}: bus reset with {} other device(s)",
                address,
                others.len()
            );
        }
        Err(err) => {
            METRICS.hot_reset_fails.inc();
            warn!("passthrough: {}: {}", address, err);
            initiator.lock().expect("Poisoned lock").fallback_reset();
        }
    }

    let mut reset = Vec::with_capacity(others.len() + 1);
    for i in others {
        let mut dev = devices[i].lock().expect("Poisoned lock");
        dev.post_reset();
        reset.push(dev.address);
    }
    initiator.lock().expect("Poisoned lock").post_reset();
    reset.push(address);
    reset
}

/// Resets every device once, skipping those already reset as a dependent of an earlier one.
pub(crate) fn reset_all(
    groups: &mut BTreeMap<u32, Group>,
    devices: &[Arc<Mutex<PassthroughDevice>>],
) {
    let mut done = HashSet::new();
    for index in 0..devices.len() {
        let address = devices[index].lock().expect("Poisoned lock").address;
        if done.contains(&address) {
            continue;
        }
        done.extend(hot_reset(groups, devices, index));
    }
}
