// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Passthrough of host PCI functions to the emulated PCI bus through VFIO.
//!
//! The [`PassthroughManager`] opens the VFIO container, claims the IOMMU groups of the configured
//! functions and maps guest memory for DMA. Each function becomes a [`PassthroughDevice`]: its
//! configuration space is emulated on top of the host's, its BARs, expansion ROM and legacy VGA
//! windows are installed on the emulator's memory and port dispatch tables as the guest programs
//! them, and its INTx interrupt is bridged onto the emulated interrupt controller.
#![warn(missing_docs)]
#![warn(clippy::undocumented_unsafe_blocks)]

#[macro_use]
extern crate vmm_sys_util;

pub mod bus;
pub mod config;
mod config_space;
pub mod container;
pub mod device;
pub mod group;
pub mod host;
pub mod irq;
pub mod manager;
pub mod metrics;
pub mod platform;
pub mod quirks;
pub mod region;
pub mod reset;
pub mod timing;
mod vfio_ioctls;

pub use crate::config::{DeviceConfig, PassthroughConfig, PciAddress};
pub use crate::device::PassthroughDevice;
pub use crate::irq::IRQ_POLL_INTERVAL;
pub use crate::manager::{AttachError, KernelVfio, PassthroughManager, VfioHost};
pub use crate::platform::{CycleClock, InterruptLine, PciBus, PciCard, Platform, VgaArbiter};
