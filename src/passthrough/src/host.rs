// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-device kernel interface: the VFIO device fd and the ioctls issued on it.

use std::fs::File;
use std::mem::{size_of, size_of_val};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use vfio_bindings::bindings::vfio::*;
use vmm_sys_util::errno;
use vmm_sys_util::eventfd::EventFd;
use vmm_sys_util::ioctl::{ioctl, ioctl_with_mut_ref, ioctl_with_ref};

use crate::config::PciAddress;
use crate::vfio_ioctls::*;

/// Errors associated with the VFIO device fd.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum HostDeviceError {
    /// VFIO_DEVICE_GET_INFO failed: {0}
    GetInfo(errno::Error),
    /// Host device is not a PCI device or exposes too few regions
    NotPci,
    /// VFIO_DEVICE_GET_REGION_INFO failed for region {0}: {1}
    GetRegionInfo(u32, errno::Error),
    /// VFIO_DEVICE_GET_IRQ_INFO failed for index {0}: {1}
    GetIrqInfo(u32, errno::Error),
    /// VFIO_DEVICE_SET_IRQS failed: {0}
    SetIrqs(errno::Error),
    /// VFIO_DEVICE_RESET failed: {0}
    Reset(errno::Error),
    /// VFIO_DEVICE_GET_PCI_HOT_RESET_INFO failed: {0}
    HotResetInfo(errno::Error),
    /// Dependent device set changed between queries: {0} entries announced, {1} reported
    HotResetInfoChanged(u32, u32),
    /// VFIO_DEVICE_PCI_HOT_RESET failed: {0}
    HotReset(errno::Error),
}

/// Result type for host device operations.
pub type Result<T> = std::result::Result<T, HostDeviceError>;

/// Device-level information reported by the kernel.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    /// `VFIO_DEVICE_FLAGS_*`.
    pub flags: u32,
    /// Number of regions the device exposes.
    pub num_regions: u32,
    /// Number of interrupt indexes the device exposes.
    pub num_irqs: u32,
}

impl DeviceInfo {
    /// Whether `VFIO_DEVICE_RESET` is supported.
    pub fn supports_reset(&self) -> bool {
        self.flags & VFIO_DEVICE_FLAGS_RESET != 0
    }
}

/// Placement and capabilities of one region within the device fd.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    /// Region index (`VFIO_PCI_*_REGION_INDEX`).
    pub index: u32,
    /// `VFIO_REGION_INFO_FLAG_*`.
    pub flags: u32,
    /// Region size in bytes, 0 if not implemented.
    pub size: u64,
    /// Offset of the region within the device fd.
    pub offset: u64,
}

impl RegionInfo {
    /// Region may be read.
    pub fn readable(&self) -> bool {
        self.flags & VFIO_REGION_INFO_FLAG_READ != 0
    }

    /// Region may be written.
    pub fn writable(&self) -> bool {
        self.flags & VFIO_REGION_INFO_FLAG_WRITE != 0
    }

    /// Region may be mapped with `mmap`.
    pub fn mmappable(&self) -> bool {
        self.flags & VFIO_REGION_INFO_FLAG_MMAP != 0
    }
}

/// A function the kernel says would be affected by a bus reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependentDevice {
    /// IOMMU group owning the function.
    pub group_id: u32,
    /// Host address of the function.
    pub address: PciAddress,
}

impl From<&vfio_pci_dependent_device> for DependentDevice {
    fn from(dev: &vfio_pci_dependent_device) -> Self {
        // The hot reset info ioctl reports group ids, never iommufd device ids.
        let group_id = dev.group_id;
        DependentDevice {
            group_id,
            address: PciAddress {
                domain: dev.segment,
                bus: dev.bus,
                device: dev.devfn >> 3,
                function: dev.devfn & 0x7,
            },
        }
    }
}

/// Kernel operations on a passthrough device.
///
/// Implemented over a VFIO device fd by [`VfioDevice`]. Shared between the emulation thread and
/// the device's interrupt thread.
pub trait HostDevice: Send + Sync {
    /// Device flags and counts.
    fn info(&self) -> DeviceInfo;
    /// Describes region `index`.
    fn region_info(&self, index: u32) -> Result<RegionInfo>;
    /// Number of vectors behind interrupt `index`.
    fn irq_count(&self, index: u32) -> Result<u32>;
    /// The fd regions are read, written and mapped through.
    fn file(&self) -> Arc<File>;
    /// Routes INTx to `trigger`.
    fn enable_intx(&self, trigger: &EventFd) -> Result<()>;
    /// Tears down INTx routing.
    fn disable_intx(&self) -> Result<()>;
    /// Masks INTx at the host.
    fn mask_intx(&self) -> Result<()>;
    /// Unmasks INTx at the host.
    fn unmask_intx(&self) -> Result<()>;
    /// Function-level reset.
    fn reset(&self) -> Result<()>;
    /// Functions a bus reset of this device would affect, including itself.
    fn hot_reset_info(&self) -> Result<Vec<DependentDevice>>;
    /// Resets the bus, proving ownership of every affected group with `group_fds`.
    fn pci_hot_reset(&self, group_fds: &[RawFd]) -> Result<()>;
}

/// Runs the size-then-fill sequence of `VFIO_DEVICE_GET_PCI_HOT_RESET_INFO`.
///
/// `query` issues the ioctl on the buffer it is given. The first call carries no array and is
/// expected to fail with `ENOSPC` after reporting the count; the second call gets exactly that
/// many entries and must not report more.
// The dependent set may change between the two calls; that is reported as an error rather than
// retried.
pub(crate) fn query_hot_reset_info<F>(mut query: F) -> Result<Vec<DependentDevice>>
where
    F: FnMut(&mut [vfio_pci_hot_reset_info]) -> std::result::Result<(), errno::Error>,
{
    let mut sizing = vec_with_array_field::<vfio_pci_hot_reset_info, vfio_pci_dependent_device>(0);
    sizing[0].argsz = size_of::<vfio_pci_hot_reset_info>() as u32;
    match query(&mut sizing) {
        Ok(()) if sizing[0].count == 0 => return Ok(Vec::new()),
        Ok(()) => {}
        Err(err) if err.errno() == libc::ENOSPC => {}
        Err(err) => return Err(HostDeviceError::HotResetInfo(err)),
    }
    let count = sizing[0].count;

    let mut info = vec_with_array_field::<vfio_pci_hot_reset_info, vfio_pci_dependent_device>(
        count as usize,
    );
    info[0].argsz = (size_of::<vfio_pci_hot_reset_info>()
        + count as usize * size_of::<vfio_pci_dependent_device>()) as u32;
    match query(&mut info) {
        Ok(()) => {}
        Err(err) if err.errno() == libc::ENOSPC => {
            return Err(HostDeviceError::HotResetInfoChanged(count, info[0].count));
        }
        Err(err) => return Err(HostDeviceError::HotResetInfo(err)),
    }
    let filled = info[0].count;
    if filled > count {
        return Err(HostDeviceError::HotResetInfoChanged(count, filled));
    }

    // SAFETY: `info` was sized for `count` trailing entries and the kernel filled `filled` of
    // them.
    let devices = unsafe { info[0].devices.as_slice(filled as usize) };
    Ok(devices.iter().map(DependentDevice::from).collect())
}

/// A VFIO device fd.
#[derive(Debug)]
pub struct VfioDevice {
    file: Arc<File>,
    info: DeviceInfo,
}

impl VfioDevice {
    /// Wraps a device fd obtained from its group, checking it is a usable PCI function.
    pub fn new(file: File) -> Result<Self> {
        let mut dev_info = vfio_device_info {
            argsz: size_of::<vfio_device_info>() as u32,
            ..Default::default()
        };
        // SAFETY: `file` is a VFIO device fd and `dev_info` is a valid, correctly sized
        // structure that outlives the call.
        let ret = unsafe { ioctl_with_mut_ref(&file, VFIO_DEVICE_GET_INFO(), &mut dev_info) };
        if ret < 0 {
            return Err(HostDeviceError::GetInfo(errno::Error::last()));
        }
        if dev_info.flags & VFIO_DEVICE_FLAGS_PCI == 0
            || dev_info.num_regions < VFIO_PCI_CONFIG_REGION_INDEX + 1
        {
            return Err(HostDeviceError::NotPci);
        }

        Ok(VfioDevice {
            file: Arc::new(file),
            info: DeviceInfo {
                flags: dev_info.flags,
                num_regions: dev_info.num_regions,
                num_irqs: dev_info.num_irqs,
            },
        })
    }

    fn set_irqs(&self, flags: u32, index: u32, count: u32, data: &[u8]) -> Result<()> {
        let mut irq_set = vec_with_array_field::<vfio_irq_set, u8>(data.len());
        irq_set[0].argsz = (size_of::<vfio_irq_set>() + data.len()) as u32;
        irq_set[0].flags = flags;
        irq_set[0].index = index;
        irq_set[0].start = 0;
        irq_set[0].count = count;
        // SAFETY: `irq_set` was allocated with room for `data.len()` trailing bytes.
        unsafe { irq_set[0].data.as_mut_slice(data.len()) }.copy_from_slice(data);

        // SAFETY: the fd is a VFIO device fd and `irq_set` is valid for `argsz` bytes.
        let ret = unsafe { ioctl_with_ref(&*self.file, VFIO_DEVICE_SET_IRQS(), &irq_set[0]) };
        if ret < 0 {
            return Err(HostDeviceError::SetIrqs(errno::Error::last()));
        }
        Ok(())
    }
}

impl HostDevice for VfioDevice {
    fn info(&self) -> DeviceInfo {
        self.info
    }

    fn region_info(&self, index: u32) -> Result<RegionInfo> {
        let mut reg_info = vfio_region_info {
            argsz: size_of::<vfio_region_info>() as u32,
            index,
            ..Default::default()
        };
        // SAFETY: the fd is a VFIO device fd and `reg_info` is valid for the call.
        let ret = unsafe {
            ioctl_with_mut_ref(&*self.file, VFIO_DEVICE_GET_REGION_INFO(), &mut reg_info)
        };
        if ret < 0 {
            return Err(HostDeviceError::GetRegionInfo(index, errno::Error::last()));
        }
        Ok(RegionInfo {
            index,
            flags: reg_info.flags,
            size: reg_info.size,
            offset: reg_info.offset,
        })
    }

    fn irq_count(&self, index: u32) -> Result<u32> {
        let mut irq_info = vfio_irq_info {
            argsz: size_of::<vfio_irq_info>() as u32,
            index,
            ..Default::default()
        };
        // SAFETY: the fd is a VFIO device fd and `irq_info` is valid for the call.
        let ret =
            unsafe { ioctl_with_mut_ref(&*self.file, VFIO_DEVICE_GET_IRQ_INFO(), &mut irq_info) };
        if ret < 0 {
            return Err(HostDeviceError::GetIrqInfo(index, errno::Error::last()));
        }
        Ok(irq_info.count)
    }

    fn file(&self) -> Arc<File> {
        self.file.clone()
    }

    fn enable_intx(&self, trigger: &EventFd) -> Result<()> {
        self.set_irqs(
            VFIO_IRQ_SET_DATA_EVENTFD | VFIO_IRQ_SET_ACTION_TRIGGER,
            VFIO_PCI_INTX_IRQ_INDEX,
            1,
            &trigger.as_raw_fd().to_ne_bytes(),
        )
    }

    fn disable_intx(&self) -> Result<()> {
        self.set_irqs(
            VFIO_IRQ_SET_DATA_NONE | VFIO_IRQ_SET_ACTION_TRIGGER,
            VFIO_PCI_INTX_IRQ_INDEX,
            0,
            &[],
        )
    }

    fn mask_intx(&self) -> Result<()> {
        self.set_irqs(
            VFIO_IRQ_SET_DATA_NONE | VFIO_IRQ_SET_ACTION_MASK,
            VFIO_PCI_INTX_IRQ_INDEX,
            1,
            &[],
        )
    }

    fn unmask_intx(&self) -> Result<()> {
        self.set_irqs(
            VFIO_IRQ_SET_DATA_NONE | VFIO_IRQ_SET_ACTION_UNMASK,
            VFIO_PCI_INTX_IRQ_INDEX,
            1,
            &[],
        )
    }

    fn reset(&self) -> Result<()> {
        // SAFETY: the fd is a VFIO device fd; the ioctl takes no argument.
        let ret = unsafe { ioctl(&*self.file, VFIO_DEVICE_RESET()) };
        if ret < 0 {
            return Err(HostDeviceError::Reset(errno::Error::last()));
        }
        Ok(())
    }

    fn hot_reset_info(&self) -> Result<Vec<DependentDevice>> {
        query_hot_reset_info(|buf| {
            // SAFETY: the fd is a VFIO device fd and `buf` spans at least `argsz` bytes.
            let ret = unsafe {
                ioctl_with_mut_ref(
                    &*self.file,
                    VFIO_DEVICE_GET_PCI_HOT_RESET_INFO(),
                    &mut buf[0],
                )
            };
            if ret < 0 {
                Err(errno::Error::last())
            } else {
                Ok(())
            }
        })
    }

    fn pci_hot_reset(&self, group_fds: &[RawFd]) -> Result<()> {
        let mut reset = vec_with_array_field::<vfio_pci_hot_reset, i32>(group_fds.len());
        reset[0].argsz = (size_of::<vfio_pci_hot_reset>() + size_of_val(group_fds)) as u32;
        reset[0].count = group_fds.len() as u32;
        // SAFETY: `reset` was allocated with room for `group_fds.len()` trailing fds.
        unsafe { reset[0].group_fds.as_mut_slice(group_fds.len()) }.copy_from_slice(group_fds);

        // SAFETY: the fd is a VFIO device fd and `reset` is valid for `argsz` bytes.
        let ret = unsafe { ioctl_with_ref(&*self.file, VFIO_DEVICE_PCI_HOT_RESET(), &reset[0]) };
        if ret < 0 {
            return Err(HostDeviceError::HotReset(errno::Error::last()));
        }
        Ok(())
    }
}
