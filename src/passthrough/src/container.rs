// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The process-wide VFIO container and the identity IOMMU mapping of guest RAM.

use std::fs::{File, OpenOptions};
use std::mem::size_of;
use std::os::unix::io::{AsRawFd, RawFd};

use log::{debug, error, warn};
use vfio_bindings::bindings::vfio::*;
use vm_memory::{Address, GuestMemory, GuestMemoryRegion, MemoryRegionAddress};
use vmm_sys_util::errno;
use vmm_sys_util::ioctl::{ioctl, ioctl_with_ref, ioctl_with_val};

use crate::metrics::METRICS;
use crate::vfio_ioctls::*;

/// Path of the VFIO container character device.
pub const VFIO_CONTAINER_PATH: &str = "/dev/vfio/vfio";

/// Errors associated with the VFIO container.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum ContainerError {
    /// Failed to open the VFIO container: {0}
    OpenContainer(std::io::Error),
    /// Unsupported VFIO API version {0}
    ApiVersion(i32),
    /// Host does not support the Type1 IOMMU
    Type1Unsupported,
    /// VFIO_SET_IOMMU failed: {0}
    SetIommu(errno::Error),
    /// VFIO_IOMMU_MAP_DMA failed at {0:#x}: {1}
    MapDma(u64, errno::Error),
    /// VFIO_IOMMU_UNMAP_DMA failed at {0:#x}: {1}
    UnmapDma(u64, errno::Error),
}

/// Result type for container operations.
pub type Result<T> = std::result::Result<T, ContainerError>;

/// One guest RAM range mapped into the IOMMU at its guest physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaRange {
    /// IO virtual address, equal to the guest physical address.
    pub iova: u64,
    /// Length in bytes.
    pub size: u64,
    /// Host virtual address backing the range.
    pub host_addr: u64,
}

/// Programs IOMMU translations.
pub trait DmaMapper {
    /// Maps `size` bytes at `host_addr` to `iova`, readable and writable by devices.
    fn map_dma(
        &self,
        iova: u64,
        size: u64,
        host_addr: u64,
    ) -> std::result::Result<(), errno::Error>;
    /// Removes the translation for [`iova`, `iova` + `size`).
    fn unmap_dma(&self, iova: u64, size: u64) -> std::result::Result<(), errno::Error>;
}

/// Maps `range`, retrying once after an unmap when the kernel reports it busy.
pub fn map_with_retry(mapper: &dyn DmaMapper, range: DmaRange) -> Result<()> {
    let res = match mapper.map_dma(range.iova, range.size, range.host_addr) {
        Err(err) if err.errno() == libc::EBUSY => {
            METRICS.dma_map_retries.inc();
            debug!(
                "passthrough: DMA range {:#x}+{:#x} busy, remapping",
                range.iova, range.size
            );
            // A stale translation is what usually holds the range; its removal may fail
            // harmlessly.
            let _ = mapper.unmap_dma(range.iova, range.size);
            mapper.map_dma(range.iova, range.size, range.host_addr)
        }
        res => res,
    };
    res.map_err(|err| {
        METRICS.dma_map_fails.inc();
        ContainerError::MapDma(range.iova, err)
    })
}

/// Maps every region of `mem` one to one into the IOMMU.
///
/// A range that cannot be mapped is logged and left out; the ranges that were mapped are
/// returned so they can be unmapped at teardown.
pub fn map_guest_memory<M: GuestMemory>(mapper: &dyn DmaMapper, mem: &M) -> Vec<DmaRange> {
    let mut mapped = Vec::new();
    for region in mem.iter() {
        let host_addr = match region.get_host_address(MemoryRegionAddress(0)) {
            Ok(addr) => addr as u64,
            Err(err) => {
                warn!(
                    "passthrough: guest RAM at {:#x} has no host mapping: {}",
                    region.start_addr().raw_value(),
                    err
                );
                continue;
            }
        };
        let range = DmaRange {
            iova: region.start_addr().raw_value(),
            size: region.len(),
            host_addr,
        };
        match map_with_retry(mapper, range) {
            Ok(()) => mapped.push(range),
            Err(err) => error!(
                "passthrough: devices cannot DMA to {:#x}+{:#x}: {}",
                range.iova, range.size, err
            ),
        }
    }
    mapped
}

/// Removes the translations installed by [`map_guest_memory`].
pub fn unmap_guest_memory(mapper: &dyn DmaMapper, ranges: &[DmaRange]) {
    for range in ranges {
        if let Err(err) = mapper.unmap_dma(range.iova, range.size) {
            warn!(
                "passthrough: {}",
                ContainerError::UnmapDma(range.iova, err)
            );
        }
    }
}

/// The VFIO container all groups are attached to.
#[derive(Debug)]
pub struct Container {
    file: File,
    iommu_set: bool,
}

impl Container {
    /// Opens the container and checks the host speaks the expected API with a Type1 IOMMU.
    pub fn open() -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(VFIO_CONTAINER_PATH)
            .map_err(ContainerError::OpenContainer)?;

        // SAFETY: `file` is a VFIO container fd; the ioctl takes no argument.
        let version = unsafe { ioctl(&file, VFIO_GET_API_VERSION()) };
        if version != VFIO_API_VERSION as i32 {
            return Err(ContainerError::ApiVersion(version));
        }
        // SAFETY: `file` is a VFIO container fd and the argument is passed by value.
        let ret = unsafe {
            ioctl_with_val(
                &file,
                VFIO_CHECK_EXTENSION(),
                libc::c_ulong::from(VFIO_TYPE1_IOMMU),
            )
        };
        if ret != 1 {
            return Err(ContainerError::Type1Unsupported);
        }

        Ok(Container {
            file,
            iommu_set: false,
        })
    }

    /// Selects the Type1 IOMMU. Only valid once a group is attached; later calls are no-ops.
    pub fn set_iommu(&mut self) -> Result<()> {
        if self.iommu_set {
            return Ok(());
        }
        // SAFETY: `file` is a VFIO container fd and the argument is passed by value.
        let ret = unsafe {
            ioctl_with_val(
                &self.file,
                VFIO_SET_IOMMU(),
                libc::c_ulong::from(VFIO_TYPE1_IOMMU),
            )
        };
        if ret < 0 {
            return Err(ContainerError::SetIommu(errno::Error::last()));
        }
        self.iommu_set = true;
        Ok(())
    }

    /// Whether the IOMMU model has been selected, which is when DMA mappings become possible.
    pub fn iommu_set(&self) -> bool {
        self.iommu_set
    }

    #[cfg(test)]
    pub(crate) fn from_file(file: File) -> Self {
        Container {
            file,
            iommu_set: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn mark_iommu_set(&mut self) {
        self.iommu_set = true;
    }
}

impl AsRawFd for Container {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl DmaMapper for Container {
    fn map_dma(
        &self,
        iova: u64,
        size: u64,
        host_addr: u64,
    ) -> std::result::Result<(), errno::Error> {
        let dma_map = vfio_iommu_type1_dma_map {
            argsz: size_of::<vfio_iommu_type1_dma_map>() as u32,
            flags: VFIO_DMA_MAP_FLAG_READ | VFIO_DMA_MAP_FLAG_WRITE,
            vaddr: host_addr,
            iova,
            size,
            ..Default::default()
        };
        // SAFETY: `file` is a VFIO container fd and `dma_map` is valid for the call.
        let ret = unsafe { ioctl_with_ref(&self.file, VFIO_IOMMU_MAP_DMA(), &dma_map) };
        if ret != 0 {
            return Err(errno::Error::last());
        }
        Ok(())
    }

    fn unmap_dma(&self, iova: u64, size: u64) -> std::result::Result<(), errno::Error> {
        let dma_unmap = vfio_iommu_type1_dma_unmap {
            argsz: size_of::<vfio_iommu_type1_dma_unmap>() as u32,
            iova,
            size,
            ..Default::default()
        };
        // SAFETY: `file` is a VFIO container fd and `dma_unmap` is valid for the call.
        let ret = unsafe { ioctl_with_ref(&self.file, VFIO_IOMMU_UNMAP_DMA(), &dma_unmap) };
        if ret != 0 {
            return Err(errno::Error::last());
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use vm_memory::{GuestAddress, GuestMemoryMmap};

    use super::*;

    /// IOMMU stand-in that fails the first `busy` map calls with `EBUSY`.
    #[derive(Debug, Default)]
    pub struct MockMapper {
        pub busy: Mutex<u32>,
        pub fail_with: Option<i32>,
        pub calls: Mutex<Vec<String>>,
        pub mapped: Mutex<Vec<(u64, u64)>>,
    }

    impl MockMapper {
        pub fn busy(times: u32) -> Self {
            MockMapper {
                busy: Mutex::new(times),
                ..Default::default()
            }
        }
    }

    impl DmaMapper for MockMapper {
        fn map_dma(
            &self,
            iova: u64,
            size: u64,
            _host_addr: u64,
        ) -> std::result::Result<(), errno::Error> {
            self.calls.lock().unwrap().push(format!("map {iova:#x}"));
            if let Some(errno) = self.fail_with {
                return Err(errno::Error::new(errno));
            }
            let mut busy = self.busy.lock().unwrap();
            if *busy > 0 {
                *busy -= 1;
                return Err(errno::Error::new(libc::EBUSY));
            }
            self.mapped.lock().unwrap().push((iova, size));
            Ok(())
        }

        fn unmap_dma(&self, iova: u64, size: u64) -> std::result::Result<(), errno::Error> {
            self.calls.lock().unwrap().push(format!("unmap {iova:#x}"));
            self.mapped.lock().unwrap().retain(|r| *r != (iova, size));
            Ok(())
        }
    }

    fn range() -> DmaRange {
        DmaRange {
            iova: 0x10_0000,
            size: 0x1000,
            host_addr: 0x7f00_0000_0000,
        }
    }

    #[test]
    fn test_map_busy_retried_once() {
        let mapper = MockMapper::busy(1);
        map_with_retry(&mapper, range()).unwrap();
        assert_eq!(
            *mapper.calls.lock().unwrap(),
            vec!["map 0x100000", "unmap 0x100000", "map 0x100000"]
        );
        assert_eq!(*mapper.mapped.lock().unwrap(), vec![(0x10_0000, 0x1000)]);
    }

    #[test]
    fn test_map_busy_twice_fails() {
        let mapper = MockMapper::busy(2);
        let retries = METRICS.dma_map_retries.count();
        match map_with_retry(&mapper, range()) {
            Err(ContainerError::MapDma(0x10_0000, err)) => assert_eq!(err.errno(), libc::EBUSY),
            other => panic!("unexpected result: {other:?}"),
        }
        // Exactly one unmap and two maps: no second retry.
        assert_eq!(mapper.calls.lock().unwrap().len(), 3);
        assert!(METRICS.dma_map_retries.count() > retries);
    }

    #[test]
    fn test_map_other_error_not_retried() {
        let mapper = MockMapper {
            fail_with: Some(libc::ENOMEM),
            ..Default::default()
        };
        map_with_retry(&mapper, range()).unwrap_err();
        assert_eq!(*mapper.calls.lock().unwrap(), vec!["map 0x100000"]);
    }

    #[test]
    fn test_map_guest_memory() {
        let mem = GuestMemoryMmap::<()>::from_ranges(&[
            (GuestAddress(0), 0x10000),
            (GuestAddress(0x100000), 0x20000),
        ])
        .unwrap();
        let mapper = MockMapper::default();
        let ranges = map_guest_memory(&mapper, &mem);
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[1].iova, 0x100000);
        assert_eq!(ranges[1].size, 0x20000);
        assert_ne!(ranges[1].host_addr, 0);

        unmap_guest_memory(&mapper, &ranges);
        assert!(mapper.mapped.lock().unwrap().is_empty());
    }

    #[test]
    fn test_map_guest_memory_skips_failed_range() {
        let mem = GuestMemoryMmap::<()>::from_ranges(&[(GuestAddress(0), 0x10000)]).unwrap();
        let mapper = MockMapper {
            fail_with: Some(libc::EFAULT),
            ..Default::default()
        };
        assert!(map_guest_memory(&mapper, &mem).is_empty());
    }
}
