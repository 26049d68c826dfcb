// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! IOMMU groups: the unit of ownership the kernel hands out to userspace.

use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::mem::size_of;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::Path;

use log::warn;
use vfio_bindings::bindings::vfio::*;
use vmm_sys_util::errno;
use vmm_sys_util::ioctl::{ioctl_with_mut_ref, ioctl_with_ptr, ioctl_with_ref};

use crate::config::PciAddress;
use crate::container::Container;
use crate::vfio_ioctls::*;

/// Directory holding the VFIO group character devices.
pub const VFIO_GROUP_DIR: &str = "/dev/vfio";

/// Errors associated with IOMMU groups.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum GroupError {
    /// Failed to resolve the IOMMU group of {0}: {1}
    ResolveGroup(PciAddress, std::io::Error),
    /// IOMMU group link of {0} does not name a group
    InvalidGroupLink(PciAddress),
    /// Failed to open VFIO group {0}: {1}
    OpenGroup(u32, std::io::Error),
    /// VFIO_GROUP_GET_STATUS failed on group {0}: {1}
    GetStatus(u32, errno::Error),
    /// Group {0} is not viable: every device in it must be bound to vfio-pci
    NotViable(u32),
    /// VFIO_GROUP_SET_CONTAINER failed on group {0}: {1}
    SetContainer(u32, errno::Error),
    /// VFIO_GROUP_GET_DEVICE_FD failed for {0}: {1}
    GetDeviceFd(PciAddress, errno::Error),
}

/// Result type for group operations.
pub type Result<T> = std::result::Result<T, GroupError>;

/// Reads the IOMMU group number of the device whose sysfs directory is `device_dir`.
///
/// The `iommu_group` entry is a symlink whose last component is the group number.
pub fn iommu_group_id(address: PciAddress, device_dir: &Path) -> Result<u32> {
    let link = fs::read_link(device_dir.join("iommu_group"))
        .map_err(|err| GroupError::ResolveGroup(address, err))?;
    link.file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.parse::<u32>().ok())
        .ok_or(GroupError::InvalidGroupLink(address))
}

/// An open VFIO group.
#[derive(Debug)]
pub struct Group {
    id: u32,
    file: File,
    attached: bool,
    /// Functions opened through this group.
    pub devices: Vec<PciAddress>,
    /// Set while this group takes part in a bus reset.
    pub resetting: bool,
}

impl Group {
    /// Opens group `id` and checks it is viable.
    pub fn open(id: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(Path::new(VFIO_GROUP_DIR).join(id.to_string()))
            .map_err(|err| GroupError::OpenGroup(id, err))?;

        let mut status = vfio_group_status {
            argsz: size_of::<vfio_group_status>() as u32,
            flags: 0,
        };
        // SAFETY: `file` is a VFIO group fd and `status` is valid for the call.
        let ret = unsafe { ioctl_with_mut_ref(&file, VFIO_GROUP_GET_STATUS(), &mut status) };
        if ret < 0 {
            return Err(GroupError::GetStatus(id, errno::Error::last()));
        }
        if status.flags & VFIO_GROUP_FLAGS_VIABLE == 0 {
            return Err(GroupError::NotViable(id));
        }

        Ok(Self::from_file(id, file))
    }

    pub(crate) fn from_file(id: u32, file: File) -> Self {
        Group {
            id,
            file,
            attached: false,
            devices: Vec::new(),
            resetting: false,
        }
    }

    /// IOMMU group number.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Claims the group for this process by attaching it to `container`.
    ///
    /// Fails if another process already owns the group.
    pub fn attach(&mut self, container: &Container) -> Result<()> {
        let container_fd: RawFd = container.as_raw_fd();
        // SAFETY: `file` is a VFIO group fd and `container_fd` outlives the call.
        let ret = unsafe { ioctl_with_ref(&self.file, VFIO_GROUP_SET_CONTAINER(), &container_fd) };
        if ret < 0 {
            return Err(GroupError::SetContainer(self.id, errno::Error::last()));
        }
        self.attached = true;
        Ok(())
    }

    /// Whether the group is attached to this process' container.
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    #[cfg(test)]
    pub(crate) fn set_attached(&mut self, attached: bool) {
        self.attached = attached;
    }

    /// Returns the fd of function `address`, which must belong to this group.
    pub fn device_file(&self, address: PciAddress) -> Result<File> {
        // Formatted addresses never contain a nul byte.
        let name = CString::new(address.to_string())
            .map_err(|_| GroupError::GetDeviceFd(address, errno::Error::new(libc::EINVAL)))?;
        // SAFETY: `file` is a VFIO group fd and `name` is a nul terminated string that outlives
        // the call.
        let ret = unsafe { ioctl_with_ptr(&self.file, VFIO_GROUP_GET_DEVICE_FD(), name.as_ptr()) };
        if ret < 0 {
            return Err(GroupError::GetDeviceFd(address, errno::Error::last()));
        }
        // SAFETY: the kernel returned a new fd that nothing else owns.
        Ok(unsafe { File::from_raw_fd(ret) })
    }

    /// Releases the group from the container. The group fd itself closes on drop.
    pub fn detach(&mut self) {
        if !self.attached {
            return;
        }
        // SAFETY: `file` is a VFIO group fd; the ioctl takes no argument.
        let ret = unsafe { vmm_sys_util::ioctl::ioctl(&self.file, VFIO_GROUP_UNSET_CONTAINER()) };
        if ret < 0 {
            warn!(
                "passthrough: failed to detach group {}: {}",
                self.id,
                errno::Error::last()
            );
        }
        self.attached = false;
    }
}

impl AsRawFd for Group {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::symlink;

    use vmm_sys_util::tempdir::TempDir;
    use vmm_sys_util::tempfile::TempFile;

    use super::*;

    fn addr() -> PciAddress {
        "0000:01:00.0".parse().unwrap()
    }

    #[test]
    fn test_iommu_group_id() {
        let dir = TempDir::new().unwrap();
        symlink(
            "../../../kernel/iommu_groups/17",
            dir.as_path().join("iommu_group"),
        )
        .unwrap();
        assert_eq!(iommu_group_id(addr(), dir.as_path()).unwrap(), 17);
    }

    #[test]
    fn test_iommu_group_id_invalid() {
        let dir = TempDir::new().unwrap();
        match iommu_group_id(addr(), dir.as_path()) {
            Err(GroupError::ResolveGroup(a, _)) => assert_eq!(a, addr()),
            other => panic!("unexpected result: {other:?}"),
        }

        symlink("../iommu_groups/gpu", dir.as_path().join("iommu_group")).unwrap();
        assert!(matches!(
            iommu_group_id(addr(), dir.as_path()),
            Err(GroupError::InvalidGroupLink(_))
        ));
    }

    #[test]
    fn test_detach_unattached_is_noop() {
        let tmp = TempFile::new().unwrap();
        let mut group = Group::from_file(3, tmp.into_file());
        assert_eq!(group.id(), 3);
        assert!(!group.is_attached());
        group.detach();
        assert!(!group.is_attached());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            GroupError::NotViable(5).to_string(),
            "Group 5 is not viable: every device in it must be bound to vfio-pci"
        );
    }
}
