// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide owner of the VFIO container, the groups and the passthrough devices.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use log::{error, info, warn};
use vm_memory::GuestMemory;

use crate::config::{DeviceConfig, PassthroughConfig, PciAddress};
use crate::container::{
    map_guest_memory, unmap_guest_memory, Container, ContainerError, DmaMapper, DmaRange,
};
use crate::device::{DeviceError, PassthroughDevice};
use crate::group::{iommu_group_id, Group, GroupError};
use crate::host::{HostDevice, HostDeviceError, VfioDevice};
use crate::metrics::METRICS;
use crate::platform::{PciBus, PciCard, Platform};
use crate::reset;

/// Reasons a configured device is left out.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum AttachError {
    /// Container error: {0}
    Container(#[from] ContainerError),
    /// Group error: {0}
    Group(#[from] GroupError),
    /// Group {0} could not be claimed earlier
    GroupUnusable(u32),
    /// Host device error: {0}
    Host(#[from] HostDeviceError),
    /// Device error: {0}
    Device(#[from] DeviceError),
    /// No free slot on the PCI bus for {0}
    BusFull(PciAddress),
    /// Passthrough is not initialized
    NoContainer,
}

/// Host entry points used to claim groups and open devices.
pub trait VfioHost: Send + Sync {
    /// Opens the VFIO container.
    fn open_container(&self) -> Result<Container, ContainerError>;
    /// IOMMU group of the function at `address`.
    fn iommu_group(&self, address: PciAddress) -> Result<u32, GroupError>;
    /// Opens group `id` and attaches it to `container`.
    fn claim_group(&self, id: u32, container: &Container) -> Result<Group, GroupError>;
    /// Selects the IOMMU model of `container`, once a group is attached.
    fn set_iommu(&self, container: &mut Container) -> Result<(), ContainerError>;
    /// Where guest memory translations of `container` are programmed.
    fn dma_mapper<'a>(&'a self, container: &'a Container) -> &'a dyn DmaMapper;
    /// Opens the function at `address`, which belongs to `group`.
    fn open_device(
        &self,
        group: &Group,
        address: PciAddress,
    ) -> Result<Arc<dyn HostDevice>, AttachError>;
}

/// [`VfioHost`] over `/dev/vfio` and sysfs.
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelVfio;

impl VfioHost for KernelVfio {
    fn open_container(&self) -> Result<Container, ContainerError> {
        Container::open()
    }

    fn iommu_group(&self, address: PciAddress) -> Result<u32, GroupError> {
        iommu_group_id(address, &address.sysfs_path())
    }

    fn claim_group(&self, id: u32, container: &Container) -> Result<Group, GroupError> {
        let mut group = Group::open(id)?;
        group.attach(container)?;
        Ok(group)
    }

    fn set_iommu(&self, container: &mut Container) -> Result<(), ContainerError> {
        container.set_iommu()
    }

    fn dma_mapper<'a>(&'a self, container: &'a Container) -> &'a dyn DmaMapper {
        container
    }

    fn open_device(
        &self,
        group: &Group,
        address: PciAddress,
    ) -> Result<Arc<dyn HostDevice>, AttachError> {
        Ok(Arc::new(VfioDevice::new(group.device_file(address)?)?))
    }
}

/// Owns every passthrough resource of the machine.
///
/// Built once by [`init`](Self::init) and torn down once by [`shutdown`](Self::shutdown), which
/// also runs on drop.
pub struct PassthroughManager {
    platform: Arc<Platform>,
    vfio: Box<dyn VfioHost>,
    container: Option<Container>,
    groups: BTreeMap<u32, Group>,
    unusable_groups: BTreeSet<u32>,
    devices: Vec<Arc<Mutex<PassthroughDevice>>>,
    dma_ranges: Vec<DmaRange>,
    shut_down: bool,
}

impl fmt::Debug for PassthroughManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassthroughManager")
            .field("container", &self.container)
            .field("groups", &self.groups.keys().collect::<Vec<_>>())
            .field("unusable_groups", &self.unusable_groups)
            .field("devices", &self.devices.len())
            .field("dma_ranges", &self.dma_ranges.len())
            .finish_non_exhaustive()
    }
}

impl PassthroughManager {
    /// Creates a manager with nothing attached.
    pub fn new(platform: Arc<Platform>) -> Self {
        Self::with_vfio(platform, Box::new(KernelVfio))
    }

    /// Creates a manager with nothing attached that reaches the host through `vfio`.
    pub fn with_vfio(platform: Arc<Platform>, vfio: Box<dyn VfioHost>) -> Self {
        PassthroughManager {
            platform,
            vfio,
            container: None,
            groups: BTreeMap::new(),
            unusable_groups: BTreeSet::new(),
            devices: Vec::new(),
            dma_ranges: Vec::new(),
            shut_down: false,
        }
    }

    /// Opens the container and attaches every device in `config` to `pci_bus`.
    ///
    /// Never fails: a device that cannot be attached is logged and skipped, and a host without
    /// usable VFIO support leaves passthrough disabled.
    pub fn init<M: GuestMemory>(
        config: &PassthroughConfig,
        platform: Arc<Platform>,
        guest_mem: &M,
        pci_bus: &mut dyn PciBus,
    ) -> Self {
        Self::init_with(config, platform, Box::new(KernelVfio), guest_mem, pci_bus)
    }

    /// Same as [`init`](Self::init), reaching the host through `vfio`.
    pub fn init_with<M: GuestMemory>(
        config: &PassthroughConfig,
        platform: Arc<Platform>,
        vfio: Box<dyn VfioHost>,
        guest_mem: &M,
        pci_bus: &mut dyn PciBus,
    ) -> Self {
        let mut manager = Self::with_vfio(platform, vfio);
        if config.devices.is_empty() {
            return manager;
        }

        match manager.vfio.open_container() {
            Ok(container) => manager.container = Some(container),
            Err(err) => {
                error!("passthrough: disabled: {}", err);
                METRICS.devices_skipped.add(config.devices.len() as u64);
                return manager;
            }
        }

        for device in &config.devices {
            if let Err(err) = manager.add_device(device, guest_mem, pci_bus) {
                METRICS.devices_skipped.inc();
                warn!("passthrough: {}: skipped: {}", device.address, err);
            }
        }
        info!(
            "passthrough: {} of {} device(s) attached",
            manager.devices.len(),
            config.devices.len()
        );
        manager
    }

    fn add_device<M: GuestMemory>(
        &mut self,
        config: &DeviceConfig,
        guest_mem: &M,
        pci_bus: &mut dyn PciBus,
    ) -> Result<(), AttachError> {
        let group_id = self.vfio.iommu_group(config.address)?;
        self.claim_group(group_id, guest_mem)?;
        let group = self
            .groups
            .get(&group_id)
            .ok_or(AttachError::GroupUnusable(group_id))?;
        let host = self.vfio.open_device(group, config.address)?;
        self.attach_device(
            config.address,
            group_id,
            host,
            config.rom_path.as_deref(),
            pci_bus,
        )
    }

    // Claims group `id` once. A group that fails to come up is never retried.
    fn claim_group<M: GuestMemory>(&mut self, id: u32, guest_mem: &M) -> Result<(), AttachError> {
        if self.unusable_groups.contains(&id) {
            return Err(AttachError::GroupUnusable(id));
        }
        if self.groups.contains_key(&id) {
            return Ok(());
        }
        match self.attach_group(id, guest_mem) {
            Ok(group) => {
                info!("passthrough: group {} attached", id);
                self.groups.insert(id, group);
                Ok(())
            }
            Err(err) => {
                self.unusable_groups.insert(id);
                Err(err)
            }
        }
    }

    // Attaches group `id` to the container. The first attached group enables the IOMMU, after
    // which guest memory is mapped.
    fn attach_group<M: GuestMemory>(
        &mut self,
        id: u32,
        guest_mem: &M,
    ) -> Result<Group, AttachError> {
        let container = self.container.as_mut().ok_or(AttachError::NoContainer)?;
        let mut group = self.vfio.claim_group(id, container)?;
        if !container.iommu_set() {
            if let Err(err) = self.vfio.set_iommu(container) {
                group.detach();
                return Err(err.into());
            }
            self.dma_ranges = map_guest_memory(self.vfio.dma_mapper(container), guest_mem);
            info!(
                "passthrough: mapped {} guest memory range(s) for DMA",
                self.dma_ranges.len()
            );
        }
        Ok(group)
    }

    /// Opens the function behind `host` and plugs it into `pci_bus`.
    pub(crate) fn attach_device(
        &mut self,
        address: PciAddress,
        group_id: u32,
        host: Arc<dyn HostDevice>,
        rom_path: Option<&Path>,
        pci_bus: &mut dyn PciBus,
    ) -> Result<(), AttachError> {
        let device =
            PassthroughDevice::open(address, group_id, host, rom_path, self.platform.clone())?;

        let card: Arc<Mutex<dyn PciCard>> = device.clone();
        let Some(slot) = pci_bus.add_card(card) else {
            device.lock().expect("Poisoned lock").close();
            return Err(AttachError::BusFull(address));
        };
        {
            let mut dev = device.lock().expect("Poisoned lock");
            dev.set_slot(slot);
            dev.enable_interrupts();
        }

        if let Some(group) = self.groups.get_mut(&group_id) {
            group.devices.push(address);
        }
        self.devices.push(device);
        METRICS.devices_attached.inc();
        info!("passthrough: {}: attached in slot {}", address, slot);
        Ok(())
    }

    /// Attached devices, in bus insertion order.
    pub fn devices(&self) -> &[Arc<Mutex<PassthroughDevice>>] {
        &self.devices
    }

    /// Groups claimed by this process.
    pub fn groups(&self) -> &BTreeMap<u32, Group> {
        &self.groups
    }

    /// Guest memory ranges mapped for DMA.
    pub fn dma_ranges(&self) -> &[DmaRange] {
        &self.dma_ranges
    }

    /// Drives every device's virtual interrupt line. Called from the emulator's periodic timer
    /// every [`IRQ_POLL_INTERVAL`](crate::irq::IRQ_POLL_INTERVAL).
    pub fn poll_interrupts(&self) {
        for device in &self.devices {
            device.lock().expect("Poisoned lock").poll_interrupts();
        }
    }

    /// Resets device `index` along with every device sharing its bus. Returns the addresses of
    /// the devices that were reset.
    pub fn hot_reset(&mut self, index: usize) -> Vec<PciAddress> {
        reset::hot_reset(&mut self.groups, &self.devices, index)
    }

    /// Resets every attached device once.
    pub fn reset_all(&mut self) {
        reset::reset_all(&mut self.groups, &self.devices);
    }

    /// Releases everything, devices first and the container last. Safe to call more than once.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        for device in self.devices.drain(..) {
            device.lock().expect("Poisoned lock").close();
        }
        // Translations are torn down while the IOMMU is still attached.
        if let Some(container) = self.container.as_ref() {
            unmap_guest_memory(self.vfio.dma_mapper(container), &self.dma_ranges);
        }
        self.dma_ranges.clear();
        for group in self.groups.values_mut() {
            group.detach();
        }
        self.groups.clear();
        self.container = None;
        info!("passthrough: shut down");
    }

    #[cfg(test)]
    pub(crate) fn insert_group(&mut self, group: Group) {
        self.groups.insert(group.id(), group);
    }
}

impl Drop for PassthroughManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::io;

    use vm_memory::{GuestAddress, GuestMemoryMmap};
    use vmm_sys_util::errno;
    use vmm_sys_util::tempfile::TempFile;

    use super::*;
    use crate::config_space::{PCI_COMMAND, PCI_COMMAND_MEMORY};
    use crate::container::tests::MockMapper;
    use crate::device::tests::mock_host;
    use crate::host::{tests::MockHostDevice, DependentDevice};
    use crate::platform::tests::{mock_platform, MockPciBus};

    // Host VFIO stand-in: groups come from `group_of`, devices are mock hosts.
    #[derive(Debug, Default)]
    struct MockVfio {
        no_container: bool,
        group_of: HashMap<PciAddress, u32>,
        busy_groups: HashSet<u32>,
        iommu_fails: bool,
        mapper: MockMapper,
        calls: Arc<Mutex<Vec<String>>>,
        opened: Arc<Mutex<Vec<Arc<MockHostDevice>>>>,
    }

    impl MockVfio {
        fn with_devices(devices: &[(&str, u32)]) -> Self {
            MockVfio {
                group_of: devices
                    .iter()
                    .map(|(address, group)| (address.parse().unwrap(), *group))
                    .collect(),
                ..Default::default()
            }
        }

        fn record(&self, what: String) {
            self.calls.lock().unwrap().push(what);
        }
    }

    impl VfioHost for MockVfio {
        fn open_container(&self) -> Result<Container, ContainerError> {
            if self.no_container {
                return Err(ContainerError::OpenContainer(io::Error::from(
                    io::ErrorKind::NotFound,
                )));
            }
            Ok(Container::from_file(TempFile::new().unwrap().into_file()))
        }

        fn iommu_group(&self, address: PciAddress) -> Result<u32, GroupError> {
            self.group_of
                .get(&address)
                .copied()
                .ok_or(GroupError::InvalidGroupLink(address))
        }

        fn claim_group(&self, id: u32, _container: &Container) -> Result<Group, GroupError> {
            self.record(format!("claim {id}"));
            if self.busy_groups.contains(&id) {
                return Err(GroupError::SetContainer(id, errno::Error::new(libc::EBUSY)));
            }
            Ok(Group::from_file(id, TempFile::new().unwrap().into_file()))
        }

        fn set_iommu(&self, container: &mut Container) -> Result<(), ContainerError> {
            self.record("set_iommu".to_string());
            if self.iommu_fails {
                return Err(ContainerError::SetIommu(errno::Error::new(libc::EPERM)));
            }
            container.mark_iommu_set();
            Ok(())
        }

        fn dma_mapper<'a>(&'a self, _container: &'a Container) -> &'a dyn DmaMapper {
            &self.mapper
        }

        fn open_device(
            &self,
            _group: &Group,
            address: PciAddress,
        ) -> Result<Arc<dyn HostDevice>, AttachError> {
            let host = Arc::new(mock_host(&address.to_string(), Arc::default()));
            self.opened.lock().unwrap().push(host.clone());
            Ok(host)
        }
    }

    fn guest_mem() -> GuestMemoryMmap<()> {
        GuestMemoryMmap::<()>::from_ranges(&[
            (GuestAddress(0), 0x10000),
            (GuestAddress(0x100000), 0x10000),
        ])
        .unwrap()
    }

    fn config(addresses: &[&str]) -> PassthroughConfig {
        PassthroughConfig {
            devices: addresses
                .iter()
                .map(|address| DeviceConfig {
                    address: address.parse().unwrap(),
                    rom_path: None,
                })
                .collect(),
        }
    }

    fn attach(
        manager: &mut PassthroughManager,
        bus: &mut MockPciBus,
        host: MockHostDevice,
        address: &str,
        group: u32,
    ) -> Result<Arc<MockHostDevice>, AttachError> {
        let host = Arc::new(host);
        manager.attach_device(
            address.parse::<PciAddress>().unwrap(),
            group,
            host.clone(),
            None,
            bus,
        )?;
        Ok(host)
    }

    #[test]
    fn test_init_without_devices() {
        let m = mock_platform();
        let mem = GuestMemoryMmap::<()>::from_ranges(&[(GuestAddress(0), 0x10000)]).unwrap();
        let mut bus = MockPciBus::default();
        let manager = PassthroughManager::init(
            &PassthroughConfig::default(),
            m.platform.clone(),
            &mem,
            &mut bus,
        );
        assert!(manager.devices().is_empty());
        assert!(manager.dma_ranges().is_empty());
        assert!(bus.cards.is_empty());
    }

    #[test]
    fn test_init_without_container() {
        let m = mock_platform();
        let mut bus = MockPciBus::default();
        let vfio = MockVfio {
            no_container: true,
            ..MockVfio::with_devices(&[("01:00.0", 4), ("02:00.0", 5)])
        };
        let calls = vfio.calls.clone();
        let skipped = METRICS.devices_skipped.count();
        let manager = PassthroughManager::init_with(
            &config(&["01:00.0", "02:00.0"]),
            m.platform.clone(),
            Box::new(vfio),
            &guest_mem(),
            &mut bus,
        );
        assert!(manager.devices().is_empty());
        assert!(manager.groups().is_empty());
        assert!(manager.dma_ranges().is_empty());
        assert!(bus.cards.is_empty());
        assert!(calls.lock().unwrap().is_empty());
        assert!(METRICS.devices_skipped.count() >= skipped + 2);
    }

    #[test]
    fn test_init_missing_host_device() {
        // Whether or not the host has a VFIO container, a function absent from sysfs is skipped.
        let m = mock_platform();
        let mut bus = MockPciBus::default();
        let manager = PassthroughManager::init(
            &config(&["ffff:ff:1f.7"]),
            m.platform.clone(),
            &guest_mem(),
            &mut bus,
        );
        assert!(manager.devices().is_empty());
        assert!(bus.cards.is_empty());
    }

    #[test]
    fn test_init_claims_each_group_once() {
        let m = mock_platform();
        let mut bus = MockPciBus::default();
        let vfio = MockVfio::with_devices(&[("01:00.0", 4), ("01:00.1", 4), ("02:00.0", 5)]);
        let calls = vfio.calls.clone();
        let opened = vfio.opened.clone();
        let mut manager = PassthroughManager::init_with(
            &config(&["01:00.0", "01:00.1", "02:00.0"]),
            m.platform.clone(),
            Box::new(vfio),
            &guest_mem(),
            &mut bus,
        );
        assert_eq!(manager.devices().len(), 3);
        assert_eq!(bus.cards.len(), 3);
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["claim 4", "set_iommu", "claim 5"]
        );
        assert_eq!(manager.groups()[&4].devices.len(), 2);
        assert_eq!(manager.groups()[&5].devices.len(), 1);
        assert_eq!(manager.dma_ranges().len(), 2);
        assert_eq!(manager.dma_ranges()[1].iova, 0x100000);

        manager.shutdown();
        assert!(manager.groups().is_empty());
        assert!(manager.dma_ranges().is_empty());
        for host in opened.lock().unwrap().iter() {
            assert_eq!(Arc::strong_count(host), 1);
        }
    }

    #[test]
    fn test_unclaimable_group_is_not_retried() {
        let m = mock_platform();
        let mut bus = MockPciBus::default();
        let mut vfio = MockVfio::with_devices(&[("01:00.0", 6), ("01:00.1", 6), ("02:00.0", 7)]);
        vfio.busy_groups.insert(6);
        let calls = vfio.calls.clone();
        let mut manager = PassthroughManager::with_vfio(m.platform.clone(), Box::new(vfio));
        manager.container = manager.vfio.open_container().ok();
        let mem = guest_mem();
        let cfg = config(&["01:00.0", "01:00.1", "02:00.0"]);

        assert!(matches!(
            manager.add_device(&cfg.devices[0], &mem, &mut bus),
            Err(AttachError::Group(GroupError::SetContainer(6, _)))
        ));
        assert!(matches!(
            manager.add_device(&cfg.devices[1], &mem, &mut bus),
            Err(AttachError::GroupUnusable(6))
        ));
        manager.add_device(&cfg.devices[2], &mem, &mut bus).unwrap();
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["claim 6", "claim 7", "set_iommu"]
        );
        assert_eq!(manager.devices().len(), 1);
        assert!(!manager.groups().contains_key(&6));
    }

    #[test]
    fn test_iommu_failure_marks_group_unusable() {
        let m = mock_platform();
        let mut bus = MockPciBus::default();
        let vfio = MockVfio {
            iommu_fails: true,
            ..MockVfio::with_devices(&[("01:00.0", 8), ("01:00.1", 8)])
        };
        let calls = vfio.calls.clone();
        let mut manager = PassthroughManager::with_vfio(m.platform.clone(), Box::new(vfio));
        manager.container = manager.vfio.open_container().ok();
        let mem = guest_mem();
        let cfg = config(&["01:00.0", "01:00.1"]);

        assert!(matches!(
            manager.add_device(&cfg.devices[0], &mem, &mut bus),
            Err(AttachError::Container(ContainerError::SetIommu(_)))
        ));
        assert!(matches!(
            manager.add_device(&cfg.devices[1], &mem, &mut bus),
            Err(AttachError::GroupUnusable(8))
        ));
        assert_eq!(*calls.lock().unwrap(), vec!["claim 8", "set_iommu"]);
        assert!(manager.groups().is_empty());
        assert!(manager.dma_ranges().is_empty());
        assert!(bus.cards.is_empty());
    }

    #[test]
    fn test_attach_device() {
        let m = mock_platform();
        let mut manager = PassthroughManager::new(m.platform.clone());
        let mut bus = MockPciBus::default();
        let host = attach(&mut manager, &mut bus, mock_host("a", Arc::default()), "01:00.0", 3)
            .unwrap();

        assert_eq!(bus.cards.len(), 1);
        let dev = manager.devices()[0].lock().unwrap();
        assert_eq!(dev.slot(), 2);
        assert!(dev.irq.is_enabled());
        drop(dev);
        assert!(host.fire_intx());

        // The bus reaches the device through the card it was handed.
        let card = bus.cards[0].clone();
        assert_eq!(card.lock().unwrap().config_read(0, 0x00), 0x86);
    }

    #[test]
    fn test_bus_full() {
        let m = mock_platform();
        let mut manager = PassthroughManager::new(m.platform.clone());
        let mut bus = MockPciBus {
            full: true,
            ..Default::default()
        };
        let err = attach(&mut manager, &mut bus, mock_host("a", Arc::default()), "01:00.0", 3)
            .unwrap_err();
        assert!(matches!(err, AttachError::BusFull(_)));
        assert!(manager.devices().is_empty());
    }

    #[test]
    fn test_attach_rejects_unreadable_config() {
        let m = mock_platform();
        let mut manager = PassthroughManager::new(m.platform.clone());
        let mut bus = MockPciBus::default();
        let host = mock_host("a", Arc::default());
        host.poke_config(0, &[0xff, 0xff]);
        let err = attach(&mut manager, &mut bus, host, "01:00.0", 3).unwrap_err();
        assert!(matches!(
            err,
            AttachError::Device(DeviceError::ConfigSpaceUnreadable(_))
        ));
        assert!(bus.cards.is_empty());
    }

    #[test]
    fn test_hot_reset_through_manager() {
        let m = mock_platform();
        let mut manager = PassthroughManager::new(m.platform.clone());
        let mut bus = MockPciBus::default();
        let mut group = Group::from_file(7, TempFile::new().unwrap().into_file());
        group.set_attached(true);
        manager.insert_group(group);

        let mut a = mock_host("a", Arc::default());
        a.deps = vec![
            DependentDevice {
                group_id: 7,
                address: "01:00.0".parse::<PciAddress>().unwrap(),
            },
            DependentDevice {
                group_id: 7,
                address: "01:00.1".parse::<PciAddress>().unwrap(),
            },
        ];
        let a = attach(&mut manager, &mut bus, a, "01:00.0", 7).unwrap();
        attach(&mut manager, &mut bus, mock_host("b", Arc::default()), "01:00.1", 7).unwrap();
        assert_eq!(manager.groups()[&7].devices.len(), 2);

        let mut reset = manager.hot_reset(0);
        reset.sort();
        assert_eq!(
            reset,
            vec![
                "01:00.0".parse::<PciAddress>().unwrap(),
                "01:00.1".parse::<PciAddress>().unwrap()
            ]
        );
        assert_eq!(a.hot_resets.lock().unwrap().len(), 1);
        assert!(manager.hot_reset(5).is_empty());

        manager.reset_all();
        assert_eq!(a.hot_resets.lock().unwrap().len(), 2);
        // Group detach would issue an ioctl on the stand-in fd.
        for group in manager.groups.values_mut() {
            group.set_attached(false);
        }
    }

    #[test]
    fn test_shutdown() {
        let m = mock_platform();
        let mut manager = PassthroughManager::new(m.platform.clone());
        let mut bus = MockPciBus::default();
        let host = attach(&mut manager, &mut bus, mock_host("a", Arc::default()), "01:00.0", 3)
            .unwrap();
        {
            let mut card = bus.cards[0].lock().unwrap();
            for (i, byte) in 0xe000_0000u32.to_le_bytes().iter().enumerate() {
                card.config_write(0, 0x10 + i as u8, *byte);
            }
            card.config_write(0, PCI_COMMAND as u8, PCI_COMMAND_MEMORY);
        }
        assert_eq!(m.platform.mmio.len(), 1);

        manager.shutdown();
        assert!(manager.devices().is_empty());
        assert!(m.platform.mmio.is_empty());
        assert!(!host.fire_intx());
        // The card stays on the bus but reads as absent, and no longer holds the device fd.
        assert_eq!(bus.cards[0].lock().unwrap().config_read(0, 0x00), 0xff);
        assert_eq!(Arc::strong_count(&host), 1);
        assert_eq!(Arc::strong_count(&host.file), 1);

        manager.shutdown();
        drop(manager);
    }
}
