// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Host resources a passthrough device exposes to the guest: BARs, the ROM shadow, config
//! space and the legacy VGA windows.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::{fmt, io};

use log::{debug, warn};
use vm_memory::{VolatileMemory, VolatileMemoryError, VolatileSlice};
use vmm_sys_util::errno;

use crate::bus::{BusError, IoHandler};
use crate::host::RegionInfo;
use crate::metrics::METRICS;
use crate::platform::{CycleClock, Platform};
use crate::timing::{self, AccessWidth};

/// Legacy VGA memory window.
pub const VGA_MEM_BASE: u64 = 0xa0000;
/// Size of the legacy VGA memory window.
pub const VGA_MEM_SIZE: u64 = 0x20000;
/// First port of the low VGA I/O window (MDA compatible registers).
pub const VGA_IO_LO_BASE: u64 = 0x3b0;
/// Size of the low VGA I/O window.
pub const VGA_IO_LO_SIZE: u64 = 0xc;
/// First port of the high VGA I/O window.
pub const VGA_IO_HI_BASE: u64 = 0x3c0;
/// Size of the high VGA I/O window.
pub const VGA_IO_HI_SIZE: u64 = 0x20;

/// Errors associated with region setup and access.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum RegionError {
    /// Failed to mmap region: {0}
    Mmap(errno::Error),
    /// Access of {1} bytes at {0:#x} is outside the region
    OutOfRange(u64, usize),
    /// Region does not support {0} byte accesses
    InvalidWidth(usize),
    /// Region is not readable
    NotReadable,
    /// Region is not writable
    NotWritable,
    /// Host access failed: {0}
    Host(io::Error),
    /// Region is already installed at {0:#x}
    AlreadyInstalled(u64),
    /// Cannot install region: {0}
    Bus(BusError),
}

/// Result type for region operations.
pub type Result<T> = std::result::Result<T, RegionError>;

/// What a region stands for on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Base address register 0..=5.
    Bar(u8),
    /// Expansion ROM shadow.
    Rom,
    /// Configuration space.
    Config,
    /// Legacy VGA memory at 0xa0000.
    VgaMem,
    /// Legacy VGA ports 0x3b0..0x3bb.
    VgaIoLo,
    /// Legacy VGA ports 0x3c0..0x3df.
    VgaIoHi,
}

/// Dispatch table a region is installed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressSpace {
    /// Memory space.
    Memory,
    /// Port I/O space.
    Io,
}

// A MAP_SHARED view of part of the device fd.
struct MmapArea {
    addr: *mut u8,
    len: usize,
}

// SAFETY: the mapping is owned by the area and is only accessed through volatile loads and
// stores.
unsafe impl Send for MmapArea {}
// SAFETY: as above; concurrent volatile accesses to device memory are what hardware expects.
unsafe impl Sync for MmapArea {}

impl MmapArea {
    fn new(file: &File, offset: u64, len: usize, prot: libc::c_int) -> Result<Self> {
        // SAFETY: a fresh mapping is requested at a kernel chosen address; the result is
        // checked below.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                prot,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                offset as libc::off_t,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(RegionError::Mmap(errno::Error::last()));
        }
        Ok(MmapArea {
            addr: addr.cast(),
            len,
        })
    }

    fn slice(&self) -> VolatileSlice<'_> {
        // SAFETY: `addr` points to `len` mapped bytes that live as long as `self`.
        unsafe { VolatileSlice::new(self.addr, self.len) }
    }

    // Device registers see exactly one access of `width`, whatever the alignment of `data`.
    fn read(
        &self,
        offset: usize,
        width: AccessWidth,
        data: &mut [u8],
    ) -> std::result::Result<(), VolatileMemoryError> {
        let slice = self.slice();
        match width {
            AccessWidth::Byte => data[0] = slice.get_ref::<u8>(offset)?.load(),
            AccessWidth::Word => {
                data.copy_from_slice(&slice.get_ref::<u16>(offset)?.load().to_le_bytes())
            }
            AccessWidth::Dword => {
                data.copy_from_slice(&slice.get_ref::<u32>(offset)?.load().to_le_bytes())
            }
        }
        Ok(())
    }

    fn write(
        &self,
        offset: usize,
        width: AccessWidth,
        data: &[u8],
    ) -> std::result::Result<(), VolatileMemoryError> {
        let slice = self.slice();
        match width {
            AccessWidth::Byte => slice.get_ref::<u8>(offset)?.store(data[0]),
            AccessWidth::Word => slice
                .get_ref::<u16>(offset)?
                .store(u16::from_le_bytes([data[0], data[1]])),
            AccessWidth::Dword => slice
                .get_ref::<u32>(offset)?
                .store(u32::from_le_bytes([data[0], data[1], data[2], data[3]])),
        }
        Ok(())
    }
}

impl Drop for MmapArea {
    fn drop(&mut self) {
        // SAFETY: `addr` and `len` describe a mapping created by `MmapArea::new`.
        let ret = unsafe { libc::munmap(self.addr.cast(), self.len) };
        if ret != 0 {
            warn!("passthrough: munmap failed: {}", errno::Error::last());
        }
    }
}

enum Backend {
    Mmap(MmapArea),
    File { file: Arc<File>, offset: u64 },
    Shadow(Box<[u8]>),
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Mmap(area) => write!(f, "Mmap({:p}, {:#x})", area.addr, area.len),
            Backend::File { offset, .. } => write!(f, "File({offset:#x})"),
            Backend::Shadow(data) => write!(f, "Shadow({:#x})", data.len()),
        }
    }
}

/// The access path of a region, shared with whatever handler it is installed under.
pub struct RegionIo {
    kind: RegionKind,
    size: u64,
    readable: bool,
    writable: bool,
    backend: Backend,
    irq_active: Arc<AtomicBool>,
    clock: Arc<dyn CycleClock>,
}

impl fmt::Debug for RegionIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionIo")
            .field("kind", &self.kind)
            .field("size", &self.size)
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

impl RegionIo {
    /// What the region stands for.
    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    /// Size of the region in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Accounts for a guest access: clears the device's interrupt-active flag and charges the
    /// access against the CPU.
    pub fn note_access(&self, len: usize, write: bool) {
        self.irq_active.store(false, Ordering::SeqCst);
        if let Some(width) = AccessWidth::from_len(len) {
            timing::charge(self.clock.as_ref(), width, write);
        }
    }

    fn check(&self, offset: u64, len: usize) -> Result<AccessWidth> {
        let width = AccessWidth::from_len(len).ok_or(RegionError::InvalidWidth(len))?;
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.size => Ok(width),
            _ => Err(RegionError::OutOfRange(offset, len)),
        }
    }

    /// Reads `data.len()` bytes at `offset` from the host without side effects.
    pub fn read_at(&self, offset: u64, data: &mut [u8]) -> Result<()> {
        if !self.readable {
            return Err(RegionError::NotReadable);
        }
        let width = self.check(offset, data.len())?;
        match &self.backend {
            Backend::Mmap(area) => area
                .read(offset as usize, width, data)
                .map_err(|err| RegionError::Host(io::Error::other(err))),
            Backend::File { file, offset: base } => file
                .read_exact_at(data, base + offset)
                .map_err(RegionError::Host),
            Backend::Shadow(buf) => {
                let start = offset as usize;
                data.copy_from_slice(&buf[start..start + data.len()]);
                Ok(())
            }
        }
    }

    /// Writes `data` at `offset` to the host without side effects.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(RegionError::NotWritable);
        }
        let width = self.check(offset, data.len())?;
        match &self.backend {
            Backend::Mmap(area) => area
                .write(offset as usize, width, data)
                .map_err(|err| RegionError::Host(io::Error::other(err))),
            Backend::File { file, offset: base } => file
                .write_all_at(data, base + offset)
                .map_err(RegionError::Host),
            Backend::Shadow(_) => Err(RegionError::NotWritable),
        }
    }
}

impl IoHandler for RegionIo {
    fn read(&self, _base: u64, offset: u64, data: &mut [u8]) {
        self.note_access(data.len(), false);
        if let Err(err) = self.read_at(offset, data) {
            METRICS.region_read_fails.inc();
            debug!("passthrough: {:?} read at {:#x} failed: {}", self.kind, offset, err);
            data.fill(0xff);
        }
    }

    fn write(&self, _base: u64, offset: u64, data: &[u8]) {
        self.note_access(data.len(), true);
        if let Err(err) = self.write_at(offset, data) {
            METRICS.region_write_fails.inc();
            debug!("passthrough: {:?} write at {:#x} failed: {}", self.kind, offset, err);
        }
    }
}

/// A region together with where it currently sits in the guest's address space.
///
/// `emulated_offset` is 0 exactly when nothing is installed on a dispatch table.
#[derive(Debug)]
pub struct Region {
    io: Arc<RegionIo>,
    space: AddressSpace,
    emulated_offset: u64,
    installed: Option<Arc<dyn IoHandler>>,
}

impl Region {
    fn with_backend(
        kind: RegionKind,
        space: AddressSpace,
        size: u64,
        caps: (bool, bool),
        backend: Backend,
        irq_active: Arc<AtomicBool>,
        clock: Arc<dyn CycleClock>,
    ) -> Self {
        Region {
            io: Arc::new(RegionIo {
                kind,
                size,
                readable: caps.0,
                writable: caps.1,
                backend,
                irq_active,
                clock,
            }),
            space,
            emulated_offset: 0,
            installed: None,
        }
    }

    /// Sets up access to a host region described by `info`.
    ///
    /// Regions the kernel allows to be mapped and that cover whole pages are accessed through
    /// an mmap; everything else goes through `pread`/`pwrite` on `file`.
    pub fn from_host(
        kind: RegionKind,
        space: AddressSpace,
        info: &RegionInfo,
        file: Arc<File>,
        irq_active: Arc<AtomicBool>,
        clock: Arc<dyn CycleClock>,
    ) -> Self {
        let caps = (info.readable(), info.writable());
        let page_size = page_size();
        let mut backend = None;
        if info.mmappable()
            && space == AddressSpace::Memory
            && info.size != 0
            && info.size % page_size == 0
        {
            let mut prot = 0;
            if caps.0 {
                prot |= libc::PROT_READ;
            }
            if caps.1 {
                prot |= libc::PROT_WRITE;
            }
            match usize::try_from(info.size)
                .map_err(|_| RegionError::OutOfRange(info.offset, 0))
                .and_then(|len| MmapArea::new(&file, info.offset, len, prot))
            {
                Ok(area) => backend = Some(Backend::Mmap(area)),
                Err(err) => debug!(
                    "passthrough: {:?} not mappable, using syscalls: {}",
                    kind, err
                ),
            }
        }
        let backend = backend.unwrap_or(Backend::File {
            file,
            offset: info.offset,
        });
        Self::with_backend(
            kind,
            space,
            info.size,
            caps,
            backend,
            irq_active,
            clock,
        )
    }

    /// A read-only in-memory ROM image.
    pub fn rom_shadow(
        data: Vec<u8>,
        irq_active: Arc<AtomicBool>,
        clock: Arc<dyn CycleClock>,
    ) -> Self {
        let size = data.len() as u64;
        Self::with_backend(
            RegionKind::Rom,
            AddressSpace::Memory,
            size,
            (true, false),
            Backend::Shadow(data.into_boxed_slice()),
            irq_active,
            clock,
        )
    }

    /// Splits the host VGA region into its memory window and its two port windows.
    ///
    /// The kernel places each window at its legacy address within the region.
    pub fn vga_split(
        info: &RegionInfo,
        file: Arc<File>,
        irq_active: Arc<AtomicBool>,
        clock: Arc<dyn CycleClock>,
    ) -> [Region; 3] {
        let caps = (info.readable(), info.writable());
        let part = |kind, space, base: u64, size| {
            Self::with_backend(
                kind,
                space,
                size,
                caps,
                Backend::File {
                    file: file.clone(),
                    offset: info.offset + base,
                },
                irq_active.clone(),
                clock.clone(),
            )
        };
        [
            part(
                RegionKind::VgaMem,
                AddressSpace::Memory,
                VGA_MEM_BASE,
                VGA_MEM_SIZE,
            ),
            part(
                RegionKind::VgaIoLo,
                AddressSpace::Io,
                VGA_IO_LO_BASE,
                VGA_IO_LO_SIZE,
            ),
            part(
                RegionKind::VgaIoHi,
                AddressSpace::Io,
                VGA_IO_HI_BASE,
                VGA_IO_HI_SIZE,
            ),
        ]
    }

    /// What the region stands for.
    pub fn kind(&self) -> RegionKind {
        self.io.kind
    }

    /// Dispatch table the region goes on.
    pub fn space(&self) -> AddressSpace {
        self.space
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.io.size
    }

    /// Guest address the region is installed at, 0 if it is not installed.
    pub fn emulated_offset(&self) -> u64 {
        self.emulated_offset
    }

    /// The access path, for wrapping in quirk handlers and for side-effect free accesses.
    pub fn io(&self) -> &Arc<RegionIo> {
        &self.io
    }

    /// The unquirked handler.
    pub fn plain_handler(&self) -> Arc<dyn IoHandler> {
        self.io.clone()
    }

    /// Installs `handler` for this region at `base`.
    pub fn install(
        &mut self,
        platform: &Platform,
        base: u64,
        handler: Arc<dyn IoHandler>,
    ) -> Result<()> {
        if self.emulated_offset != 0 {
            return Err(RegionError::AlreadyInstalled(self.emulated_offset));
        }
        let bus = match self.space {
            AddressSpace::Memory => &platform.mmio,
            AddressSpace::Io => &platform.pio,
        };
        bus.insert(handler.clone(), base, self.io.size)
            .map_err(RegionError::Bus)?;
        self.emulated_offset = base;
        self.installed = Some(handler);
        Ok(())
    }

    /// Removes the region from its dispatch table, if installed.
    pub fn uninstall(&mut self, platform: &Platform) {
        if self.emulated_offset == 0 {
            return;
        }
        let bus = match self.space {
            AddressSpace::Memory => &platform.mmio,
            AddressSpace::Io => &platform.pio,
        };
        if let Err(err) = bus.remove(self.emulated_offset, self.io.size) {
            warn!(
                "passthrough: failed to remove {:?} at {:#x}: {}",
                self.io.kind, self.emulated_offset, err
            );
        }
        self.emulated_offset = 0;
        self.installed = None;
    }
}

fn page_size() -> u64 {
    // SAFETY: sysconf has no memory safety requirements.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    u64::try_from(size).unwrap_or(4096)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use vfio_bindings::bindings::vfio::{
        VFIO_REGION_INFO_FLAG_MMAP, VFIO_REGION_INFO_FLAG_READ, VFIO_REGION_INFO_FLAG_WRITE,
    };
    use vmm_sys_util::tempfile::TempFile;

    use super::*;
    use crate::platform::tests::mock_platform;

    const RW: u32 = VFIO_REGION_INFO_FLAG_READ | VFIO_REGION_INFO_FLAG_WRITE;

    fn backing(len: u64) -> (TempFile, Arc<File>) {
        let tmp = TempFile::new().unwrap();
        tmp.as_file().set_len(len).unwrap();
        let file = Arc::new(tmp.as_file().try_clone().unwrap());
        (tmp, file)
    }

    fn info(flags: u32, size: u64, offset: u64) -> RegionInfo {
        RegionInfo {
            index: 0,
            flags,
            size,
            offset,
        }
    }

    #[test]
    fn test_file_backend() {
        let m = mock_platform();
        let (_tmp, file) = backing(0x2000);
        let active = Arc::new(AtomicBool::new(true));
        let region = Region::from_host(
            RegionKind::Bar(1),
            AddressSpace::Io,
            &info(RW, 0x20, 0x1000),
            file.clone(),
            active.clone(),
            m.clock.clone(),
        );
        assert!(matches!(region.io().backend, Backend::File { .. }));

        region.io().write(0, 4, &[0x12, 0x34]);
        let mut buf = [0u8; 2];
        file.read_exact_at(&mut buf, 0x1004).unwrap();
        assert_eq!(buf, [0x12, 0x34]);
        assert!(!active.load(Ordering::SeqCst));

        let mut data = [0u8; 4];
        region.io().read(0, 4, &mut data);
        assert_eq!(data, [0x12, 0x34, 0, 0]);
        // One word write and one dword read at bus timing 3.
        assert_eq!(m.clock.consumed.load(Ordering::SeqCst), (2 + 6) * 3);
    }

    #[test]
    fn test_mmap_backend() {
        let m = mock_platform();
        let page = page_size();
        let (_tmp, file) = backing(page * 2);
        file.write_all_at(&[0xaa, 0xbb, 0xcc, 0xdd], page + 8)
            .unwrap();
        let region = Region::from_host(
            RegionKind::Bar(0),
            AddressSpace::Memory,
            &info(RW | VFIO_REGION_INFO_FLAG_MMAP, page, page),
            file.clone(),
            Arc::new(AtomicBool::new(false)),
            m.clock.clone(),
        );
        assert!(matches!(region.io().backend, Backend::Mmap(_)));

        let mut data = [0u8; 4];
        region.io().read(0, 8, &mut data);
        assert_eq!(u32::from_le_bytes(data), 0xddcc_bbaa);

        region.io().write(0, 0x10, &0x1234_5678u32.to_le_bytes());
        let mut buf = [0u8; 4];
        file.read_exact_at(&mut buf, page + 0x10).unwrap();
        assert_eq!(u32::from_le_bytes(buf), 0x1234_5678);
    }

    #[test]
    fn test_mmap_access_widths() {
        let m = mock_platform();
        let page = page_size();
        let (_tmp, file) = backing(page);
        file.write_all_at(&[0x10, 0x21, 0x32, 0x43, 0x54, 0x65, 0x76, 0x87], 0x40)
            .unwrap();
        let region = Region::from_host(
            RegionKind::Bar(0),
            AddressSpace::Memory,
            &info(RW | VFIO_REGION_INFO_FLAG_MMAP, page, 0),
            file.clone(),
            Arc::new(AtomicBool::new(false)),
            m.clock.clone(),
        );
        assert!(matches!(region.io().backend, Backend::Mmap(_)));

        // Odd buffer positions and odd register offsets for every width.
        let mut buf = [0u8; 8];
        region.io().read_at(0x41, &mut buf[1..2]).unwrap();
        assert_eq!(buf[1], 0x21);
        region.io().read_at(0x41, &mut buf[3..5]).unwrap();
        assert_eq!(u16::from_le_bytes([buf[3], buf[4]]), 0x3221);
        region.io().read_at(0x43, &mut buf[1..5]).unwrap();
        assert_eq!(
            u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]),
            0x7665_5443
        );

        let mut out = [0u8; 7];
        out[3..5].copy_from_slice(&0xbeefu16.to_le_bytes());
        region.io().write_at(0x81, &out[3..5]).unwrap();
        out[1..5].copy_from_slice(&0xcafe_f00du32.to_le_bytes());
        region.io().write_at(0x85, &out[1..5]).unwrap();
        out[6] = 0x5a;
        region.io().write_at(0x89, &out[6..7]).unwrap();
        let mut raw = [0u8; 9];
        file.read_exact_at(&mut raw, 0x81).unwrap();
        assert_eq!(raw, [0xef, 0xbe, 0, 0, 0x0d, 0xf0, 0xfe, 0xca, 0x5a]);

        assert!(matches!(
            region.io().read_at(0x40, &mut buf[..3]),
            Err(RegionError::InvalidWidth(3))
        ));
        assert!(matches!(
            region.io().write_at(page - 2, &out[1..5]),
            Err(RegionError::OutOfRange(_, 4))
        ));
    }

    #[test]
    fn test_failed_accesses() {
        let m = mock_platform();
        let (_tmp, file) = backing(0x100);
        let region = Region::from_host(
            RegionKind::Bar(2),
            AddressSpace::Memory,
            &info(VFIO_REGION_INFO_FLAG_READ, 0x10, 0),
            file.clone(),
            Arc::new(AtomicBool::new(false)),
            m.clock.clone(),
        );

        let mut data = [0u8; 4];
        region.io().read(0, 0xe, &mut data);
        assert_eq!(data, [0xff; 4]);
        let mut data = [0u8; 3];
        region.io().read(0, 0, &mut data);
        assert_eq!(data, [0xff; 3]);

        region.io().write(0, 0, &[1, 2, 3, 4]);
        let mut buf = [0u8; 4];
        file.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(buf, [0; 4]);
        assert!(matches!(
            region.io().write_at(0, &[1]),
            Err(RegionError::NotWritable)
        ));
    }

    #[test]
    fn test_rom_shadow() {
        let m = mock_platform();
        let mut rom = vec![0u8; 0x800];
        rom[0] = 0x55;
        rom[1] = 0xaa;
        let region = Region::rom_shadow(rom, Arc::new(AtomicBool::new(false)), m.clock.clone());
        assert_eq!(region.kind(), RegionKind::Rom);
        assert_eq!(region.size(), 0x800);

        region.io().write(0, 0, &[0, 0]);
        let mut data = [0u8; 2];
        region.io().read(0, 0, &mut data);
        assert_eq!(data, [0x55, 0xaa]);
    }

    #[test]
    fn test_vga_split() {
        let m = mock_platform();
        let (_tmp, file) = backing(0x100000);
        file.write_all_at(&[0x11], 0x80000 + 0xa0000).unwrap();
        file.write_all_at(&[0x22], 0x80000 + 0x3b0).unwrap();
        let [mem, lo, hi] = Region::vga_split(
            &info(RW, 0xc0000, 0x80000),
            file,
            Arc::new(AtomicBool::new(false)),
            m.clock.clone(),
        );
        let mut byte = [0u8; 1];
        mem.io().read_at(0, &mut byte).unwrap();
        assert_eq!(byte, [0x11]);
        assert_eq!(mem.size(), VGA_MEM_SIZE);
        assert_eq!(lo.space(), AddressSpace::Io);
        lo.io().read_at(0, &mut byte).unwrap();
        assert_eq!(byte, [0x22]);
        assert_eq!(hi.size(), 0x20);
        assert_eq!(hi.kind(), RegionKind::VgaIoHi);
    }

    #[test]
    fn test_install_uninstall() {
        let m = mock_platform();
        let (_tmp, file) = backing(0x1000);
        let mut region = Region::from_host(
            RegionKind::Bar(0),
            AddressSpace::Memory,
            &info(RW, 0x1000, 0),
            file,
            Arc::new(AtomicBool::new(false)),
            m.clock.clone(),
        );
        let handler = region.plain_handler();
        region
            .install(&m.platform, 0xe000_0000, handler.clone())
            .unwrap();
        assert_eq!(region.emulated_offset(), 0xe000_0000);
        assert!(m.platform.mmio.resolve(0xe000_0fff).is_some());
        assert!(matches!(
            region.install(&m.platform, 0xf000_0000, handler),
            Err(RegionError::AlreadyInstalled(0xe000_0000))
        ));

        region.uninstall(&m.platform);
        assert_eq!(region.emulated_offset(), 0);
        assert!(m.platform.mmio.is_empty());
        // Second uninstall is a no-op.
        region.uninstall(&m.platform);
    }
}
