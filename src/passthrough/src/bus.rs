// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

//! Memory and port dispatch tables that passthrough regions are installed on.

use std::cmp::Ordering;
use std::collections::btree_map::BTreeMap;
use std::sync::{Arc, RwLock, Weak};

/// Handler for accesses to an address range installed on a [`Bus`].
///
/// `offset` is relative to `base`, the start of the installed range. `data.len()` is the
/// access width in bytes.
#[allow(unused_variables)]
pub trait IoHandler: Send + Sync {
    /// Reads at `offset` from this handler.
    fn read(&self, base: u64, offset: u64, data: &mut [u8]) {}
    /// Writes at `offset` into this handler.
    fn write(&self, base: u64, offset: u64, data: &[u8]) {}
}

impl std::fmt::Debug for dyn IoHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("IoHandler")
    }
}

/// Errors associated with [`Bus`] operations.
#[derive(Debug, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum BusError {
    /// Range {0:#x}+{1:#x} overlaps an installed handler
    Overlap(u64, u64),
    /// Cannot install or remove a zero sized range
    ZeroSizedRange,
    /// No handler installed at {0:#x}
    MissingAddressRange(u64),
}

/// Result type for [`Bus`] operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// A base and length describing the space occupied by a handler.
#[derive(Debug, Copy, Clone)]
pub struct BusRange {
    /// First address of the range.
    pub base: u64,
    /// Length of the range in bytes.
    pub len: u64,
}

impl BusRange {
    /// Returns true if the range intersects [`base`, `base` + `len`).
    pub fn overlaps(&self, base: u64, len: u64) -> bool {
        self.base < base.saturating_add(len) && base < self.base.saturating_add(self.len)
    }
}

impl Eq for BusRange {}

impl PartialEq for BusRange {
    fn eq(&self, other: &BusRange) -> bool {
        self.base == other.base
    }
}

impl Ord for BusRange {
    fn cmp(&self, other: &BusRange) -> Ordering {
        self.base.cmp(&other.base)
    }
}

impl PartialOrd for BusRange {
    fn partial_cmp(&self, other: &BusRange) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// An address space routing accesses to installed handlers.
///
/// No two ranges may overlap. Handlers are held weakly: whoever installs a handler keeps it
/// alive for as long as the range stays installed.
#[derive(Default, Debug)]
pub struct Bus {
    handlers: RwLock<BTreeMap<BusRange, Weak<dyn IoHandler>>>,
}

impl Bus {
    /// Constructs a bus with an empty address space.
    pub fn new() -> Bus {
        Bus {
            handlers: RwLock::new(BTreeMap::new()),
        }
    }

    fn first_before(&self, addr: u64) -> Option<(BusRange, Arc<dyn IoHandler>)> {
        let handlers = self.handlers.read().unwrap();
        let (range, handler) = handlers
            .range(..=BusRange { base: addr, len: 1 })
            .next_back()?;
        handler.upgrade().map(|h| (*range, h))
    }

    /// Returns the range base, the offset into it and the handler owning `addr`.
    #[allow(clippy::type_complexity)]
    pub fn resolve(&self, addr: u64) -> Option<(u64, u64, Arc<dyn IoHandler>)> {
        let (range, handler) = self.first_before(addr)?;
        let offset = addr - range.base;
        (offset < range.len).then_some((range.base, offset, handler))
    }

    /// Installs `handler` on [`base`, `base` + `len`).
    pub fn insert(&self, handler: Arc<dyn IoHandler>, base: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Err(BusError::ZeroSizedRange);
        }

        let mut handlers = self.handlers.write().unwrap();
        if handlers.keys().any(|range| range.overlaps(base, len)) {
            return Err(BusError::Overlap(base, len));
        }
        handlers.insert(BusRange { base, len }, Arc::downgrade(&handler));

        Ok(())
    }

    /// Removes the handler installed at exactly [`base`, `base` + `len`).
    pub fn remove(&self, base: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Err(BusError::ZeroSizedRange);
        }

        let mut handlers = self.handlers.write().unwrap();
        match handlers.get_key_value(&BusRange { base, len }) {
            Some((range, _)) if range.len == len => {
                handlers.remove(&BusRange { base, len });
                Ok(())
            }
            _ => Err(BusError::MissingAddressRange(base)),
        }
    }

    /// Number of installed ranges.
    pub fn len(&self) -> usize {
        self.handlers.read().unwrap().len()
    }

    /// Returns true if nothing is installed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Installed ranges, in address order.
    pub fn ranges(&self) -> Vec<BusRange> {
        self.handlers.read().unwrap().keys().copied().collect()
    }

    /// Reads from the handler owning `addr` into `data`.
    ///
    /// `data` is left untouched if nothing is installed at `addr`.
    pub fn read(&self, addr: u64, data: &mut [u8]) -> Result<()> {
        let (base, offset, handler) = self
            .resolve(addr)
            .ok_or(BusError::MissingAddressRange(addr))?;
        handler.read(base, offset, data);
        Ok(())
    }

    /// Writes `data` to the handler owning `addr`.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        let (base, offset, handler) = self
            .resolve(addr)
            .ok_or(BusError::MissingAddressRange(addr))?;
        handler.write(base, offset, data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DummyHandler;
    impl IoHandler for DummyHandler {}

    struct ConstantHandler;
    impl IoHandler for ConstantHandler {
        #[allow(clippy::cast_possible_truncation)]
        fn read(&self, _base: u64, offset: u64, data: &mut [u8]) {
            for (i, v) in data.iter_mut().enumerate() {
                *v = (offset as u8) + (i as u8);
            }
        }
    }

    #[test]
    fn bus_insert() {
        let bus = Bus::new();
        let dummy: Arc<dyn IoHandler> = Arc::new(DummyHandler);
        assert_eq!(
            bus.insert(dummy.clone(), 0x10, 0),
            Err(BusError::ZeroSizedRange)
        );
        bus.insert(dummy.clone(), 0x10, 0x10).unwrap();

        assert_eq!(
            bus.insert(dummy.clone(), 0x0f, 0x10),
            Err(BusError::Overlap(0x0f, 0x10))
        );
        bus.insert(dummy.clone(), 0x10, 0x10).unwrap_err();
        bus.insert(dummy.clone(), 0x12, 0x01).unwrap_err();
        bus.insert(dummy.clone(), 0x0, 0x20).unwrap_err();
        bus.insert(dummy.clone(), 0x20, 0x05).unwrap();
        bus.insert(dummy.clone(), 0x0, 0x10).unwrap();
        assert_eq!(bus.len(), 3);
    }

    #[test]
    fn bus_remove() {
        let bus = Bus::new();
        let dummy: Arc<dyn IoHandler> = Arc::new(DummyHandler);

        bus.remove(0x42, 0x0).unwrap_err();
        bus.remove(0x13, 0x12).unwrap_err();

        bus.insert(dummy.clone(), 0x13, 0x12).unwrap();
        assert_eq!(bus.remove(0x13, 0x4), Err(BusError::MissingAddressRange(0x13)));
        bus.remove(0x13, 0x12).unwrap();
        assert!(bus.is_empty());
    }

    #[test]
    fn bus_read_write() {
        let bus = Bus::new();
        let handler: Arc<dyn IoHandler> = Arc::new(ConstantHandler);
        bus.insert(handler.clone(), 0x10, 0x10).unwrap();

        let mut values = [0xff; 4];
        bus.read(0x15, &mut values).unwrap();
        assert_eq!(values, [5, 6, 7, 8]);
        bus.write(0x10, &values).unwrap();

        let mut values = [0xff; 4];
        bus.read(0x20, &mut values).unwrap_err();
        assert_eq!(values, [0xff; 4]);
        bus.write(0x0f, &values).unwrap_err();
    }

    #[test]
    fn bus_drops_dead_handlers() {
        let bus = Bus::new();
        let handler: Arc<dyn IoHandler> = Arc::new(ConstantHandler);
        bus.insert(handler.clone(), 0x1000, 0x100).unwrap();
        drop(handler);
        assert!(bus.resolve(0x1000).is_none());
        bus.read(0x1000, &mut [0u8; 4]).unwrap_err();
    }

    #[test]
    fn bus_range_overlap() {
        let a = BusRange {
            base: 0x1000,
            len: 0x400,
        };
        assert!(a.overlaps(0x1000, 0x400));
        assert!(a.overlaps(0xf00, 0x400));
        assert!(a.overlaps(0xfff, 0x02));
        assert!(a.overlaps(0x13ff, 0x100));
        assert!(!a.overlaps(0x1400, 0x100));
        assert!(!a.overlaps(0xf00, 0x100));
        assert!(!a.overlaps(u64::MAX - 1, 0x10));
    }
}
