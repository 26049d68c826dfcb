// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Counters describing the health of the passthrough subsystem.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Serialize, Serializer};

/// Counter that may be bumped from the emulation thread and the interrupt threads alike.
///
/// Holds the running total and the total at the last flush; serializing reports the
/// difference and starts a new interval.
#[derive(Debug, Default)]
pub struct SharedIncMetric(AtomicU64, AtomicU64);

impl SharedIncMetric {
    /// Const default construction.
    pub const fn new() -> Self {
        Self(AtomicU64::new(0), AtomicU64::new(0))
    }

    /// Adds `value` to the counter.
    pub fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    /// Increments the counter by one.
    pub fn inc(&self) {
        self.add(1);
    }

    /// Running total.
    pub fn count(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Serialize for SharedIncMetric {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let snapshot = self.0.load(Ordering::Relaxed);
        let res = serializer.serialize_u64(snapshot - self.1.load(Ordering::Relaxed));
        if res.is_ok() {
            self.1.store(snapshot, Ordering::Relaxed);
        }
        res
    }
}

/// Passthrough metrics.
#[derive(Debug, Default, Serialize)]
pub struct PassthroughMetrics {
    /// Devices attached to the emulated PCI bus.
    pub devices_attached: SharedIncMetric,
    /// Configured devices that could not be attached.
    pub devices_skipped: SharedIncMetric,
    /// Region reads that failed and returned all-ones.
    pub region_read_fails: SharedIncMetric,
    /// Region writes that failed and were dropped.
    pub region_write_fails: SharedIncMetric,
    /// Configuration space accesses that failed on the host.
    pub config_access_fails: SharedIncMetric,
    /// Guest memory ranges that could not be mapped into the IOMMU.
    pub dma_map_fails: SharedIncMetric,
    /// DMA mappings retried after the kernel reported the range busy.
    pub dma_map_retries: SharedIncMetric,
    /// Rising edges driven on emulated interrupt lines.
    pub irq_raised: SharedIncMetric,
    /// Falling edges driven on emulated interrupt lines.
    pub irq_lowered: SharedIncMetric,
    /// Bus resets issued to the host.
    pub hot_resets: SharedIncMetric,
    /// Bus resets that failed or were unavailable.
    pub hot_reset_fails: SharedIncMetric,
}

impl PassthroughMetrics {
    /// Const default construction.
    pub const fn new() -> Self {
        Self {
            devices_attached: SharedIncMetric::new(),
            devices_skipped: SharedIncMetric::new(),
            region_read_fails: SharedIncMetric::new(),
            region_write_fails: SharedIncMetric::new(),
            config_access_fails: SharedIncMetric::new(),
            dma_map_fails: SharedIncMetric::new(),
            dma_map_retries: SharedIncMetric::new(),
            irq_raised: SharedIncMetric::new(),
            irq_lowered: SharedIncMetric::new(),
            hot_resets: SharedIncMetric::new(),
            hot_reset_fails: SharedIncMetric::new(),
        }
    }
}

/// Process-wide passthrough metrics.
pub static METRICS: PassthroughMetrics = PassthroughMetrics::new();
