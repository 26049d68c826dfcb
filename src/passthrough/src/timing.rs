// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cost of passthrough accesses in emulated bus clocks.

use crate::platform::CycleClock;

/// Width of a single region access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessWidth {
    /// 8-bit access.
    Byte,
    /// 16-bit access.
    Word,
    /// 32-bit access.
    Dword,
}

impl AccessWidth {
    /// Width matching an access buffer, if it is 1, 2 or 4 bytes long.
    pub fn from_len(len: usize) -> Option<Self> {
        match len {
            1 => Some(AccessWidth::Byte),
            2 => Some(AccessWidth::Word),
            4 => Some(AccessWidth::Dword),
            _ => None,
        }
    }
}

// Bus clocks per access. Reads stall for the full round trip; writes are posted.
const READ_CLOCKS: [u64; 3] = [4, 4, 6];
const WRITE_CLOCKS: [u64; 3] = [2, 2, 3];

/// Bus clocks an access of `width` costs.
pub fn access_clocks(width: AccessWidth, write: bool) -> u64 {
    let table = if write { &WRITE_CLOCKS } else { &READ_CLOCKS };
    match width {
        AccessWidth::Byte => table[0],
        AccessWidth::Word => table[1],
        AccessWidth::Dword => table[2],
    }
}

/// Charges one access against the CPU, scaled by the current bus timing.
pub fn charge(clock: &dyn CycleClock, width: AccessWidth, write: bool) {
    clock.consume(access_clocks(width, write) * clock.bus_timing());
}
