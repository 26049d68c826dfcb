// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Bridging of the host's level-triggered INTx into edges on the emulated interrupt line.
//!
//! A dedicated thread waits for the host interrupt, masks it and parks. The emulator's timer
//! calls [`IntxBridge::poll`], which raises the virtual line once the thread has parked and
//! lowers it again after the guest has touched the device, letting the thread unmask the host
//! interrupt and wait for the next one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use std::{fmt, io, thread};

use log::{debug, error, warn};
use vmm_sys_util::eventfd::EventFd;

use crate::host::{HostDevice, HostDeviceError};
use crate::metrics::METRICS;
use crate::platform::InterruptLine;

/// How often the emulator should call [`IntxBridge::poll`].
pub const IRQ_POLL_INTERVAL: Duration = Duration::from_micros(100);

/// Errors associated with interrupt bridging.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum IrqError {
    /// Failed to create an eventfd: {0}
    EventFd(io::Error),
    /// Failed to route INTx to the eventfd: {0}
    Route(HostDeviceError),
    /// Failed to spawn the interrupt thread: {0}
    Spawn(io::Error),
    /// Interrupt bridge was released with its device
    Released,
}

// Flags shared with the interrupt thread.
#[derive(Debug, Default)]
struct Shared {
    in_irq: AtomicBool,
    stop: AtomicBool,
}

/// INTx bridge of one passthrough device.
pub struct IntxBridge {
    name: String,
    host: Option<Arc<dyn HostDevice>>,
    line: Arc<dyn InterruptLine>,
    slot: u8,
    pin: u8,
    shared: Arc<Shared>,
    active: Arc<AtomicBool>,
    asserted: bool,
    trigger: Option<Arc<EventFd>>,
    release: Option<Arc<EventFd>>,
    thread: Option<JoinHandle<()>>,
}

impl fmt::Debug for IntxBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntxBridge")
            .field("name", &self.name)
            .field("slot", &self.slot)
            .field("pin", &self.pin)
            .field("asserted", &self.asserted)
            .field("running", &self.thread.is_some())
            .finish_non_exhaustive()
    }
}

impl IntxBridge {
    /// Creates a stopped bridge. `active` is the flag cleared by every access to the device's
    /// regions.
    pub fn new(
        name: String,
        host: Arc<dyn HostDevice>,
        line: Arc<dyn InterruptLine>,
        active: Arc<AtomicBool>,
    ) -> Self {
        IntxBridge {
            name,
            host: Some(host),
            line,
            slot: 0,
            pin: 0,
            shared: Arc::new(Shared::default()),
            active,
            asserted: false,
            trigger: None,
            release: None,
            thread: None,
        }
    }

    /// Sets the bus slot and interrupt pin (1 = INTA) the virtual line is addressed by.
    pub fn set_route(&mut self, slot: u8, pin: u8) {
        self.slot = slot;
        self.pin = pin;
    }

    /// Whether the interrupt thread is running.
    pub fn is_enabled(&self) -> bool {
        self.thread.is_some()
    }

    /// The flag region accesses clear to acknowledge an asserted interrupt.
    pub fn active_flag(&self) -> Arc<AtomicBool> {
        self.active.clone()
    }

    /// Whether the interrupt thread has caught a host interrupt not yet handed back.
    pub fn in_irq(&self) -> bool {
        self.shared.in_irq.load(Ordering::SeqCst)
    }

    /// Routes the host INTx to a fresh eventfd and starts the interrupt thread.
    pub fn enable(&mut self) -> Result<(), IrqError> {
        if self.thread.is_some() {
            return Ok(());
        }
        let Some(host) = self.host.clone() else {
            return Err(IrqError::Released);
        };

        let trigger = Arc::new(EventFd::new(0).map_err(IrqError::EventFd)?);
        let release = Arc::new(EventFd::new(0).map_err(IrqError::EventFd)?);
        host.enable_intx(&trigger).map_err(IrqError::Route)?;

        self.shared.stop.store(false, Ordering::SeqCst);
        self.shared.in_irq.store(false, Ordering::SeqCst);
        self.asserted = false;

        let thread_host = host.clone();
        let shared = self.shared.clone();
        let thread_trigger = trigger.clone();
        let thread_release = release.clone();
        let name = self.name.clone();
        let handle = thread::Builder::new()
            .name(format!("intx_{}", self.name))
            .spawn(move || {
                intx_thread(
                    &name,
                    thread_host.as_ref(),
                    &shared,
                    &thread_trigger,
                    &thread_release,
                )
            });
        let handle = match handle {
            Ok(handle) => handle,
            Err(err) => {
                if let Err(err) = host.disable_intx() {
                    warn!("passthrough: {}: {}", self.name, err);
                }
                return Err(IrqError::Spawn(err));
            }
        };

        self.trigger = Some(trigger);
        self.release = Some(release);
        self.thread = Some(handle);
        debug!("passthrough: {}: INTx bridge enabled", self.name);
        Ok(())
    }

    /// Stops the interrupt thread, waits for it and tears down the host routing.
    ///
    /// A virtual line left asserted is lowered.
    pub fn disable(&mut self) {
        let Some(handle) = self.thread.take() else {
            return;
        };

        self.shared.stop.store(true, Ordering::SeqCst);
        for evt in [&self.trigger, &self.release].into_iter().flatten() {
            if let Err(err) = evt.write(1) {
                error!("passthrough: {}: failed to wake INTx thread: {}", self.name, err);
            }
        }
        if handle.join().is_err() {
            error!("passthrough: {}: INTx thread panicked", self.name);
        }
        if let Some(Err(err)) = self.host.as_ref().map(|host| host.disable_intx()) {
            warn!("passthrough: {}: {}", self.name, err);
        }
        self.trigger = None;
        self.release = None;

        if self.asserted {
            self.line.lower(self.slot, self.pin);
            METRICS.irq_lowered.inc();
            self.asserted = false;
        }
        self.shared.in_irq.store(false, Ordering::SeqCst);
        debug!("passthrough: {}: INTx bridge disabled", self.name);
    }

    /// Disables the bridge for good and drops its handle on the host device.
    pub fn release(&mut self) {
        self.disable();
        self.host = None;
    }

    /// Drives the virtual line. Called from the emulator's periodic timer.
    pub fn poll(&mut self) {
        if self.thread.is_none() {
            return;
        }

        if !self.asserted {
            if self.shared.in_irq.load(Ordering::SeqCst) {
                self.active.store(true, Ordering::SeqCst);
                self.asserted = true;
                self.line.raise(self.slot, self.pin);
                METRICS.irq_raised.inc();
            }
        } else if !self.active.load(Ordering::SeqCst) {
            self.line.lower(self.slot, self.pin);
            METRICS.irq_lowered.inc();
            self.asserted = false;
            self.shared.in_irq.store(false, Ordering::SeqCst);
            if let Some(release) = &self.release {
                if let Err(err) = release.write(1) {
                    error!("passthrough: {}: failed to release INTx thread: {}", self.name, err);
                }
            }
        }
    }
}

impl Drop for IntxBridge {
    fn drop(&mut self) {
        self.disable();
    }
}

fn intx_thread(
    name: &str,
    host: &dyn HostDevice,
    shared: &Shared,
    trigger: &EventFd,
    release: &EventFd,
) {
    loop {
        if shared.stop.load(Ordering::SeqCst) {
            break;
        }
        if let Err(err) = host.unmask_intx() {
            warn!("passthrough: {}: {}", name, err);
        }
        if let Err(err) = trigger.read() {
            error!("passthrough: {}: INTx eventfd read failed: {}", name, err);
            break;
        }
        if shared.stop.load(Ordering::SeqCst) {
            break;
        }
        if let Err(err) = host.mask_intx() {
            warn!("passthrough: {}: {}", name, err);
        }
        shared.in_irq.store(true, Ordering::SeqCst);
        if let Err(err) = release.read() {
            error!("passthrough: {}: INTx release read failed: {}", name, err);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Instant;

    use super::*;
    use crate::host::tests::MockHostDevice;
    use crate::platform::tests::MockInterruptLine;

    fn wait_for(what: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !what() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn bridge() -> (
        IntxBridge,
        Arc<MockHostDevice>,
        Arc<MockInterruptLine>,
        Arc<AtomicBool>,
    ) {
        let host = Arc::new(MockHostDevice::new("a", Arc::new(Mutex::new(Vec::new()))));
        let line = Arc::new(MockInterruptLine::default());
        let active = Arc::new(AtomicBool::new(false));
        let mut bridge = IntxBridge::new(
            "0000:01:00.0".to_string(),
            host.clone(),
            line.clone(),
            active.clone(),
        );
        bridge.set_route(3, 1);
        (bridge, host, line, active)
    }

    #[test]
    fn test_no_extra_edges_while_asserted() {
        let (mut bridge, host, line, active) = bridge();
        bridge.enable().unwrap();
        assert!(bridge.is_enabled());

        assert!(host.fire_intx());
        wait_for(|| bridge.in_irq());
        bridge.poll();
        assert_eq!(line.raises(), 1);
        assert!(active.load(Ordering::SeqCst));

        // More host interrupts and ticks while the guest has not touched the device.
        assert!(host.fire_intx());
        assert!(host.fire_intx());
        for _ in 0..10 {
            bridge.poll();
        }
        assert_eq!(line.raises(), 1);
        assert_eq!(line.lowers(), 0);

        // A region access clears the flag; the next tick lowers the line.
        active.store(false, Ordering::SeqCst);
        bridge.poll();
        assert_eq!(line.lowers(), 1);
        assert!(!bridge.asserted);

        // The pending host interrupt is picked up once the thread re-arms.
        wait_for(|| bridge.in_irq());
        bridge.poll();
        assert_eq!(line.raises(), 2);
        assert_eq!(*line.edges.lock().unwrap().first().unwrap(), (3, 1, true));

        bridge.disable();
        assert_eq!(line.lowers(), 2);
        assert!(!bridge.is_enabled());
    }

    #[test]
    fn test_poll_without_interrupt() {
        let (mut bridge, _host, line, _active) = bridge();
        bridge.poll();
        bridge.enable().unwrap();
        bridge.poll();
        assert!(line.edges.lock().unwrap().is_empty());
    }

    #[test]
    fn test_disable_and_reenable() {
        let (mut bridge, host, _line, _active) = bridge();
        bridge.disable();
        bridge.enable().unwrap();
        bridge.enable().unwrap();
        bridge.disable();
        assert!(!host.fire_intx());
        bridge.enable().unwrap();
        assert!(host.fire_intx());
        wait_for(|| bridge.in_irq());
        drop(bridge);
        assert_eq!(
            *host.log.lock().unwrap(),
            vec![
                "a:enable_intx",
                "a:disable_intx",
                "a:enable_intx",
                "a:disable_intx"
            ]
        );
    }

    #[test]
    fn test_release_drops_host() {
        let (mut bridge, host, line, _active) = bridge();
        bridge.enable().unwrap();
        assert!(host.fire_intx());
        wait_for(|| bridge.in_irq());
        bridge.poll();
        assert_eq!(line.raises(), 1);
        assert_eq!(Arc::strong_count(&host), 3);

        bridge.release();
        assert_eq!(Arc::strong_count(&host), 1);
        assert_eq!(line.lowers(), 1);
        assert!(!bridge.is_enabled());
        assert!(matches!(bridge.enable(), Err(IrqError::Released)));
        assert_eq!(
            *host.log.lock().unwrap(),
            vec!["a:enable_intx", "a:disable_intx"]
        );
    }
}
