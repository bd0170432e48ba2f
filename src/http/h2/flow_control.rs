//! HTTP/2 flow control
//!
//! This module implements flow control as defined in RFC 9113 Section 5.2.
//!
//! HTTP/2 uses flow control to prevent senders from overwhelming receivers
//! with data. Flow control is applied at both the connection and stream level.
//!
//! `FlowControlWindow` is the send side: callers block on it for credit and the
//! reader loop releases credit when WINDOW_UPDATE arrives. `ReceiveWindow` is
//! the receive side: the reader loop consumes it for every DATA frame and gets
//! told when to send a WINDOW_UPDATE.

use super::error::{Error, Result};
use super::{MAX_WINDOW_SIZE, WINDOW_UPDATE_THRESHOLD_DIVISOR};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

/// Longest single wait while the window is empty
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Send-side flow control window
///
/// The value is signed: a SETTINGS-driven shrink of INITIAL_WINDOW_SIZE can
/// push it below zero, and nothing can be acquired until releases bring it
/// back above zero.
#[derive(Debug)]
pub struct FlowControlWindow {
    window: Mutex<i64>,
    available: Condvar,
}

impl FlowControlWindow {
    /// Create a window holding `initial` bytes of credit
    pub fn new(initial: u32) -> Self {
        FlowControlWindow {
            window: Mutex::new(i64::from(initial)),
            available: Condvar::new(),
        }
    }

    /// Take up to `max` bytes of credit without blocking
    ///
    /// Returns the amount acquired, zero if the window is empty.
    pub fn try_acquire_non_blocking(&self, max: u32) -> u32 {
        let mut window = self.window.lock();
        take(&mut window, max)
    }

    /// Take up to `max` bytes of credit, waiting while the window is empty
    ///
    /// Returns as soon as any credit is available, possibly less than `max`.
    /// Waits in short slices so adjustments are observed promptly. Returns
    /// zero on timeout.
    pub fn try_acquire_up_to(&self, max: u32, timeout: Duration) -> u32 {
        if max == 0 {
            return 0;
        }
        let deadline = Instant::now() + timeout;
        let mut window = self.window.lock();
        loop {
            let acquired = take(&mut window, max);
            if acquired > 0 {
                return acquired;
            }
            let now = Instant::now();
            if now >= deadline {
                return 0;
            }
            let slice = (deadline - now).min(ACQUIRE_POLL_INTERVAL);
            self.available.wait_for(&mut window, slice);
        }
    }

    /// Return credit to the window and wake waiters
    ///
    /// Fails without changing the window if the result would exceed 2^31-1.
    pub fn release(&self, bytes: u32) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }
        let mut window = self.window.lock();
        let updated = *window + i64::from(bytes);
        if updated > i64::from(MAX_WINDOW_SIZE) {
            return Err(Error::FlowControl(format!(
                "window {} + increment {} exceeds 2^31-1",
                *window, bytes
            )));
        }
        *window = updated;
        drop(window);
        self.available.notify_all();
        Ok(())
    }

    /// Apply a signed INITIAL_WINDOW_SIZE delta
    ///
    /// May drive the window negative. Fails without changing the window if
    /// the result would exceed 2^31-1.
    pub fn adjust(&self, delta: i64) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }
        let mut window = self.window.lock();
        let updated = *window + delta;
        if updated > i64::from(MAX_WINDOW_SIZE) {
            return Err(Error::FlowControl(format!(
                "window {} adjusted by {} exceeds 2^31-1",
                *window, delta
            )));
        }
        *window = updated;
        drop(window);
        if delta > 0 {
            self.available.notify_all();
        }
        Ok(())
    }

    /// Replace the credit outright
    pub fn reset(&self, size: u32) {
        *self.window.lock() = i64::from(size);
        self.available.notify_all();
    }

    /// Current credit (may be negative)
    pub fn available(&self) -> i64 {
        *self.window.lock()
    }
}

fn take(window: &mut i64, max: u32) -> u32 {
    if *window <= 0 || max == 0 {
        return 0;
    }
    let acquired = (*window).min(i64::from(max));
    *window -= acquired;
    acquired as u32
}

/// Receive-side window accounting
///
/// Only the reader loop consumes; other threads may observe the value.
#[derive(Debug)]
pub struct ReceiveWindow {
    initial: u32,
    current: AtomicI64,
}

impl ReceiveWindow {
    /// Create a window advertised at `initial` bytes
    pub fn new(initial: u32) -> Self {
        ReceiveWindow {
            initial,
            current: AtomicI64::new(i64::from(initial)),
        }
    }

    /// Account for `bytes` received from the peer
    ///
    /// Returns the WINDOW_UPDATE increment to send once the window falls
    /// below a third of its initial size; the increment restores the window
    /// to its initial size. Receiving more than the window allows is a flow
    /// control error.
    pub fn consume(&self, bytes: u32) -> Result<Option<u32>> {
        if bytes == 0 {
            return Ok(None);
        }
        let before = self.current.fetch_sub(i64::from(bytes), Ordering::AcqRel);
        let after = before - i64::from(bytes);
        if after < 0 {
            return Err(Error::FlowControl(format!(
                "received {} bytes with only {} left in the receive window",
                bytes, before
            )));
        }

        let initial = i64::from(self.initial);
        if after < initial / WINDOW_UPDATE_THRESHOLD_DIVISOR {
            let increment = initial - after;
            self.current.fetch_add(increment, Ordering::AcqRel);
            return Ok(Some(increment as u32));
        }
        Ok(None)
    }

    /// Remaining receive credit
    pub fn available(&self) -> i64 {
        self.current.load(Ordering::Acquire)
    }

    /// Advertised initial size
    pub fn initial(&self) -> u32 {
        self.initial
    }
}
