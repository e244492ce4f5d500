// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host stand-in for the architecture layer.
//!
//! This exists so the kernel's logic compiles and unit-tests on a
//! development machine. Nothing here can actually run tasks: starting the
//! scheduler or resetting is a panic, the tick counter only moves when a
//! test advances it, and the priority ceiling degenerates to a plain
//! call (host tests are single-threaded through the kernel).

use crate::task::Task;
use crate::time::Timestamp;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Same shape as the ARM-M saved state so `Task`'s layout is identical.
#[repr(C)]
#[derive(Debug, Default)]
pub struct SavedState {
    psp: u32,
}

impl SavedState {
    pub const fn new() -> Self {
        SavedState { psp: 0 }
    }

    pub const fn with_psp(psp: u32) -> Self {
        SavedState { psp }
    }

    pub fn stack_pointer(&self) -> u32 {
        self.psp
    }
}

static TICKS: AtomicU64 = AtomicU64::new(0);
static SWITCH_PENDING: AtomicBool = AtomicBool::new(false);

pub fn now() -> Timestamp {
    Timestamp::from_ticks(TICKS.load(Ordering::Relaxed))
}

/// Test hook: advances the fake tick counter.
pub fn advance_ticks(n: u64) {
    TICKS.fetch_add(n, Ordering::Relaxed);
}

pub fn with_priority_ceiling<R>(body: impl FnOnce() -> R) -> R {
    body()
}

pub fn pend_switch() {
    SWITCH_PENDING.store(true, Ordering::Relaxed);
}

/// Test hook: reports and clears the pending-switch flag.
pub fn take_pending_switch() -> bool {
    SWITCH_PENDING.swap(false, Ordering::Relaxed)
}

pub fn wait_for_interrupt() {
    core::hint::spin_loop();
}

pub fn reset() -> ! {
    panic!("SYSTEM RESET");
}

pub unsafe fn set_current_task(_task: &Task) {}

pub fn start_first_task(_tick_divisor: u32, _task: &Task) -> ! {
    panic!("cannot enter task context on the host");
}
