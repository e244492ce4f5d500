// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Compile-time kernel configuration.
//!
//! Everything tunable lives here so a port only has to touch one file.
//! Interrupt priority constants are in NVIC convention: lower number means
//! higher priority, and only the top four bits of the 8-bit priority field
//! are implemented on STM32F4-class parts.

/// Capacity of the task table, including the idle task.
pub const MAX_TASKS: usize = 58;

/// Tick interrupt frequency. The tick is the kernel's unit of time; all
/// sleep durations are measured in it.
pub const SYSTICK_FREQ_HZ: u32 = 1000;

/// Sentinel written to the first word of every live stack. The overflow
/// sweep deletes any task whose canary no longer reads back.
pub const STACK_CANARY: u32 = 0xDEAD_BEEF;

/// How often the idle task runs compaction and the canary sweep.
pub const GARBAGE_COLLECTION_TICKS: u64 = 1000;

/// Stack size, in words, of each embedded stack when the `static-stacks`
/// feature is enabled.
pub const STACK_SIZE_WORDS: usize = 255;

/// Bounds applied to requested stack sizes in dynamic mode. Requests below
/// the minimum are raised to it; requests above the maximum are refused.
pub const STACK_MIN_BYTES: usize = 512;
pub const STACK_MAX_BYTES: usize = 8192;

/// Stack given to the idle task.
pub const IDLE_STACK_BYTES: usize = 512;

/// Whether task stacks come from the kernel heap (default) or are
/// embedded in the task records (`static-stacks` feature). Exposed as a
/// constant so diagnostics outside this crate can report the mode.
pub const DYNAMIC_STACKS: bool = cfg!(not(feature = "static-stacks"));

/// Highest (numerically lowest) interrupt priority that may call kernel
/// entry points. The priority-ceiling critical section masks this level
/// and below; anything more urgent stays deliverable but must not touch
/// kernel state.
pub const MAX_SYSCALL_PRIORITY: u8 = 5;

/// Priority of the tick interrupt: below ordinary peripherals so it never
/// delays byte-level I/O, above the context switch.
pub const SYSTICK_PRIORITY: u8 = 14;

/// Priority of the deferred context-switch interrupt. Lowest of all, so a
/// switch requested from any handler happens only once every other handler
/// has finished.
pub const PENDSV_PRIORITY: u8 = 15;

/// Converts one of the priority constants above into the value the
/// hardware registers (BASEPRI, SHPR, NVIC IPR) actually take.
pub const fn hw_priority(level: u8) -> u8 {
    level << 4
}
