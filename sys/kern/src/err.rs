// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel error types.
//!
//! Every kernel entry point reports failure through one of these enums.
//! The discriminants are the stable negative integer codes for each kind,
//! so callers that need a raw status (the shell, mostly) can cast, while
//! kernel-internal code gets ordinary `Result`s.

/// Reasons `create` can refuse to make a task.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum CreateError {
    /// No free slot in the task table.
    TableFull = -1,
    /// Requested stack exceeds `STACK_MAX_BYTES`.
    StackTooLarge = -2,
    /// The heap could not supply the stack region.
    OutOfMemory = -3,
}

/// Reasons `delete` can refuse. These match the original controller's
/// status codes one for one.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum DeleteError {
    /// No live task carries the given id.
    NotFound = -1,
    /// The idle task cannot be deleted.
    IsIdle = -2,
    /// A task cannot delete itself this way; it must call `exit`.
    IsCurrent = -3,
}

/// Reasons `sleep_ticks` can fail without blocking.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum SleepError {
    /// Zero-tick sleeps are rejected rather than treated as a yield.
    ZeroDuration = -1,
    /// The idle task must always remain selectable.
    IdleTask = -2,
}

/// Reasons `block`/`unblock` can fail.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum BlockError {
    /// No live, blockable task carries the given id.
    NotFound = -1,
    /// The idle task must always remain selectable.
    IsIdle = -2,
    /// Only the running task itself may block it (via `block_current`);
    /// blocking another Running record from outside is refused.
    IsRunning = -3,
}
