// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Task-facing kernel entry points.
//!
//! Tasks run privileged and call these as ordinary functions; "syscall"
//! refers to their role, not a trap mechanism. Each entry point takes the
//! priority ceiling around its table access and returns a typed error
//! (see `err` for the stable integer codes).

use crate::arch::{self, with_priority_ceiling};
use crate::err::{BlockError, DeleteError, SleepError};
use crate::stack::ReclaimedStack;
use crate::startup::with_task_table;
use crate::task::{TaskId, TaskSnapshot};
use crate::time::Timestamp;

/// Relinquishes the CPU: requests a context switch, which the switch
/// handler performs as soon as priorities allow. The caller stays Ready
/// and will be picked up again in round-robin order.
pub fn yield_cpu() {
    arch::pend_switch();
}

/// Current kernel time, in ticks since start.
pub fn now() -> Timestamp {
    arch::now()
}

/// Puts the calling task to sleep for `ticks` ticks (which must be
/// nonzero). The task blocks until the wake scan readies it, then resumes
/// here.
pub fn sleep_ticks(ticks: u64) -> Result<(), SleepError> {
    with_priority_ceiling(|| {
        // Safety: ceiling held.
        unsafe { with_task_table(|tbl| tbl.sleep_current(arch::now(), ticks)) }
    })?;
    // Out of the critical section before the switch actually happens.
    yield_cpu();
    Ok(())
}

/// Terminates the calling task. The record lingers as a Zombie (its stack
/// is still in use right here) until the idle task's collection pass
/// reclaims it. `extern "C"` because this is also the return address
/// planted under every task entry function.
pub extern "C" fn exit() -> ! {
    with_priority_ceiling(|| {
        // Safety: ceiling held.
        unsafe { with_task_table(|tbl| tbl.exit_current()) }
    });
    loop {
        // Nothing will ever select this task again; hand the CPU over
        // until the switch takes.
        yield_cpu();
    }
}

/// Blocks the task `id` (not the caller; see
/// [`block_current`]). Blocked tasks stay off the scheduler until
/// [`unblock`].
pub fn block(id: TaskId) -> Result<(), BlockError> {
    with_priority_ceiling(|| {
        // Safety: ceiling held.
        unsafe { with_task_table(|tbl| tbl.block(id)) }
    })
}

/// Readies a blocked task.
pub fn unblock(id: TaskId) -> Result<(), BlockError> {
    with_priority_ceiling(|| {
        // Safety: ceiling held.
        unsafe { with_task_table(|tbl| tbl.unblock(id)) }
    })
}

/// Blocks the calling task and yields. Some other task must `unblock` it.
pub fn block_current() {
    with_priority_ceiling(|| {
        // Safety: ceiling held.
        unsafe { with_task_table(|tbl| tbl.block_current()) }
    });
    yield_cpu();
}

/// Removes the task `id`, returning its heap stack (if any) to the pool.
/// The idle task and the caller are refused with distinct errors.
pub fn delete(id: TaskId) -> Result<(), DeleteError> {
    with_priority_ceiling(|| {
        // Safety: ceiling held.
        unsafe { with_task_table(|tbl| tbl.delete(id, reclaim_stack)) }
    })
}

/// Compacts the task table, reclaiming zombie records and closing holes
/// left by deletions. Normally invoked by the idle task on its collection
/// cadence.
pub fn garbage_collect() {
    with_priority_ceiling(|| {
        // Safety: ceiling held.
        unsafe {
            with_task_table(|tbl| {
                tbl.garbage_collect(reclaim_stack);
                // Compaction may have moved the current record; the
                // switch handler's pointer must follow it.
                arch::set_current_task(tbl.current_task());
            });
        }
    })
}

/// Sweeps all stack canaries, deleting any task whose canary was
/// overwritten. If the calling task is the offender it does not survive
/// this call.
pub fn check_stack_overflow() {
    let current_overflowed = with_priority_ceiling(|| {
        // Safety: ceiling held.
        unsafe { with_task_table(|tbl| tbl.check_stack_overflow(reclaim_stack)) }
    });
    if current_overflowed {
        klog!("kern: stack overflow in current task");
        exit();
    }
}

/// Reads out one task-table record for diagnostics. Indices are table
/// positions, not ids; `None` marks empty slots and the end of the table.
pub fn task_info(index: usize) -> Option<TaskSnapshot> {
    with_priority_ceiling(|| {
        // Safety: ceiling held.
        unsafe { with_task_table(|tbl| tbl.snapshot(index)) }
    })
}

/// Number of live tasks.
pub fn live_task_count() -> usize {
    with_priority_ceiling(|| {
        // Safety: ceiling held.
        unsafe { with_task_table(|tbl| tbl.live_tasks()) }
    })
}

/// Hands a reclaimed stack region back to wherever stacks come from: the
/// kernel heap in the default build; unreachable in a `static-stacks`
/// build, where regions are embedded and never detach.
#[cfg(not(feature = "static-stacks"))]
fn reclaim_stack(stack: ReclaimedStack) {
    // Safety: the region came out of a task record, which got it from
    // `heap::alloc`, and the record no longer references it.
    unsafe { crate::heap::free(stack.0) }
}

#[cfg(feature = "static-stacks")]
fn reclaim_stack(stack: ReclaimedStack) {
    match stack {}
}
