// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup and the task-table home.
//!
//! The board's `main` does its hardware bring-up, initializes the heap,
//! calls [`init`], creates its tasks, and finally calls [`start`], which
//! does not return: from then on the CPU belongs to the tasks and the
//! interrupt handlers in `arch`.

use crate::arch::with_priority_ceiling;
use crate::config::{GARBAGE_COLLECTION_TICKS, IDLE_STACK_BYTES, SYSTICK_FREQ_HZ};
use crate::err::CreateError;
use crate::task::{TaskEntry, TaskId, TaskTable};

/// The task table. All access funnels through [`with_task_table`].
static mut TASK_TABLE: TaskTable = TaskTable::new();

/// Manufactures an exclusive reference to the task table and hands it to
/// `body`.
///
/// Because the lifetime of the reference passed into `body` is anonymous,
/// the reference can't easily be stored, which is deliberate.
///
/// # Safety
///
/// Callers must be kernel entry points that hold the priority ceiling, or
/// handlers (tick, switch) that the ceiling masks; that rule is what
/// makes the reference exclusive on this single-core system.
pub(crate) unsafe fn with_task_table<R>(body: impl FnOnce(&mut TaskTable) -> R) -> R {
    // Safety: per the caller contract there is no live reference to the
    // table anywhere else right now.
    body(unsafe { &mut *core::ptr::addr_of_mut!(TASK_TABLE) })
}

/// Resets the scheduler to an empty table. Call once before creating
/// tasks. (The table is also statically initialized, so this mainly
/// matters for warm restarts.)
pub fn init() {
    with_priority_ceiling(|| {
        // Safety: ceiling held.
        unsafe {
            with_task_table(|tbl| *tbl = TaskTable::new());
        }
    })
}

/// Creates a Ready task that will enter `entry` with `arg` in its first
/// argument register.
///
/// In the default build the stack is drawn from the kernel heap:
/// `stack_bytes` is raised to the configured minimum, refused above the
/// maximum, and rounded to the 8-byte stack alignment. In a
/// `static-stacks` build the parameter is ignored and the record's
/// embedded buffer is used.
#[cfg(not(feature = "static-stacks"))]
pub fn create(entry: TaskEntry, arg: usize, stack_bytes: usize) -> Result<TaskId, CreateError> {
    with_priority_ceiling(|| {
        // Safety: ceiling held.
        unsafe {
            with_task_table(|tbl| {
                let size = crate::task::clamp_stack_size(stack_bytes)?;
                // Check for a slot before touching the heap so a full
                // table doesn't leak a stack region.
                if !tbl.has_free_slot() {
                    return Err(CreateError::TableFull);
                }
                let base = crate::heap::alloc(size).ok_or(CreateError::OutOfMemory)?;
                let stack = crate::stack::StackRegion::from_heap(base, size);
                tbl.create(entry, arg, stack)
            })
        }
    })
}

#[cfg(feature = "static-stacks")]
pub fn create(entry: TaskEntry, arg: usize, stack_bytes: usize) -> Result<TaskId, CreateError> {
    // Embedded stacks are sized at compile time; the request is ignored.
    let _ = stack_bytes;
    with_priority_ceiling(|| {
        // Safety: ceiling held.
        unsafe { with_task_table(|tbl| tbl.create(entry, arg)) }
    })
}

/// Starts the scheduler: creates the idle task, marks slot 0 Running, and
/// jumps into it through the architecture trampoline. Call with at least
/// one task created; does not return.
pub fn start(cpu_hz: u32) -> ! {
    klog!("kern: starting, tick={}Hz", SYSTICK_FREQ_HZ);

    let idle_id = match create(idle_main, 0, IDLE_STACK_BYTES) {
        Ok(id) => id,
        // Without an idle task the scheduler has no fallback; there is
        // nothing sensible to limp along with.
        Err(e) => panic!("idle task: {e:?}"),
    };

    let first = with_priority_ceiling(|| {
        // Safety: ceiling held.
        unsafe {
            with_task_table(|tbl| {
                tbl.mark_idle(idle_id);
                tbl.start() as *const crate::task::Task
            })
        }
    });

    // Safety: `first` points into the static task table, which lives
    // forever; the reference handed onward is never stored.
    unsafe { crate::arch::start_first_task(cpu_hz / SYSTICK_FREQ_HZ, &*first) }
}

/// The idle task: the scheduler's fallback when nothing else is
/// runnable. Roughly once a second it compacts the task table and sweeps
/// stack canaries; otherwise it parks the core until the next interrupt.
extern "C" fn idle_main(_arg: usize) {
    let mut last_collection = crate::arch::now();
    loop {
        let now = crate::arch::now();
        if now.ticks() - last_collection.ticks() >= GARBAGE_COLLECTION_TICKS {
            crate::syscalls::garbage_collect();
            crate::syscalls::check_stack_overflow();
            last_collection = now;
        }
        crate::arch::wait_for_interrupt();
    }
}
