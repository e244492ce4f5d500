// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for ARMv7-M (Cortex-M4 class cores).
//!
//! # Timer
//!
//! The SysTick peripheral is a 24-bit down-counter, useless as a
//! timestamp on its own; its job here is purely to fire at the tick
//! frequency. Real kernel time is the 64-bit `TICKS` count that the
//! handler advances on each interrupt. Costs an interrupt per
//! millisecond, needs nothing from the SoC beyond the core itself.
//!
//! # Interrupt roles
//!
//! - `SysTick` maintains the timestamp, runs the wake scan, and requests
//!   a context switch -- the tick is the timeslice boundary.
//! - `PendSV`, at the lowest configurable priority, performs the actual
//!   switch. Anything that wants the CPU handed over (the tick, a task
//!   calling `yield_cpu`) just pends it; the switch then happens after
//!   every other active handler has returned. This deferral is the
//!   standard Cortex-M context-switch idiom: only `PendSV` pays for the
//!   full callee-saved save/restore, and no other handler has to care.
//! - `SVCall` is used exactly once, to bootstrap Thread mode onto the
//!   first task's stack when the scheduler starts.
//!
//! # Critical sections
//!
//! Kernel data is guarded by a BASEPRI priority ceiling rather than a
//! global interrupt disable: handlers above `MAX_SYSCALL_PRIORITY` stay
//! deliverable during kernel operations, they just must not call kernel
//! entry points. `SysTick` and `PendSV` sit below the ceiling, so state
//! mutations never race with scheduling decisions.
//!
//! # Register save layout
//!
//! The hardware stacks r0-r3, r12, lr, pc and xPSR on exception entry;
//! `PendSV` pushes r4-r11 below that on the task's own stack and records
//! the resulting stack pointer in the task record (whose first word is
//! the saved PSP -- see the layout note on `Task`). This image is also
//! what `TaskTable::create` forges for a brand-new task. The build
//! targets cores without an active FPU context (`thumbv7em-none-eabi`),
//! so no S-registers are saved.

use core::arch::global_asm;
use core::sync::atomic::{compiler_fence, AtomicPtr, AtomicU32, Ordering};

use crate::config;
use crate::task::Task;
use crate::time::Timestamp;

/// Saved machine state of a task, updated by the `PendSV` handler on
/// every switch. Only the process stack pointer lives here; the rest of
/// the context is on the task's stack.
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

/// On ARMv7-M we have to use a global to record the current task pointer,
/// since we don't have a scratch register. The `PendSV` assembly below
/// dereferences this, which is why the name must not be mangled.
#[no_mangle]
static CURRENT_TASK_PTR: AtomicPtr<Task> = AtomicPtr::new(core::ptr::null_mut());

/// The kernel's 64-bit tick count, stored low half then high half.
///
/// ARMv7-M has no 64-bit atomics, so the widened counter the sleep
/// machinery wants (see `time`) lives here as two words. That split is
/// safe under this kernel's rules: the tick handler is the only writer,
/// and everything that reads both halves either *is* the tick handler
/// or holds the priority ceiling, which masks it. No torn reads are
/// possible, so plain relaxed loads and stores suffice.
static TICKS: [AtomicU32; 2] = [const { AtomicU32::new(0) }; 2];

/// EXC_RETURN value for resuming Thread mode on the process stack with a
/// basic (no-FPU) frame.
const EXC_RETURN_CONST: u32 = 0xFFFFFFFD;

/// Reads the tick counter. Callers are kernel entry points holding the
/// priority ceiling, which is what makes the two-word read coherent
/// (see `TICKS`).
pub fn now() -> Timestamp {
    Timestamp::from_halves(
        TICKS[0].load(Ordering::Relaxed),
        TICKS[1].load(Ordering::Relaxed),
    )
}

/// Runs `body` with interrupt priorities at or below
/// `MAX_SYSCALL_PRIORITY` masked, restoring the previous mask afterwards.
/// Nests freely; this is the kernel's only lock.
pub fn with_priority_ceiling<R>(body: impl FnOnce() -> R) -> R {
    let prev = cortex_m::register::basepri::read();
    unsafe {
        cortex_m::register::basepri::write(config::hw_priority(
            config::MAX_SYSCALL_PRIORITY,
        ));
    }
    // The register write alone is not a compiler fence; make sure the
    // protected accesses stay inside the masked region.
    compiler_fence(Ordering::SeqCst);

    let r = body();

    compiler_fence(Ordering::SeqCst);
    unsafe {
        cortex_m::register::basepri::write(prev);
    }
    r
}

/// Requests a context switch by pending `PendSV`. The switch happens when
/// execution drops below `PendSV`'s (lowest) priority: immediately for
/// task code, on handler exit for interrupt handlers.
pub fn pend_switch() {
    cortex_m::peripheral::SCB::set_pendsv();
}

/// Executes a wait-for-interrupt, parking the core until something is
/// deliverable.
pub fn wait_for_interrupt() {
    cortex_m::asm::wfi();
}

/// Requests a system reset. Does not return.
pub fn reset() -> ! {
    cortex_m::peripheral::SCB::sys_reset()
}

/// Records the address of `task` as the current task.
///
/// # Safety
///
/// This records a pointer that aliases `task`. The pointer is only read
/// at `PendSV` entry, which cannot run while the caller holds the
/// priority ceiling; callers must store only pointers into the live task
/// table and must refresh the pointer whenever compaction moves the
/// current record.
pub unsafe fn set_current_task(task: &Task) {
    CURRENT_TASK_PTR.store(task as *const _ as *mut _, Ordering::Relaxed);
}

/// Handler that gets linked into the vector table for the System Tick
/// Timer overflow interrupt. (Name is dictated by the `cortex_m` crate.)
#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    // One more tick: recombine the halves, bump the 64-bit value, and
    // store both halves back. Nobody can observe the window between the
    // two stores -- this handler is the sole writer and every reader
    // masks it (see TICKS).
    let now = Timestamp::from_halves(
        TICKS[0].load(Ordering::Relaxed),
        TICKS[1].load(Ordering::Relaxed),
    ) + 1;
    let (lo, hi) = now.halves();
    TICKS[0].store(lo, Ordering::Relaxed);
    TICKS[1].store(hi, Ordering::Relaxed);

    // Ready any sleepers whose deadline arrived.
    // Safety: this handler runs below the ceiling, so no kernel entry
    // point can be mid-mutation of the table when we get here, and the
    // tick source is only armed once the kernel has started.
    unsafe {
        crate::startup::with_task_table(|tbl| {
            tbl.wake_sleeping(now);
        });
    }

    // Every tick is a timeslice boundary: defer a switch so the woken
    // (or next round-robin) task runs. The entry sequence to this ISR
    // doesn't save full state, which is exactly why the switch is
    // deferred to PendSV.
    pend_switch();
}

/// The Rust side of the `PendSV` handler, called once the assembly
/// prologue has parked the outgoing task's registers on its stack and
/// saved its stack pointer into the task record.
#[no_mangle]
unsafe extern "C" fn pendsv_entry() {
    // Selection is bracketed by the ceiling so a tick arriving mid-scan
    // cannot rewrite task states under us.
    with_priority_ceiling(|| {
        // Safety: kernel entry point, table not otherwise in use.
        unsafe {
            crate::startup::with_task_table(|tbl| {
                tbl.select_next();
                set_current_task(tbl.current_task());
            });
        }
    });
}

// The context-switch handler proper.
//
// Save order mirrors the image `TaskTable::create` forges: r4-r11 pushed
// below the hardware-stacked frame, PSP stored at offset 0 of the task
// record (the `SavedState`). After `pendsv_entry` reselects, the same
// sequence runs in reverse against the (possibly different) current
// record.
global_asm! {"
    .section .text.PendSV
    .globl PendSV
    .type PendSV,function
    PendSV:
        @ Park the outgoing task's callee-saved registers on its own
        @ stack, below the hardware-stacked frame.
        mrs r0, PSP
        stmdb r0!, {{r4-r11}}
        @ Record the resulting stack pointer in the current task record.
        movw r1, #:lower16:CURRENT_TASK_PTR
        movt r1, #:upper16:CURRENT_TASK_PTR
        ldr r2, [r1]
        str r0, [r2]

        @ Pick the next task; updates CURRENT_TASK_PTR.
        bl pendsv_entry

        @ We're returning into *some* task, maybe not the same one.
        movw r1, #:lower16:CURRENT_TASK_PTR
        movt r1, #:upper16:CURRENT_TASK_PTR
        ldr r2, [r1]
        ldr r0, [r2]
        ldmia r0!, {{r4-r11}}
        msr PSP, r0

        @ Return to Thread mode on the process stack; the hardware pops
        @ the rest of the frame.
        ldr lr, ={exc_return}
        bx lr
    ",
    exc_return = const EXC_RETURN_CONST,
}

// Handler for the SVC instruction, which this kernel uses exactly once:
// `start_first_task` traps into it from Thread mode on the main stack,
// with PSP already pointing at the first task's forged hardware frame.
// Returning with the thread-mode EXC_RETURN moves Thread mode onto the
// process stack, and the hardware unstacks the frame as if the task had
// merely been interrupted. Tasks remain privileged; kernel entry points
// are plain function calls, so there is no syscall path through here.
global_asm! {"
    .section .text.SVCall
    .globl SVCall
    .type SVCall,function
    SVCall:
        ldr lr, ={exc_return}
        bx lr
    ",
    exc_return = const EXC_RETURN_CONST,
}

/// Hands the CPU to `task`, never to return. Configures exception
/// priorities, arms the tick source at `tick_divisor` CPU cycles per
/// tick, and bootstraps into Thread mode on the task's stack via the SVC
/// trap above.
pub fn start_first_task(tick_divisor: u32, task: &Task) -> ! {
    unsafe {
        // Set handler priorities: SVCall and PendSV lowest so a pended
        // switch never preempts another handler, SysTick just above so
        // ticks still fire while a peripheral handler spins. Peripheral
        // interrupts are configured by the board code and sit above all
        // three.
        let scb = &*cortex_m::peripheral::SCB::PTR;
        // SHPR2[31:24] is SVCall.
        scb.shpr[7].write(config::hw_priority(config::PENDSV_PRIORITY));
        // SHPR3[23:16] is PendSV, SHPR3[31:24] is SysTick.
        scb.shpr[10].write(config::hw_priority(config::PENDSV_PRIORITY));
        scb.shpr[11].write(config::hw_priority(config::SYSTICK_PRIORITY));
    }

    CURRENT_TASK_PTR.store(task as *const _ as *mut _, Ordering::Relaxed);

    unsafe {
        // Arm the timer. The first tick lands one full divisor period
        // from now, comfortably after the SVC below.
        let syst = &*cortex_m::peripheral::SYST::PTR;
        // Program reload value.
        syst.rvr.write(tick_divisor - 1);
        // Clear current value.
        syst.cvr.write(0);
        // Enable counter and interrupt, clocked from the core.
        syst.csr.modify(|v| v | 0b111);
    }

    unsafe {
        // Restore the forged callee-saved registers, point PSP at the
        // hardware frame above them, and trap. The SVC handler returns
        // straight into the task.
        core::arch::asm!("
            ldmia r0!, {{r4-r11}}
            msr PSP, r0
            svc #0xFF
            udf #0
            ",
            in("r0") task.save().stack_pointer(),
            options(noreturn),
        )
    }
}
