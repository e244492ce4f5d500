// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Task stack storage.
//!
//! A task's stack is described by a `StackRegion`. Two shapes exist,
//! chosen at build time by the `static-stacks` feature:
//!
//! - default: the region points at memory drawn from the kernel heap when
//!   the task is created and returned when it dies;
//! - `static-stacks`: every task record embeds a fixed
//!   `[u32; STACK_SIZE_WORDS]` buffer, so the kernel needs no heap at all.
//!
//! Both shapes expose the same method surface, so the rest of the kernel
//! is written once against it. The first word of a live stack always holds
//! the canary; the initial exception frame is written at the (8-byte
//! aligned) top.

use crate::config::STACK_CANARY;
use zerocopy::{Immutable, IntoBytes};

/// Stuff the hardware pushes/pops at exception entry and return, in stack
/// order.
#[derive(IntoBytes, Immutable)]
#[repr(C)]
struct ExceptionFrame {
    r0: u32,
    r1: u32,
    r2: u32,
    r3: u32,
    r12: u32,
    lr: u32,
    pc: u32,
    xpsr: u32,
}

/// The full image a brand-new task starts from: the callee-saved registers
/// the context-switch handler pops, then the hardware frame.
#[derive(IntoBytes, Immutable)]
#[repr(C)]
struct InitialFrame {
    /// r4-r11, zeroed for a fresh task.
    regs: [u32; 8],
    hw: ExceptionFrame,
}

/// Thumb bit; the only xPSR content a fresh task needs.
const INITIAL_PSR: u32 = 1 << 24;

/// Where a task's stack lives, as reported to diagnostics.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StackLocation {
    /// Embedded in the task record (`static-stacks` build).
    Embedded,
    /// Drawn from the kernel heap.
    Heap { base: usize, size: usize },
    /// No storage attached (unused record).
    Absent,
}

cfg_if::cfg_if! {
    if #[cfg(feature = "static-stacks")] {
        use crate::config::STACK_SIZE_WORDS;

        /// Embedded stack buffer. Alignment matters: AAPCS requires
        /// 8-byte-aligned stacks.
        #[repr(C, align(8))]
        pub struct StackRegion {
            buf: [u32; STACK_SIZE_WORDS],
        }

        impl StackRegion {
            pub const fn empty() -> Self {
                StackRegion { buf: [0; STACK_SIZE_WORDS] }
            }

            pub fn is_present(&self) -> bool {
                true
            }

            pub fn size(&self) -> usize {
                STACK_SIZE_WORDS * 4
            }

            pub fn base_addr(&self) -> usize {
                self.buf.as_ptr() as usize
            }

            pub fn location(&self) -> StackLocation {
                StackLocation::Embedded
            }

            fn bytes_mut(&mut self) -> &mut [u8] {
                self.buf.as_mut_bytes()
            }

            pub fn write_canary(&mut self) {
                self.buf[0] = STACK_CANARY;
            }

            pub fn canary_ok(&self) -> bool {
                self.buf[0] == STACK_CANARY
            }

            /// Nothing to hand back in static mode; the buffer stays in
            /// the record.
            pub fn take_for_reclaim(&mut self) -> Option<ReclaimedStack> {
                None
            }
        }

        /// Token for a stack region that should be returned to the heap.
        /// Uninhabited in static mode.
        pub enum ReclaimedStack {}
    } else {
        use core::ptr::NonNull;

        /// Heap-backed stack descriptor: base pointer plus size.
        pub struct StackRegion {
            base: *mut u8,
            size: usize,
        }

        /// A stack region detached from a dead task, waiting to be
        /// returned to the heap.
        pub struct ReclaimedStack(pub NonNull<u8>);

        impl StackRegion {
            pub const fn empty() -> Self {
                StackRegion { base: core::ptr::null_mut(), size: 0 }
            }

            /// Adopts `size` bytes at `base`. `base` must be 8-byte
            /// aligned and exclusively owned by this region until
            /// [`StackRegion::take_for_reclaim`] hands it back.
            pub fn from_heap(base: NonNull<u8>, size: usize) -> Self {
                StackRegion { base: base.as_ptr(), size }
            }

            pub fn is_present(&self) -> bool {
                !self.base.is_null()
            }

            pub fn size(&self) -> usize {
                self.size
            }

            pub fn base_addr(&self) -> usize {
                self.base as usize
            }

            pub fn location(&self) -> StackLocation {
                if self.is_present() {
                    StackLocation::Heap { base: self.base_addr(), size: self.size }
                } else {
                    StackLocation::Absent
                }
            }

            fn bytes_mut(&mut self) -> &mut [u8] {
                if !self.is_present() {
                    return &mut [];
                }
                // Safety: the region was handed to us whole by the heap
                // and nothing else references it while this record owns
                // it.
                unsafe { core::slice::from_raw_parts_mut(self.base, self.size) }
            }

            pub fn write_canary(&mut self) {
                if self.is_present() {
                    // Safety: base is valid, aligned (heap payloads are
                    // 8-byte aligned), and ours.
                    unsafe { self.base.cast::<u32>().write_volatile(STACK_CANARY) }
                }
            }

            pub fn canary_ok(&self) -> bool {
                if !self.is_present() {
                    return true;
                }
                // Safety: as in write_canary.
                unsafe { self.base.cast::<u32>().read_volatile() == STACK_CANARY }
            }

            /// Detaches the storage so the caller can return it to the
            /// heap; the region reads as absent afterwards.
            pub fn take_for_reclaim(&mut self) -> Option<ReclaimedStack> {
                let base = NonNull::new(self.base)?;
                self.base = core::ptr::null_mut();
                self.size = 0;
                Some(ReclaimedStack(base))
            }
        }
    }
}

impl StackRegion {
    /// Writes the initial exception-return image at the top of the stack
    /// and returns the process stack pointer a context-switch handler
    /// should resume from.
    ///
    /// `entry` lands in the program counter (Thumb bit set), `arg` in r0,
    /// and `exit` in the link register so a task that returns from its
    /// entry function self-terminates.
    pub fn prepare(&mut self, entry: u32, arg: u32, exit: u32) -> u32 {
        let base = self.base_addr();
        let bytes = self.bytes_mut();
        // Top of stack, rounded down so the hardware frame is 8-byte
        // aligned.
        let top = bytes.len() & !7;
        let off = top - core::mem::size_of::<InitialFrame>();
        let frame = InitialFrame {
            regs: [0; 8],
            hw: ExceptionFrame {
                r0: arg,
                r1: 0,
                r2: 0,
                r3: 0,
                r12: 0,
                lr: exit,
                pc: entry | 1, // for thumb
                xpsr: INITIAL_PSR,
            },
        };
        bytes[off..top].copy_from_slice(frame.as_bytes());
        (base + off) as u32
    }
}
