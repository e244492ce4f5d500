// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture facade.
//!
//! The kernel needs a handful of things from the machine: a saved-state
//! slot for the context switch, the priority ceiling, the tick counter,
//! a way to request a deferred switch, and the one-way trampoline into
//! the first task. Exactly one backing module is compiled in and
//! re-exported here, so the rest of the kernel just says `arch::...`:
//!
//! - on ARM targets, `arm_m` drives the real hardware;
//! - everywhere else, `host` substitutes fakes so the kernel's logic
//!   builds and unit-tests with plain `cargo test` on a workstation.
//!   Anything that would require actually entering task context panics
//!   there instead.
//!
//! Both modules must expose the same names with the same meanings; the
//! compiler holds us to the names, the meanings are on us.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "arm")] {
        pub mod arm_m;
        pub use arm_m::*;
    } else {
        pub mod host;
        pub use host::*;
    }
}
