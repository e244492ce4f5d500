// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The builtin command set.
//!
//! These are the kernel-introspection commands every image ships:
//! `help`, `tasks`, `heap`, `uptime`, `kill`, `reboot`, `heaptest`.
//! Applications register their own commands alongside them.

use crate::{sh_print, Command, RegistryFull, Shell};
use kern::stack::StackLocation;
use kern::task::{TaskId, TaskState};

/// Registers every builtin into `shell`.
pub fn register_all(shell: &mut Shell) -> Result<(), RegistryFull> {
    for cmd in [
        &HELP, &TASKS, &HEAP, &UPTIME, &KILL, &REBOOT, &HEAPTEST,
    ] {
        shell.register(cmd)?;
    }
    Ok(())
}

pub static HELP: Command = Command {
    name: "help",
    help: "List commands",
    handler: cmd_help,
};

pub static TASKS: Command = Command {
    name: "tasks",
    help: "List all tasks",
    handler: cmd_tasks,
};

pub static HEAP: Command = Command {
    name: "heap",
    help: "Show heap statistics (dynamic mode only)",
    handler: cmd_heap,
};

pub static UPTIME: Command = Command {
    name: "uptime",
    help: "Show time since boot",
    handler: cmd_uptime,
};

pub static KILL: Command = Command {
    name: "kill",
    help: "Delete a task by id",
    handler: cmd_kill,
};

pub static REBOOT: Command = Command {
    name: "reboot",
    help: "Reset the system",
    handler: cmd_reboot,
};

pub static HEAPTEST: Command = Command {
    name: "heaptest",
    help: "Exercise the heap: heaptest <basic|frag|stress> [size]",
    handler: cmd_heaptest,
};

fn cmd_help(sh: &mut Shell, _argv: &[&str]) -> i32 {
    sh_print!(sh, "Available commands:\r\n");
    for cmd in sh.commands() {
        sh_print!(sh, "  {:<10} {}\r\n", cmd.name, cmd.help);
    }
    0
}

fn cmd_tasks(sh: &mut Shell, _argv: &[&str]) -> i32 {
    sh_print!(sh, "Task List:\r\n");
    sh_print!(sh, "ID   State      Stack Location\r\n");
    sh_print!(sh, "---  ---------  --------------\r\n");

    let mut count = 0u32;
    for index in 0..kern::config::MAX_TASKS {
        let Some(info) = kern::syscalls::task_info(index) else {
            continue;
        };
        let state = match info.state {
            TaskState::Ready => "READY",
            TaskState::Running => "RUNNING",
            TaskState::Blocked => "BLOCKED",
            TaskState::Zombie => "ZOMBIE",
            TaskState::Unused => "UNKNOWN",
        };
        match info.stack {
            StackLocation::Heap { base, .. } => {
                sh_print!(sh, "{:<3}  {:<9}  {:#010x} (heap)\r\n", info.id.0, state, base);
            }
            StackLocation::Embedded => {
                sh_print!(sh, "{:<3}  {:<9}  Static (embedded)\r\n", info.id.0, state);
            }
            StackLocation::Absent => {
                sh_print!(sh, "{:<3}  {:<9}  NULL\r\n", info.id.0, state);
            }
        }
        count += 1;
    }

    sh_print!(sh, "\r\nTotal tasks: {}\r\n", count);
    0
}

fn cmd_heap(sh: &mut Shell, _argv: &[&str]) -> i32 {
    if !kern::config::DYNAMIC_STACKS {
        sh_print!(sh, "Heap statistics only available in dynamic allocation mode\r\n");
        sh_print!(sh, "Current mode: STATIC (stacks embedded in task records)\r\n");
        return 0;
    }
    let Some(stats) = kern::heap::stats() else {
        sh_print!(sh, "Heap not initialized\r\n");
        return -1;
    };

    sh_print!(sh, "Heap Statistics:\r\n");
    sh_print!(sh, "  Total size:     {} bytes\r\n", stats.total_size);
    sh_print!(sh, "  Used:           {} bytes\r\n", stats.used_size);
    sh_print!(sh, "  Free:           {} bytes\r\n", stats.free_size);
    sh_print!(sh, "  Largest block:  {} bytes\r\n", stats.largest_free_block);
    sh_print!(sh, "  Allocated blocks: {}\r\n", stats.allocated_blocks);
    sh_print!(sh, "  Free fragments:   {}\r\n", stats.free_blocks);
    if stats.total_size > 0 {
        let percent = (stats.used_size * 100) / stats.total_size;
        sh_print!(sh, "  Usage:           {}%\r\n", percent);
    }
    if kern::heap::check_integrity().is_ok() {
        sh_print!(sh, "  Status:          OK\r\n");
    } else {
        sh_print!(sh, "  Status:          CORRUPTED!\r\n");
    }
    0
}

fn cmd_uptime(sh: &mut Shell, _argv: &[&str]) -> i32 {
    let ms = kern::syscalls::now().ticks();
    let secs = ms / 1000;
    sh_print!(
        sh,
        "Uptime: {} Days, {} Hours, {} Minutes, {} Seconds.{:03}\r\n",
        secs / 86_400,
        (secs / 3600) % 24,
        (secs / 60) % 60,
        secs % 60,
        ms % 1000,
    );
    0
}

fn cmd_kill(sh: &mut Shell, argv: &[&str]) -> i32 {
    let Some(arg) = argv.get(1) else {
        sh_print!(sh, "Usage: kill <id>\r\n");
        return -1;
    };
    let Ok(id) = arg.parse::<u16>() else {
        sh_print!(sh, "Invalid task id: {}\r\n", arg);
        return -1;
    };
    match kern::syscalls::delete(TaskId(id)) {
        Ok(()) => {
            sh_print!(sh, "Task {} killed.\r\n", id);
            0
        }
        Err(e) => {
            match e {
                kern::err::DeleteError::NotFound => {
                    sh_print!(sh, "Task {} not found.\r\n", id);
                }
                kern::err::DeleteError::IsIdle => {
                    sh_print!(sh, "Cannot kill the idle task.\r\n");
                }
                kern::err::DeleteError::IsCurrent => {
                    sh_print!(sh, "A task cannot kill itself.\r\n");
                }
            }
            e as i32
        }
    }
}

fn cmd_reboot(sh: &mut Shell, _argv: &[&str]) -> i32 {
    sh_print!(sh, "Rebooting...\r\n");
    // Give the TX ring a moment to drain before the reset wipes it.
    let _ = kern::syscalls::sleep_ticks(50);
    kern::arch::reset();
}

fn cmd_heaptest(sh: &mut Shell, argv: &[&str]) -> i32 {
    if !kern::config::DYNAMIC_STACKS {
        sh_print!(sh, "Heap tests only available in dynamic allocation mode\r\n");
        return -1;
    }
    let size = argv
        .get(2)
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(128)
        .max(8);
    match argv.get(1).copied() {
        Some("basic") => heaptest_basic(sh, size),
        Some("frag") => heaptest_frag(sh, size),
        Some("stress") => heaptest_stress(sh, size),
        _ => {
            sh_print!(sh, "Usage: heaptest <basic|frag|stress> [size]\r\n");
            -1
        }
    }
}

/// Fills an allocation with a position-derived pattern.
unsafe fn fill_pattern(p: *mut u8, len: usize, seed: u8) {
    for i in 0..len {
        unsafe { p.add(i).write((i as u8).wrapping_add(seed)) };
    }
}

/// Checks the pattern written by `fill_pattern`. Returns the first
/// mismatching offset.
unsafe fn verify_pattern(p: *const u8, len: usize, seed: u8) -> Option<usize> {
    (0..len).find(|&i| unsafe { p.add(i).read() } != (i as u8).wrapping_add(seed))
}

fn heaptest_basic(sh: &mut Shell, size: usize) -> i32 {
    let Some(p) = kern::heap::alloc(size) else {
        sh_print!(sh, "[FAIL] alloc({}) returned nothing\r\n", size);
        return -1;
    };
    sh_print!(sh, "[PASS] Allocated {} bytes at {:#010x}\r\n", size, p.as_ptr() as usize);

    unsafe { fill_pattern(p.as_ptr(), size, 0xA5) };
    sh_print!(sh, "[PASS] Pattern written\r\n");

    if let Some(off) = unsafe { verify_pattern(p.as_ptr(), size, 0xA5) } {
        sh_print!(sh, "[FAIL] Pattern mismatch at offset {}\r\n", off);
        unsafe { kern::heap::free(p) };
        return -1;
    }
    sh_print!(sh, "[PASS] Pattern verified\r\n");

    let Some(bigger) = (unsafe { kern::heap::realloc(p, size * 2) }) else {
        sh_print!(sh, "[FAIL] realloc({}) returned nothing\r\n", size * 2);
        unsafe { kern::heap::free(p) };
        return -1;
    };
    sh_print!(sh, "[PASS] Reallocated to {} bytes\r\n", size * 2);

    if let Some(off) = unsafe { verify_pattern(bigger.as_ptr(), size, 0xA5) } {
        sh_print!(sh, "[FAIL] Old contents lost at offset {}\r\n", off);
        unsafe { kern::heap::free(bigger) };
        return -1;
    }
    sh_print!(sh, "[PASS] Old contents intact after realloc\r\n");

    unsafe { kern::heap::free(bigger) };
    sh_print!(sh, "[PASS] Freed\r\n");

    sh_print!(sh, "[PASS] Basic test passed.\r\n");
    0
}

fn heaptest_frag(sh: &mut Shell, size: usize) -> i32 {
    let mut blocks = [None; 5];
    for (i, slot) in blocks.iter_mut().enumerate() {
        *slot = kern::heap::alloc(size);
        if slot.is_none() {
            sh_print!(sh, "[FAIL] alloc #{} failed\r\n", i);
            return -1;
        }
    }
    sh_print!(sh, "[PASS] Allocated 5 x {} bytes\r\n", size);

    // Free the odd blocks, punching two holes.
    for i in [1, 3] {
        if let Some(p) = blocks[i].take() {
            unsafe { kern::heap::free(p) };
        }
    }
    let Some(stats) = kern::heap::stats() else {
        sh_print!(sh, "[FAIL] no heap stats\r\n");
        return -1;
    };
    if stats.free_blocks < 2 {
        sh_print!(sh, "[FAIL] expected >= 2 fragments, found {}\r\n", stats.free_blocks);
        return -1;
    }
    sh_print!(sh, "[PASS] {} free fragments after punching holes\r\n", stats.free_blocks);

    // A hole-sized allocation must not grow the pool's used area past
    // the holes; first-fit reuses the lowest one.
    let Some(refill) = kern::heap::alloc(size) else {
        sh_print!(sh, "[FAIL] refill alloc failed\r\n");
        return -1;
    };
    sh_print!(sh, "[PASS] Hole reused at {:#010x}\r\n", refill.as_ptr() as usize);
    unsafe { kern::heap::free(refill) };

    for slot in blocks.iter_mut() {
        if let Some(p) = slot.take() {
            unsafe { kern::heap::free(p) };
        }
    }
    let Some(stats) = kern::heap::stats() else {
        sh_print!(sh, "[FAIL] no heap stats\r\n");
        return -1;
    };
    if kern::heap::check_integrity().is_err() {
        sh_print!(sh, "[FAIL] integrity check failed\r\n");
        return -1;
    }
    sh_print!(sh, "[PASS] All freed, {} fragment(s) remain\r\n", stats.free_blocks);
    sh_print!(sh, "[PASS] Fragmentation test passed.\r\n");
    0
}

fn heaptest_stress(sh: &mut Shell, size: usize) -> i32 {
    let before = kern::heap::stats();

    // Churn: overlapping alloc/free with varying sizes, integrity
    // checked as we go.
    let mut live = [None; 8];
    for round in 0..64usize {
        let slot = round % live.len();
        if let Some(p) = live[slot].take() {
            unsafe { kern::heap::free(p) };
        }
        let n = (size + (round * 24) % (size * 3)).max(8);
        live[slot] = kern::heap::alloc(n);
        if let Some(p) = live[slot] {
            unsafe { fill_pattern(p.as_ptr(), n, round as u8) };
        }
        if kern::heap::check_integrity().is_err() {
            sh_print!(sh, "[FAIL] integrity lost in round {}\r\n", round);
            return -1;
        }
    }
    for slot in live.iter_mut() {
        if let Some(p) = slot.take() {
            unsafe { kern::heap::free(p) };
        }
    }
    sh_print!(sh, "[PASS] 64 rounds of churn survived\r\n");

    if kern::heap::stats() != before {
        sh_print!(sh, "[FAIL] stats did not return to baseline\r\n");
        return -1;
    }
    sh_print!(sh, "[PASS] Heap returned to baseline\r\n");
    sh_print!(sh, "[PASS] Stress test passed.\r\n");
    0
}
