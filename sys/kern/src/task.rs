// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of tasks and the task table.
//!
//! Everything here is plain data manipulation over a [`TaskTable`]; no
//! statics, no interrupts, no architecture specifics beyond the saved
//! stack pointer. The kernel proper wraps these operations in its
//! priority-ceiling critical section (see `syscalls`/`startup`), and the
//! test suite drives them directly on the host.
//!
//! Storage reclamation is expressed through callbacks taking a
//! [`ReclaimedStack`], so this module never touches the heap: whoever
//! calls `delete`/`garbage_collect`/`check_stack_overflow` decides what
//! returning a stack region means.

use crate::config::{MAX_TASKS, STACK_MAX_BYTES, STACK_MIN_BYTES};
use crate::err::{BlockError, CreateError, DeleteError, SleepError};
use crate::stack::{ReclaimedStack, StackLocation, StackRegion};
use crate::time::Timestamp;

/// Signature of a task entry function. `extern "C"` because the entry
/// address is consumed by the exception-return frame, and the argument
/// arrives in r0.
pub type TaskEntry = extern "C" fn(usize);

/// Stable identifier handed out at creation and used by `delete`/`block`.
/// Id 0 belongs to the idle task for the life of the system.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TaskId(pub u16);

impl TaskId {
    pub const IDLE: TaskId = TaskId(0);
}

/// Scheduling state of one task-table record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TaskState {
    /// Slot holds no task.
    Unused,
    /// Runnable, waiting its turn.
    Ready,
    /// Currently executing. At most one record is Running.
    Running,
    /// Not selectable: sleeping or explicitly blocked.
    Blocked,
    /// Self-exited; still owns its stack until the next collection pass.
    Zombie,
}

/// Internal representation of a task.
#[repr(C)] // so the location of `save` is predictable
pub struct Task {
    /// Saved machine state. The context-switch handler stores and reloads
    /// the process stack pointer through the current-task pointer, so
    /// this field must stay first.
    save: crate::arch::SavedState,
    /// When set, the tick at which the wake scan should ready this task.
    deadline: Option<Timestamp>,
    /// The task's stack storage (heap-backed or embedded; see `stack`).
    stack: StackRegion,
    state: TaskState,
    /// The idle task is only selected when nothing else is runnable, and
    /// is exempt from sleep/block/delete.
    is_idle: bool,
    id: TaskId,
}

impl Task {
    const fn unused() -> Self {
        Task {
            save: crate::arch::SavedState::new(),
            deadline: None,
            stack: StackRegion::empty(),
            state: TaskState::Unused,
            is_idle: false,
            id: TaskId(0),
        }
    }

    pub fn save(&self) -> &crate::arch::SavedState {
        &self.save
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn is_idle(&self) -> bool {
        self.is_idle
    }

    fn is_live(&self) -> bool {
        self.state != TaskState::Unused
    }

    /// Eligible for round-robin selection: runnable, not the idle
    /// fallback, and not waiting out a sleep.
    fn is_eligible(&self) -> bool {
        self.state == TaskState::Ready && !self.is_idle && self.deadline.is_none()
    }
}

/// Copy of one record's externally interesting fields, for diagnostics.
#[derive(Copy, Clone, Debug)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub state: TaskState,
    pub stack: StackLocation,
}

/// Validates a requested stack size: undersized requests are raised to
/// the minimum, oversized ones refused, and the result is rounded up to
/// the 8-byte stack alignment.
pub fn clamp_stack_size(requested: usize) -> Result<usize, CreateError> {
    let n = requested.max(STACK_MIN_BYTES);
    if n > STACK_MAX_BYTES {
        return Err(CreateError::StackTooLarge);
    }
    Ok((n + 7) & !7)
}

/// The fixed-capacity task table plus its bookkeeping: live prefix
/// length, current index, idle index, and the id counter.
pub struct TaskTable {
    tasks: [Task; MAX_TASKS],
    /// Records `0..count` are the dense region the scheduler scans;
    /// compaction keeps it dense. Slots in the region may still be
    /// Unused between deletions and the next collection.
    count: usize,
    current: usize,
    idle: Option<usize>,
    next_id: u16,
}

impl TaskTable {
    const TASK_INIT: Task = Task::unused();

    pub const fn new() -> Self {
        TaskTable {
            tasks: [Self::TASK_INIT; MAX_TASKS],
            count: 0,
            current: 0,
            idle: None,
            next_id: 0,
        }
    }

    /// Whether `create` could currently succeed, ignoring stack storage.
    /// Callers acquire the stack only after checking this, so a full
    /// table does not leak a heap region.
    pub fn has_free_slot(&self) -> bool {
        self.count < MAX_TASKS
            || self.tasks[..self.count]
                .iter()
                .any(|t| t.state == TaskState::Unused)
    }

    fn free_slot(&self) -> Option<usize> {
        self.tasks[..self.count]
            .iter()
            .position(|t| t.state == TaskState::Unused)
            .or((self.count < MAX_TASKS).then_some(self.count))
    }

    fn next_id(&mut self) -> TaskId {
        self.next_id = self.next_id.wrapping_add(1);
        if self.next_id == 0 {
            // 0 is the idle task forever; skip it when the counter wraps.
            self.next_id = 1;
        }
        TaskId(self.next_id)
    }

    /// Installs a new Ready task in the first free slot and returns its
    /// id. In the default build the caller supplies the stack region; in
    /// a `static-stacks` build the slot's embedded buffer is used.
    #[cfg(not(feature = "static-stacks"))]
    pub fn create(
        &mut self,
        entry: TaskEntry,
        arg: usize,
        stack: StackRegion,
    ) -> Result<TaskId, CreateError> {
        let slot = self.free_slot().ok_or(CreateError::TableFull)?;
        self.tasks[slot].stack = stack;
        self.install(slot, entry, arg)
    }

    #[cfg(feature = "static-stacks")]
    pub fn create(&mut self, entry: TaskEntry, arg: usize) -> Result<TaskId, CreateError> {
        let slot = self.free_slot().ok_or(CreateError::TableFull)?;
        self.install(slot, entry, arg)
    }

    fn install(&mut self, slot: usize, entry: TaskEntry, arg: usize) -> Result<TaskId, CreateError> {
        let id = self.next_id();
        let t = &mut self.tasks[slot];
        t.stack.write_canary();
        let psp = t.stack.prepare(
            entry as usize as u32,
            arg as u32,
            crate::syscalls::exit as usize as u32,
        );
        t.save = crate::arch::SavedState::with_psp(psp);
        t.deadline = None;
        t.state = TaskState::Ready;
        t.is_idle = false;
        t.id = id;
        if slot == self.count {
            self.count += 1;
        }
        Ok(id)
    }

    /// Re-labels the task `id` as the idle task. It takes the reserved id
    /// 0 and becomes the fallback the scheduler picks when nothing else
    /// is eligible.
    pub fn mark_idle(&mut self, id: TaskId) {
        if let Some(idx) = self.find_by_id(id) {
            self.tasks[idx].is_idle = true;
            self.tasks[idx].id = TaskId::IDLE;
            self.idle = Some(idx);
        }
    }

    /// Marks slot 0 Running and returns a reference to it, for handing to
    /// the architecture's first-task trampoline.
    pub fn start(&mut self) -> &Task {
        self.current = 0;
        self.tasks[0].state = TaskState::Running;
        &self.tasks[0]
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current_task(&self) -> &Task {
        &self.tasks[self.current]
    }

    /// Round-robin selection, starting after the current task. The
    /// outgoing Running record returns to Ready; the chosen record
    /// becomes Running. Falls back to the idle task, and failing even
    /// that (only possible when the current task is the idle task or
    /// nothing else exists) stays where it is.
    pub fn select_next(&mut self) -> usize {
        if self.count == 0 {
            return self.current;
        }

        if self.tasks[self.current].state == TaskState::Running {
            self.tasks[self.current].state = TaskState::Ready;
        }

        let start = (self.current + 1) % self.count;
        for i in 0..self.count {
            let idx = (start + i) % self.count;
            if self.tasks[idx].is_eligible() {
                self.tasks[idx].state = TaskState::Running;
                self.current = idx;
                return idx;
            }
        }

        if let Some(idle) = self.idle {
            if self.tasks[idle].state == TaskState::Ready {
                self.tasks[idle].state = TaskState::Running;
                self.current = idle;
                return idle;
            }
        }

        // Nothing else runnable and no selectable idle task: resume the
        // interrupted task.
        if self.tasks[self.current].state == TaskState::Ready {
            self.tasks[self.current].state = TaskState::Running;
        }
        self.current
    }

    /// Puts the current task to sleep for `ticks` ticks from `now`.
    /// The caller yields afterwards; the wake scan makes the task Ready
    /// again once the deadline passes.
    pub fn sleep_current(&mut self, now: Timestamp, ticks: u64) -> Result<(), SleepError> {
        if ticks == 0 {
            return Err(SleepError::ZeroDuration);
        }
        let t = &mut self.tasks[self.current];
        if t.is_idle {
            return Err(SleepError::IdleTask);
        }
        t.deadline = Some(now + ticks);
        if t.is_live() {
            t.state = TaskState::Blocked;
        }
        Ok(())
    }

    /// The tick-side wake scan: readies every blocked task whose deadline
    /// has arrived. Returns how many woke, which doubles as the "should
    /// we reschedule" hint.
    pub fn wake_sleeping(&mut self, now: Timestamp) -> usize {
        let mut woken = 0;
        for t in &mut self.tasks[..self.count] {
            if t.state == TaskState::Blocked {
                if let Some(deadline) = t.deadline {
                    if deadline <= now {
                        t.state = TaskState::Ready;
                        t.deadline = None;
                        woken += 1;
                    }
                }
            }
        }
        woken
    }

    /// Blocks the task `id`. Running records are refused: a task blocks
    /// itself through [`TaskTable::block_current`], never from outside.
    pub fn block(&mut self, id: TaskId) -> Result<(), BlockError> {
        let idx = self.find_by_id(id).ok_or(BlockError::NotFound)?;
        let t = &mut self.tasks[idx];
        if t.is_idle {
            return Err(BlockError::IsIdle);
        }
        match t.state {
            TaskState::Ready | TaskState::Blocked => {
                t.state = TaskState::Blocked;
                Ok(())
            }
            TaskState::Running => Err(BlockError::IsRunning),
            // Zombies are as good as gone.
            _ => Err(BlockError::NotFound),
        }
    }

    /// Readies a blocked task. Also clears any pending sleep deadline,
    /// otherwise an externally unblocked sleeper would be Ready yet never
    /// eligible (the wake scan only looks at Blocked records).
    pub fn unblock(&mut self, id: TaskId) -> Result<(), BlockError> {
        let idx = self.find_by_id(id).ok_or(BlockError::NotFound)?;
        let t = &mut self.tasks[idx];
        if t.state == TaskState::Blocked {
            t.state = TaskState::Ready;
            t.deadline = None;
        }
        Ok(())
    }

    /// Blocks the calling task. The idle task is quietly exempted. The
    /// caller yields afterwards.
    pub fn block_current(&mut self) {
        let t = &mut self.tasks[self.current];
        if t.is_live() && !t.is_idle {
            t.state = TaskState::Blocked;
        }
    }

    /// Removes the task `id` from the table. Refuses the idle task and
    /// the caller (which must use `exit`). A heap-backed stack is handed
    /// to `on_reclaim`.
    pub fn delete(
        &mut self,
        id: TaskId,
        on_reclaim: impl FnOnce(ReclaimedStack),
    ) -> Result<(), DeleteError> {
        let idx = self.find_by_id(id).ok_or(DeleteError::NotFound)?;
        if self.tasks[idx].is_idle {
            return Err(DeleteError::IsIdle);
        }
        if idx == self.current {
            return Err(DeleteError::IsCurrent);
        }
        if let Some(stack) = self.tasks[idx].stack.take_for_reclaim() {
            on_reclaim(stack);
        }
        self.tasks[idx] = Task::unused();
        Ok(())
    }

    /// Self-termination: the record becomes a Zombie. Its stack stays
    /// attached (the task is still executing on it) until garbage
    /// collection reclaims the record.
    pub fn exit_current(&mut self) {
        let t = &mut self.tasks[self.current];
        t.state = TaskState::Zombie;
        t.deadline = None;
    }

    /// Canary sweep. Tasks whose stack canary no longer matches are
    /// deleted on the spot (stacks passed to `on_reclaim`); if the
    /// current task is the offender the caller must force it to exit, so
    /// that case is only reported.
    pub fn check_stack_overflow(&mut self, mut on_reclaim: impl FnMut(ReclaimedStack)) -> bool {
        let mut current_overflowed = false;
        for idx in 0..self.count {
            let t = &mut self.tasks[idx];
            if !t.is_live() || !t.stack.is_present() || t.stack.canary_ok() {
                continue;
            }
            if idx == self.current {
                current_overflowed = true;
            } else {
                if let Some(stack) = t.stack.take_for_reclaim() {
                    on_reclaim(stack);
                }
                *t = Task::unused();
            }
        }
        current_overflowed
    }

    /// Garbage collection: reclaims zombie records (returning their
    /// stacks), then compacts the dense region so live records close up
    /// over Unused holes. Relative order is preserved, so round-robin
    /// progress survives a collection; the current and idle indices move
    /// with their records.
    pub fn garbage_collect(&mut self, mut on_reclaim: impl FnMut(ReclaimedStack)) {
        for idx in 0..self.count {
            if self.tasks[idx].state == TaskState::Zombie && idx != self.current {
                if let Some(stack) = self.tasks[idx].stack.take_for_reclaim() {
                    on_reclaim(stack);
                }
                self.tasks[idx] = Task::unused();
            }
        }

        let mut write = 0;
        for read in 0..self.count {
            if self.tasks[read].is_live() {
                if read != write {
                    self.tasks.swap(read, write);
                    if self.current == read {
                        self.current = write;
                    }
                    if self.idle == Some(read) {
                        self.idle = Some(write);
                    }
                }
                write += 1;
            }
        }
        self.count = write;
    }

    /// Reads out one record for diagnostics; `None` for unused slots and
    /// out-of-range indices.
    pub fn snapshot(&self, index: usize) -> Option<TaskSnapshot> {
        let t = self.tasks.get(index)?;
        if !t.is_live() {
            return None;
        }
        Some(TaskSnapshot {
            id: t.id,
            state: t.state,
            stack: t.stack.location(),
        })
    }

    /// Number of live records.
    pub fn live_tasks(&self) -> usize {
        self.tasks[..self.count].iter().filter(|t| t.is_live()).count()
    }

    fn find_by_id(&self, id: TaskId) -> Option<usize> {
        self.tasks[..self.count]
            .iter()
            .position(|t| t.is_live() && t.id == id)
    }
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(feature = "static-stacks")))]
mod tests {
    use super::*;
    use crate::config::STACK_CANARY;
    use core::ptr::NonNull;

    extern "C" fn noop_entry(_arg: usize) {}

    /// Leaks an 8-byte-aligned stack for a test task.
    fn test_stack(bytes: usize) -> StackRegion {
        let words = vec![0u64; bytes / 8].into_boxed_slice();
        let mem = Box::leak(words);
        StackRegion::from_heap(
            NonNull::new(mem.as_mut_ptr().cast::<u8>()).unwrap(),
            bytes,
        )
    }

    fn table_with(n: usize) -> (TaskTable, Vec<TaskId>) {
        let mut tbl = TaskTable::new();
        let ids = (0..n)
            .map(|_| tbl.create(noop_entry, 0, test_stack(512)).unwrap())
            .collect();
        (tbl, ids)
    }

    fn assert_at_most_one_running(tbl: &TaskTable) {
        let running = (0..MAX_TASKS)
            .filter_map(|i| tbl.snapshot(i))
            .filter(|s| s.state == TaskState::Running)
            .count();
        assert!(running <= 1, "{running} tasks Running");
    }

    #[test]
    fn clamping() {
        assert_eq!(clamp_stack_size(0), Ok(STACK_MIN_BYTES));
        assert_eq!(clamp_stack_size(100), Ok(STACK_MIN_BYTES));
        assert_eq!(clamp_stack_size(513), Ok(520));
        assert_eq!(clamp_stack_size(STACK_MAX_BYTES), Ok(STACK_MAX_BYTES));
        assert_eq!(
            clamp_stack_size(STACK_MAX_BYTES + 1),
            Err(CreateError::StackTooLarge)
        );
    }

    #[test]
    fn create_assigns_ids_and_canary() {
        let (tbl, ids) = table_with(3);
        assert_eq!(ids, vec![TaskId(1), TaskId(2), TaskId(3)]);
        for (i, id) in ids.iter().enumerate() {
            let snap = tbl.snapshot(i).unwrap();
            assert_eq!(snap.id, *id);
            assert_eq!(snap.state, TaskState::Ready);
            match snap.stack {
                StackLocation::Heap { base, size } => {
                    assert_eq!(size, 512);
                    let canary = unsafe { (base as *const u32).read() };
                    assert_eq!(canary, STACK_CANARY);
                }
                other => panic!("unexpected stack location {other:?}"),
            }
        }
    }

    #[test]
    fn create_at_capacity_fails() {
        let (mut tbl, _ids) = table_with(MAX_TASKS);
        assert!(!tbl.has_free_slot());
        let stack = test_stack(512);
        assert_eq!(
            tbl.create(noop_entry, 0, stack).unwrap_err(),
            CreateError::TableFull
        );
    }

    #[test]
    fn delete_then_create_reuses_slot() {
        let (mut tbl, ids) = table_with(3);
        assert_eq!(tbl.live_tasks(), 3);
        let mut reclaimed = 0;
        tbl.delete(ids[1], |_| reclaimed += 1).unwrap();
        assert_eq!(reclaimed, 1);
        assert_eq!(tbl.live_tasks(), 2);
        let id = tbl.create(noop_entry, 0, test_stack(512)).unwrap();
        assert_eq!(id, TaskId(4));
        assert_eq!(tbl.live_tasks(), 3);
        // The hole was reused, not appended past it.
        assert_eq!(tbl.snapshot(1).unwrap().id, id);
    }

    #[test]
    fn delete_error_kinds_do_not_mutate() {
        let (mut tbl, ids) = table_with(2);
        tbl.mark_idle(ids[1]);
        tbl.start();

        assert_eq!(
            tbl.delete(TaskId(7777), |_| {}).unwrap_err(),
            DeleteError::NotFound
        );
        assert_eq!(
            tbl.delete(TaskId::IDLE, |_| {}).unwrap_err(),
            DeleteError::IsIdle
        );
        assert_eq!(
            tbl.delete(ids[0], |_| {}).unwrap_err(),
            DeleteError::IsCurrent
        );
        assert_eq!(tbl.live_tasks(), 2);
        assert_eq!(tbl.snapshot(0).unwrap().state, TaskState::Running);
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let (mut tbl, ids) = table_with(4);
        tbl.mark_idle(ids[3]);
        tbl.start();

        // Current is task 0; repeated selection must visit 1, 2, 0, 1...
        assert_eq!(tbl.select_next(), 1);
        assert_at_most_one_running(&tbl);
        assert_eq!(tbl.select_next(), 2);
        assert_eq!(tbl.select_next(), 0);
        assert_eq!(tbl.select_next(), 1);
    }

    #[test]
    fn idle_fallback_when_everyone_sleeps() {
        let (mut tbl, ids) = table_with(3);
        tbl.mark_idle(ids[2]);
        tbl.start();

        let now = Timestamp::from_ticks(0);
        tbl.sleep_current(now, 10).unwrap();
        assert_eq!(tbl.select_next(), 1);
        tbl.sleep_current(now, 10).unwrap();
        let idle_idx = tbl.select_next();
        assert!(tbl.snapshot(idle_idx).unwrap().id == TaskId::IDLE);
        // With everyone else asleep the idle task keeps getting picked.
        assert_eq!(tbl.select_next(), idle_idx);
        assert_at_most_one_running(&tbl);
    }

    #[test]
    fn selection_skips_sleepers_until_woken() {
        let (mut tbl, ids) = table_with(3);
        tbl.mark_idle(ids[2]);
        tbl.start();

        tbl.sleep_current(Timestamp::from_ticks(0), 5).unwrap();
        assert_eq!(tbl.select_next(), 1);

        // Tick 4: too early.
        assert_eq!(tbl.wake_sleeping(Timestamp::from_ticks(4)), 0);
        // Tick 5: deadline reached.
        assert_eq!(tbl.wake_sleeping(Timestamp::from_ticks(5)), 1);
        assert_eq!(tbl.snapshot(0).unwrap().state, TaskState::Ready);
        assert_eq!(tbl.select_next(), 0);
    }

    #[test]
    fn wake_set_is_exactly_the_expired_sleepers() {
        let (mut tbl, ids) = table_with(4);
        tbl.mark_idle(ids[3]);
        tbl.start();

        tbl.sleep_current(Timestamp::from_ticks(0), 5).unwrap();
        tbl.select_next();
        tbl.sleep_current(Timestamp::from_ticks(0), 10).unwrap();
        tbl.select_next();
        // Task 2 blocks without a deadline; no tick may wake it.
        tbl.block_current();
        tbl.select_next();

        assert_eq!(tbl.wake_sleeping(Timestamp::from_ticks(7)), 1);
        assert_eq!(tbl.snapshot(0).unwrap().state, TaskState::Ready);
        assert_eq!(tbl.snapshot(1).unwrap().state, TaskState::Blocked);
        assert_eq!(tbl.snapshot(2).unwrap().state, TaskState::Blocked);
        assert_eq!(tbl.wake_sleeping(Timestamp::from_ticks(10)), 1);
        assert_eq!(tbl.snapshot(1).unwrap().state, TaskState::Ready);
        assert_eq!(tbl.snapshot(2).unwrap().state, TaskState::Blocked);
    }

    #[test]
    fn sleep_zero_is_an_error_and_does_not_block() {
        let (mut tbl, ids) = table_with(2);
        tbl.mark_idle(ids[1]);
        tbl.start();
        assert_eq!(
            tbl.sleep_current(Timestamp::from_ticks(0), 0),
            Err(SleepError::ZeroDuration)
        );
        assert_eq!(tbl.snapshot(0).unwrap().state, TaskState::Running);
    }

    #[test]
    fn block_rules() {
        let (mut tbl, ids) = table_with(3);
        tbl.mark_idle(ids[2]);
        tbl.start();

        // Blocking another Running task from outside is refused.
        assert_eq!(tbl.block(ids[0]), Err(BlockError::IsRunning));
        // Idle is protected.
        assert_eq!(tbl.block(TaskId::IDLE), Err(BlockError::IsIdle));
        // Ready tasks block fine.
        tbl.block(ids[1]).unwrap();
        assert_eq!(tbl.snapshot(1).unwrap().state, TaskState::Blocked);
        tbl.unblock(ids[1]).unwrap();
        assert_eq!(tbl.snapshot(1).unwrap().state, TaskState::Ready);
        assert_eq!(tbl.block(TaskId(999)), Err(BlockError::NotFound));
    }

    #[test]
    fn unblock_clears_a_pending_sleep() {
        let (mut tbl, ids) = table_with(2);
        tbl.mark_idle(ids[1]);
        tbl.start();
        tbl.sleep_current(Timestamp::from_ticks(0), 1000).unwrap();
        tbl.select_next();
        tbl.unblock(ids[0]).unwrap();
        // Ready *and* eligible: the stale deadline must not linger.
        assert_eq!(tbl.select_next(), 0);
    }

    #[test]
    fn exit_and_collection_reclaim_the_zombie() {
        let (mut tbl, ids) = table_with(3);
        tbl.mark_idle(ids[2]);
        tbl.start();

        tbl.exit_current();
        assert_eq!(tbl.snapshot(0).unwrap().state, TaskState::Zombie);
        // The zombie still owns its stack and is never selected again.
        assert_eq!(tbl.select_next(), 1);

        let mut reclaimed = 0;
        tbl.garbage_collect(|_| reclaimed += 1);
        assert_eq!(reclaimed, 1);
        assert_eq!(tbl.live_tasks(), 2);
        // Survivors slid down; the running task's index moved with it.
        assert_eq!(tbl.snapshot(0).unwrap().id, ids[1]);
        assert_eq!(tbl.snapshot(0).unwrap().state, TaskState::Running);
        assert_eq!(tbl.current_index(), 0);
        assert_eq!(tbl.snapshot(1).unwrap().id, TaskId::IDLE);
    }

    #[test]
    fn compaction_preserves_order_and_idle_index() {
        let (mut tbl, ids) = table_with(5);
        tbl.mark_idle(ids[4]);
        tbl.start();

        tbl.delete(ids[1], |_| {}).unwrap();
        tbl.delete(ids[3], |_| {}).unwrap();
        tbl.garbage_collect(|_| {});

        let order: Vec<TaskId> = (0..MAX_TASKS)
            .filter_map(|i| tbl.snapshot(i))
            .map(|s| s.id)
            .collect();
        assert_eq!(order, vec![ids[0], ids[2], TaskId::IDLE]);

        // Round-robin still works over the compacted table, with the idle
        // fallback in its new position.
        assert_eq!(tbl.select_next(), 1);
        tbl.sleep_current(Timestamp::from_ticks(0), 10).unwrap();
        tbl.select_next();
        tbl.sleep_current(Timestamp::from_ticks(0), 10).unwrap();
        let idle_idx = tbl.select_next();
        assert_eq!(tbl.snapshot(idle_idx).unwrap().id, TaskId::IDLE);
    }

    #[test]
    fn canary_sweep_deletes_corrupt_tasks() {
        let (mut tbl, ids) = table_with(3);
        tbl.mark_idle(ids[2]);
        tbl.start();

        // Simulate task 1 overflowing: stomp its canary word.
        match tbl.snapshot(1).unwrap().stack {
            StackLocation::Heap { base, .. } => unsafe {
                (base as *mut u32).write(0x0BAD_F00D);
            },
            other => panic!("unexpected stack location {other:?}"),
        }

        let mut reclaimed = 0;
        let current_bad = tbl.check_stack_overflow(|_| reclaimed += 1);
        assert!(!current_bad);
        assert_eq!(reclaimed, 1);
        assert_eq!(tbl.live_tasks(), 2);
        assert!(tbl.snapshot(1).is_none());
    }

    #[test]
    fn canary_sweep_reports_the_current_task() {
        let (mut tbl, ids) = table_with(2);
        tbl.mark_idle(ids[1]);
        tbl.start();

        match tbl.snapshot(0).unwrap().stack {
            StackLocation::Heap { base, .. } => unsafe {
                (base as *mut u32).write(0);
            },
            other => panic!("unexpected stack location {other:?}"),
        }
        // The offender is the caller: not deleted here, just reported.
        assert!(tbl.check_stack_overflow(|_| panic!("must not reclaim")));
        assert_eq!(tbl.live_tasks(), 2);
    }

    #[test]
    fn two_sleepers_scenario() {
        // Two tasks that loop { sleep(10); counter += 1 } next to an idle
        // task, driven for 200 ticks: each wakes 20 times.
        let (mut tbl, ids) = table_with(3);
        tbl.mark_idle(ids[2]);
        tbl.start();

        let mut counter = 0u32;

        // First pass: both tasks run to their first sleep without
        // counting.
        tbl.sleep_current(Timestamp::from_ticks(0), 10).unwrap();
        tbl.select_next();
        tbl.sleep_current(Timestamp::from_ticks(0), 10).unwrap();
        tbl.select_next();

        for tick in 1..=200u64 {
            let now = Timestamp::from_ticks(tick);
            tbl.wake_sleeping(now);
            loop {
                let idx = tbl.select_next();
                if tbl.snapshot(idx).unwrap().id == TaskId::IDLE {
                    break;
                }
                // The task body: wake from sleep, bump the counter, sleep
                // again.
                counter += 1;
                tbl.sleep_current(now, 10).unwrap();
            }
            assert_at_most_one_running(&tbl);
        }

        assert_eq!(counter, 40);
        for i in 0..2 {
            match tbl.snapshot(i).unwrap().stack {
                StackLocation::Heap { base, .. } => {
                    let canary = unsafe { (base as *const u32).read() };
                    assert_eq!(canary, STACK_CANARY);
                }
                other => panic!("unexpected stack location {other:?}"),
            }
        }
    }
}
