// sched.rs
// Three-priority round-robin scheduler
//
// Three ready lists (driver/server/user, checked in that priority order),
// a blocked list, a master "all" list for bookkeeping, and a dedicated
// idle process that is never itself enqueued. `next` is the entire
// scheduling decision: it is called once per trap, with the process that
// was just interrupted, and returns the process to resume.

use core::ptr::NonNull;

use crate::list::{Elem, IntrusiveList};
use crate::palloc::PageAllocator;
use crate::process::{CreateError, ExtraMapping, Process, ProcessPool, ProcessState};

#[repr(usize)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Priority {
    Driver = 0,
    Server = 1,
    User = 2,
}

fn elem_of(p: *mut Process) -> NonNull<Elem> {
    NonNull::new(unsafe { &mut (*p).elem as *mut Elem }).unwrap()
}

fn allelem_of(p: *mut Process) -> NonNull<Elem> {
    NonNull::new(unsafe { &mut (*p).allelem as *mut Elem }).unwrap()
}

pub struct Scheduler {
    pool: ProcessPool,
    all: IntrusiveList,
    driver: IntrusiveList,
    server: IntrusiveList,
    user: IntrusiveList,
    blocked: IntrusiveList,
    idle: *mut Process,
    running: *mut Process,
}

// SAFETY: the kernel runs on a single hart; there is never concurrent
// access to the scheduler from more than one context at a time.
unsafe impl Sync for Scheduler {}

impl Scheduler {
    pub const fn new() -> Self {
        Scheduler {
            pool: ProcessPool::new(),
            all: IntrusiveList::new(),
            driver: IntrusiveList::new(),
            server: IntrusiveList::new(),
            user: IntrusiveList::new(),
            blocked: IntrusiveList::new(),
            idle: core::ptr::null_mut(),
            running: core::ptr::null_mut(),
        }
    }

    /// Must run once, before any `create`/`next` call: sets up the list
    /// sentinels and loads the idle process.
    pub fn init(&mut self, allocator: &mut PageAllocator, idle_binary: &[u8]) -> Result<(), CreateError> {
        self.all.init();
        self.driver.init();
        self.server.init();
        self.user.init();
        self.blocked.init();

        let idle = self.pool.create_idle(allocator, idle_binary)?;
        unsafe { self.all.push_back(allelem_of(idle)) };
        self.idle = idle;
        self.running = idle;
        Ok(())
    }

    pub fn running(&self) -> *mut Process {
        self.running
    }

    /// Create a process, push it onto `all` and the priority-appropriate
    /// ready queue, and return it. Priority is currently hard-coded to
    /// `user`, matching spec §4.5.
    pub fn create(
        &mut self,
        allocator: &mut PageAllocator,
        name: &str,
        binary: &[u8],
        mappings: &[ExtraMapping],
    ) -> Result<*mut Process, CreateError> {
        let p = self.pool.create(allocator, name, binary, mappings)?;
        unsafe {
            self.all.push_back(allelem_of(p));
            self.user.push_back(elem_of(p));
        }
        Ok(p)
    }

    fn ready_queue_for(&mut self, priority: Priority) -> &mut IntrusiveList {
        match priority {
            Priority::Driver => &mut self.driver,
            Priority::Server => &mut self.server,
            Priority::User => &mut self.user,
        }
    }

    /// Push an already-created process onto a specific priority's ready
    /// queue (used by callers that know a process belongs on `driver` or
    /// `server` rather than the default `user`).
    pub fn enqueue(&mut self, p: *mut Process, priority: Priority) {
        unsafe { (*p).state = ProcessState::Ready };
        let q = self.ready_queue_for(priority);
        unsafe { q.push_back(elem_of(p)) };
    }

    /// The scheduling decision, run once per trap with the process that
    /// was just interrupted. See spec §4.5.
    pub fn next(&mut self, current: *mut Process) -> *mut Process {
        if current != self.idle {
            let state = unsafe { (*current).state };
            match state {
                ProcessState::Running => {
                    return current;
                }
                ProcessState::Ready => unsafe {
                    self.user.push_back(elem_of(current));
                },
                ProcessState::Blocked => unsafe {
                    self.blocked.push_back(elem_of(current));
                },
                ProcessState::Dying => {
                    log::info!("process {} dying, dropped from scheduling", unsafe { (*current).id });
                }
            }
        } else {
            unsafe { (*self.idle).state = ProcessState::Ready };
        }

        let chosen = self.pop_from_priority_queues().unwrap_or(self.idle);
        unsafe { (*chosen).state = ProcessState::Running };
        self.running = chosen;
        chosen
    }

    fn pop_from_priority_queues(&mut self) -> Option<*mut Process> {
        if let Some(elem) = self.driver.pop_front() {
            return Some(crate::list_data!(elem, Process, elem));
        }
        if let Some(elem) = self.server.pop_front() {
            return Some(crate::list_data!(elem, Process, elem));
        }
        if let Some(elem) = self.user.pop_front() {
            return Some(crate::list_data!(elem, Process, elem));
        }
        None
    }

    /// Move a blocked process back onto the user-ready queue. Per spec
    /// §4.5, unblocking transitions the process to `Ready` (not directly
    /// to `Running`): it is merely made eligible, and `next` decides when
    /// it actually runs.
    pub fn unblock(&mut self, p: *mut Process) {
        assert_eq!(unsafe { (*p).state }, ProcessState::Blocked, "unblock of a non-blocked process");
        unsafe { self.blocked.remove(elem_of(p)) };
        unsafe { (*p).state = ProcessState::Ready };
        unsafe { self.user.push_back(elem_of(p)) };
        log::debug!("process {} unblocked", unsafe { (*p).id });
    }

    /// Find a blocked process by id and unblock it. Walks the blocked
    /// list linearly; this kernel has no process table indexed by id.
    pub fn unblock_by_id(&mut self, id: u16) -> bool {
        let mut cursor = self.blocked.first();
        while let Some(elem) = cursor {
            if self.blocked.at_end(elem) {
                break;
            }
            let p = crate::list_data!(elem, Process, elem);
            let next = unsafe { self.blocked.next_of(elem) };
            if unsafe { (*p).id } == id {
                self.unblock(p);
                return true;
            }
            cursor = Some(next);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::vec::Vec;

    /// Build a scheduler with a bare idle process and `n` bare user
    /// processes, bypassing ELF loading entirely (`next`/`unblock` never
    /// look at a process's page table).
    fn harness(n: usize) -> (Scheduler, *mut Process, Vec<*mut Process>) {
        let mut sched = Scheduler::new();
        sched.all.init();
        sched.driver.init();
        sched.server.init();
        sched.user.init();
        sched.blocked.init();

        let idle = sched.pool.take_bare_for_test().unwrap();
        unsafe { sched.all.push_back(allelem_of(idle)) };
        sched.idle = idle;
        sched.running = idle;

        let mut procs = Vec::new();
        for _ in 0..n {
            let p = sched.pool.take_bare_for_test().unwrap();
            unsafe {
                sched.all.push_back(allelem_of(p));
                sched.user.push_back(elem_of(p));
            }
            procs.push(p);
        }
        (sched, idle, procs)
    }

    #[test]
    fn next_round_robins_through_user_queue() {
        let (mut sched, idle, procs) = harness(3);
        let first = sched.next(idle);
        assert_eq!(first, procs[0]);
        assert_eq!(unsafe { (*first).state }, ProcessState::Running);

        // Pretend `first` was preempted while still runnable: it goes to
        // the tail of `user`, and the next process takes over.
        unsafe { (*first).state = ProcessState::Ready };
        let second = sched.next(first);
        assert_eq!(second, procs[1]);

        unsafe { (*second).state = ProcessState::Ready };
        let third = sched.next(second);
        assert_eq!(third, procs[2]);

        // Full circle: `first` is back at the tail, so it is chosen again
        // only after `third` cycles through.
        unsafe { (*third).state = ProcessState::Ready };
        let fourth = sched.next(third);
        assert_eq!(fourth, procs[0]);
    }

    #[test]
    fn idle_runs_when_every_queue_is_empty() {
        let (mut sched, idle, _procs) = harness(0);
        let chosen = sched.next(idle);
        assert_eq!(chosen, idle);
        assert_eq!(unsafe { (*chosen).state }, ProcessState::Running);
    }

    #[test]
    fn blocked_process_is_not_rescheduled_until_unblocked() {
        let (mut sched, idle, procs) = harness(1);
        let p = procs[0];
        let chosen = sched.next(idle);
        assert_eq!(chosen, p);

        unsafe { (*p).state = ProcessState::Blocked };
        let after_block = sched.next(p);
        assert_eq!(after_block, idle);
        assert!(sched.user.empty());

        sched.unblock(p);
        assert_eq!(unsafe { (*p).state }, ProcessState::Ready);
        let rescheduled = sched.next(idle);
        assert_eq!(rescheduled, p);
    }

    #[test]
    fn unblock_by_id_finds_the_right_process() {
        let (mut sched, _idle, procs) = harness(2);
        for p in &procs {
            unsafe { sched.user.remove(elem_of(*p)) };
            unsafe { (**p).state = ProcessState::Blocked };
            unsafe { sched.blocked.push_back(elem_of(*p)) };
        }
        let target_id = unsafe { (*procs[1]).id };
        assert!(sched.unblock_by_id(target_id));
        assert_eq!(unsafe { (*procs[1]).state }, ProcessState::Ready);
        assert_eq!(unsafe { (*procs[0]).state }, ProcessState::Blocked);
    }

    #[test]
    fn driver_queue_preempts_user_queue() {
        let (mut sched, idle, procs) = harness(1);
        let driver_proc = sched.pool.take_bare_for_test().unwrap();
        unsafe { sched.all.push_back(allelem_of(driver_proc)) };
        sched.enqueue(driver_proc, Priority::Driver);

        let chosen = sched.next(idle);
        assert_eq!(chosen, driver_proc);
        let _ = procs;
    }
}
