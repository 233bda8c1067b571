//! Fixed-slot cooperative round-robin scheduler.
//!
//! Grounded on the general shape of the teacher's `task/scheduler.rs`
//! (a thread table plus a current-thread cursor) and `task/kthread.rs`'s
//! trampoline-calls-entry-then-exits idiom, both reduced drastically: no
//! `Arc<Mutex<Thread>>`/`VecDeque`/waiters/process coupling, just a fixed
//! `[Thread; MAX_THREADS]` array scanned round-robin. Single-CPU,
//! non-preemptive: the only suspension point is `yield_now`.

use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

use super::context::{perform_context_switch, CpuContext};
use super::thread::{allocate_thread_id, Thread, ThreadState};

pub const MAX_THREADS: usize = 16;
const DEFAULT_STACK_PAGES: usize = 4;
const STACK_SIZE: usize = DEFAULT_STACK_PAGES * 4096;

struct SchedulerState {
    threads: [Thread; MAX_THREADS],
    current: usize,
}

static SCHEDULER: Mutex<Option<SchedulerState>> = Mutex::new(None);
static RESCHEDULE_REQUESTED: AtomicBool = AtomicBool::new(false);

pub fn set_reschedule_requested() {
    RESCHEDULE_REQUESTED.store(true, Ordering::Relaxed);
}

fn take_reschedule_requested() -> bool {
    RESCHEDULE_REQUESTED.swap(false, Ordering::Relaxed)
}

/// Adopts the currently executing stack as thread 0 ("bootstrap"), Running.
pub fn init() {
    const UNUSED: Thread = Thread::unused();
    let mut threads = [UNUSED; MAX_THREADS];
    threads[0] = Thread {
        id: allocate_thread_id(),
        name: "bootstrap",
        priority: 0,
        state: ThreadState::Running,
        ctx: CpuContext::default(),
        kstack_base: 0,
        kstack_size: 0,
        entry: None,
        arg: 0,
    };

    *SCHEDULER.lock() = Some(SchedulerState { threads, current: 0 });
    log::info!(target: "sched", "scheduler initialized, bootstrap thread running");
}

/// Entry point every newly created thread's context switches into on its
/// first run. Reads its own slot off `current` (set by `yield_now` before
/// the switch), invokes the staged entry function, marks itself Dead on
/// return, and yields forever after.
extern "C" fn trampoline() -> ! {
    let (entry, arg) = {
        let guard = SCHEDULER.lock();
        let state = guard.as_ref().expect("scheduler not initialized");
        let slot = &state.threads[state.current];
        (slot.entry.expect("trampoline entered with no entry staged"), slot.arg)
    };

    entry(arg);

    {
        let mut guard = SCHEDULER.lock();
        let state = guard.as_mut().expect("scheduler not initialized");
        let cur = state.current;
        state.threads[cur].state = ThreadState::Dead;
    }

    crate::hlt_loop();
}

/// Allocates a slot, prepares a kernel stack, and marks it Ready. The stack
/// is drawn from the heap and owned by the thread for its lifetime; it is
/// never freed since this core has no thread-join/reap path.
pub fn create(name: &'static str, entry: fn(usize), arg: usize, priority: u8) -> Option<u64> {
    let mut guard = SCHEDULER.lock();
    let state = guard.as_mut().expect("scheduler not initialized");

    let slot = (0..MAX_THREADS).find(|&i| {
        matches!(state.threads[i].state, ThreadState::Unused | ThreadState::Dead)
    })?;

    let stack = crate::memory::heap::kmalloc(STACK_SIZE);
    if stack.is_null() {
        return None;
    }
    let stack_top = ((stack as u64) + STACK_SIZE as u64) & !0xF;

    let id = allocate_thread_id();
    state.threads[slot] = Thread {
        id,
        name,
        priority,
        state: ThreadState::Ready,
        ctx: CpuContext::bootstrap(stack_top, trampoline as u64),
        kstack_base: stack as u64,
        kstack_size: STACK_SIZE,
        entry: Some(entry),
        arg,
    };

    Some(id)
}

/// The sole suspension point. Picks the next Ready slot round-robin from
/// `current + 1`, falling back to `current` if none found. A timer tick that
/// landed between steps cannot cause a second switch: the flag is cleared
/// exactly once per call, with interrupts disabled throughout the decision.
/// Pure round-robin slot selection: the first Ready slot starting at
/// `current + 1` and wrapping, or `current` itself if none is Ready.
/// Factored out of `yield_now` so it can be exercised without the global
/// scheduler, real stacks, or a context switch.
fn pick_next(states: &[ThreadState; MAX_THREADS], current: usize) -> usize {
    for offset in 1..=MAX_THREADS {
        let candidate = (current + offset) % MAX_THREADS;
        if matches!(states[candidate], ThreadState::Ready) {
            return candidate;
        }
    }
    current
}

pub fn yield_now() {
    x86_64::instructions::interrupts::disable();

    let (old_ctx_ptr, new_ctx_ptr, should_switch) = {
        let mut guard = SCHEDULER.lock();
        let state = guard.as_mut().expect("scheduler not initialized");
        let current = state.current;

        let states: [ThreadState; MAX_THREADS] =
            core::array::from_fn(|i| state.threads[i].state);
        let next = pick_next(&states, current);

        let reschedule = take_reschedule_requested();
        if !reschedule && next == current {
            (core::ptr::null_mut(), core::ptr::null(), false)
        } else {
            if matches!(state.threads[current].state, ThreadState::Running) {
                state.threads[current].state = ThreadState::Ready;
            }
            state.threads[next].state = ThreadState::Running;
            state.current = next;

            let old_ptr = &mut state.threads[current].ctx as *mut CpuContext;
            let new_ptr = &state.threads[next].ctx as *const CpuContext;
            (old_ptr, new_ptr, true)
        }
    };

    if should_switch {
        unsafe { perform_context_switch(old_ctx_ptr, new_ctx_ptr) };
    }

    x86_64::instructions::interrupts::enable();
}

pub fn current_thread_id() -> u64 {
    let guard = SCHEDULER.lock();
    let state = guard.as_ref().expect("scheduler not initialized");
    state.threads[state.current].id
}

pub fn is_dead(id: u64) -> bool {
    let guard = SCHEDULER.lock();
    let state = guard.as_ref().expect("scheduler not initialized");
    state
        .threads
        .iter()
        .find(|t| t.id == id)
        .map(|t| matches!(t.state, ThreadState::Dead))
        .unwrap_or(true)
}

#[cfg(test)]
mod scheduler_tests {
    use super::*;

    fn all_unused() -> [ThreadState; MAX_THREADS] {
        [ThreadState::Unused; MAX_THREADS]
    }

    #[test_case]
    fn picks_next_ready_slot_round_robin() {
        let mut states = all_unused();
        states[3] = ThreadState::Ready;
        states[7] = ThreadState::Ready;

        assert_eq!(pick_next(&states, 0), 3);
        assert_eq!(pick_next(&states, 3), 7);
        assert_eq!(pick_next(&states, 7), 3);
    }

    #[test_case]
    fn falls_back_to_current_when_nothing_else_ready() {
        let mut states = all_unused();
        states[5] = ThreadState::Running;
        assert_eq!(pick_next(&states, 5), 5);
    }

    #[test_case]
    fn wraps_past_the_end_of_the_table() {
        let mut states = all_unused();
        states[1] = ThreadState::Ready;
        assert_eq!(pick_next(&states, MAX_THREADS - 1), 1);
    }

    #[test_case]
    fn dead_and_blocked_slots_are_skipped() {
        let mut states = all_unused();
        states[1] = ThreadState::Dead;
        states[2] = ThreadState::Blocked;
        states[3] = ThreadState::Ready;
        assert_eq!(pick_next(&states, 0), 3);
    }
}
