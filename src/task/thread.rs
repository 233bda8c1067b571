//! Thread table entry and id allocation.
//!
//! Grounded on the teacher's `task/thread.rs` id-allocation idiom, reduced
//! from its full {Running,Ready,Blocked,Terminated}/{Kernel,User}-privilege
//! `CpuContext` down to the spec's {Unused,Ready,Running,Blocked,Dead}
//! lifecycle and callee-saved-only context — there is no user privilege
//! level in this core.

use core::sync::atomic::{AtomicU64, Ordering};

use super::context::CpuContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub enum ThreadState {
    Unused,
    Ready,
    Running,
    Blocked,
    Dead,
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

pub fn allocate_thread_id() -> u64 {
    NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed)
}

pub struct Thread {
    pub id: u64,
    pub name: &'static str,
    pub priority: u8,
    pub state: ThreadState,
    pub ctx: CpuContext,
    pub kstack_base: u64,
    pub kstack_size: usize,
    /// Staged for the trampoline's first run; read once off `current` and
    /// never touched again afterward.
    pub entry: Option<fn(usize)>,
    pub arg: usize,
}

impl Thread {
    pub const fn unused() -> Self {
        Thread {
            id: 0,
            name: "",
            priority: 0,
            state: ThreadState::Unused,
            ctx: CpuContext {
                r15: 0,
                r14: 0,
                r13: 0,
                r12: 0,
                rbx: 0,
                rbp: 0,
                rsp: 0,
            },
            kstack_base: 0,
            kstack_size: 0,
            entry: None,
            arg: 0,
        }
    }
}
