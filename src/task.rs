//! # Task Control Block
//!
//! Defines the task model for tickos. Tasks are registered statically with
//! a caller-owned stack, a priority (0 = most important) and a time slice.
//! Each task owns two kernel objects created at registration: a one-shot
//! timer used for every timed suspension, and a counting semaphore used as
//! its event-wait primitive.

use crate::config::DEFAULT_TIME_SLICE;
use crate::object::ObjectId;
use crate::sem::SemId;
use crate::timer::TimerId;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Index of a task in the kernel's task table. Also its bit in event owner
/// bitmaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub(crate) u8);

impl TaskId {
    #[inline]
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Task entry point. Receives the parameter given at registration; in
/// tickos tasks never return, they leave through `exit`.
pub type TaskEntry = extern "C" fn(usize) -> !;

// ---------------------------------------------------------------------------
// Task state machine
// ---------------------------------------------------------------------------

/// Execution state of a task.
///
/// ```text
///            register()          schedule()
///   ┌──────┐ ────────► ┌───────┐ ─────────► ┌─────────┐
///   │ Init │           │ Ready │            │ Running │
///   └──────┘           └───────┘ ◄───────── └─────────┘
///                          ▲      preempt /      │   │
///                          │      yield          │   │ exit()
///                resume()  │                     │   ▼
///                  / wake  │    take / wait /    │ ┌────────┐
///                     ┌───────────┐  delay       │ │ Closed │
///                     │ Suspended │ ◄────────────┘ └────────┘
///                     └───────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Registered but not yet started.
    Init,
    /// Runnable and linked into its ready list.
    Ready,
    /// Currently executing. The running task is not in a ready list.
    Running,
    /// Blocked on an object, delayed, or explicitly suspended.
    Suspended,
    /// Exited; waiting for the idle loop to reap it.
    Closed,
}

/// What a suspended task is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendOn {
    Nothing,
    Semaphore(SemId),
    Mutex(crate::mutex::MutexId),
    Delay,
    Suspend,
}

/// Outcome of the most recent suspension, read back by the task after it
/// resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendStatus {
    Ok,
    Pending,
    Timeout,
    Detached,
    Interrupted,
}

// ---------------------------------------------------------------------------
// Task configuration (immutable after registration)
// ---------------------------------------------------------------------------

/// Static configuration for a task, set at registration.
#[derive(Debug, Clone, Copy)]
pub struct TaskConfig {
    /// Unique name; also the task's key in the object table.
    pub name: &'static str,

    /// Priority, 0 = most important, `PRIORITY_COUNT - 1` is reserved for
    /// idle.
    pub priority: u8,

    /// Round-robin time slice in ticks. If 0, uses `DEFAULT_TIME_SLICE`.
    pub time_slice: u32,

    /// Opaque parameter handed to the entry function.
    pub param: usize,
}

impl TaskConfig {
    /// Returns the effective time slice, falling back to the system default.
    #[inline]
    pub const fn effective_time_slice(&self) -> u32 {
        if self.time_slice > 0 {
            self.time_slice
        } else {
            DEFAULT_TIME_SLICE
        }
    }
}

// ---------------------------------------------------------------------------
// Intrusive links
// ---------------------------------------------------------------------------

/// Doubly linked list node embedded in a TCB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Link {
    pub prev: Option<TaskId>,
    pub next: Option<TaskId>,
}

impl Link {
    pub const DETACHED: Link = Link {
        prev: None,
        next: None,
    };
}

// ---------------------------------------------------------------------------
// Task Control Block
// ---------------------------------------------------------------------------

/// Task Control Block: everything the kernel knows about one task.
///
/// The stack is owned by the caller and outlives the task; the TCB only
/// records its bounds and the saved stack pointer.
pub struct TaskControlBlock {
    /// Index in the task table.
    pub id: TaskId,

    /// Whether this slot holds a registered task.
    pub active: bool,

    pub name: &'static str,

    pub state: TaskState,

    /// Scheduled priority. Differs from `base_priority` while boosted by
    /// priority inheritance.
    pub priority: u8,

    /// Priority assigned at registration or by `set_priority`.
    pub base_priority: u8,

    /// Time slice reload value.
    pub init_tick: u32,

    /// Ticks left in the current slice.
    pub remaining_tick: u32,

    /// Set when the slice ran out; the next `schedule` rotates the task to
    /// the back of its ready list.
    pub yield_pending: bool,

    /// Ready-list membership.
    pub ready_link: Link,

    /// Wait-list membership while blocked on a semaphore or mutex.
    pub pend_link: Link,

    pub pend_on: PendOn,
    pub pend_status: PendStatus,

    /// One-shot timer armed for timed suspensions.
    pub timer: Option<TimerId>,

    /// Private counting semaphore posted on every event addressed to this
    /// task.
    pub event_sem: Option<SemId>,

    /// While set, sends to this task are dropped and publishes skip it.
    pub event_recv_disable: bool,

    /// Topic the task is blocked on in a specific wait, if any.
    pub wait_specific: Option<ObjectId>,

    /// The task's entry in the object table.
    pub object: Option<ObjectId>,

    pub entry: Option<TaskEntry>,
    pub param: usize,

    /// Lowest address of the caller-owned stack.
    pub stack_base: *mut u32,

    /// Stack length in words.
    pub stack_len: usize,

    /// Saved process stack pointer. Updated on every context switch.
    pub stack_pointer: *mut u32,
}

// Safety: the raw pointers refer to the task's caller-owned stack, which
// outlives the task. TCBs are only touched inside critical sections.
unsafe impl Send for TaskControlBlock {}
unsafe impl Sync for TaskControlBlock {}

impl TaskControlBlock {
    /// An unallocated TCB. Used to initialize the static table.
    pub const EMPTY: TaskControlBlock = TaskControlBlock {
        id: TaskId(0),
        active: false,
        name: "",
        state: TaskState::Init,
        priority: 0,
        base_priority: 0,
        init_tick: 0,
        remaining_tick: 0,
        yield_pending: false,
        ready_link: Link::DETACHED,
        pend_link: Link::DETACHED,
        pend_on: PendOn::Nothing,
        pend_status: PendStatus::Ok,
        timer: None,
        event_sem: None,
        event_recv_disable: false,
        wait_specific: None,
        object: None,
        entry: None,
        param: 0,
        stack_base: core::ptr::null_mut(),
        stack_len: 0,
        stack_pointer: core::ptr::null_mut(),
    };

    /// Initialize a TCB for a new task. The task starts in `Init`; the
    /// kernel makes it ready once its kernel objects exist.
    pub fn init(&mut self, id: TaskId, config: &TaskConfig) {
        *self = Self::EMPTY;
        self.id = id;
        self.active = true;
        self.name = config.name;
        self.priority = config.priority;
        self.base_priority = config.priority;
        self.init_tick = config.effective_time_slice();
        self.remaining_tick = self.init_tick;
        self.param = config.param;
    }

    /// Consume one tick of the time slice. Returns `true` when the slice
    /// ran out, in which case it is reloaded and the task marked
    /// yield-pending.
    pub fn consume_tick(&mut self) -> bool {
        self.remaining_tick = self.remaining_tick.saturating_sub(1);
        if self.remaining_tick == 0 {
            self.remaining_tick = self.init_tick;
            self.yield_pending = true;
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn is_runnable(&self) -> bool {
        self.active && matches!(self.state, TaskState::Ready | TaskState::Running)
    }

    /// Whether the task is blocked and still waiting for a wake-up.
    #[inline]
    pub fn is_pending(&self) -> bool {
        self.state == TaskState::Suspended && self.pend_status == PendStatus::Pending
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
