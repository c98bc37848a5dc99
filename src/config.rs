//! # tickos Configuration
//!
//! Compile-time constants governing the kernel. All capacities are fixed at
//! compile time; the kernel never allocates from a global heap.

/// Maximum number of tasks, including the idle and timer tasks.
/// Bounded by the width of the event owner bitmap (one bit per task).
pub const MAX_TASKS: usize = 32;

/// Number of distinct priority levels. Priority 0 is the most important.
/// Bounded by the width of the ready bitmap.
pub const PRIORITY_COUNT: usize = 32;

/// Priority of the idle task. Always the least important level.
pub const IDLE_PRIORITY: u8 = (PRIORITY_COUNT - 1) as u8;

/// Priority of the soft-timer service task.
pub const TIMER_TASK_PRIORITY: u8 = 1;

/// Tick interrupt frequency in Hz.
pub const TICK_HZ: u32 = 1000;

/// Time slice in ticks used when a task registers with a slice of zero.
pub const DEFAULT_TIME_SLICE: u32 = 10;

/// System clock frequency in Hz (default for STM32F4 at 16 MHz HSI).
pub const SYSTEM_CLOCK_HZ: u32 = 16_000_000;

/// Number of slots in the object table. Must be prime so that the hash
/// spreads evenly.
pub const OBJECT_TABLE_SIZE: usize = 67;

/// Maximum number of slots probed around the home slot before the table is
/// considered exhausted for a key.
pub const OBJECT_TABLE_PROBE: usize = 16;

/// Maximum length of an object key in bytes.
pub const KEY_LEN: usize = 32;

/// Size of the database heap arena in bytes.
pub const HEAP_SIZE: usize = 4096;

/// Capacity of the event-data record pool.
pub const EVENT_RECORD_POOL: usize = 64;

/// Capacity of the timer pool. Every task owns one timer.
pub const MAX_TIMERS: usize = MAX_TASKS + 32;

/// Capacity of the semaphore pool. Every task owns one event semaphore.
pub const MAX_SEMAPHORES: usize = MAX_TASKS + 16;

/// Capacity of the mutex pool.
pub const MAX_MUTEXES: usize = 16;

/// Number of levels in the timer skip list.
pub const TIMER_SKIP_LIST_LEVEL: usize = 3;

/// Promotion mask of the timer skip list. A new timer climbs one level for
/// every group of zero bits under this mask in the insertion counter.
pub const TIMER_SKIP_LIST_MASK: u32 = 0x3;

/// Depth of the pending soft-timer queue.
pub const SOFT_TIMER_QUEUE: usize = 16;

/// Largest value a semaphore count may reach.
pub const SEM_VALUE_MAX: u16 = u16::MAX;

/// Largest recursive hold count of a mutex.
pub const MUTEX_HOLD_MAX: u8 = u8::MAX;

/// Deepest state nesting a state machine may use.
pub const HSM_MAX_DEPTH: usize = 8;

/// Timeout value meaning "block until the resource becomes available".
pub const WAIT_FOREVER: u32 = u32::MAX;
