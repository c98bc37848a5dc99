//! # Thread-Level API
//!
//! The kernel instance of a running system and the calls tasks and
//! interrupt handlers make against it. Only built for the target.
//!
//! Every call enters the global critical section, borrows the kernel,
//! applies one [`Kernel`] operation and, when that operation left a
//! context switch pending, raises PendSV on the way out. A blocking call
//! that suspended the caller returns into the PendSV switch; when the task
//! runs again it collects the outcome of its wait.
//!
//! ```text
//!   task ──► os::sem_take ──► with(Kernel::sem_take) ── Wait::Blocked
//!                                   │
//!                                   └─► PendSV ──► other tasks run …
//!   task ◄── pend_outcome ◄── resumed by release, timeout or resume
//! ```
//!
//! Calls are not reentrant: a timer callback or actor handler that is
//! handed `&mut Kernel` must use it directly instead of calling back in
//! here. Timeouts are in milliseconds.

use core::cell::RefCell;
use core::ptr::addr_of_mut;
use core::sync::atomic::{AtomicBool, Ordering};

use critical_section::Mutex;

use crate::arch::cortex_m4;
use crate::config::WAIT_FOREVER;
use crate::error::Result;
use crate::event::Event;
use crate::kernel::{ms_to_ticks, Kernel, SystemTasks, Wait};
use crate::mutex::MutexId;
use crate::object::{Attribute, ObjectId};
use crate::sem::SemId;
use crate::sync::{self, Critical};
use crate::task::{TaskConfig, TaskEntry, TaskId};
use crate::wait::WaitOrder;

static KERNEL: Mutex<RefCell<Kernel>> = Mutex::new(RefCell::new(Kernel::new()));

static INITIALIZED: AtomicBool = AtomicBool::new(false);

static mut IDLE_STACK: [u32; 128] = [0; 128];
static mut TIMER_STACK: [u32; 256] = [0; 256];

/// Run `f` against the kernel with interrupts masked, then request a
/// context switch if `f` made one necessary.
pub fn with<R>(f: impl FnOnce(&mut Kernel) -> R) -> R {
    let (result, switch) = {
        let guard = Critical::enter();
        let mut kernel = KERNEL.borrow_ref_mut(guard.token());
        let result = f(&mut kernel);
        (result, kernel.switch_pending())
    };
    if switch {
        cortex_m4::trigger_pendsv();
    }
    result
}

/// Outcome of the running task's last wait, read once it runs again.
fn resumed() -> Result<()> {
    with(|k| {
        let cur = k.running();
        k.pend_outcome(cur)
    })
}

fn block_on<T>(f: impl FnOnce(&mut Kernel) -> Result<Wait<T>>) -> Result<Option<T>> {
    match with(f)? {
        Wait::Ready(value) => Ok(Some(value)),
        Wait::Blocked => resumed().map(|()| None),
    }
}

/// Ticks left of a `timeout` that started at `start`.
fn remaining(timeout: u32, start: u32) -> u32 {
    if timeout == WAIT_FOREVER {
        return WAIT_FOREVER;
    }
    timeout.saturating_sub(now().wrapping_sub(start))
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

extern "C" fn idle_entry(_: usize) -> ! {
    loop {
        let reaped = with(Kernel::idle_cleanup);
        if reaped == 0 {
            cortex_m::asm::wfi();
        }
    }
}

extern "C" fn timer_entry(_: usize) -> ! {
    loop {
        with(Kernel::timer_task_step);
    }
}

/// Register the idle and timer service tasks. Call once, before any
/// other task is registered.
pub fn init() -> Result<()> {
    crate::kernel_assert!(
        !INITIALIZED.swap(true, Ordering::AcqRel),
        "kernel initialized twice"
    );
    // SAFETY: guarded by INITIALIZED, so these are the only references to
    // the service stacks and they are handed over to the kernel for good.
    let (idle_stack, timer_stack) = unsafe {
        (
            &mut *addr_of_mut!(IDLE_STACK),
            &mut *addr_of_mut!(TIMER_STACK),
        )
    };
    with(|k| {
        k.init(SystemTasks {
            idle_entry,
            idle_stack,
            timer_entry,
            timer_stack,
        })
    })
}

pub fn register_task(config: TaskConfig, entry: TaskEntry, stack: &'static mut [u32]) -> Result<TaskId> {
    with(|k| k.register_task(config, entry, stack))
}

/// Start the tick and switch to the most important task.
pub fn start(mut core: cortex_m::Peripherals) -> ! {
    cortex_m::interrupt::disable();
    cortex_m4::set_interrupt_priorities(&mut core.SCB);
    let first = with(Kernel::start);
    crate::kernel_assert!(first.is_some(), "no task to start");
    cortex_m4::configure_systick(&mut core.SYST);
    // SAFETY: called once from main, interrupts masked, kernel started.
    unsafe { cortex_m4::start_first_task() }
}

// ---------------------------------------------------------------------------
// Port hooks
// ---------------------------------------------------------------------------

/// SysTick body.
pub fn tick_isr() {
    with(|k| {
        k.tick();
    });
}

/// Called by PendSV with the outgoing task's stack pointer.
#[no_mangle]
pub extern "C" fn tickos_switch_context(psp: *mut u32) -> *mut u32 {
    sync::critical_section(|cs| KERNEL.borrow_ref_mut(cs).switch_context(psp))
}

// ---------------------------------------------------------------------------
// Tasks and time
// ---------------------------------------------------------------------------

pub fn now() -> u32 {
    with(|k| k.now())
}

pub fn get_time_ms() -> u32 {
    with(|k| k.get_time_ms())
}

pub fn current_task() -> Option<TaskId> {
    with(|k| k.current_task())
}

pub fn task_by_name(name: &str) -> Option<TaskId> {
    with(|k| k.task_by_name(name))
}

pub fn yield_now() {
    with(|k| {
        k.yield_now();
    });
}

pub fn delay_ms(ms: u32) {
    with(|k| k.delay_ms(ms));
}

pub fn suspend(task: TaskId) -> Result<()> {
    with(|k| k.suspend(task))
}

pub fn resume(task: TaskId) -> Result<()> {
    with(|k| k.resume(task))
}

pub fn set_priority(task: TaskId, priority: u8) {
    with(|k| k.set_priority(task, priority));
}

pub fn enter_critical() {
    with(Kernel::enter_critical);
}

pub fn exit_critical() {
    with(|k| {
        k.exit_critical();
    });
}

/// End the running task. Also the landing point of a task body that
/// returns.
pub fn exit() -> ! {
    with(Kernel::exit);
    loop {
        cortex_m::asm::wfi();
    }
}

// ---------------------------------------------------------------------------
// Semaphores and mutexes
// ---------------------------------------------------------------------------

pub fn sem_create(value: u16, order: WaitOrder) -> Result<SemId> {
    with(|k| k.sem_create(value, order))
}

pub fn sem_take(sem: SemId, timeout_ms: u32) -> Result<()> {
    block_on(|k| k.sem_take(sem, ms_to_ticks(timeout_ms))).map(|_| ())
}

pub fn sem_release(sem: SemId) -> Result<()> {
    with(|k| k.sem_release(sem))
}

pub fn mutex_create() -> Result<MutexId> {
    with(|k| k.mutex_create())
}

pub fn mutex_take(mutex: MutexId, timeout_ms: u32) -> Result<()> {
    block_on(|k| k.mutex_take(mutex, ms_to_ticks(timeout_ms))).map(|_| ())
}

pub fn mutex_release(mutex: MutexId) -> Result<()> {
    with(|k| k.mutex_release(mutex))
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

pub fn send(target: &str, topic: &str) -> Result<()> {
    with(|k| k.send_to(target, topic))
}

pub fn publish(topic: &str) -> Result<()> {
    with(|k| k.publish(topic))
}

pub fn send_delay(target: TaskId, topic: &str, ms: u32) -> Result<ObjectId> {
    with(|k| k.send_delay(target, topic, ms))
}

pub fn send_period(target: TaskId, topic: &str, ms: u32) -> Result<ObjectId> {
    with(|k| k.send_period(target, topic, ms))
}

pub fn publish_delay(topic: &str, ms: u32) -> Result<ObjectId> {
    with(|k| k.publish_delay(topic, ms))
}

pub fn publish_period(topic: &str, ms: u32) -> Result<ObjectId> {
    with(|k| k.publish_period(topic, ms))
}

pub fn sub(topic: &str) -> Result<()> {
    with(|k| k.sub(topic))
}

pub fn unsub(topic: &str) -> Result<()> {
    with(|k| k.unsub(topic))
}

/// Wait for any event addressed to the running task.
pub fn wait_event(timeout_ms: u32) -> Result<Event> {
    let timeout = ms_to_ticks(timeout_ms);
    let start = now();
    loop {
        let ticks = remaining(timeout, start);
        match block_on(|k| k.wait_event(ticks))? {
            Some(event) => return Ok(event),
            // woken with a unit; the record is picked up on the next pass
            None => continue,
        }
    }
}

/// Wait for one topic; other events stay queued.
pub fn wait_specific_event(topic: &str, timeout_ms: u32) -> Result<Event> {
    let timeout = ms_to_ticks(timeout_ms);
    let start = now();
    loop {
        let ticks = remaining(timeout, start);
        let outcome = block_on(|k| k.wait_specific_event(topic, ticks));
        match outcome {
            Ok(Some(event)) => return Ok(event),
            Ok(None) => continue,
            Err(e) => {
                with(|k| {
                    let cur = k.running();
                    k.clear_specific_wait(cur);
                });
                return Err(e);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

pub fn db_register(key: &str, size: usize, attr: Attribute) -> Result<ObjectId> {
    with(|k| k.db_register(key, size, attr))
}

pub fn db_block_write(key: &str, data: &[u8]) -> Result<()> {
    with(|k| k.db_block_write(key, data))
}

pub fn db_block_read(key: &str, buf: &mut [u8]) -> Result<()> {
    with(|k| k.db_block_read(key, buf))
}

pub fn db_stream_write(key: &str, data: &[u8]) -> Result<()> {
    with(|k| k.db_stream_write(key, data))
}

pub fn db_stream_read(key: &str, buf: &mut [u8]) -> Result<usize> {
    with(|k| k.db_stream_read(key, buf))
}
