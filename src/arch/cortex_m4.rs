//! # Cortex-M4F Port Layer
//!
//! Context switching via PendSV, the SysTick time base and the initial
//! task frame for the ARM Cortex-M4F (Thumb-2, single-precision FPU).
//!
//! ## Context Switch Mechanism
//!
//! Tasks run in Thread mode on the process stack (PSP); the kernel and all
//! interrupt handlers use the main stack (MSP). On exception entry the
//! hardware stacks R0–R3, R12, LR, PC and xPSR (plus S0–S15 and FPSCR when
//! the task has touched the FPU). PendSV saves the rest:
//!
//! ```text
//!   high ┌──────────────┐
//!        │ xPSR         │  hardware frame
//!        │ PC  LR  R12  │
//!        │ R3 … R0      │
//!        ├──────────────┤
//!        │ S31 … S16    │  only when EXC_RETURN bit 4 is clear
//!        ├──────────────┤
//!        │ EXC_RETURN   │  software frame
//!        │ R11 … R4     │
//!   low  └──────────────┘ ◄── saved PSP
//! ```
//!
//! The outgoing PSP goes to [`Kernel::switch_context`](crate::kernel::Kernel::switch_context)
//! through the `tickos_switch_context` hook, which returns the PSP of the
//! task to resume.
//!
//! ## Interrupt Priorities
//!
//! SysTick and PendSV both sit at the lowest priority, so a context switch
//! never preempts an application interrupt handler.

use cortex_m::peripheral::scb::SystemHandler;
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::{SCB, SYST};

use crate::config::{SYSTEM_CLOCK_HZ, TICK_HZ};
use crate::task::TaskEntry;

/// Words written by [`init_stack`]: software frame plus hardware frame.
const INITIAL_FRAME_WORDS: usize = 17;

/// Thread mode, PSP, no FPU frame.
const EXC_RETURN_THREAD_PSP: u32 = 0xFFFF_FFFD;

/// Thumb state bit.
const INITIAL_XPSR: u32 = 0x0100_0000;

// ---------------------------------------------------------------------------
// SysTick configuration
// ---------------------------------------------------------------------------

/// Program SysTick to interrupt at `TICK_HZ` from the core clock.
pub fn configure_systick(syst: &mut SYST) {
    let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

/// SysTick exception handler: one kernel tick.
#[no_mangle]
pub extern "C" fn SysTick() {
    crate::os::tick_isr();
}

// ---------------------------------------------------------------------------
// PendSV
// ---------------------------------------------------------------------------

/// Request a context switch. PendSV runs once no other handler is active.
#[inline]
pub fn trigger_pendsv() {
    SCB::set_pendsv();
}

/// Drop SysTick and PendSV to the lowest priority.
pub fn set_interrupt_priorities(scb: &mut SCB) {
    // SAFETY: runs before the scheduler starts; no priority-based critical
    // sections are in use yet.
    unsafe {
        scb.set_priority(SystemHandler::PendSV, 0xFF);
        scb.set_priority(SystemHandler::SysTick, 0xFF);
    }
}

core::arch::global_asm!(
    ".section .text.PendSV,\"ax\",%progbits",
    ".global PendSV",
    ".type PendSV,%function",
    ".thumb_func",
    "PendSV:",
    "    mrs r0, psp",
    "    tst lr, #0x10",
    "    it eq",
    "    vstmdbeq r0!, {{s16-s31}}",
    "    stmdb r0!, {{r4-r11, lr}}",
    "    bl tickos_switch_context",
    "    ldmia r0!, {{r4-r11, lr}}",
    "    tst lr, #0x10",
    "    it eq",
    "    vldmiaeq r0!, {{s16-s31}}",
    "    msr psp, r0",
    "    isb",
    "    bx lr",
    ".size PendSV, . - PendSV",
);

// ---------------------------------------------------------------------------
// Task stacks
// ---------------------------------------------------------------------------

/// Task body returned. Entry points never return, but a stray `bx lr`
/// lands here and ends the task cleanly.
extern "C" fn task_return() -> ! {
    crate::os::exit()
}

/// Lay out the frame PendSV expects to restore the first time the task
/// runs, and return the initial stack pointer.
///
/// R0 carries `param` into `entry`. The frame top is aligned down to 8
/// bytes as the AAPCS requires.
pub fn init_stack(stack: &mut [u32], entry: TaskEntry, param: usize) -> *mut u32 {
    let base = stack.as_ptr() as usize;
    let top = (base + stack.len() * 4) & !7;
    let top_index = (top - base) / 4;
    crate::kernel_assert!(top_index >= INITIAL_FRAME_WORDS, "task stack too small");

    let frame = &mut stack[top_index - INITIAL_FRAME_WORDS..top_index];
    frame.fill(0);
    frame[8] = EXC_RETURN_THREAD_PSP;
    frame[9] = param as u32;
    frame[14] = task_return as usize as u32;
    frame[15] = entry as usize as u32 & !1;
    frame[16] = INITIAL_XPSR;
    frame.as_mut_ptr()
}

/// Hand the CPU to the first task. PendSV saves a throwaway context into a
/// scratch frame, then restores the task the kernel selected.
///
/// # Safety
/// Call once, from Thread mode on the main stack, with the kernel started
/// and interrupts masked.
pub unsafe fn start_first_task() -> ! {
    // software frame plus a possible FPU block
    static mut SCRATCH: [u32; 32] = [0; 32];

    let top = core::ptr::addr_of_mut!(SCRATCH).cast::<u32>().add(32);
    cortex_m::register::psp::write(top as u32);
    trigger_pendsv();
    cortex_m::interrupt::enable();
    loop {
        cortex_m::asm::wfi();
    }
}
