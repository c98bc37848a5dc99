//! # tickos
//!
//! An event-driven real-time kernel for single-core ARM Cortex-M
//! microcontrollers.
//!
//! ## Overview
//!
//! tickos pairs a classic fixed-priority preemptive scheduler with a named
//! event layer. Tasks find each other by name through one global object
//! table, talk by sending and publishing topics, and may run as actors:
//! a flat reactor or a hierarchical state machine fed by the task's event
//! queue.
//!
//! - **Scheduling**: 32 priorities, O(1) selection through a ready bitmap,
//!   round-robin time slices within a priority.
//! - **Timers**: a skip list ordered by absolute deadline, wraparound
//!   safe; hard timers fire in the tick interrupt, soft timers in a
//!   service task.
//! - **Synchronization**: counting semaphores (FIFO or priority ordered)
//!   and recursive mutexes with priority inheritance.
//! - **Events**: send, publish, subscribe, delayed and periodic delivery,
//!   and a small database of value slots and byte streams.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    Application Tasks                   │
//! ├────────────────────────────────────────────────────────┤
//! │        Actors (actor.rs · hsm.rs)  ·  os.rs (target)    │
//! ├──────────────┬──────────────┬──────────────────────────┤
//! │  Events      │  Database    │  Object table            │
//! │  event.rs    │  db.rs       │  object.rs               │
//! ├──────────────┴──────┬───────┴──────────────────────────┤
//! │  Semaphore · Mutex  │  Timers (timer.rs)               │
//! │  sem.rs · mutex.rs  │                                  │
//! ├─────────────────────┴──────────────────────────────────┤
//! │  Kernel state (kernel.rs) · Scheduler (scheduler.rs)    │
//! │  Task model (task.rs) · wait lists (wait.rs)           │
//! ├────────────────────────────────────────────────────────┤
//! │  bitmap.rs · slab.rs · heap.rs · sync.rs · error.rs    │
//! ├────────────────────────────────────────────────────────┤
//! │            Arch Port (arch/cortex_m4.rs)               │
//! │    PendSV · SysTick · Context Switch · Stack Init      │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Memory Model
//!
//! - **No allocator**: every pool is a fixed-capacity array sized in
//!   `config.rs`.
//! - **Handles, not pointers**: timers, semaphores, mutexes, objects and
//!   event records live in slots addressed by generation-checked handles.
//! - **Caller-owned stacks**: each task registers a `&'static mut [u32]`.
//! - **Database heap**: value slots and stream buffers come from a
//!   first-fit arena inside the kernel.
//!
//! ## Host Builds
//!
//! [`kernel::Kernel`] is a plain state machine and builds on the host,
//! where the unit tests drive it tick by tick. The `os` module and the
//! Cortex-M port only exist on ARM targets.

#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod error;
pub mod sync;

pub mod bitmap;
pub mod heap;
pub mod slab;

pub mod scheduler;
pub mod task;
pub mod wait;

pub mod kernel;
pub mod mutex;
pub mod sem;
pub mod timer;

pub mod db;
pub mod event;
pub mod object;

pub mod actor;
pub mod hsm;

pub mod arch;
#[cfg(target_arch = "arm")]
pub mod os;
