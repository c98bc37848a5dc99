//! # tickos Demo Firmware
//!
//! Three tasks on an STM32F407 exercising the event layer:
//!
//! | Task        | Priority | Shape    | Behavior                                   |
//! |-------------|----------|----------|--------------------------------------------|
//! | `heartbeat` | 10       | plain    | publishes `Tick` every 100 ms, sends `Beat` |
//! | `logger`    | 5        | reactor  | appends every `Tick` to the `log` stream    |
//! | `door`      | 3        | HSM      | Closed ⇄ Open(Ajar/Wide) driven by ticks    |
//!
//! The `uptime` database key is written by the logger and published to
//! anyone subscribed to it.

#![no_std]
#![no_main]

use core::ptr::addr_of_mut;

use cortex_m_rt::entry;
use panic_halt as _;

use tickos::actor::{ActorTask, Context, Reactor};
use tickos::event::Event;
use tickos::hsm::{Hsm, Response, Signal, StateChart};
use tickos::object::Attribute;
use tickos::os;
use tickos::task::TaskConfig;

static mut HEARTBEAT_STACK: [u32; 256] = [0; 256];
static mut LOGGER_STACK: [u32; 512] = [0; 512];
static mut DOOR_STACK: [u32; 512] = [0; 512];

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

extern "C" fn heartbeat(_: usize) -> ! {
    os::publish_period("Tick", 100).expect("periodic Tick");
    loop {
        os::delay_ms(1000);
        let _ = os::send("logger", "Beat");
    }
}

extern "C" fn logger(_: usize) -> ! {
    let task = os::current_task().expect("running in a task");
    let mut ticks: u32 = 0;
    let reactor = Reactor::new(move |cx: &mut Context<'_>, ev: &Event| match ev.topic.as_str() {
        "Tick" => {
            ticks = ticks.wrapping_add(1);
            let _ = cx.kernel.db_stream_write("log", &[ticks as u8]);
            let uptime = cx.kernel.get_time_ms();
            let _ = cx.kernel.db_block_write("uptime", &uptime.to_le_bytes());
        }
        "Beat" => log::info!("heartbeat after {} ticks", ticks),
        _ => {}
    });
    let mut actor = ActorTask::new(task, reactor);
    os::with(|k| {
        let _ = k.sub_task(task, "Tick");
    });
    actor.run()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Door {
    Top,
    Closed,
    Open,
    Ajar,
    Wide,
}

struct DoorChart {
    ticks: u32,
}

impl StateChart for DoorChart {
    type State = Door;

    fn initial(&self) -> Door {
        Door::Top
    }

    fn handle(&mut self, cx: &mut Context<'_>, state: Door, signal: &Signal<'_>) -> Response<Door> {
        match (state, signal) {
            (Door::Top, Signal::Empty) => Response::Ignored,
            (Door::Closed | Door::Open, Signal::Empty) => Response::Super(Door::Top),
            (Door::Ajar | Door::Wide, Signal::Empty) => Response::Super(Door::Open),
            (Door::Top, Signal::Init) => Response::Transition(Door::Closed),
            (Door::Open, Signal::Init) => Response::Transition(Door::Ajar),
            (Door::Open, Signal::Enter) => {
                let _ = cx.publish("DoorOpen");
                Response::Handled
            }
            (_, Signal::Event(ev)) if ev.topic.as_str() == "Tick" => {
                self.ticks += 1;
                match (state, self.ticks % 10) {
                    (Door::Closed, 0) => Response::Transition(Door::Open),
                    (Door::Ajar, 5) => Response::Transition(Door::Wide),
                    (Door::Wide, 0) => Response::Transition(Door::Closed),
                    _ => Response::Handled,
                }
            }
            _ => Response::Ignored,
        }
    }
}

extern "C" fn door(_: usize) -> ! {
    let task = os::current_task().expect("running in a task");
    let mut actor = ActorTask::new(task, Hsm::new(DoorChart { ticks: 0 }));
    os::with(|k| {
        let _ = k.sub_task(task, "Tick");
    });
    actor.run()
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

#[entry]
fn main() -> ! {
    let cp = cortex_m::Peripherals::take().expect("core peripherals taken once");

    os::init().expect("kernel init");
    os::db_register("log", 64, Attribute::STREAM | Attribute::GLOBAL).expect("log stream");
    os::db_register("uptime", 4, Attribute::VALUE | Attribute::GLOBAL).expect("uptime value");

    // SAFETY: main runs once; each stack is handed to exactly one task.
    let (heartbeat_stack, logger_stack, door_stack) = unsafe {
        (
            &mut *addr_of_mut!(HEARTBEAT_STACK),
            &mut *addr_of_mut!(LOGGER_STACK),
            &mut *addr_of_mut!(DOOR_STACK),
        )
    };

    os::register_task(
        TaskConfig {
            name: "heartbeat",
            priority: 10,
            time_slice: 0,
            param: 0,
        },
        heartbeat,
        heartbeat_stack,
    )
    .expect("register heartbeat");

    os::register_task(
        TaskConfig {
            name: "logger",
            priority: 5,
            time_slice: 0,
            param: 0,
        },
        logger,
        logger_stack,
    )
    .expect("register logger");

    os::register_task(
        TaskConfig {
            name: "door",
            priority: 3,
            time_slice: 0,
            param: 0,
        },
        door,
        door_stack,
    )
    .expect("register door");

    os::start(cp)
}
