//! End-to-end scenarios driven through the public kernel API, tick by tick.

use tickos::actor::{ActorTask, Context, Reactor};
use tickos::config::WAIT_FOREVER;
use tickos::event::Event;
use tickos::kernel::{Kernel, SystemTasks, Wait};
use tickos::object::Attribute;
use tickos::task::{TaskConfig, TaskId};

extern "C" fn parked(_: usize) -> ! {
    loop {
        std::hint::spin_loop();
    }
}

fn stack() -> &'static mut [u32] {
    Box::leak(vec![0u32; 128].into_boxed_slice())
}

fn boot() -> Box<Kernel> {
    let mut k = Box::new(Kernel::new());
    k.init(SystemTasks {
        idle_entry: parked,
        idle_stack: stack(),
        timer_entry: parked,
        timer_stack: stack(),
    })
    .unwrap();
    k
}

fn spawn(k: &mut Kernel, name: &'static str, priority: u8) -> TaskId {
    k.register_task(
        TaskConfig {
            name,
            priority,
            time_slice: 0,
            param: 0,
        },
        parked,
        stack(),
    )
    .unwrap()
}

#[test]
fn test_periodic_tick_reaches_consumer() {
    let mut k = boot();
    let a = spawn(&mut k, "A", 4);
    let b = spawn(&mut k, "B", 5);
    k.start();
    assert_eq!(k.current_task(), Some(a));

    let baseline = k.pending_records();
    let heap_baseline = k.heap_used_blocks();
    k.send_period(b, "Tick", 10).unwrap();

    let mut deliveries = 0;
    for _ in 0..100 {
        k.tick();
        while let Some(event) = k.take_event(b, None) {
            assert_eq!(event.topic.as_str(), "Tick");
            deliveries += 1;
            assert_eq!(k.pending_records(), baseline, "record freed after consumption");
        }
    }
    assert_eq!(deliveries, 10);
    assert_eq!(k.pending_records(), baseline);
    assert_eq!(k.heap_used_blocks(), heap_baseline);
}

#[test]
fn test_blocked_consumer_wakes_on_each_tick() {
    let mut k = boot();
    let producer = spawn(&mut k, "producer", 6);
    let consumer = spawn(&mut k, "consumer", 2);
    k.start();
    assert_eq!(k.current_task(), Some(consumer));
    k.send_period(consumer, "Tick", 10).unwrap();

    // consumer parks in wait_event, the producer runs in between
    let mut woken = 0;
    assert_eq!(k.wait_event(WAIT_FOREVER), Ok(Wait::Blocked));
    for _ in 0..50 {
        k.tick();
        if k.current_task() == Some(consumer) {
            woken += 1;
            assert_eq!(k.pend_outcome(consumer), Ok(()));
            let ev = k.take_event(consumer, None).expect("wake-up carries a record");
            assert_eq!(ev.topic.as_str(), "Tick");
            assert_eq!(k.wait_event(WAIT_FOREVER), Ok(Wait::Blocked));
            assert_eq!(k.current_task(), Some(producer));
        }
    }
    assert_eq!(woken, 5);
}

#[test]
fn test_database_feeds_reactor() {
    let mut k = boot();
    let sensor = spawn(&mut k, "sensor", 5);
    let display = spawn(&mut k, "display", 6);
    k.start();
    assert_eq!(k.current_task(), Some(sensor));

    k.db_register("temp", 2, Attribute::VALUE).unwrap();
    k.sub_task(display, "temp").unwrap();

    let mut readings: Vec<u16> = Vec::new();
    let mut task = ActorTask::new(
        display,
        Reactor::new(|cx: &mut Context<'_>, ev: &Event| {
            let mut raw = [0u8; 2];
            cx.kernel.db_block_read(ev.topic.as_str(), &mut raw).unwrap();
            readings.push(u16::from_le_bytes(raw));
        }),
    );

    k.db_block_write("temp", &215u16.to_le_bytes()).unwrap();
    task.poll(&mut k);
    k.db_block_write("temp", &216u16.to_le_bytes()).unwrap();
    k.db_block_write("temp", &217u16.to_le_bytes()).unwrap();
    task.poll(&mut k);
    drop(task);

    assert_eq!(readings, vec![215, 217], "back-to-back writes merge into one notification");
}

#[test]
fn test_priority_inheritance_through_public_api() {
    let mut k = boot();
    let low = spawn(&mut k, "low", 20);
    k.start();
    let m = k.mutex_create().unwrap();
    k.mutex_take(m, WAIT_FOREVER).unwrap();

    let mid = spawn(&mut k, "mid", 10);
    let high = spawn(&mut k, "high", 2);
    assert_eq!(k.current_task(), Some(high));
    assert_eq!(k.mutex_take(m, WAIT_FOREVER), Ok(Wait::Blocked));
    assert_eq!(k.current_task(), Some(low), "boosted owner outranks mid");
    assert_eq!(k.task_priority(low), 2);

    k.mutex_release(m).unwrap();
    assert_eq!(k.task_priority(low), 20);
    assert_eq!(k.current_task(), Some(high));
    assert_eq!(k.mutex_owner(m), Some(high));
    assert_ne!(k.current_task(), Some(mid));
}
