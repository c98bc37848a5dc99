//! # Actors
//!
//! Event handlers bound to a task. An actor never waits itself: its task
//! loop waits for events addressed to the task and hands each one to
//! [`Actor::dispatch`], which runs to completion.
//!
//! Two shapes are provided:
//!
//! - [`Reactor`] wraps a single handler closure; events go straight to it.
//! - [`Hsm`](crate::hsm::Hsm) drives a hierarchical state chart.
//!
//! Handlers receive a [`Context`] with the kernel borrowed for the length
//! of the call, so they can publish, send and subscribe but never block.

use crate::error::Result;
use crate::event::Event;
use crate::kernel::Kernel;
use crate::task::TaskId;

/// What a handler may touch while it runs.
pub struct Context<'k> {
    pub kernel: &'k mut Kernel,
    task: TaskId,
}

impl<'k> Context<'k> {
    pub fn new(kernel: &'k mut Kernel, task: TaskId) -> Self {
        Self { kernel, task }
    }

    /// Task the actor runs in.
    #[inline]
    pub fn task(&self) -> TaskId {
        self.task
    }

    #[inline]
    pub fn now(&self) -> u32 {
        self.kernel.now()
    }

    pub fn publish(&mut self, topic: &str) -> Result<()> {
        self.kernel.publish(topic)
    }

    pub fn send(&mut self, target: &str, topic: &str) -> Result<()> {
        self.kernel.send_to(target, topic)
    }

    pub fn subscribe(&mut self, topic: &str) -> Result<()> {
        self.kernel.sub_task(self.task, topic)
    }

    pub fn unsubscribe(&mut self, topic: &str) -> Result<()> {
        self.kernel.unsub_task(self.task, topic)
    }
}

pub trait Actor {
    /// Runs once, before the first event.
    fn start(&mut self, _cx: &mut Context<'_>) {}

    fn dispatch(&mut self, cx: &mut Context<'_>, event: &Event);
}

/// A flat actor: one handler, no state hierarchy.
pub struct Reactor<H> {
    handler: H,
}

impl<H> Reactor<H>
where
    H: FnMut(&mut Context<'_>, &Event),
{
    pub const fn new(handler: H) -> Self {
        Self { handler }
    }
}

impl<H> Actor for Reactor<H>
where
    H: FnMut(&mut Context<'_>, &Event),
{
    fn dispatch(&mut self, cx: &mut Context<'_>, event: &Event) {
        (self.handler)(cx, event)
    }
}

// ---------------------------------------------------------------------------
// Task binding
// ---------------------------------------------------------------------------

/// An actor together with the task whose events it consumes.
pub struct ActorTask<A> {
    task: TaskId,
    actor: A,
    started: bool,
}

impl<A: Actor> ActorTask<A> {
    pub const fn new(task: TaskId, actor: A) -> Self {
        Self {
            task,
            actor,
            started: false,
        }
    }

    #[inline]
    pub fn task(&self) -> TaskId {
        self.task
    }

    pub fn actor(&self) -> &A {
        &self.actor
    }

    pub fn actor_mut(&mut self) -> &mut A {
        &mut self.actor
    }

    /// Start the actor if needed, then dispatch every event already queued
    /// for the task. Returns the number of events dispatched.
    pub fn poll(&mut self, kernel: &mut Kernel) -> usize {
        let mut cx = Context::new(kernel, self.task);
        if !self.started {
            self.started = true;
            self.actor.start(&mut cx);
        }
        let mut dispatched = 0;
        while let Some(event) = cx.kernel.take_event(self.task, None) {
            self.actor.dispatch(&mut cx, &event);
            dispatched += 1;
        }
        dispatched
    }

    /// Task body: drain, then sleep until the next event arrives.
    #[cfg(target_arch = "arm")]
    pub fn run(&mut self) -> ! {
        loop {
            crate::os::with(|k| self.poll(k));
            if let Ok(event) = crate::os::wait_event(crate::config::WAIT_FOREVER) {
                let task = self.task;
                let actor = &mut self.actor;
                crate::os::with(|k| actor.dispatch(&mut Context::new(k, task), &event));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::testing::{boot, spawn};

    #[test]
    fn test_reactor_sees_every_event_in_order() {
        let mut k = boot();
        let a = spawn(&mut k, "a", 5);
        let mut seen: Vec<std::string::String> = Vec::new();
        {
            let mut task = ActorTask::new(
                a,
                Reactor::new(|_cx: &mut Context<'_>, ev: &Event| seen.push(ev.topic.as_str().into())),
            );
            k.send(a, "one").unwrap();
            k.send(a, "two").unwrap();
            assert_eq!(task.poll(&mut k), 2);
            assert_eq!(task.poll(&mut k), 0, "queue drained");
        }
        assert_eq!(seen, vec!["one", "two"]);
        assert_eq!(k.pending_records(), 0);
    }

    struct Echo {
        started: u32,
        handled: u32,
    }

    impl Actor for Echo {
        fn start(&mut self, cx: &mut Context<'_>) {
            self.started += 1;
            cx.subscribe("ping").unwrap();
        }

        fn dispatch(&mut self, cx: &mut Context<'_>, event: &Event) {
            self.handled += 1;
            if event.topic.as_str() == "ping" {
                cx.send("sink", "pong").unwrap();
            }
        }
    }

    #[test]
    fn test_start_runs_once_and_handlers_can_send() {
        let mut k = boot();
        let echo = spawn(&mut k, "echo", 5);
        let sink = spawn(&mut k, "sink", 6);
        let mut task = ActorTask::new(
            echo,
            Echo {
                started: 0,
                handled: 0,
            },
        );

        task.poll(&mut k);
        k.publish("ping").unwrap();
        task.poll(&mut k);
        assert_eq!(task.actor().started, 1);
        assert_eq!(task.actor().handled, 1);

        let reply = k.take_event(sink, None).expect("sink should receive a pong");
        assert_eq!(reply.topic.as_str(), "pong");
    }
}
