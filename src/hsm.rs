//! # Hierarchical State Machine
//!
//! A state chart is a set of states, each with a parent, described by one
//! handler function. The machine asks the handler about structure through
//! reserved signals instead of keeping a parent table:
//!
//! | Signal   | Handler answers                                         |
//! |----------|---------------------------------------------------------|
//! | `Empty`  | `Super(parent)`, anything else at the top state          |
//! | `Enter`  | side effects only                                       |
//! | `Exit`   | side effects only                                       |
//! | `Init`   | `Transition(child)` to descend into a default substate  |
//! | `Event`  | `Handled`, `Ignored`, `Super(parent)` or `Transition`   |
//!
//! ## Transitions
//!
//! ```text
//!            Root                     go: A1 ──► B1
//!          /      \
//!        A          B                 exit  A1, A
//!      /   \         \                enter B, B1
//!    A1     A2        B1              Root is the LCA and is untouched
//! ```
//!
//! The least common ancestor (LCA) of the current state and the target is
//! the first state on the current state's ancestor chain that also lies on
//! the target's. States below it on the current side are exited bottom-up,
//! states below it on the target side are entered top-down, then `Init`
//! is followed for as long as the new state asks to descend. A transition
//! to the current state or to one of its ancestors leaves and re-enters
//! the target.
//!
//! Nesting deeper than `HSM_MAX_DEPTH`, usually a parent cycle, is fatal.

use core::fmt::Debug;

use heapless::Vec;

use crate::actor::{Actor, Context};
use crate::config::HSM_MAX_DEPTH;
use crate::event::Event;

#[derive(Debug, Clone, Copy)]
pub enum Signal<'a> {
    /// Structure probe: report the parent state.
    Empty,
    Init,
    Enter,
    Exit,
    Event(&'a Event),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response<S> {
    Handled,
    Ignored,
    /// Not handled here; ask the parent.
    Super(S),
    Transition(S),
}

pub trait StateChart {
    type State: Copy + Eq + Debug;

    /// State entered by `start`, together with all of its ancestors.
    fn initial(&self) -> Self::State;

    fn handle(
        &mut self,
        cx: &mut Context<'_>,
        state: Self::State,
        signal: &Signal<'_>,
    ) -> Response<Self::State>;
}

/// Ancestor chain, innermost first.
type Chain<S> = Vec<S, HSM_MAX_DEPTH>;

pub struct Hsm<C: StateChart> {
    chart: C,
    current: Option<C::State>,
}

impl<C: StateChart> Hsm<C> {
    pub const fn new(chart: C) -> Self {
        Self {
            chart,
            current: None,
        }
    }

    /// Active leaf state, `None` before start.
    pub fn state(&self) -> Option<C::State> {
        self.current
    }

    pub fn chart(&self) -> &C {
        &self.chart
    }

    fn chain(&mut self, cx: &mut Context<'_>, state: C::State) -> Chain<C::State> {
        let mut chain = Chain::new();
        let mut state = state;
        loop {
            if chain.push(state).is_err() {
                crate::error::fatal("state nesting exceeds HSM_MAX_DEPTH", file!(), line!());
            }
            match self.chart.handle(cx, state, &Signal::Empty) {
                Response::Super(parent) => state = parent,
                _ => return chain,
            }
        }
    }

    fn enter_down(&mut self, cx: &mut Context<'_>, states: &[C::State]) {
        for &state in states.iter().rev() {
            self.chart.handle(cx, state, &Signal::Enter);
        }
    }

    /// Follow `Init` transitions from the current state down to a leaf.
    fn settle(&mut self, cx: &mut Context<'_>) {
        let Some(mut state) = self.current else {
            return;
        };
        for _ in 0..HSM_MAX_DEPTH {
            let Response::Transition(child) = self.chart.handle(cx, state, &Signal::Init) else {
                self.current = Some(state);
                return;
            };
            let chain = self.chain(cx, child);
            let Some(depth) = chain.iter().position(|&s| s == state) else {
                crate::error::fatal("initial transition must target a substate", file!(), line!());
            };
            self.enter_down(cx, &chain[..depth]);
            state = child;
        }
        crate::error::fatal("initial transitions exceed HSM_MAX_DEPTH", file!(), line!());
    }

    fn transition(&mut self, cx: &mut Context<'_>, target: C::State) {
        let Some(current) = self.current else {
            return;
        };
        let exiting = self.chain(cx, current);
        let entering = self.chain(cx, target);

        let mut lca = exiting.iter().copied().find(|s| entering.contains(s));
        if lca == Some(target) {
            // the target itself is left and re-entered
            lca = entering.get(1).copied();
        }

        for &state in exiting.iter().take_while(|&&s| Some(s) != lca) {
            self.chart.handle(cx, state, &Signal::Exit);
        }
        let below = entering
            .iter()
            .position(|&s| Some(s) == lca)
            .unwrap_or(entering.len());
        self.enter_down(cx, &entering[..below]);

        self.current = Some(target);
        self.settle(cx);
    }
}

impl<C: StateChart> Actor for Hsm<C> {
    fn start(&mut self, cx: &mut Context<'_>) {
        let initial = self.chart.initial();
        let chain = self.chain(cx, initial);
        self.enter_down(cx, &chain);
        self.current = Some(initial);
        self.settle(cx);
    }

    fn dispatch(&mut self, cx: &mut Context<'_>, event: &Event) {
        let Some(mut state) = self.current else {
            return;
        };
        let signal = Signal::Event(event);
        for _ in 0..HSM_MAX_DEPTH {
            match self.chart.handle(cx, state, &signal) {
                Response::Handled | Response::Ignored => return,
                Response::Super(parent) => state = parent,
                Response::Transition(target) => {
                    self.transition(cx, target);
                    return;
                }
            }
        }
        crate::error::fatal("event climbed past HSM_MAX_DEPTH", file!(), line!());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorTask;
    use crate::kernel::testing::{boot, spawn};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum S {
        Root,
        A,
        A1,
        A2,
        B,
        B1,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Trace {
        Enter(S),
        Exit(S),
    }

    #[derive(Default)]
    struct Chart {
        trace: std::vec::Vec<Trace>,
        pings: u32,
    }

    impl StateChart for Chart {
        type State = S;

        fn initial(&self) -> S {
            S::Root
        }

        fn handle(&mut self, _cx: &mut Context<'_>, state: S, signal: &Signal<'_>) -> Response<S> {
            let parent = match state {
                S::Root => None,
                S::A | S::B => Some(S::Root),
                S::A1 | S::A2 => Some(S::A),
                S::B1 => Some(S::B),
            };
            let topic = match signal {
                Signal::Empty => return parent.map_or(Response::Ignored, Response::Super),
                Signal::Enter => {
                    self.trace.push(Trace::Enter(state));
                    return Response::Handled;
                }
                Signal::Exit => {
                    self.trace.push(Trace::Exit(state));
                    return Response::Handled;
                }
                Signal::Init => {
                    return match state {
                        S::Root => Response::Transition(S::A),
                        S::A => Response::Transition(S::A1),
                        S::B => Response::Transition(S::B1),
                        _ => Response::Handled,
                    }
                }
                Signal::Event(event) => event.topic.as_str(),
            };
            match (state, topic) {
                (S::A1, "go") => Response::Transition(S::B1),
                (S::A1, "self") => Response::Transition(S::A1),
                (S::A1, "up") => Response::Transition(S::A),
                (S::A1, "side") => Response::Transition(S::A2),
                (S::Root, "ping") => {
                    self.pings += 1;
                    Response::Handled
                }
                (S::Root, _) => Response::Ignored,
                _ => parent.map_or(Response::Ignored, Response::Super),
            }
        }
    }

    struct Fixture {
        kernel: Box<crate::kernel::Kernel>,
        task: ActorTask<Hsm<Chart>>,
    }

    impl Fixture {
        fn new() -> Self {
            let mut kernel = boot();
            let id = spawn(&mut kernel, "fsm", 5);
            let mut task = ActorTask::new(id, Hsm::new(Chart::default()));
            task.poll(&mut kernel);
            Self { kernel, task }
        }

        fn fire(&mut self, topic: &str) -> std::vec::Vec<Trace> {
            self.task.actor_mut().chart.trace.clear();
            self.kernel.send(self.task.task(), topic).unwrap();
            self.task.poll(&mut self.kernel);
            self.task.actor().chart().trace.clone()
        }
    }

    #[test]
    fn test_start_enters_top_down_and_follows_init() {
        let f = Fixture::new();
        assert_eq!(
            f.task.actor().chart().trace,
            vec![Trace::Enter(S::Root), Trace::Enter(S::A), Trace::Enter(S::A1)]
        );
        assert_eq!(f.task.actor().state(), Some(S::A1));
    }

    #[test]
    fn test_cousin_transition_keeps_the_root() {
        let mut f = Fixture::new();
        let trace = f.fire("go");
        assert_eq!(
            trace,
            vec![
                Trace::Exit(S::A1),
                Trace::Exit(S::A),
                Trace::Enter(S::B),
                Trace::Enter(S::B1)
            ]
        );
        assert_eq!(f.task.actor().state(), Some(S::B1));
    }

    #[test]
    fn test_sibling_transition() {
        let mut f = Fixture::new();
        assert_eq!(f.fire("side"), vec![Trace::Exit(S::A1), Trace::Enter(S::A2)]);
    }

    #[test]
    fn test_self_transition_exits_and_reenters() {
        let mut f = Fixture::new();
        assert_eq!(f.fire("self"), vec![Trace::Exit(S::A1), Trace::Enter(S::A1)]);
        assert_eq!(f.task.actor().state(), Some(S::A1));
    }

    #[test]
    fn test_transition_to_ancestor_reenters_it() {
        let mut f = Fixture::new();
        assert_eq!(
            f.fire("up"),
            vec![
                Trace::Exit(S::A1),
                Trace::Exit(S::A),
                Trace::Enter(S::A),
                Trace::Enter(S::A1)
            ],
            "the ancestor's Init leads back down"
        );
    }

    #[test]
    fn test_unhandled_event_bubbles_to_root() {
        let mut f = Fixture::new();
        assert!(f.fire("ping").is_empty());
        assert!(f.fire("noise").is_empty());
        assert_eq!(f.task.actor().chart().pings, 1);
        assert_eq!(f.task.actor().state(), Some(S::A1));
    }

    struct Loop;

    impl StateChart for Loop {
        type State = u8;

        fn initial(&self) -> u8 {
            0
        }

        fn handle(&mut self, _cx: &mut Context<'_>, state: u8, signal: &Signal<'_>) -> Response<u8> {
            match signal {
                Signal::Empty => Response::Super(state ^ 1),
                _ => Response::Handled,
            }
        }
    }

    #[test]
    #[should_panic(expected = "HSM_MAX_DEPTH")]
    fn test_parent_cycle_is_fatal() {
        let mut k = boot();
        let id = spawn(&mut k, "loop", 5);
        ActorTask::new(id, Hsm::new(Loop)).poll(&mut k);
    }
}
