//! Component E: hierarchical, trace-enabled finite state machine engine.
//!
//! A `StateMachine<U>` owns every sub-machine it contains (the C original
//! deep-copies a sub state machine at insertion time because its states are
//! plain function pointers; here the closures are boxed trait objects so we
//! just move ownership in — the sub-machine still lives exactly as long as
//! its parent and is never shared).

use std::collections::{BTreeSet, HashSet};
use indexmap::IndexMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorStatus {
    BadId,
    NoNext,
    BadNext,
    SelfNext,
    NoPrev,
    InfContinue,
    StopCleanup,
    StateError,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Next(u64),
    Prev,
    Continue(u64),
    Wait,
    Done,
    Error(ErrorStatus),
}

impl Status {
    fn is_wait(&self) -> bool {
        matches!(self, Status::Wait)
    }
}

pub type StateFn<U> = dyn FnMut(&mut U) -> Status;
pub type CleanupFn<U> = dyn FnMut(&mut U, Status) -> Status;
pub type PreFn<U> = dyn FnMut(&mut U) -> (bool, Status);
pub type PostFn<U> = dyn FnMut(&mut U, Status) -> Status;
pub type TraceFn = dyn FnMut(&TraceEvent);

#[derive(Clone, Copy, Debug, Default)]
pub struct MachineFlags {
    pub explicit_next: bool,
    pub linear_end: bool,
    pub done_cleanup: bool,
    pub one_cleanup: bool,
    pub continue_loop: bool,
    pub self_call: bool,
    pub single_prev: bool,
}

#[derive(Clone, Copy, Debug)]
pub enum TraceEvent {
    MachineEnter { descr: &'static str },
    MachineExit { descr: &'static str },
    StateStart { id: u64, descr: &'static str },
    StateFinish { id: u64, descr: &'static str, status: Status },
    PreStart,
    PreFinish { status: Status, run_sub: bool },
    PostStart,
    PostFinish { status: Status },
    Cleanup { id: u64, descr: &'static str, status: Status },
}

pub enum StateBody<U> {
    Function(Box<StateFn<U>>),
    CleanupFunction(Box<CleanupFn<U>>),
    Sub {
        machine: Box<StateMachine<U>>,
        pre: Option<Box<PreFn<U>>>,
        post: Option<Box<PostFn<U>>>,
        started: bool,
    },
}

pub struct State<U> {
    pub descr: &'static str,
    pub body: StateBody<U>,
    pub allowed_next: Option<HashSet<u64>>,
    pub cleanup: Option<Box<StateMachine<U>>>,
}

pub struct StateMachine<U> {
    descr: &'static str,
    flags: MachineFlags,
    states: IndexMap<u64, State<U>>,
    current_id: u64,
    current_cleanup_id: u64,
    prev: Vec<u64>,
    cleanup_ids: Vec<u64>,
    cleanup_seen: HashSet<u64>,
    continuations: BTreeSet<u64>,
    cleanup_reason: Option<Status>,
    return_status: Option<Status>,
    running: bool,
    trace: Option<Box<TraceFn>>,
}

impl<U> StateMachine<U> {
    pub fn new(descr: &'static str, flags: MachineFlags) -> Self {
        StateMachine {
            descr,
            flags,
            states: IndexMap::new(),
            current_id: 0,
            current_cleanup_id: 0,
            prev: Vec::new(),
            cleanup_ids: Vec::new(),
            cleanup_seen: HashSet::new(),
            continuations: BTreeSet::new(),
            cleanup_reason: None,
            return_status: None,
            running: false,
            trace: None,
        }
    }

    pub fn enable_trace(&mut self, cb: impl FnMut(&TraceEvent) + 'static) {
        self.trace = Some(Box::new(cb));
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn has_state(&self, id: u64) -> bool {
        self.states.contains_key(&id)
    }

    pub fn remove_state(&mut self, id: u64) -> bool {
        self.states.shift_remove(&id).is_some()
    }

    fn insert(&mut self, id: u64, state: State<U>) -> bool {
        if id == 0 || self.states.contains_key(&id) {
            return false;
        }
        self.states.insert(id, state);
        true
    }

    pub fn insert_state(
        &mut self,
        id: u64,
        descr: &'static str,
        func: impl FnMut(&mut U) -> Status + 'static,
        cleanup: Option<StateMachine<U>>,
        allowed_next: Option<HashSet<u64>>,
    ) -> bool {
        self.insert(
            id,
            State {
                descr,
                body: StateBody::Function(Box::new(func)),
                allowed_next,
                cleanup: cleanup.map(Box::new),
            },
        )
    }

    pub fn insert_cleanup_state(
        &mut self,
        id: u64,
        descr: &'static str,
        func: impl FnMut(&mut U, Status) -> Status + 'static,
        cleanup: Option<StateMachine<U>>,
        allowed_next: Option<HashSet<u64>>,
    ) -> bool {
        self.insert(
            id,
            State {
                descr,
                body: StateBody::CleanupFunction(Box::new(func)),
                allowed_next,
                cleanup: cleanup.map(Box::new),
            },
        )
    }

    pub fn insert_sub_state_machine(
        &mut self,
        id: u64,
        descr: &'static str,
        machine: StateMachine<U>,
        pre: Option<Box<PreFn<U>>>,
        post: Option<Box<PostFn<U>>>,
        cleanup: Option<StateMachine<U>>,
        allowed_next: Option<HashSet<u64>>,
    ) -> bool {
        self.insert(
            id,
            State {
                descr,
                body: StateBody::Sub {
                    machine: Box::new(machine),
                    pre,
                    post,
                    started: false,
                },
                allowed_next,
                cleanup: cleanup.map(Box::new),
            },
        )
    }

    pub fn run(&mut self, data: &mut U) -> Status {
        self.run_machine(data)
    }

    fn run_machine(&mut self, data: &mut U) -> Status {
        if let Some(t) = &mut self.trace {
            t(&TraceEvent::MachineEnter { descr: self.descr });
        }
        let status = self.run_states(data);
        if let Some(t) = &mut self.trace {
            t(&TraceEvent::MachineExit { descr: self.descr });
        }
        status
    }

    fn fallthrough_next(&self, current_id: u64) -> Option<u64> {
        if self.flags.explicit_next {
            return Some(0);
        }
        let idx = self.states.get_index_of(&current_id)?;
        if idx + 1 == self.states.len() {
            Some(0)
        } else {
            self.states.get_index(idx + 1).map(|(id, _)| *id)
        }
    }

    fn run_states(&mut self, data: &mut U) -> Status {
        if self.states.is_empty() {
            self.running = false;
            self.current_id = 0;
            return Status::Done;
        }

        if !self.running {
            self.continuations.clear();
            self.cleanup_ids.clear();
            self.cleanup_seen.clear();
            self.prev.clear();
            self.current_id = *self.states.get_index(0).unwrap().0;
            self.cleanup_reason = None;
            self.return_status = None;
        }
        self.running = true;

        loop {
            let current_id = self.current_id;

            if !self.states.contains_key(&current_id) {
                self.cleanup_reason = Some(Status::Error(ErrorStatus::StateError));
                self.return_status = Some(Status::Error(ErrorStatus::BadId));
            }

            if self.cleanup_reason.is_some() {
                if let Some(status) = self.drain_active_sub(&current_id, data) {
                    return status;
                }

                let status = self.run_cleanup(data);
                if status.is_wait() {
                    return Status::Wait;
                }
                self.cleanup_ids.clear();
                self.running = false;
                return self.return_status.unwrap_or(Status::Done);
            }

            let Some(next_id) = self.fallthrough_next(current_id) else {
                self.cleanup_reason = Some(Status::Error(ErrorStatus::StateError));
                self.return_status = Some(Status::Error(ErrorStatus::BadId));
                continue;
            };

            let (status, chosen_next) = self.dispatch_state(current_id, next_id, data);

            match status {
                Status::Next(_) | Status::Continue(_) => {
                    let target = chosen_next;
                    if target == 0 {
                        if self.flags.linear_end && !self.flags.explicit_next {
                            if self.flags.done_cleanup {
                                self.cleanup_reason = Some(Status::Done);
                                self.return_status = Some(Status::Done);
                                continue;
                            }
                            self.cleanup_ids.clear();
                            self.running = false;
                            self.continuations.clear();
                            return Status::Done;
                        }
                        self.cleanup_reason = Some(Status::Error(ErrorStatus::NoNext));
                        self.return_status = Some(Status::Error(ErrorStatus::NoNext));
                        continue;
                    }

                    if let Some(allowed) = self.states.get(&current_id).and_then(|s| s.allowed_next.as_ref()) {
                        if !allowed.contains(&target) {
                            self.cleanup_reason = Some(Status::Error(ErrorStatus::BadNext));
                            self.return_status = Some(Status::Error(ErrorStatus::BadNext));
                            continue;
                        }
                    }

                    if matches!(status, Status::Continue(_)) {
                        if !self.flags.continue_loop && self.continuations.contains(&target) {
                            self.cleanup_reason = Some(Status::Error(ErrorStatus::InfContinue));
                            self.return_status = Some(Status::Error(ErrorStatus::InfContinue));
                            continue;
                        }
                        self.continuations.insert(target);
                    } else {
                        if self.flags.single_prev {
                            self.prev.clear();
                        }
                        self.prev.push(current_id);
                        self.continuations.clear();
                    }

                    if !self.flags.self_call && target == current_id {
                        self.cleanup_reason = Some(Status::Error(ErrorStatus::SelfNext));
                        self.return_status = Some(Status::Error(ErrorStatus::SelfNext));
                        continue;
                    }

                    self.current_id = target;
                }
                Status::Prev => {
                    if let Some(id) = self.prev.pop() {
                        self.current_id = id;
                    } else {
                        self.cleanup_reason = Some(Status::Error(ErrorStatus::NoPrev));
                        self.return_status = Some(Status::Error(ErrorStatus::NoPrev));
                    }
                }
                Status::Wait => {
                    self.continuations.clear();
                    return Status::Wait;
                }
                Status::Done => {
                    if self.flags.done_cleanup {
                        self.cleanup_reason = Some(Status::Done);
                        self.return_status = Some(Status::Done);
                    } else {
                        self.cleanup_ids.clear();
                        self.running = false;
                        return Status::Done;
                    }
                }
                Status::Error(e) => {
                    self.cleanup_reason = Some(Status::Error(e));
                    self.return_status = Some(Status::Error(e));
                    self.continuations.clear();
                }
            }
        }
    }

    /// If the current state is an active (still-running) sub-machine, run
    /// its own cleanup first. Returns `Some(Status::Wait)` if that needs to
    /// suspend the whole step.
    fn drain_active_sub(&mut self, current_id: &u64, data: &mut U) -> Option<Status> {
        let is_active_sub = matches!(
            self.states.get(current_id).map(|s| &s.body),
            Some(StateBody::Sub { machine, .. }) if machine.running
        );
        if !is_active_sub {
            return None;
        }
        let mut state = self.states.shift_remove(current_id)?;
        let result = if let StateBody::Sub { machine, .. } = &mut state.body {
            machine.run_machine(data)
        } else {
            unreachable!()
        };
        self.states.insert(*current_id, state);
        if result.is_wait() {
            Some(Status::Wait)
        } else {
            None
        }
    }

    /// Invoke the current state's body. Returns `(status, next_id)` where
    /// `next_id` is the transition target actually chosen (callback-supplied
    /// or the fallthrough default).
    fn dispatch_state(&mut self, current_id: u64, fallthrough: u64, data: &mut U) -> (Status, u64) {
        let mut state = self.states.shift_remove(&current_id).expect("checked by caller");

        if let Some(t) = &mut self.trace {
            t(&TraceEvent::StateStart { id: current_id, descr: state.descr });
        }

        let (status, next_id, already_enqueued) = match &mut state.body {
            StateBody::Sub { machine, pre, post, started } => {
                let mut run_sub = true;
                let mut status = Status::Next(fallthrough);
                let mut next_id = fallthrough;

                if let Some(pre_fn) = pre {
                    if !*started {
                        if let Some(t) = &mut self.trace {
                            t(&TraceEvent::PreStart);
                        }
                        let (rs, st) = pre_fn(data);
                        run_sub = rs;
                        status = st;
                        next_id = extract_next(&status, fallthrough);
                        if let Some(t) = &mut self.trace {
                            t(&TraceEvent::PreFinish { status, run_sub });
                        }
                    }
                }

                if run_sub {
                    if !*started {
                        self.cleanup_ids.push(current_id);
                        *started = true;
                    }
                    let sub_status = machine.run_machine(data);
                    if sub_status.is_wait() {
                        status = Status::Wait;
                    } else if self.cleanup_reason.is_none() {
                        if let Some(post_fn) = post {
                            if let Some(t) = &mut self.trace {
                                t(&TraceEvent::PostStart);
                            }
                            status = post_fn(data, sub_status);
                            next_id = extract_next(&status, fallthrough);
                            if let Some(t) = &mut self.trace {
                                t(&TraceEvent::PostFinish { status });
                            }
                        } else if sub_status == Status::Done {
                            status = Status::Next(fallthrough);
                            next_id = fallthrough;
                        } else {
                            status = sub_status;
                            next_id = extract_next(&status, fallthrough);
                        }
                    } else {
                        status = sub_status;
                    }
                }

                (status, next_id, true)
            }
            StateBody::Function(f) => {
                let status = f(data);
                let next_id = extract_next(&status, fallthrough);
                (status, next_id, false)
            }
            StateBody::CleanupFunction(f) => {
                let reason = self.cleanup_reason.unwrap_or(Status::Done);
                let status = f(data, reason);
                let next_id = extract_next(&status, fallthrough);
                (status, next_id, false)
            }
        };

        if let Some(t) = &mut self.trace {
            t(&TraceEvent::StateFinish { id: current_id, descr: state.descr, status });
        }

        if !already_enqueued && !status.is_wait() {
            self.cleanup_ids.push(current_id);
        }

        self.states.insert(current_id, state);
        (status, next_id)
    }

    fn run_cleanup(&mut self, data: &mut U) -> Status {
        let Some(reason) = self.cleanup_reason else {
            return Status::Done;
        };

        let mut last_status = Status::Done;
        while let Some(id) = self.cleanup_ids.pop() {
            self.current_cleanup_id = id;

            if self.flags.one_cleanup && self.cleanup_seen.contains(&id) {
                continue;
            }
            self.cleanup_seen.insert(id);

            let Some(mut state) = self.states.shift_remove(&id) else {
                continue;
            };
            let Some(mut cleanup_machine) = state.cleanup.take() else {
                self.states.insert(id, state);
                continue;
            };

            cleanup_machine.cleanup_reason = Some(reason);
            let status = cleanup_machine.run_machine(data);
            if let Some(t) = &mut self.trace {
                t(&TraceEvent::Cleanup { id, descr: state.descr, status });
            }
            cleanup_machine.cleanup_reason = None;
            state.cleanup = Some(cleanup_machine);
            self.states.insert(id, state);

            match status {
                Status::Next(_) | Status::Prev | Status::Continue(_) | Status::Wait => {
                    self.cleanup_ids.push(id);
                    return status;
                }
                Status::Done => {}
                Status::Error(_) => {
                    if self.flags.one_cleanup {
                        self.cleanup_seen.remove(&id);
                    }
                }
            }
            last_status = Status::Done;
        }

        self.cleanup_ids.clear();
        self.current_cleanup_id = 0;
        self.cleanup_seen.clear();
        last_status
    }

    /// Mark the innermost active sub-machine (recursing down) for cleanup
    /// with `reason`; the next `run()` call drains it.
    pub fn reset(&mut self, reason: Status) {
        if !self.running {
            return;
        }

        if let Some(state) = self.states.get_mut(&self.current_id) {
            match &mut state.body {
                StateBody::Sub { machine, .. } => machine.reset(reason),
                _ => {
                    if let Some(&id) = self.cleanup_ids.last() {
                        if let Some(s) = self.states.get_mut(&id) {
                            if let Some(cleanup) = &mut s.cleanup {
                                cleanup.reset(reason);
                            }
                        }
                    }
                }
            }
        }

        if reason == Status::Done && matches!(self.cleanup_reason, None) {
            self.cleanup_ids.clear();
            self.continuations.clear();
            self.prev.clear();
            self.current_id = 0;
            self.running = false;
        }

        self.cleanup_reason = Some(reason);
        self.return_status = Some(Status::Done);
    }
}

fn extract_next(status: &Status, fallthrough: u64) -> u64 {
    match status {
        Status::Next(id) | Status::Continue(id) if *id != 0 => *id,
        Status::Next(_) | Status::Continue(_) => fallthrough,
        _ => fallthrough,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_machine_runs_each_state_once_in_order() {
        let mut sm: StateMachine<Vec<u64>> = StateMachine::new(
            "linear",
            MachineFlags { linear_end: true, ..Default::default() },
        );
        sm.insert_state(1, "one", |log: &mut Vec<u64>| { log.push(1); Status::Next(0) }, None, None);
        sm.insert_state(2, "two", |log: &mut Vec<u64>| { log.push(2); Status::Next(0) }, None, None);
        sm.insert_state(3, "three", |log: &mut Vec<u64>| { log.push(3); Status::Done }, None, None);

        let mut data = Vec::new();
        let status = sm.run(&mut data);
        assert_eq!(status, Status::Done);
        assert_eq!(data, vec![1, 2, 3]);
    }

    #[test]
    fn continue_without_loop_flag_errors_on_revisit() {
        let mut sm: StateMachine<()> = StateMachine::new("loopy", MachineFlags::default());
        sm.insert_state(1, "a", |_: &mut ()| Status::Continue(1), None, None);

        let status = sm.run(&mut ());
        assert_eq!(status, Status::Error(ErrorStatus::InfContinue));
    }

    #[test]
    fn continue_loop_flag_allows_revisits() {
        let mut sm: StateMachine<u32> = StateMachine::new(
            "loopy",
            MachineFlags { continue_loop: true, ..Default::default() },
        );
        sm.insert_state(
            1,
            "a",
            |count: &mut u32| {
                *count += 1;
                if *count >= 3 { Status::Done } else { Status::Continue(1) }
            },
            None,
            None,
        );

        let mut count = 0u32;
        let status = sm.run(&mut count);
        assert_eq!(status, Status::Done);
        assert_eq!(count, 3);
    }

    #[test]
    fn one_cleanup_does_not_rerun_successful_cleanup_but_retries_failed_one() {
        let mut cleanup_a: StateMachine<Vec<&'static str>> = StateMachine::new("cleanup_a", MachineFlags::default());
        cleanup_a.insert_cleanup_state(
            1,
            "wipe",
            |log: &mut Vec<&'static str>, _reason| {
                log.push("wipe");
                Status::Done
            },
            None,
            None,
        );

        let mut sm: StateMachine<Vec<&'static str>> = StateMachine::new(
            "main",
            MachineFlags { linear_end: true, one_cleanup: true, done_cleanup: true, ..Default::default() },
        );
        sm.insert_state(
            1,
            "a",
            |log: &mut Vec<&'static str>| {
                log.push("a");
                Status::Done
            },
            Some(cleanup_a),
            None,
        );

        let mut log = Vec::new();
        let status = sm.run(&mut log);
        assert_eq!(status, Status::Done);
        assert_eq!(log, vec!["a", "wipe"]);
    }

    #[test]
    fn bad_next_without_allowed_transition_errors() {
        let mut sm: StateMachine<()> = StateMachine::new("badnext", MachineFlags { explicit_next: true, ..Default::default() });
        let mut allowed = HashSet::new();
        allowed.insert(2u64);
        sm.insert_state(1, "a", |_: &mut ()| Status::Next(99), None, Some(allowed));

        let status = sm.run(&mut ());
        assert_eq!(status, Status::Error(ErrorStatus::BadNext));
    }
}
