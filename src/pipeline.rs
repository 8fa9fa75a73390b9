//! Component F: bounded multi-stage pipeline scheduler.
//!
//! One worker thread per stage, each stage holding a capacity-1 task slot.
//! A task moves stage to stage only when the next stage's slot is empty;
//! a busy downstream stage back-pressures upstream production. A failure
//! anywhere aborts every queued and in-flight task unless `NOABORT` is set.
//!
//! `cnt` tracks tasks that are queued *or* currently being processed by a
//! stage — everything inserted and not yet finished. `wait(limit)` blocks
//! until `cnt` drops to `limit` or below, letting a caller drain the
//! pipeline without tearing it down.

use crate::lock_ext::MutexExt;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum TaskOutcome {
    Success,
    Fail,
    Abort,
}

pub type StageFn<T> = dyn Fn(&mut T) -> bool + Send + Sync;
pub type FinishFn<T> = dyn Fn(T, TaskOutcome) + Send + Sync;

struct Slot<T> {
    task: Option<T>,
}

struct Shared<T> {
    input: Mutex<VecDeque<T>>,
    input_cv: Condvar,
    slots: Vec<Mutex<Slot<T>>>,
    slot_cv: Vec<Condvar>,
    status_ok: Mutex<bool>,
    shutdown: Mutex<bool>,
    global_cv: Condvar,
    in_flight: Mutex<usize>,
    count_cv: Condvar,
    finish: Arc<FinishFn<T>>,
}

impl<T> Shared<T> {
    /// Run the finish callback and drop the task out of `cnt`, waking
    /// anyone blocked in `wait`.
    fn finish_task(&self, task: T, outcome: TaskOutcome) {
        (self.finish)(task, outcome);
        let mut cnt = self.in_flight.lock_poisoned();
        *cnt -= 1;
        self.count_cv.notify_all();
    }
}

pub struct Pipeline<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> Pipeline<T> {
    /// Spawn one worker thread per stage. `no_abort` mirrors the
    /// `NOABORT` flag: a stage failure no longer cancels sibling tasks.
    pub fn new(stages: Vec<Arc<StageFn<T>>>, finish: Arc<FinishFn<T>>, no_abort: bool) -> Self {
        let nstages = stages.len();
        let shared = Arc::new(Shared {
            input: Mutex::new(VecDeque::new()),
            input_cv: Condvar::new(),
            slots: (0..nstages).map(|_| Mutex::new(Slot { task: None })).collect(),
            slot_cv: (0..nstages).map(|_| Condvar::new()).collect(),
            status_ok: Mutex::new(true),
            shutdown: Mutex::new(false),
            global_cv: Condvar::new(),
            in_flight: Mutex::new(0),
            count_cv: Condvar::new(),
            finish,
        });

        let mut workers = Vec::with_capacity(nstages);
        for (idx, stage) in stages.into_iter().enumerate() {
            let shared = Arc::clone(&shared);
            workers.push(std::thread::spawn(move || {
                Self::stage_loop(shared, idx, nstages, stage, no_abort);
            }));
        }

        Pipeline { shared, workers }
    }

    fn take_task(shared: &Arc<Shared<T>>, idx: usize) -> Option<T> {
        if idx == 0 {
            let mut input = shared.input.lock_poisoned();
            loop {
                if let Some(task) = input.pop_front() {
                    return Some(task);
                }
                if *shared.shutdown.lock_poisoned() {
                    return None;
                }
                input = shared.input_cv.wait(input).unwrap_or_else(|e| e.into_inner());
            }
        } else {
            let mut slot = shared.slots[idx].lock_poisoned();
            loop {
                if let Some(task) = slot.task.take() {
                    shared.slot_cv[idx].notify_all();
                    return Some(task);
                }
                if *shared.shutdown.lock_poisoned() {
                    return None;
                }
                slot = shared.global_cv.wait(slot).unwrap_or_else(|e| e.into_inner());
            }
        }
    }

    fn hand_off(shared: &Arc<Shared<T>>, idx: usize, task: T) {
        let mut slot = shared.slots[idx].lock_poisoned();
        while slot.task.is_some() {
            slot = shared.slot_cv[idx].wait(slot).unwrap_or_else(|e| e.into_inner());
        }
        slot.task = Some(task);
        shared.global_cv.notify_all();
    }

    fn stage_loop(shared: Arc<Shared<T>>, idx: usize, nstages: usize, stage: Arc<StageFn<T>>, no_abort: bool) {
        loop {
            let Some(mut task) = Self::take_task(&shared, idx) else {
                return;
            };

            if !*shared.status_ok.lock_poisoned() {
                shared.finish_task(task, TaskOutcome::Abort);
                continue;
            }

            let ok = stage(&mut task);

            if ok && idx + 1 < nstages {
                Self::hand_off(&shared, idx + 1, task);
                continue;
            }

            if ok {
                shared.finish_task(task, TaskOutcome::Success);
            } else {
                if !no_abort {
                    *shared.status_ok.lock_poisoned() = false;
                    shared.global_cv.notify_all();
                    shared.input_cv.notify_all();
                }
                shared.finish_task(task, TaskOutcome::Fail);
            }
        }
    }

    /// Queue a new task at stage 0.
    pub fn insert(&self, task: T) {
        *self.shared.in_flight.lock_poisoned() += 1;
        self.shared.input.lock_poisoned().push_back(task);
        self.shared.input_cv.notify_one();
    }

    /// Number of tasks queued or currently being processed by a stage.
    pub fn queue_count(&self) -> usize {
        *self.shared.in_flight.lock_poisoned()
    }

    /// Block until the number of queued-or-in-flight tasks drops to
    /// `limit` or below.
    pub fn wait(&self, limit: usize) {
        let mut cnt = self.shared.in_flight.lock_poisoned();
        while *cnt > limit {
            cnt = self.shared.count_cv.wait(cnt).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// `true` unless a stage has failed and abort was not suppressed.
    pub fn status_ok(&self) -> bool {
        *self.shared.status_ok.lock_poisoned()
    }

    /// Stop accepting new work, abort everything still queued, then wait
    /// for in-flight tasks to finish and join every worker thread.
    pub fn shutdown(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        *self.shared.shutdown.lock_poisoned() = true;

        let drained: Vec<T> = self.shared.input.lock_poisoned().drain(..).collect();
        for task in drained {
            self.shared.finish_task(task, TaskOutcome::Abort);
        }

        self.shared.input_cv.notify_all();
        self.shared.global_cv.notify_all();

        self.wait(0);

        for w in self.workers.drain(..) {
            let _ = w.join();
        }
    }
}

impl<T: Send + 'static> Drop for Pipeline<T> {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn tasks_flow_through_every_stage_in_order() {
        let stages: Vec<Arc<StageFn<i32>>> = vec![
            Arc::new(|n: &mut i32| { *n += 1; true }),
            Arc::new(|n: &mut i32| { *n *= 2; true }),
        ];
        let (tx, rx) = mpsc::channel();
        let finish: Arc<FinishFn<i32>> = Arc::new(move |task, outcome| {
            tx.send((task, outcome)).unwrap();
        });

        let pipeline = Pipeline::new(stages, finish, false);
        pipeline.insert(1);
        pipeline.insert(5);

        let mut results: Vec<(i32, TaskOutcome)> = (0..2).map(|_| rx.recv().unwrap()).collect();
        results.sort();
        assert_eq!(results, vec![(4, TaskOutcome::Success), (12, TaskOutcome::Success)]);

        pipeline.wait(0);
        assert_eq!(pipeline.queue_count(), 0);
    }

    #[test]
    fn failure_aborts_remaining_tasks_unless_noabort() {
        let stages: Vec<Arc<StageFn<i32>>> = vec![Arc::new(|n: &mut i32| *n != 13)];
        let (tx, rx) = mpsc::channel();
        let finish: Arc<FinishFn<i32>> = Arc::new(move |task, outcome| {
            tx.send((task, outcome)).unwrap();
        });

        let pipeline = Pipeline::new(stages, finish, false);
        pipeline.insert(13);
        let (_, outcome) = rx.recv().unwrap();
        assert_eq!(outcome, TaskOutcome::Fail);

        // give the status flag time to propagate before checking
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!pipeline.status_ok());
    }

    #[test]
    fn wait_blocks_until_in_flight_count_drops() {
        let stages: Vec<Arc<StageFn<i32>>> =
            vec![Arc::new(|n: &mut i32| { std::thread::sleep(std::time::Duration::from_millis(30)); *n += 1; true })];
        let (tx, rx) = mpsc::channel();
        let finish: Arc<FinishFn<i32>> = Arc::new(move |task, outcome| {
            tx.send((task, outcome)).unwrap();
        });

        let pipeline = Pipeline::new(stages, finish, false);
        pipeline.insert(1);
        pipeline.insert(2);
        assert_eq!(pipeline.queue_count(), 2);

        pipeline.wait(0);
        assert_eq!(pipeline.queue_count(), 0);

        let mut results: Vec<i32> = (0..2).map(|_| rx.recv().unwrap().0).collect();
        results.sort();
        assert_eq!(results, vec![2, 3]);
    }

    #[test]
    fn shutdown_aborts_tasks_still_queued() {
        let stages: Vec<Arc<StageFn<i32>>> =
            vec![Arc::new(|n: &mut i32| { std::thread::sleep(std::time::Duration::from_millis(50)); *n += 1; true })];
        let (tx, rx) = mpsc::channel();
        let finish: Arc<FinishFn<i32>> = Arc::new(move |task, outcome| {
            tx.send((task, outcome)).unwrap();
        });

        let pipeline = Pipeline::new(stages, finish, false);
        pipeline.insert(1);
        pipeline.insert(2);
        pipeline.insert(3);
        pipeline.shutdown();

        let mut outcomes: Vec<TaskOutcome> = (0..3).map(|_| rx.recv().unwrap().1).collect();
        outcomes.sort_by_key(|o| *o as u8);
        assert!(outcomes.contains(&TaskOutcome::Abort));
    }
}
