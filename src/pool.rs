//! A process-wide dynamic worker pool.
//!
//! Work is submitted in groups. Each [`WorkItem`] is repeatedly asked for
//! its next unit of work and told to execute it; items of one group run
//! freely in parallel, but a single item is never run by two threads at
//! once. Groups created from inside a running item are scheduled at a
//! deeper nesting level and preferred by the workers, so deep work trees
//! progress front-to-back instead of exploding breadth-first.
//!
//! Threads are created on demand up to roughly the hardware concurrency,
//! park on a condvar when idle, and exit after an idle timeout. On Linux
//! the pool periodically inspects `/proc/self/task` to tell runnable
//! threads from blocked ones and rebalances; where that file is absent or
//! lies (containers, sandboxes), it falls back to the plain
//! create-up-to-hardware-concurrency policy rather than stalling.

use std::cell::Cell;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use lazy_static::lazy_static;
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::deadline::{Countdown, Deadline};
use crate::error::{Error, Result};

/// Returned from [`WorkItem::next`] when the item is finished for good.
pub const WORK_DONE: isize = -1;
/// Returned from [`WorkItem::next`] to be called again later, optionally
/// no earlier than the deadline written through the `next` parameter.
pub const WORK_LATER: isize = 0;

/// A unit of schedulable work.
///
/// `next` hands out positive sentinels naming the next piece of work;
/// `execute` performs one. A failing `execute` cancels the rest of the
/// group. `group_complete` runs exactly once per item after the whole
/// group finished or was cancelled.
pub trait WorkItem: Send {
    /// Returns [`WORK_DONE`], [`WORK_LATER`] (with an optional wake-up
    /// deadline written to `deadline`), or a positive work sentinel.
    fn next(&mut self, deadline: &mut Option<Deadline>) -> isize;

    /// Performs the unit of work named by `work`.
    fn execute(&mut self, work: isize) -> Result<()>;

    /// Called once all items in the group have finished or been
    /// cancelled. `cancelled` carries the group's failure cause, if any.
    fn group_complete(&mut self, cancelled: Option<Error>) {
        let _ = cancelled;
    }
}

struct ItemSlot {
    item: Mutex<Box<dyn WorkItem>>,
    done: AtomicBool,
}

struct GroupState {
    slots: Vec<Arc<ItemSlot>>,
    live: usize,
    stopping: bool,
    first_error: Option<Error>,
    // Items submitted while the group was stopping; promoted to live once
    // the group goes idle again.
    parked: Vec<Box<dyn WorkItem>>,
    last_result: Option<Result<()>>,
}

struct GroupInner {
    nesting: usize,
    state: Mutex<GroupState>,
    completed: Condvar,
}

#[derive(Clone)]
struct Task {
    group: Arc<GroupInner>,
    slot: Arc<ItemSlot>,
}

struct SteadyTimer {
    due: Instant,
    task: Task,
}

struct SystemTimer {
    due: SystemTime,
    task: Task,
}

// The heaps are min-heaps on the due time; only the time takes part in
// the ordering.
macro_rules! timer_ord {
    ($ty:ident) => {
        impl PartialEq for $ty {
            fn eq(&self, other: &Self) -> bool {
                self.due == other.due
            }
        }
        impl Eq for $ty {}
        impl PartialOrd for $ty {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }
        impl Ord for $ty {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                other.due.cmp(&self.due)
            }
        }
    };
}
timer_ord!(SteadyTimer);
timer_ord!(SystemTimer);

const IDLE_TIMEOUT: Duration = Duration::from_secs(20);
const REBALANCE_INTERVAL: Duration = Duration::from_millis(100);

struct PoolState {
    // One run queue per nesting level; workers pull from the deepest
    // non-empty one.
    run_queues: Vec<VecDeque<Task>>,
    steady_timers: BinaryHeap<SteadyTimer>,
    system_timers: BinaryHeap<SystemTimer>,
    threads: usize,
    total_items: usize,
    last_rebalance: Instant,
    shrink_hint: bool,
}

struct Pool {
    state: Mutex<PoolState>,
    work_ready: Condvar,
}

lazy_static! {
    static ref POOL: Pool = Pool {
        state: Mutex::new(PoolState {
            run_queues: Vec::new(),
            steady_timers: BinaryHeap::new(),
            system_timers: BinaryHeap::new(),
            threads: 0,
            total_items: 0,
            last_rebalance: Instant::now(),
            shrink_hint: false,
        }),
        work_ready: Condvar::new(),
    };
}

thread_local! {
    static NESTING: Cell<usize> = const { Cell::new(0) };
}

fn hardware_concurrency() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

// Counts runnable and total threads of this process from /proc. `None`
// when the scan is impossible, in which case callers must not assume
// anything about blocked threads.
#[cfg(target_os = "linux")]
fn thread_activity() -> Option<(usize, usize)> {
    let entries = std::fs::read_dir("/proc/self/task").ok()?;
    let mut running = 0usize;
    let mut total = 0usize;
    for entry in entries.flatten() {
        let stat = std::fs::read_to_string(entry.path().join("stat")).ok()?;
        // The state field follows the parenthesized comm, which may itself
        // contain spaces and parentheses.
        let close = stat.rfind(')')?;
        let state = stat.as_bytes().get(close + 2).copied()?;
        total += 1;
        if state == b'R' {
            running += 1;
        }
    }
    Some((running, total))
}

#[cfg(not(target_os = "linux"))]
fn thread_activity() -> Option<(usize, usize)> {
    None
}

impl Pool {
    fn enqueue(&self, task: Task, fresh_item: bool) {
        let nesting = task.group.nesting;
        let mut st = self.state.lock();
        if st.run_queues.len() <= nesting {
            st.run_queues.resize_with(nesting + 1, VecDeque::new);
        }
        st.run_queues[nesting].push_back(task);
        if fresh_item {
            st.total_items += 1;
        }
        self.ensure_threads(&mut st);
        drop(st);
        self.work_ready.notify_one();
    }

    fn ensure_threads(&self, st: &mut PoolState) {
        let target = hardware_concurrency().min(st.total_items).max(1);
        while st.threads < target {
            st.threads += 1;
            std::thread::Builder::new()
                .name("relio-pool-worker".into())
                .spawn(worker_loop)
                .map_err(|err| {
                    st.threads -= 1;
                    warn!("could not spawn pool worker: {err}");
                })
                .ok();
        }
    }

    // Grow or shrink based on what the kernel says our threads are doing.
    fn rebalance(&self, st: &mut PoolState) {
        if st.last_rebalance.elapsed() < REBALANCE_INTERVAL {
            return;
        }
        st.last_rebalance = Instant::now();
        let hw = hardware_concurrency();
        if let Some((running, _total)) = thread_activity() {
            let target = hw.min(st.total_items);
            if running < target && st.threads < hw + 3 && queued(st) > 0 {
                debug!("pool growing: {running} runnable of target {target}");
                st.threads += 1;
                if std::thread::Builder::new()
                    .name("relio-pool-worker".into())
                    .spawn(worker_loop)
                    .is_err()
                {
                    st.threads -= 1;
                }
            } else if running > hw + 3 {
                st.shrink_hint = true;
            }
        }
    }
}

fn queued(st: &PoolState) -> usize {
    st.run_queues.iter().map(|q| q.len()).sum()
}

fn promote_due_timers(st: &mut PoolState) {
    let now = Instant::now();
    while st.steady_timers.peek().is_some_and(|t| t.due <= now) {
        let t = st.steady_timers.pop().unwrap();
        let nesting = t.task.group.nesting;
        if st.run_queues.len() <= nesting {
            st.run_queues.resize_with(nesting + 1, VecDeque::new);
        }
        st.run_queues[nesting].push_back(t.task);
    }
    let now = SystemTime::now();
    while st.system_timers.peek().is_some_and(|t| t.due <= now) {
        let t = st.system_timers.pop().unwrap();
        let nesting = t.task.group.nesting;
        if st.run_queues.len() <= nesting {
            st.run_queues.resize_with(nesting + 1, VecDeque::new);
        }
        st.run_queues[nesting].push_back(t.task);
    }
}

fn pop_task(st: &mut PoolState) -> Option<Task> {
    // Deepest nesting first.
    for q in st.run_queues.iter_mut().rev() {
        if let Some(task) = q.pop_front() {
            return Some(task);
        }
    }
    None
}

fn next_timer_in(st: &PoolState) -> Option<Duration> {
    let steady = st
        .steady_timers
        .peek()
        .map(|t| t.due.saturating_duration_since(Instant::now()));
    let system = st.system_timers.peek().map(|t| {
        t.due
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO)
    });
    match (steady, system) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

fn worker_loop() {
    let pool: &Pool = &POOL;
    loop {
        let task = {
            let mut st = pool.state.lock();
            loop {
                promote_due_timers(&mut st);
                if let Some(task) = pop_task(&mut st) {
                    break task;
                }
                pool.rebalance(&mut st);
                if st.shrink_hint {
                    st.shrink_hint = false;
                    st.threads -= 1;
                    return;
                }
                let timeout = next_timer_in(&st)
                    .map(|t| t.min(IDLE_TIMEOUT).max(Duration::from_millis(1)))
                    .unwrap_or(IDLE_TIMEOUT);
                let timed_out = pool
                    .work_ready
                    .wait_for(&mut st, timeout)
                    .timed_out();
                if timed_out {
                    promote_due_timers(&mut st);
                    if let Some(task) = pop_task(&mut st) {
                        break task;
                    }
                    if st.steady_timers.is_empty() && st.system_timers.is_empty() {
                        st.threads -= 1;
                        return;
                    }
                }
            }
        };
        run_task(pool, task);
    }
}

fn run_task(pool: &Pool, task: Task) {
    let group = task.group.clone();
    if group.state.lock().stopping {
        finish_item(pool, &task);
        return;
    }
    let previous_nesting = NESTING.with(|n| n.get());
    NESTING.with(|n| n.set(group.nesting + 1));
    let outcome = {
        let mut item = task.slot.item.lock();
        let mut deadline = None;
        let verdict = item.next(&mut deadline);
        match verdict {
            WORK_DONE => Outcome::Finished,
            WORK_LATER => Outcome::Later(deadline),
            work => match item.execute(work) {
                Ok(()) => Outcome::MoreToDo,
                Err(err) => Outcome::Failed(err),
            },
        }
    };
    NESTING.with(|n| n.set(previous_nesting));
    match outcome {
        Outcome::Finished => finish_item(pool, &task),
        Outcome::MoreToDo => pool.enqueue(task, false),
        Outcome::Later(deadline) => {
            let mut st = pool.state.lock();
            match deadline {
                Some(Deadline::After(d)) if !d.is_zero() => st.steady_timers.push(SteadyTimer {
                    due: Instant::now() + d,
                    task: task.clone(),
                }),
                Some(Deadline::At(t)) => {
                    st.system_timers.push(SystemTimer { due: t, task: task.clone() })
                }
                _ => {
                    let nesting = task.group.nesting;
                    if st.run_queues.len() <= nesting {
                        st.run_queues.resize_with(nesting + 1, VecDeque::new);
                    }
                    st.run_queues[nesting].push_back(task.clone());
                }
            }
            drop(st);
            pool.work_ready.notify_one();
        }
        Outcome::Failed(err) => {
            {
                let mut gs = group.state.lock();
                if gs.first_error.is_none() {
                    gs.first_error = Some(err);
                }
                gs.stopping = true;
            }
            finish_item(pool, &task);
        }
    }
}

enum Outcome {
    Finished,
    MoreToDo,
    Later(Option<Deadline>),
    Failed(Error),
}

fn finish_item(pool: &Pool, task: &Task) {
    if task.slot.done.swap(true, Ordering::AcqRel) {
        return;
    }
    {
        let mut st = pool.state.lock();
        st.total_items = st.total_items.saturating_sub(1);
    }
    let group = &task.group;
    let completion = {
        let mut gs = group.state.lock();
        gs.live -= 1;
        if gs.live == 0 {
            Some((std::mem::take(&mut gs.slots), gs.first_error))
        } else {
            None
        }
    };
    if let Some((slots, error)) = completion {
        for slot in &slots {
            slot.item.lock().group_complete(error);
        }
        let parked = {
            let mut gs = group.state.lock();
            gs.last_result = Some(match error {
                Some(err) => Err(err),
                None => Ok(()),
            });
            gs.stopping = false;
            gs.first_error = None;
            std::mem::take(&mut gs.parked)
        };
        group.completed.notify_all();
        for item in parked {
            submit_to(group.clone(), item);
        }
    }
}

fn submit_to(group: Arc<GroupInner>, item: Box<dyn WorkItem>) {
    let slot = {
        let mut gs = group.state.lock();
        if gs.stopping {
            gs.parked.push(item);
            return;
        }
        let slot = Arc::new(ItemSlot { item: Mutex::new(item), done: AtomicBool::new(false) });
        gs.slots.push(slot.clone());
        gs.live += 1;
        gs.last_result = None;
        slot
    };
    POOL.enqueue(Task { group, slot }, true);
}

/// A group of related work items sharing a completion result and a
/// cancellation flag.
pub struct WorkGroup {
    inner: Arc<GroupInner>,
}

impl std::fmt::Debug for WorkGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkGroup")
            .field("nesting", &self.inner.nesting)
            .finish()
    }
}

impl Default for WorkGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkGroup {
    /// Creates a group. Created from inside a running work item, the new
    /// group nests one level deeper and its items are scheduled
    /// preferentially.
    pub fn new() -> WorkGroup {
        let nesting = NESTING.with(|n| n.get());
        WorkGroup {
            inner: Arc::new(GroupInner {
                nesting,
                state: Mutex::new(GroupState {
                    slots: Vec::new(),
                    live: 0,
                    stopping: false,
                    first_error: None,
                    parked: Vec::new(),
                    last_result: None,
                }),
                completed: Condvar::new(),
            }),
        }
    }

    /// Submits an item. If the group is currently stopping, the item is
    /// parked and promoted once the group has gone idle.
    pub fn submit(&self, item: Box<dyn WorkItem>) {
        submit_to(self.inner.clone(), item);
    }

    /// Requests cancellation: running items stop at their next
    /// `next`/`execute` boundary and the group completes with
    /// [`Error::Cancelled`] unless it already failed with something else.
    pub fn stop(&self) {
        let mut gs = self.inner.state.lock();
        if gs.live == 0 {
            return;
        }
        if gs.first_error.is_none() {
            gs.first_error = Some(Error::Cancelled);
        }
        gs.stopping = true;
    }

    /// Waits for every live item to finish, returning the group's result.
    pub fn wait(&self, deadline: Option<Deadline>) -> Result<()> {
        let countdown = Countdown::begin(deadline);
        let mut gs = self.inner.state.lock();
        loop {
            if gs.live == 0 {
                return gs.last_result.take().unwrap_or(Ok(()));
            }
            match countdown.remaining() {
                None => self.inner.completed.wait(&mut gs),
                Some(left) => {
                    if left.is_zero() {
                        return Err(Error::TimedOut);
                    }
                    self.inner.completed.wait_for(&mut gs, left);
                }
            }
        }
    }
}

/// Tuning knobs for [`IoAwareWorkItem`], defaulted for SSDs.
#[derive(Debug, Clone, Copy)]
pub struct IoAwareTuning {
    /// Fraction of wall time the device may be busy before throttling.
    pub max_iosbusytime: f64,
    /// Throttling stops once in-flight I/O falls below this.
    pub min_iosinprogress: u64,
    /// Throttling starts once in-flight I/O exceeds this (and the busy
    /// fraction exceeds `max_iosbusytime`).
    pub max_iosinprogress: u64,
}

impl Default for IoAwareTuning {
    fn default() -> Self {
        IoAwareTuning { max_iosbusytime: 0.95, min_iosinprogress: 16, max_iosinprogress: 32 }
    }
}

#[derive(Debug)]
struct DeviceSample {
    major: u32,
    minor: u32,
    last_ticks_ms: u64,
    last_at: Instant,
    busy_avg: f64,
    inflight: u64,
}

/// A work item wrapper that watches the I/O load of the devices backing a
/// set of handles and paces itself when they saturate.
///
/// Before each scheduling decision the backing devices' busy time and
/// in-flight I/O are sampled; while a device is saturated the item asks to
/// be called later with a growing delay, and the delay is removed when the
/// load subsides. The expected-operation counts describe this item's own
/// contribution and size the delay growth.
pub struct IoAwareWorkItem<I: WorkItem> {
    inner: I,
    devices: Vec<DeviceSample>,
    tuning: IoAwareTuning,
    delay: Duration,
    throttled: bool,
}

/// Expected I/O of one handle inside an [`IoAwareWorkItem`].
#[derive(Debug, Clone, Copy)]
pub struct ExpectedIo {
    /// Reads the item expects to issue against the handle.
    pub reads: u64,
    /// Writes the item expects to issue against the handle.
    pub writes: u64,
    /// Barriers the item expects to issue against the handle.
    pub barriers: u64,
}

impl<I: WorkItem> IoAwareWorkItem<I> {
    /// Wraps `inner`, watching the devices backing `handles`.
    pub fn new(
        inner: I,
        handles: &[(&crate::handle::Handle, ExpectedIo)],
        tuning: IoAwareTuning,
    ) -> Result<IoAwareWorkItem<I>> {
        let mut devices: Vec<DeviceSample> = Vec::new();
        for (h, _expected) in handles {
            let id = h.fetch_inode()?;
            let major = libc::major(id.dev as libc::dev_t) as u32;
            let minor = libc::minor(id.dev as libc::dev_t) as u32;
            if !devices.iter().any(|d| d.major == major && d.minor == minor) {
                devices.push(DeviceSample {
                    major,
                    minor,
                    last_ticks_ms: 0,
                    last_at: Instant::now(),
                    busy_avg: 0.0,
                    inflight: 0,
                });
            }
        }
        Ok(IoAwareWorkItem {
            inner,
            devices,
            tuning,
            delay: Duration::ZERO,
            throttled: false,
        })
    }

    #[cfg(target_os = "linux")]
    fn sample(&mut self) {
        let Ok(stats) = std::fs::read_to_string("/proc/diskstats") else {
            return;
        };
        for line in stats.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 13 {
                continue;
            }
            let (Ok(major), Ok(minor)) = (fields[0].parse::<u32>(), fields[1].parse::<u32>())
            else {
                continue;
            };
            let Some(dev) = self
                .devices
                .iter_mut()
                .find(|d| d.major == major && d.minor == minor)
            else {
                continue;
            };
            let inflight: u64 = fields[11].parse().unwrap_or(0);
            let ticks_ms: u64 = fields[12].parse().unwrap_or(0);
            let elapsed = dev.last_at.elapsed();
            if dev.last_ticks_ms != 0 && !elapsed.is_zero() {
                let busy = (ticks_ms.saturating_sub(dev.last_ticks_ms)) as f64
                    / elapsed.as_millis().max(1) as f64;
                dev.busy_avg = dev.busy_avg * 0.875 + busy.min(1.0) * 0.125;
            }
            dev.last_ticks_ms = ticks_ms;
            dev.last_at = Instant::now();
            dev.inflight = inflight;
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn sample(&mut self) {}

    fn saturated(&self) -> bool {
        self.devices.iter().any(|d| {
            if self.throttled {
                // Throttling is removed only once the busy time has
                // dropped below the threshold and in-flight I/O below
                // the floor.
                d.busy_avg >= self.tuning.max_iosbusytime
                    || d.inflight >= self.tuning.min_iosinprogress
            } else {
                d.busy_avg > self.tuning.max_iosbusytime
                    && d.inflight > self.tuning.max_iosinprogress
            }
        })
    }
}

impl<I: WorkItem> WorkItem for IoAwareWorkItem<I> {
    fn next(&mut self, deadline: &mut Option<Deadline>) -> isize {
        self.sample();
        if !self.devices.is_empty() && self.saturated() {
            self.throttled = true;
            self.delay = (self.delay * 2).clamp(Duration::from_micros(500), Duration::from_millis(100));
            *deadline = Some(Deadline::After(self.delay));
            return WORK_LATER;
        }
        self.throttled = false;
        self.delay = Duration::ZERO;
        self.inner.next(deadline)
    }

    fn execute(&mut self, work: isize) -> Result<()> {
        self.inner.execute(work)
    }

    fn group_complete(&mut self, cancelled: Option<Error>) {
        self.inner.group_complete(cancelled);
    }
}

impl<I: WorkItem> std::fmt::Debug for IoAwareWorkItem<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoAwareWorkItem")
            .field("devices", &self.devices)
            .field("throttled", &self.throttled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountTo {
        target: usize,
        issued: usize,
        counter: Arc<AtomicUsize>,
        completions: Arc<AtomicUsize>,
    }

    impl WorkItem for CountTo {
        fn next(&mut self, _deadline: &mut Option<Deadline>) -> isize {
            if self.issued == self.target {
                WORK_DONE
            } else {
                self.issued += 1;
                self.issued as isize
            }
        }

        fn execute(&mut self, _work: isize) -> Result<()> {
            self.counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn group_complete(&mut self, _cancelled: Option<Error>) {
            self.completions.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn items_run_to_completion() {
        let counter = Arc::new(AtomicUsize::new(0));
        let completions = Arc::new(AtomicUsize::new(0));
        let group = WorkGroup::new();
        for _ in 0..8 {
            group.submit(Box::new(CountTo {
                target: 10,
                issued: 0,
                counter: counter.clone(),
                completions: completions.clone(),
            }));
        }
        group.wait(None).unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 80);
        assert_eq!(completions.load(Ordering::Relaxed), 8);
    }

    struct FailsOnThird {
        issued: usize,
    }

    impl WorkItem for FailsOnThird {
        fn next(&mut self, _deadline: &mut Option<Deadline>) -> isize {
            self.issued += 1;
            self.issued as isize
        }

        fn execute(&mut self, work: isize) -> Result<()> {
            if work == 3 {
                Err(Error::PermissionDenied)
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn first_failure_becomes_group_result() {
        let group = WorkGroup::new();
        group.submit(Box::new(FailsOnThird { issued: 0 }));
        assert_eq!(group.wait(None).unwrap_err(), Error::PermissionDenied);
    }

    struct SleepyThenDone {
        asked: bool,
        woke_at: Arc<Mutex<Option<Instant>>>,
    }

    impl WorkItem for SleepyThenDone {
        fn next(&mut self, deadline: &mut Option<Deadline>) -> isize {
            if !self.asked {
                self.asked = true;
                *deadline = Some(Deadline::After(Duration::from_millis(50)));
                return WORK_LATER;
            }
            *self.woke_at.lock() = Some(Instant::now());
            WORK_DONE
        }

        fn execute(&mut self, _work: isize) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn timer_deadline_delays_rescheduling() {
        let woke_at = Arc::new(Mutex::new(None));
        let started = Instant::now();
        let group = WorkGroup::new();
        group.submit(Box::new(SleepyThenDone { asked: false, woke_at: woke_at.clone() }));
        group.wait(None).unwrap();
        let woke = woke_at.lock().unwrap();
        assert!(woke.duration_since(started) >= Duration::from_millis(45));
    }

    struct Endless;

    impl WorkItem for Endless {
        fn next(&mut self, _deadline: &mut Option<Deadline>) -> isize {
            1
        }

        fn execute(&mut self, _work: isize) -> Result<()> {
            std::thread::sleep(Duration::from_millis(1));
            Ok(())
        }
    }

    #[test]
    fn stop_cancels_the_group() {
        let group = WorkGroup::new();
        group.submit(Box::new(Endless));
        std::thread::sleep(Duration::from_millis(20));
        group.stop();
        assert_eq!(group.wait(None).unwrap_err(), Error::Cancelled);
    }

    #[test]
    fn wait_deadline_expires() {
        let group = WorkGroup::new();
        group.submit(Box::new(Endless));
        let err = group
            .wait(Some(Deadline::After(Duration::from_millis(30))))
            .unwrap_err();
        assert_eq!(err, Error::TimedOut);
        group.stop();
        let _ = group.wait(None);
    }
}
