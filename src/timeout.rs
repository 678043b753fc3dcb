//! Renewable timers driven by a single background thread.
//!
//! A timer fires its callback every time its deadline passes, after which it is rescheduled with a fresh randomized
//! delay. Callbacks run on the timer thread while the timer table is locked, so they must be short; the consensus
//! timers only post a message to an inbox. Because [`RenewableTimeout::cancel`] takes the same lock, a cancelled timer
//! never fires afterwards.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Schedules and fires [`RenewableTimeout`]s.
pub struct TimeoutService {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

/// A handle to a periodic timer created by [`TimeoutService::create`].
pub struct RenewableTimeout {
    id: u64,
    name: String,
    shared: Arc<Shared>,
}

struct Shared {
    timers: Mutex<Timers>,
    condvar: Condvar,
}

struct Timers {
    entries: HashMap<u64, Timer>,
    next_id: u64,
    shutdown: bool,
    random: StdRng,
}

struct Timer {
    name: String,
    delay: Duration,
    randomness: Duration,
    deadline: Instant,
    callback: Box<dyn FnMut() + Send>,
}

/// A timer whose deadline can be pushed back.
///
/// [`RaftMachine`](crate::consensus::RaftMachine) only renews and cancels its timers, so anything counting down to a
/// deadline, such as a simulated clock, can drive it.
pub trait Renewable: Send {
    fn renew(&self);
    fn cancel(&self);
}

/// Returns `delay` extended by a uniformly random amount in `[0, randomness)`.
pub fn random_delay(random: &mut impl Rng, delay: Duration, randomness: Duration) -> Duration {
    let randomness = randomness.as_nanos() as u64;
    if randomness == 0 {
        return delay;
    }
    delay + Duration::from_nanos(random.gen_range(0..randomness))
}

//
// TimeoutService impls
//

impl TimeoutService {
    pub fn start() -> Self {
        Self::with_random(StdRng::from_entropy())
    }

    /// Starts a service drawing its timer jitter from `random`.
    pub fn with_random(random: StdRng) -> Self {
        let shared = Arc::new(Shared {
            timers: Mutex::new(Timers {
                entries: HashMap::new(),
                next_id: 0,
                shutdown: false,
                random,
            }),
            condvar: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("raft-timeouts".to_string())
            .spawn(move || thread_shared.run());
        let thread = match thread {
            Ok(thread) => Some(thread),
            Err(error) => {
                warn!("failed to start timeout thread: {}", error);
                None
            }
        };
        Self { shared, thread }
    }

    /// Creates a timer which first fires after `delay` plus up to `randomness`, and again after each such interval
    /// until cancelled.
    pub fn create(
        &self,
        name: impl Into<String>,
        delay: Duration,
        randomness: Duration,
        callback: impl FnMut() + Send + 'static,
    ) -> RenewableTimeout {
        let name = name.into();
        let mut timers = self.shared.timers.lock();
        let id = timers.next_id;
        timers.next_id += 1;
        let deadline = Instant::now() + random_delay(&mut timers.random, delay, randomness);
        timers.entries.insert(
            id,
            Timer {
                name: name.clone(),
                delay,
                randomness,
                deadline,
                callback: Box::new(callback),
            },
        );
        self.shared.condvar.notify_one();
        debug!("created timeout {} with delay {:?}", name, delay);
        RenewableTimeout {
            id,
            name,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Stops the timer thread. No callback runs after this returns.
    pub fn shutdown(&mut self) {
        self.shared.timers.lock().shutdown = true;
        self.shared.condvar.notify_one();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("timeout thread panicked");
            }
        }
    }
}

impl Drop for TimeoutService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//
// RenewableTimeout impls
//

impl RenewableTimeout {
    /// Pushes the deadline back to a fresh randomized delay from now. Has no effect once cancelled.
    pub fn renew(&self) {
        let mut timers = self.shared.timers.lock();
        let Timers {
            entries, random, ..
        } = &mut *timers;
        if let Some(timer) = entries.get_mut(&self.id) {
            timer.deadline = Instant::now() + random_delay(random, timer.delay, timer.randomness);
            self.shared.condvar.notify_one();
        }
    }

    /// Cancels the timer. Its callback is never invoked again.
    pub fn cancel(&self) {
        if self.shared.timers.lock().entries.remove(&self.id).is_some() {
            debug!("cancelled timeout {}", self.name);
            self.shared.condvar.notify_one();
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Renewable for RenewableTimeout {
    fn renew(&self) {
        RenewableTimeout::renew(self)
    }

    fn cancel(&self) {
        RenewableTimeout::cancel(self)
    }
}

//
// Shared impls
//

impl Shared {
    fn run(&self) {
        let mut timers = self.timers.lock();
        while !timers.shutdown {
            let now = Instant::now();
            let next = timers
                .entries
                .iter()
                .min_by_key(|(_, timer)| timer.deadline)
                .map(|(id, timer)| (*id, timer.deadline));
            match next {
                Some((id, deadline)) if deadline <= now => {
                    let Timers {
                        entries, random, ..
                    } = &mut *timers;
                    if let Some(timer) = entries.get_mut(&id) {
                        verbose!("timeout {} fired", timer.name);
                        (timer.callback)();
                        timer.deadline = now + random_delay(random, timer.delay, timer.randomness);
                    }
                }
                Some((_, deadline)) => {
                    self.condvar.wait_until(&mut timers, deadline);
                }
                None => self.condvar.wait(&mut timers),
            }
        }
    }
}
