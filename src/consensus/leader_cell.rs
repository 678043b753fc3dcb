use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::NoLeaderFoundError;
use crate::member::MemberId;

/// The leader most recently known to this member, which other threads can wait on.
#[derive(Default)]
pub struct LeaderCell {
    slot: Mutex<Slot>,
    changed: Condvar,
}

#[derive(Default)]
struct Slot {
    leader: Option<MemberId>,
    interrupted: bool,
}

impl LeaderCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, leader: Option<MemberId>) {
        let mut slot = self.slot.lock();
        slot.leader = leader;
        if leader.is_some() {
            self.changed.notify_all();
        }
    }

    pub fn get(&self) -> Option<MemberId> {
        self.slot.lock().leader
    }

    /// Returns the leader, waiting up to `timeout` for one to become known. A zero timeout never blocks.
    pub fn await_leader(&self, timeout: Duration) -> Result<MemberId, NoLeaderFoundError> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        loop {
            if slot.interrupted {
                return Err(NoLeaderFoundError::Interrupted);
            }
            if let Some(leader) = slot.leader {
                return Ok(leader);
            }
            if timeout.is_zero() || self.changed.wait_until(&mut slot, deadline).timed_out() {
                return match slot.leader {
                    Some(leader) if !slot.interrupted => Ok(leader),
                    _ => Err(NoLeaderFoundError::Timeout(timeout)),
                };
            }
        }
    }

    /// Wakes every waiter with [`NoLeaderFoundError::Interrupted`], now and in the future.
    pub fn interrupt(&self) {
        self.slot.lock().interrupted = true;
        self.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn zero_timeout_does_not_block() {
        let cell = LeaderCell::new();
        assert!(matches!(
            cell.await_leader(Duration::ZERO),
            Err(NoLeaderFoundError::Timeout(_))
        ));
    }

    #[test]
    fn waiter_sees_leader_set_later() {
        let cell = Arc::new(LeaderCell::new());
        let leader = MemberId::random();
        let waiter = {
            let cell = Arc::clone(&cell);
            thread::spawn(move || cell.await_leader(Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(20));
        cell.set(Some(leader));
        assert_eq!(waiter.join().unwrap().unwrap(), leader);
    }

    #[test]
    fn interrupt_wakes_waiters() {
        let cell = Arc::new(LeaderCell::new());
        let waiter = {
            let cell = Arc::clone(&cell);
            thread::spawn(move || cell.await_leader(Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(20));
        cell.interrupt();
        assert!(matches!(
            waiter.join().unwrap(),
            Err(NoLeaderFoundError::Interrupted)
        ));
    }
}
