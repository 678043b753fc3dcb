use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

/// Single-producer broadcast to any number of subscribers.
///
/// Every value published is cloned to each live subscriber. Subscribers whose receiver was dropped are forgotten on
/// the next publish.
pub struct Broadcast<X>
where
    X: Clone + Send + 'static,
{
    senders: Mutex<Vec<Sender<X>>>,
}

impl<X> Broadcast<X>
where
    X: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> Receiver<X> {
        let (tx, rx) = unbounded();
        self.senders.lock().push(tx);
        rx
    }

    /// Sends `msg` to every subscriber, returning the number it was delivered to.
    pub fn publish(&self, msg: X) -> usize {
        let mut senders = self.senders.lock();
        senders.retain(|sender| sender.send(msg.clone()).is_ok());
        senders.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders.lock().len()
    }
}

impl<X> Default for Broadcast<X>
where
    X: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
