//! In-process message delivery between members.
//!
//! Members of a [`ChannelNetwork`] deliver messages straight into each other's inboxes. Every message is framed and
//! decoded again on the way, exactly as it would be on a socket, so only wireable messages travel. Links to a member
//! can be cut to simulate a partition.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::BytesMut;
use crossbeam_channel::Sender;
use parking_lot::RwLock;

use crate::consensus::Outbound;
use crate::error::SendError;
use crate::member::MemberId;
use crate::message::{InboundMessage, Message, RaftMessage};
use crate::wire;

/// The registry of member inboxes reachable in this process.
#[derive(Clone, Default)]
pub struct ChannelNetwork {
    routes: Arc<RwLock<HashMap<MemberId, Route>>>,
}

struct Route {
    inbox: Sender<InboundMessage>,
    connected: bool,
}

/// The [`Outbound`] of one member of a [`ChannelNetwork`].
#[derive(Clone)]
pub struct ChannelTransport {
    myself: MemberId,
    network: ChannelNetwork,
}

//
// ChannelNetwork impls
//

impl ChannelNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `member` reachable through `inbox`, replacing any earlier route.
    pub fn register(&self, member: MemberId, inbox: Sender<InboundMessage>) {
        self.routes.write().insert(
            member,
            Route {
                inbox,
                connected: true,
            },
        );
    }

    pub fn unregister(&self, member: &MemberId) {
        self.routes.write().remove(member);
    }

    /// Drops every message to and from `member` until it is reconnected.
    pub fn disconnect(&self, member: &MemberId) {
        if let Some(route) = self.routes.write().get_mut(member) {
            route.connected = false;
        }
    }

    pub fn reconnect(&self, member: &MemberId) {
        if let Some(route) = self.routes.write().get_mut(member) {
            route.connected = true;
        }
    }

    pub fn transport(&self, myself: MemberId) -> ChannelTransport {
        ChannelTransport {
            myself,
            network: self.clone(),
        }
    }

    fn is_connected(&self, member: &MemberId) -> bool {
        self.routes.read().get(member).map_or(false, |route| route.connected)
    }
}

//
// ChannelTransport impls
//

impl Outbound for ChannelTransport {
    fn send(&self, to: MemberId, message: Message) -> Result<(), SendError> {
        if !self.network.is_connected(&self.myself) {
            return Err(SendError::Disconnected(to));
        }
        let mut frame = BytesMut::new();
        wire::encode_message(self.myself, &message, &mut frame)?;
        let (from, message) = wire::decode_frame(frame.freeze())?;

        let routes = self.network.routes.read();
        let route = routes.get(&to).ok_or(SendError::UnknownMember(to))?;
        if !route.connected {
            return Err(SendError::Disconnected(to));
        }
        route
            .inbox
            .send((from, RaftMessage::Message(message)))
            .map_err(|_| SendError::Disconnected(to))
    }
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::unbounded;

    use crate::message::{Rpc, VoteResponse};

    use super::*;

    #[test]
    fn delivers_through_wire_frames() {
        let network = ChannelNetwork::new();
        let (a, b) = (MemberId::random(), MemberId::random());
        let (a_tx, _a_rx) = unbounded();
        let (b_tx, b_rx) = unbounded();
        network.register(a, a_tx);
        network.register(b, b_tx);

        let message = Message::new(3, Rpc::VoteResponse(VoteResponse { vote_granted: true }));
        network.transport(a).send(b, message.clone()).unwrap();
        assert_eq!(b_rx.try_recv().unwrap(), (a, RaftMessage::Message(message)));
    }

    #[test]
    fn partitioned_member_is_unreachable() {
        let network = ChannelNetwork::new();
        let (a, b) = (MemberId::random(), MemberId::random());
        let (a_tx, _a_rx) = unbounded();
        let (b_tx, b_rx) = unbounded();
        network.register(a, a_tx);
        network.register(b, b_tx);
        let message = Message::new(1, Rpc::VoteResponse(VoteResponse { vote_granted: false }));

        network.disconnect(&b);
        assert!(matches!(
            network.transport(a).send(b, message.clone()),
            Err(SendError::Disconnected(_))
        ));
        assert!(matches!(
            network.transport(b).send(a, message.clone()),
            Err(SendError::Disconnected(_))
        ));
        assert!(matches!(
            network.transport(a).send(MemberId::random(), message.clone()),
            Err(SendError::UnknownMember(_))
        ));

        network.reconnect(&b);
        network.transport(a).send(b, message).unwrap();
        assert!(b_rx.try_recv().is_ok());
    }
}
