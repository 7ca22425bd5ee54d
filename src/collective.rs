//! Coordination between server ranks.
//!
//! Rank 0 owns the launcher and connection channels and relays what every rank must know to the
//! others in order. Peers only ever talk back to rank 0.

use crate::error::EnsembleError;
use crate::protocol::LauncherMessage;

use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

/// State changes relayed between ranks.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlEvent {
    /// A simulation connected with these per-process slice sizes.
    Connection { client_sizes: Vec<usize> },
    /// A launcher command that affects group state.
    Launcher(LauncherMessage),
    Parameters { simu_id: usize, parameters: Vec<f64> },
    Timeout { simu_id: usize },
    Stop,
    /// Sent by a peer to rank 0 once its own indices have converged.
    Converged { rank: usize },
}

/// One rank's view of the server group.
#[derive(Debug)]
pub struct RankGroup {
    rank: usize,
    size: usize,
    /// Rank 0 holds one sender per peer; a peer holds a single sender to rank 0.
    senders: Vec<UnboundedSender<ControlEvent>>,
    inbox: Option<UnboundedReceiver<ControlEvent>>,
}

impl RankGroup {
    /// A group of one.
    pub fn single() -> Self {
        Self {
            rank: 0,
            size: 1,
            senders: Vec::new(),
            inbox: None,
        }
    }

    /// Builds `size` connected ranks living in one process.
    pub fn local_group(size: usize) -> Vec<RankGroup> {
        assert!(size > 0, "a rank group needs at least one rank");
        let (root_tx, root_rx) = mpsc::unbounded_channel();
        let mut root = RankGroup {
            rank: 0,
            size,
            senders: Vec::with_capacity(size - 1),
            inbox: (size > 1).then_some(root_rx),
        };
        let mut peers = Vec::with_capacity(size - 1);
        for rank in 1..size {
            let (tx, rx) = mpsc::unbounded_channel();
            root.senders.push(tx);
            peers.push(RankGroup {
                rank,
                size,
                senders: vec![root_tx.clone()],
                inbox: Some(rx),
            });
        }
        std::iter::once(root).chain(peers).collect()
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_root(&self) -> bool {
        self.rank == 0
    }

    /// Sends `event` from rank 0 to every peer, in rank order.
    pub fn broadcast(&self, event: ControlEvent) -> Result<(), EnsembleError> {
        if !self.is_root() {
            return Err(EnsembleError::protocol(format!(
                "rank {} cannot broadcast",
                self.rank
            )));
        }
        for sender in &self.senders {
            sender
                .send(event.clone())
                .map_err(|_| EnsembleError::ChannelClosed { channel: "control" })?;
        }
        Ok(())
    }

    /// Sends `event` from a peer to rank 0.
    pub fn report(&self, event: ControlEvent) -> Result<(), EnsembleError> {
        match (self.is_root(), self.senders.first()) {
            (false, Some(sender)) => sender
                .send(event)
                .map_err(|_| EnsembleError::ChannelClosed { channel: "control" }),
            _ => Err(EnsembleError::protocol("rank 0 has no one to report to")),
        }
    }

    /// Takes the next pending event without waiting. Drops the inbox once every sender is gone.
    pub fn try_recv(&mut self) -> Option<ControlEvent> {
        match self.inbox.as_mut()?.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.inbox = None;
                None
            }
        }
    }

    /// Waits for the next event. Never resolves once the inbox is closed.
    pub async fn recv(&mut self) -> Option<ControlEvent> {
        match self.inbox.as_mut() {
            Some(inbox) => inbox.recv().await,
            None => std::future::pending().await,
        }
    }

    /// Forgets the inbox after [RankGroup::recv] reported it closed.
    pub fn close_inbox(&mut self) {
        self.inbox = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_every_peer_in_order() {
        let mut group = RankGroup::local_group(3);
        assert_eq!(
            vec![0, 1, 2],
            group.iter().map(RankGroup::rank).collect::<Vec<_>>()
        );
        group[0].broadcast(ControlEvent::Timeout { simu_id: 4 }).unwrap();
        group[0].broadcast(ControlEvent::Stop).unwrap();
        for peer in &mut group[1..] {
            assert_eq!(Some(ControlEvent::Timeout { simu_id: 4 }), peer.recv().await);
            assert_eq!(Some(ControlEvent::Stop), peer.try_recv());
            assert_eq!(None, peer.try_recv());
        }
    }

    #[tokio::test]
    async fn peers_report_to_root() {
        let mut group = RankGroup::local_group(2);
        group[1].report(ControlEvent::Converged { rank: 1 }).unwrap();
        assert_eq!(Some(ControlEvent::Converged { rank: 1 }), group[0].recv().await);
        assert!(group[0].report(ControlEvent::Stop).is_err());
        assert!(group[1].broadcast(ControlEvent::Stop).is_err());
    }

    #[test]
    fn single_rank_has_no_peers() {
        let mut group = RankGroup::single();
        assert!(group.is_root());
        assert_eq!(1, group.size());
        group.broadcast(ControlEvent::Stop).unwrap();
        assert_eq!(None, group.try_recv());
    }

    #[test]
    fn dropped_root_closes_peer_inbox() {
        let mut group = RankGroup::local_group(2);
        let mut peer = group.pop().unwrap();
        drop(group);
        assert_eq!(None, peer.try_recv());
        assert!(peer.report(ControlEvent::Stop).is_err());
    }
}
