//! Simulation side of the data path.
//!
//! A [ClientSession] belongs to one simulation process. It slices each local vector according to
//! the partition plan and sends one data message to every server rank whose slice overlaps it.

use crate::error::EnsembleError;
use crate::partition::{ceil_partition, PartitionPlan};
use crate::protocol::{DataMessageBuilder, HandshakeResponse};
use crate::transport::write_frame;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Destination for encoded data messages, addressed by server rank.
#[async_trait]
pub trait DataSink: Send {
    async fn send(&mut self, server_rank: usize, frame: Bytes) -> Result<(), EnsembleError>;
}

/// One TCP stream per server rank.
#[derive(Debug)]
pub struct TcpDataSink {
    streams: Vec<TcpStream>,
}

impl TcpDataSink {
    /// Connects to every `host:port` data endpoint, in rank order.
    pub async fn connect(node_names: &[String]) -> Result<Self, EnsembleError> {
        let mut streams = Vec::with_capacity(node_names.len());
        for name in node_names {
            streams.push(TcpStream::connect(name.as_str()).await?);
        }
        Ok(Self { streams })
    }
}

#[async_trait]
impl DataSink for TcpDataSink {
    async fn send(&mut self, server_rank: usize, frame: Bytes) -> Result<(), EnsembleError> {
        let stream = self.streams.get_mut(server_rank).ok_or_else(|| {
            EnsembleError::protocol(format!("no connection to server rank {server_rank}"))
        })?;
        write_frame(stream, &frame).await?;
        Ok(())
    }
}

/// In-process delivery straight into each rank's data channel.
#[derive(Clone, Debug)]
pub struct ChannelSink {
    ranks: Vec<mpsc::Sender<Bytes>>,
}

impl ChannelSink {
    pub fn new(ranks: Vec<mpsc::Sender<Bytes>>) -> Self {
        Self { ranks }
    }
}

#[async_trait]
impl DataSink for ChannelSink {
    async fn send(&mut self, server_rank: usize, frame: Bytes) -> Result<(), EnsembleError> {
        self.ranks
            .get(server_rank)
            .ok_or_else(|| EnsembleError::protocol(format!("no server rank {server_rank}")))?
            .send(frame)
            .await
            .map_err(|_| EnsembleError::ChannelClosed { channel: "data" })
    }
}

/// Sends the data of one simulation process.
#[derive(Debug)]
pub struct ClientSession<S> {
    simu_id: usize,
    client_rank: usize,
    plan: PartitionPlan,
    vectors_per_message: usize,
    sink: S,
}

impl<S: DataSink> ClientSession<S> {
    /// Builds the plan agreed in the handshake: servers split the global vector with
    /// [ceil_partition], clients keep the sizes they announced.
    pub fn new(
        simu_id: usize,
        client_rank: usize,
        client_sizes: &[usize],
        response: &HandshakeResponse,
        sink: S,
    ) -> Result<Self, EnsembleError> {
        if client_rank >= client_sizes.len() {
            return Err(EnsembleError::protocol(format!(
                "client rank {client_rank} outside a group of {}",
                client_sizes.len()
            )));
        }
        let global: usize = client_sizes.iter().sum();
        let server_sizes = ceil_partition(global, response.server_count());
        let plan = PartitionPlan::build(global, &server_sizes, client_sizes)?;
        let vectors_per_message = if response.sobol {
            response.nb_parameters + 2
        } else {
            1
        };
        Ok(Self {
            simu_id,
            client_rank,
            plan,
            vectors_per_message,
            sink,
        })
    }

    pub fn plan(&self) -> &PartitionPlan {
        &self.plan
    }

    pub fn vectors_per_message(&self) -> usize {
        self.vectors_per_message
    }

    /// Sends one timestep of `field`. Under Sobol' `vectors` is `[A, B, C_1, ...]`, otherwise a
    /// single vector. Returns the number of messages sent.
    pub async fn send(
        &mut self,
        field: &str,
        timestep: usize,
        vectors: &[&[f64]],
    ) -> Result<usize, EnsembleError> {
        let local = self.plan.client_sizes()[self.client_rank];
        if let Some(bad) = vectors.iter().find(|v| v.len() != local) {
            return Err(EnsembleError::protocol(format!(
                "local vector has {} values, slice holds {local}",
                bad.len()
            )));
        }
        let transfers: Vec<_> = self.plan.sends_from(self.client_rank).copied().collect();
        for transfer in &transfers {
            let range = transfer.client_offset..transfer.client_offset + transfer.count;
            let frame = vectors
                .iter()
                .fold(
                    DataMessageBuilder::new(field, timestep, self.simu_id, self.client_rank),
                    |builder, vector| builder.vector(&vector[range.clone()]),
                )
                .build(self.vectors_per_message)?;
            self.sink.send(transfer.server_rank, frame).await?;
        }
        Ok(transfers.len())
    }

    pub fn into_sink(self) -> S {
        self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DataMessage;

    fn response(servers: usize) -> HandshakeResponse {
        HandshakeResponse {
            sobol: false,
            learning: false,
            nb_parameters: 0,
            verbosity: 0,
            node_names: (0..servers).map(|r| format!("127.0.0.1:{}", 5000 + r)).collect(),
        }
    }

    #[tokio::test]
    async fn slices_follow_plan() {
        let (tx0, mut rx0) = mpsc::channel(8);
        let (tx1, mut rx1) = mpsc::channel(8);
        let sink = ChannelSink::new(vec![tx0, tx1]);
        // Client rank 1 owns global elements 4..7, split across both servers.
        let mut session = ClientSession::new(3, 1, &[4, 3, 3], &response(2), sink).unwrap();
        let sent = session.send("u", 2, &[&[10.0, 11.0, 12.0]]).await.unwrap();
        assert_eq!(2, sent);

        let first = DataMessage::decode(&rx0.recv().await.unwrap(), 1).unwrap();
        assert_eq!((3, 1, 2), (first.simu_id, first.client_rank, first.timestep));
        assert_eq!(vec![10.0], first.payload);
        let second = DataMessage::decode(&rx1.recv().await.unwrap(), 1).unwrap();
        assert_eq!(vec![11.0, 12.0], second.payload);
        assert!(rx0.try_recv().is_err());
    }

    #[tokio::test]
    async fn sobol_messages_carry_every_vector() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut handshake = response(1);
        handshake.sobol = true;
        handshake.nb_parameters = 1;
        let mut session =
            ClientSession::new(0, 0, &[2], &handshake, ChannelSink::new(vec![tx])).unwrap();
        assert_eq!(3, session.vectors_per_message());
        session
            .send("u", 0, &[&[1.0, 2.0], &[3.0, 4.0], &[5.0, 6.0]])
            .await
            .unwrap();
        let message = DataMessage::decode(&rx.recv().await.unwrap(), 3).unwrap();
        assert_eq!(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], message.payload);
        assert!(session.send("u", 0, &[&[1.0, 2.0]]).await.is_err());
    }

    #[tokio::test]
    async fn wrong_local_size_rejected() {
        let (tx, _rx) = mpsc::channel(8);
        let mut session =
            ClientSession::new(0, 0, &[2, 2], &response(1), ChannelSink::new(vec![tx])).unwrap();
        assert!(session.send("u", 0, &[&[1.0]]).await.is_err());
        assert!(ClientSession::new(0, 2, &[2, 2], &response(1), session.into_sink()).is_err());
    }
}
