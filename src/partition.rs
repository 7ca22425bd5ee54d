//! N-to-M redistribution of a globally indexed vector.
//!
//! Clients (simulation ranks) and servers each own one contiguous slice of the global index range.
//! A [PartitionPlan] lists every overlap between a client slice and a server slice, which is
//! exactly the set of point-to-point messages needed to move the data.

use crate::error::EnsembleError;

use serde::Serialize;

/// One contiguous block sent by a client rank to a server rank.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct Transfer {
    pub client_rank: usize,
    pub server_rank: usize,
    /// Offset of the block in the client's local slice.
    pub client_offset: usize,
    /// Offset of the block in the server's local slice.
    pub server_offset: usize,
    pub count: usize,
}

/// Splits `global` elements over `n` ranks, each taking `ceil(global / n)` except the last.
///
/// Trailing ranks may end up empty, e.g. 5 elements over 4 ranks gives `[2, 2, 1, 0]`.
pub fn ceil_partition(global: usize, n: usize) -> Vec<usize> {
    if n == 0 {
        return Vec::new();
    }
    let chunk = global.div_ceil(n);
    let mut remaining = global;
    (0..n)
        .map(|_| {
            let size = chunk.min(remaining);
            remaining -= size;
            size
        })
        .collect()
}

/// Splits `global` elements over `n` ranks with sizes differing by at most one, larger first.
pub fn balanced_partition(global: usize, n: usize) -> Vec<usize> {
    if n == 0 {
        return Vec::new();
    }
    let base = global / n;
    let extra = global % n;
    (0..n).map(|rank| base + usize::from(rank < extra)).collect()
}

/// Ordered list of transfers between two partitions of the same index range.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct PartitionPlan {
    global_vect_size: usize,
    client_sizes: Vec<usize>,
    server_sizes: Vec<usize>,
    transfers: Vec<Transfer>,
}

impl PartitionPlan {
    /// Computes the transfers between `client_sizes` and `server_sizes`.
    ///
    /// Both partitions must sum to `global_vect_size`. Transfers come in increasing global index
    /// order, which is also lexicographic (client, server) order. Empty slices produce no
    /// transfers.
    pub fn build(
        global_vect_size: usize,
        server_sizes: &[usize],
        client_sizes: &[usize],
    ) -> Result<Self, EnsembleError> {
        for sizes in [server_sizes, client_sizes] {
            let actual: usize = sizes.iter().sum();
            if actual != global_vect_size {
                return Err(EnsembleError::PartitionMismatch {
                    expected: global_vect_size,
                    actual,
                });
            }
        }

        let mut transfers = Vec::new();
        let (mut client, mut server) = (0, 0);
        let (mut client_offset, mut server_offset) = (0, 0);
        let mut position = 0;
        while position < global_vect_size {
            // Skip ranks whose slice is exhausted, including empty ones.
            while client_offset == client_sizes[client] {
                client += 1;
                client_offset = 0;
            }
            while server_offset == server_sizes[server] {
                server += 1;
                server_offset = 0;
            }
            let count = (client_sizes[client] - client_offset)
                .min(server_sizes[server] - server_offset);
            transfers.push(Transfer {
                client_rank: client,
                server_rank: server,
                client_offset,
                server_offset,
                count,
            });
            client_offset += count;
            server_offset += count;
            position += count;
        }

        Ok(Self {
            global_vect_size,
            client_sizes: client_sizes.to_vec(),
            server_sizes: server_sizes.to_vec(),
            transfers,
        })
    }

    pub fn global_vect_size(&self) -> usize {
        self.global_vect_size
    }

    pub fn client_sizes(&self) -> &[usize] {
        &self.client_sizes
    }

    pub fn server_sizes(&self) -> &[usize] {
        &self.server_sizes
    }

    pub fn transfers(&self) -> &[Transfer] {
        &self.transfers
    }

    /// Transfers a client rank must send, in server order.
    pub fn sends_from(&self, client_rank: usize) -> impl Iterator<Item = &Transfer> {
        self.transfers
            .iter()
            .filter(move |t| t.client_rank == client_rank)
    }

    /// Transfers a server rank will receive, in client order.
    pub fn receives_at(&self, server_rank: usize) -> impl Iterator<Item = &Transfer> {
        self.transfers
            .iter()
            .filter(move |t| t.server_rank == server_rank)
    }

    /// Client ranks whose data reaches `server_rank`.
    pub fn owned_client_ranks(&self, server_rank: usize) -> Vec<usize> {
        self.receives_at(server_rank).map(|t| t.client_rank).collect()
    }

    /// Number of elements a server rank receives from a given client rank, if any.
    pub fn received_count(&self, server_rank: usize, client_rank: usize) -> Option<usize> {
        self.receives_at(server_rank)
            .find(|t| t.client_rank == client_rank)
            .map(|t| t.count)
    }
}
