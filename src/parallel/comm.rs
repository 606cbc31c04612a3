//! Minimal message-passing abstraction between ranks.
//!
//! Implementors provide point-to-point `send`/`recv` for a transport (TCP,
//! MPI, shared memory); everything above — framing, tag matching, the
//! collective reductions at barriers — is built on those two calls. An
//! in-process channel-backed implementation is included for tests and
//! single-machine runs.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::cell::RefCell;
use std::collections::VecDeque;

use crate::error::MeshError;

/// Interface for a group of processes that exchange messages. `send` must
/// return immediately; `recv` may block until a message is available.
pub trait Communicator {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn send(&self, rank: usize, message: Vec<u8>);

    fn recv(&self) -> Vec<u8>;

    /// Requeue a received message that is not yet wanted; a later `recv`
    /// returns it again.
    fn requeue_recv(&self, message: Vec<u8>);
}

/// Channel-backed communicator connecting ranks inside one process, one
/// value per rank. Each rank owns its entry and moves it onto its thread.
pub struct MemCommunicator {
    rank: usize,
    senders: Vec<Sender<Vec<u8>>>,
    receiver: Receiver<Vec<u8>>,
    pending: RefCell<VecDeque<Vec<u8>>>,
}

/// Build a fully connected set of in-process communicators.
pub fn mem_communicators(size: usize) -> Vec<MemCommunicator> {
    let mut senders = Vec::with_capacity(size);
    let mut receivers = Vec::with_capacity(size);
    for _ in 0..size {
        let (tx, rx) = unbounded();
        senders.push(tx);
        receivers.push(rx);
    }
    receivers
        .into_iter()
        .enumerate()
        .map(|(rank, receiver)| MemCommunicator {
            rank,
            senders: senders.clone(),
            receiver,
            pending: RefCell::new(VecDeque::new()),
        })
        .collect()
}

impl Communicator for MemCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.senders.len()
    }

    fn send(&self, rank: usize, message: Vec<u8>) {
        self.senders[rank]
            .send(message)
            .expect("peer communicator dropped");
    }

    fn recv(&self) -> Vec<u8> {
        if let Some(message) = self.pending.borrow_mut().pop_front() {
            return message;
        }
        self.receiver.recv().expect("all peer communicators dropped")
    }

    fn requeue_recv(&self, message: Vec<u8>) {
        self.pending.borrow_mut().push_back(message);
    }
}

// *******************************
// Framing

/// Every message is `[sender][tag][payload]`, so barriers never need to
/// rely on transport-level ordering between different exchanges.
pub(crate) fn frame(from: usize, tag: u64, payload: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(16 + payload.len());
    message.extend_from_slice(&(from as u64).to_le_bytes());
    message.extend_from_slice(&tag.to_le_bytes());
    message.extend_from_slice(payload);
    message
}

pub(crate) fn unframe(message: &[u8]) -> Result<(usize, u64, &[u8]), MeshError> {
    if message.len() < 16 {
        return Err(MeshError::Exchange(format!(
            "message of {} bytes is shorter than its header",
            message.len()
        )));
    }
    let from = u64::from_le_bytes(message[0..8].try_into().expect("8 bytes")) as usize;
    let tag = u64::from_le_bytes(message[8..16].try_into().expect("8 bytes"));
    Ok((from, tag, &message[16..]))
}

/// Block until the message with the wanted sender and tag arrives,
/// requeueing everything else.
pub(crate) fn recv_matching(
    comm: &dyn Communicator,
    from: usize,
    tag: u64,
) -> Result<Vec<u8>, MeshError> {
    let mut stash = Vec::new();
    let payload = loop {
        let message = comm.recv();
        let (sender, received, payload) = unframe(&message)?;
        if sender == from && received == tag {
            break payload.to_vec();
        }
        stash.push(message);
    };
    for message in stash {
        comm.requeue_recv(message);
    }
    Ok(payload)
}

pub(crate) fn encode_f64s(values: &[f64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 8);
    for value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

pub(crate) fn decode_f64s(bytes: &[u8]) -> Result<Vec<f64>, MeshError> {
    if bytes.len() % 8 != 0 {
        return Err(MeshError::Exchange(format!(
            "payload of {} bytes is not a whole number of values",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|chunk| f64::from_le_bytes(chunk.try_into().expect("8 bytes")))
        .collect())
}

// *******************************
// Collectives

/// Symmetric reduction over one `f64` per rank (used for the global time
/// step). Gathers on rank 0 and broadcasts the result.
pub fn all_reduce_f64(
    comm: &dyn Communicator,
    tag: u64,
    value: f64,
    fold: fn(f64, f64) -> f64,
) -> Result<f64, MeshError> {
    if comm.size() == 1 {
        return Ok(value);
    }
    if comm.rank() == 0 {
        let mut result = value;
        for from in 1..comm.size() {
            let payload = recv_matching(comm, from, tag)?;
            let values = decode_f64s(&payload)?;
            let received = values
                .first()
                .copied()
                .ok_or_else(|| MeshError::Exchange("empty reduction payload".into()))?;
            result = fold(result, received);
        }
        for to in 1..comm.size() {
            comm.send(to, frame(0, tag, &encode_f64s(&[result])));
        }
        Ok(result)
    } else {
        comm.send(0, frame(comm.rank(), tag, &encode_f64s(&[value])));
        let payload = recv_matching(comm, 0, tag)?;
        let values = decode_f64s(&payload)?;
        values
            .first()
            .copied()
            .ok_or_else(|| MeshError::Exchange("empty reduction payload".into()))
    }
}
