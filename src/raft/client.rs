use super::{Index, NodeID, Request, Response, Status, REQUEST_TIMEOUT};
use crate::errdata;
use crate::error::Result;

use crossbeam::channel::Sender;

/// A client for the local Raft node, used by server sessions. Requests are
/// submitted onto the node's event loop, and the caller blocks on a
/// response channel until the request is applied, rejected, or times out.
/// A timed-out write may still commit and apply later; retries are
/// deduplicated by the state machine.
#[derive(Clone)]
pub struct Client {
    request_tx: Sender<(Request, Sender<Result<Response>>)>,
}

impl Client {
    /// Creates a new Raft client.
    pub fn new(request_tx: Sender<(Request, Sender<Result<Response>>)>) -> Self {
        Self { request_tx }
    }

    /// Executes a request against the local Raft node.
    fn request(&self, request: Request) -> Result<Response> {
        let (response_tx, response_rx) = crossbeam::channel::bounded(1);
        self.request_tx.send((request, response_tx))?;
        response_rx.recv_timeout(REQUEST_TIMEOUT)?
    }

    /// Mutates the state machine via the replicated log, returning the
    /// apply result.
    pub fn write(&self, command: Vec<u8>) -> Result<Vec<u8>> {
        match self.request(Request::Write(command))? {
            Response::Write(response) => Ok(response),
            response => errdata!("unexpected Raft write response {response:?}"),
        }
    }

    /// Reads from the state machine, returning the result and the applied
    /// index of the serving replica as a staleness marker.
    pub fn read(&self, command: Vec<u8>) -> Result<(Vec<u8>, Index)> {
        match self.request(Request::Read(command))? {
            Response::Read { response, applied_index } => Ok((response, applied_index)),
            response => errdata!("unexpected Raft read response {response:?}"),
        }
    }

    /// Asks the leader to add a server to the cluster as a non-voting
    /// learner. It is promoted automatically once it has caught up.
    pub fn join(&self, id: NodeID, addr: String) -> Result<()> {
        match self.request(Request::Join { id, addr })? {
            Response::Join => Ok(()),
            response => errdata!("unexpected Raft join response {response:?}"),
        }
    }

    /// Fetches node and cluster status.
    pub fn status(&self) -> Result<Status> {
        match self.request(Request::Status)? {
            Response::Status(status) => Ok(status),
            response => errdata!("unexpected Raft status response {response:?}"),
        }
    }
}
