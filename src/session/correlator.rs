use std::collections::HashMap;
use std::time::Duration;

use log::{debug, trace};
use serde_json::Value;
use tokio::time::Instant;

use super::{CommandReply, DeviceError};

struct PendingRequest {
    reply: CommandReply,
    deadline: Instant,
    timeout: Duration,
}

/// Matches responses to the requests that asked for them.
///
/// Ids start at 1 and only ever grow for the lifetime of the correlator,
/// reconnects included.
pub struct Correlator {
    last_id: u64,
    pending: HashMap<u64, PendingRequest>,
}

impl Correlator {
    pub fn new() -> Self {
        Correlator { last_id: 0, pending: HashMap::new() }
    }

    /// Hand out an id without tracking a response for it
    pub fn next_id(&mut self) -> u64 {
        self.last_id += 1;
        return self.last_id;
    }

    /// Reserve an id and park `reply` under it until answered or expired
    pub fn register(&mut self, reply: CommandReply, timeout: Duration) -> u64 {
        let id = self.next_id();
        self.pending.insert(id, PendingRequest { reply, deadline: Instant::now() + timeout, timeout });
        trace!("Request {} registered, {} pending", id, self.pending.len());
        return id;
    }

    /// Settle the request `id` with the device's answer. Returns false for
    /// answers nobody waits for anymore.
    pub fn resolve(&mut self, id: u64, outcome: Result<Value, String>) -> bool {
        let request = match self.pending.remove(&id) {
            Some(r) => r,
            None => {
                debug!("Discarding orphan response {} ({} pending)", id, self.pending.len());
                return false;
            }
        };

        let result = match outcome {
            Ok(value) => Ok(Some(value)),
            Err(message) => Err(DeviceError::Command(message)),
        };
        let _ = request.reply.send(result);
        return true;
    }

    pub fn fail(&mut self, id: u64, error: DeviceError) -> bool {
        match self.pending.remove(&id) {
            Some(request) => {
                let _ = request.reply.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Reject everything still waiting, returns how many were rejected
    pub fn fail_all(&mut self, error: DeviceError) -> usize {
        let count = self.pending.len();
        for (_, request) in self.pending.drain() {
            let _ = request.reply.send(Err(error.clone()));
        }
        if count > 0 {
            debug!("Rejected {} pending requests: {}", count, error);
        }
        return count;
    }

    /// Reject every request whose deadline is at or before `now`
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, r)| r.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired.iter() {
            if let Some(request) = self.pending.remove(id) {
                debug!("Request {} timed out", id);
                let _ = request.reply.send(Err(DeviceError::CommandTimeout {
                    id: *id,
                    timeout_ms: request.timeout.as_millis() as u64,
                }));
            }
        }
        return expired.len();
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|r| r.deadline).min()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.pending.contains_key(&id)
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}
