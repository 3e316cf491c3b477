// Command side of the dispatcher: id correlation, retry and timeouts

use super::CommandError;
use crate::protocol::handshake::BEGIN_REQUEST_ID;
use crate::protocol::{decode_response, encode_request, Request, Response};
use crate::transport::ble::{CentralBridge, PeripheralId, TagCharacteristics, WriteType};
use crate::transport::fragmenter::{FragmentError, Fragmenter};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Completion channel of one enqueued command
pub type Responder = oneshot::Sender<Result<Response, CommandError>>;

/// First id handed out after the handshake ids
const FIRST_COMMAND_ID: u32 = BEGIN_REQUEST_ID + 1;

struct PendingCommand {
    fragments: Vec<Vec<u8>>,
    retries_left: u32,
    timeout: Duration,
    deadline: Instant,
    attempt: u32,
    responder: Responder,
}

/// Which attempt an acknowledged write belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WriteTag {
    id: u32,
    attempt: u32,
}

pub struct CommandDispatcher {
    bridge: Arc<dyn CentralBridge>,
    peripheral: PeripheralId,
    command_char: uuid::Uuid,
    fragmenter: Fragmenter,
    next_id: u32,
    pending: HashMap<u32, PendingCommand>,
    /// Outstanding acknowledged writes, oldest first
    writes: VecDeque<WriteTag>,
}

impl CommandDispatcher {
    pub fn new(
        bridge: Arc<dyn CentralBridge>,
        peripheral: PeripheralId,
        characteristics: TagCharacteristics,
        mtu: u16,
    ) -> Result<Self, FragmentError> {
        Ok(Self {
            bridge,
            peripheral,
            command_char: characteristics.command,
            fragmenter: Fragmenter::new(mtu)?,
            next_id: FIRST_COMMAND_ID,
            pending: HashMap::new(),
            writes: VecDeque::new(),
        })
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Assign a fresh id, write the request and start its timer
    pub fn enqueue(
        &mut self,
        request: Request,
        retries: u32,
        timeout: Duration,
        responder: Responder,
        now: Instant,
    ) {
        let id = self.allocate_id();
        let request = request.with_id(id);
        let fragments = match encode_request(&request)
            .map_err(|e| e.to_string())
            .and_then(|packet| self.fragmenter.fragments(&packet).map_err(|e| e.to_string()))
        {
            Ok(fragments) => fragments,
            Err(e) => {
                let _ = responder.send(Err(CommandError::InvalidRequest(e)));
                return;
            }
        };

        debug!(
            "Enqueued request {} ({}/{}) in {} fragments",
            id,
            request.domain,
            request.opcode,
            fragments.len()
        );
        self.pending.insert(
            id,
            PendingCommand {
                fragments,
                retries_left: retries,
                timeout,
                deadline: now + timeout,
                attempt: 0,
                responder,
            },
        );
        self.transmit(id, now);
    }

    /// Reassemble a response fragment and resolve its command
    pub fn handle_response_fragment(&mut self, fragment: &[u8]) {
        let Some(packet) = self.fragmenter.add_fragment(fragment) else {
            return;
        };
        let response = match decode_response(&packet) {
            Ok(response) => response,
            Err(e) => {
                warn!("Dropping undecodable response ({} bytes): {}", packet.len(), e);
                return;
            }
        };
        let Some(pending) = self.pending.remove(&response.id) else {
            warn!("Dropping response {} with no pending command", response.id);
            return;
        };

        let result = if response.status.is_ok() {
            Ok(response)
        } else {
            Err(CommandError::Status(response.status))
        };
        if pending.responder.send(result).is_err() {
            debug!("Caller abandoned command");
        }
    }

    /// Completion of one acknowledged write on the command characteristic
    pub fn handle_write_result(&mut self, error: Option<&str>, now: Instant) {
        let Some(tag) = self.writes.pop_front() else {
            debug!("Write completion with nothing outstanding");
            return;
        };
        let Some(error) = error else {
            return;
        };
        let current = self
            .pending
            .get(&tag.id)
            .map(|pending| pending.attempt == tag.attempt)
            .unwrap_or(false);
        if current {
            self.retry_or_fail(tag.id, CommandError::WriteFailed(error.to_string()), now);
        } else {
            debug!("Write error for superseded attempt of request {}", tag.id);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|pending| pending.deadline).min()
    }

    /// Resend or fail every command whose deadline passed
    pub fn poll_timeouts(&mut self, now: Instant) {
        let expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            let abandoned = self
                .pending
                .get(&id)
                .map(|pending| pending.responder.is_closed())
                .unwrap_or(true);
            if abandoned {
                self.pending.remove(&id);
                continue;
            }
            self.retry_or_fail(id, CommandError::Timeout, now);
        }
    }

    pub fn shutdown(&mut self) {
        for (_, pending) in self.pending.drain() {
            let _ = pending.responder.send(Err(CommandError::Disconnected));
        }
        self.writes.clear();
        self.fragmenter.reset();
    }

    fn allocate_id(&mut self) -> u32 {
        loop {
            let id = self.next_id;
            self.next_id = match self.next_id.wrapping_add(1) {
                0..=BEGIN_REQUEST_ID => FIRST_COMMAND_ID,
                next => next,
            };
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    fn retry_or_fail(&mut self, id: u32, error: CommandError, now: Instant) {
        let Some(pending) = self.pending.get_mut(&id) else {
            return;
        };
        if pending.retries_left == 0 {
            warn!("Request {} failed: {}", id, error);
            if let Some(pending) = self.pending.remove(&id) {
                let _ = pending.responder.send(Err(error));
            }
            return;
        }
        pending.retries_left -= 1;
        pending.attempt += 1;
        debug!(
            "Request {} failed ({}), resending, {} retries left",
            id, error, pending.retries_left
        );
        self.transmit(id, now);
    }

    fn transmit(&mut self, id: u32, now: Instant) {
        loop {
            let Some(pending) = self.pending.get_mut(&id) else {
                return;
            };
            let mut failure = None;
            for fragment in &pending.fragments {
                debug!("-> {} {}", id, hex::encode(fragment));
                match self.bridge.write_value(
                    &self.peripheral,
                    fragment,
                    &self.command_char,
                    WriteType::WithResponse,
                ) {
                    Ok(()) => self.writes.push_back(WriteTag {
                        id,
                        attempt: pending.attempt,
                    }),
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }

            let Some(error) = failure else {
                pending.deadline = now + pending.timeout;
                return;
            };
            if pending.retries_left == 0 {
                warn!("Request {} failed: bridge refused write: {}", id, error);
                if let Some(pending) = self.pending.remove(&id) {
                    let _ = pending.responder.send(Err(CommandError::WriteFailed(error)));
                }
                return;
            }
            pending.retries_left -= 1;
            pending.attempt += 1;
            debug!("Bridge refused write for request {}, resending", id);
        }
    }
}
