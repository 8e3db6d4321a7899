//! Per-connection session record

use std::io::{Read, Write};
use uuid::Uuid;

use crate::crypto::SessionCrypto;
use crate::journal::Direction;
use crate::protocol::{Command, FRAME_SIZE};
use crate::protocol_core::{decode, encode, Message, Value, WireError};
use crate::scheduler::ReadTiming;
use crate::transport::Transport;

pub type SessionId = u64;

/// What the session is currently doing. Updated as steps run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingHello,
    Ready,
    Authenticating,
    PullingFile,
    PushingFile,
    Delegating(Command),
    ErrorReply,
    Terminating,
}

pub enum TransferIo {
    Pull { reader: Box<dyn Read> },
    Push { writer: Box<dyn Write>, end_part: u64 },
}

/// An in-flight file transfer.
pub struct Transfer {
    pub id: Uuid,
    pub path: String,
    pub next_part: u64,
    pub bytes: u64,
    pub io: TransferIo,
}

impl Transfer {
    pub fn pull(path: String, reader: Box<dyn Read>) -> Self {
        Self { id: Uuid::new_v4(), path, next_part: 0, bytes: 0, io: TransferIo::Pull { reader } }
    }

    pub fn push(path: String, writer: Box<dyn Write>, end_part: u64) -> Self {
        Self { id: Uuid::new_v4(), path, next_part: 0, bytes: 0, io: TransferIo::Push { writer, end_part } }
    }

    pub fn direction(&self) -> Direction {
        match self.io {
            TransferIo::Pull { .. } => Direction::Pull,
            TransferIo::Push { .. } => Direction::Push,
        }
    }
}

/// A frame waiting to go out, with how much of it the transport has taken.
pub struct Outbox {
    pub frame: Vec<u8>,
    pub sent: usize,
}

pub struct Session {
    pub(crate) id: SessionId,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) buffer: Vec<u8>,
    pub(crate) pending: Option<Message>,
    pub(crate) identity: Option<String>,
    pub(crate) crypto: Option<SessionCrypto>,
    pub(crate) transfer: Option<Transfer>,
    pub(crate) outbox: Option<Outbox>,
    pub(crate) timing: ReadTiming,
    pub(crate) cwd: String,
    pub(crate) phase: Phase,
    peer: String,
}

impl Session {
    pub fn new(id: SessionId, transport: Box<dyn Transport>) -> Self {
        let peer = transport.peer();
        Self {
            id,
            transport,
            buffer: Vec::with_capacity(FRAME_SIZE),
            pending: None,
            identity: None,
            crypto: None,
            transfer: None,
            outbox: None,
            timing: ReadTiming::default(),
            cwd: "/".to_string(),
            phase: Phase::AwaitingHello,
            peer,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Upgraded sessions sign and encrypt every frame.
    pub fn is_private(&self) -> bool {
        self.crypto.is_some()
    }

    pub fn timing(&self) -> &ReadTiming {
        &self.timing
    }

    pub fn has_transfer(&self) -> bool {
        self.transfer.is_some()
    }

    /// Encode a frame with the session's current cipher and signer.
    pub(crate) fn encode(&mut self, command: Command, args: &[Value]) -> Result<Vec<u8>, WireError> {
        match self.crypto.as_mut() {
            Some(c) => encode(command, args, Some(&mut c.outbound), Some(&c.signer)),
            None => encode(command, args, None, None),
        }
    }

    /// Pop and decode the first complete frame in the buffer, if any.
    pub(crate) fn next_frame(&mut self) -> Option<Result<Message, WireError>> {
        if self.buffer.len() < FRAME_SIZE {
            return None;
        }
        let raw: Vec<u8> = self.buffer.drain(..FRAME_SIZE).collect();
        Some(match self.crypto.as_mut() {
            Some(c) => decode(&raw, Some(&mut c.inbound), Some(&c.signer)),
            None => decode(&raw, None, None),
        })
    }
}
