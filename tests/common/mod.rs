#![allow(dead_code)]

use std::path::Path;

use spm::crypto::{SessionCrypto, SessionKey};
use spm::engine::{Engine, EngineSettings, Task};
use spm::journal::TransferJournal;
use spm::protocol::{Command, FRAME_SIZE};
use spm::protocol_core::{decode, encode, Message, Value};
use spm::scheduler::{ManualClock, TaskQueue};
use spm::session::{Phase, SessionId};
use spm::store::memory::MemoryContents;
use spm::store::{MemoryStore, Store};
use spm::ticket::Ticket;
use spm::transport::MemoryTransport;

pub const ROUNDS: u32 = 32;
pub const ROOT_PW: &str = "root-secret";
pub const ALICE_PW: &str = "alice-secret";
pub const BOB_PW: &str = "bob-secret";

pub fn settings() -> EngineSettings {
    EngineSettings { kdf_rounds: ROUNDS, ..EngineSettings::default() }
}

/// Client end of an in-memory connection.
pub struct Client {
    pub id: SessionId,
    pub peer: MemoryTransport,
    crypto: Option<SessionCrypto>,
    inbox: Vec<u8>,
}

impl Client {
    pub fn encode(&mut self, command: Command, args: &[Value]) -> Vec<u8> {
        match self.crypto.as_mut() {
            Some(c) => encode(command, args, Some(&mut c.outbound), Some(&c.signer)).unwrap(),
            None => encode(command, args, None, None).unwrap(),
        }
    }

    pub fn send(&mut self, command: Command, args: Vec<Value>) {
        let frame = self.encode(command, &args);
        self.peer.push_inbound(&frame);
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.peer.push_inbound(bytes);
    }

    pub fn install_key(&mut self, password: &str, salt: &[u8]) {
        let key = SessionKey::derive(password, salt, ROUNDS);
        self.crypto = Some(SessionCrypto::for_client(&key));
    }

    /// Decode every complete frame the server has sent so far.
    pub fn recv(&mut self) -> Vec<Message> {
        self.inbox.extend(self.peer.take_outbound());
        let mut out = Vec::new();
        while self.inbox.len() >= FRAME_SIZE {
            let frame: Vec<u8> = self.inbox.drain(..FRAME_SIZE).collect();
            let msg = match self.crypto.as_mut() {
                Some(c) => decode(&frame, Some(&mut c.inbound), Some(&c.signer)),
                None => decode(&frame, None, None),
            };
            out.push(msg.expect("server frame decodes"));
        }
        out
    }

    pub fn pending_bytes(&self) -> usize {
        self.inbox.len()
    }

    pub fn is_closed(&self) -> bool {
        self.peer.is_closed()
    }
}

pub fn commands(msgs: &[Message]) -> Vec<Command> {
    msgs.iter().map(|m| m.command).collect()
}

/// Engine over a memory store with a manual clock.
///
/// Subjects: `root` (super), `alice` (holds `rw:/`), `bob` (nothing).
pub struct Harness {
    pub engine: Engine<MemoryStore, ManualClock>,
    pub queue: TaskQueue<Task>,
    pub clock: ManualClock,
    pub contents: MemoryContents,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_journal(path: &Path) -> Self {
        Self::build(Some(TransferJournal::new(path)))
    }

    fn build(journal: Option<TransferJournal>) -> Self {
        let mut store = MemoryStore::in_memory();
        store.add_subject("root", ROOT_PW, true).unwrap();
        store.add_subject("alice", ALICE_PW, false).unwrap();
        store.add_subject("bob", BOB_PW, false).unwrap();
        store.give_ticket("root", "alice", &Ticket::parse("rw:/", "/").unwrap()).unwrap();
        let contents = store.contents().clone();
        let clock = ManualClock::new();
        let mut engine = Engine::new(settings(), store, clock.clone());
        if let Some(journal) = journal {
            engine = engine.with_journal(journal);
        }
        Self { engine, queue: TaskQueue::new(), clock, contents }
    }

    pub fn connect(&mut self) -> Client {
        let peer = MemoryTransport::new();
        let id = self.engine.accept(&mut self.queue, Box::new(peer.clone()));
        Client { id, peer, crypto: None, inbox: Vec::new() }
    }

    pub fn run(&mut self) {
        self.engine.run_steps(&mut self.queue, 2_000);
    }

    pub fn phase(&self, client: &Client) -> Option<Phase> {
        self.engine.session(client.id).map(|s| s.phase())
    }

    pub fn is_open(&self, client: &Client) -> bool {
        self.engine.session(client.id).is_some() && !client.is_closed()
    }

    pub fn greet(&mut self, client: &mut Client) {
        client.send(Command::HelloClient, vec![spm::protocol::VERSION.into()]);
        self.run();
        let replies = client.recv();
        assert_eq!(commands(&replies), vec![Command::HelloServer]);
    }

    /// Handshake and authenticate; panics unless CONFIRM_AUTH comes back.
    pub fn login(&mut self, client: &mut Client, subject: &str, password: &str) {
        self.greet(client);
        self.authenticate(client, subject, password);
    }

    pub fn authenticate(&mut self, client: &mut Client, subject: &str, password: &str) {
        let salt = format!("salt-{}", client.id).into_bytes();
        client.send(Command::AuthSubject, vec![subject.into(), Value::Bytes(salt.clone())]);
        client.install_key(password, &salt);
        self.run();
        let replies = client.recv();
        assert_eq!(commands(&replies), vec![Command::ConfirmAuth]);
        assert!(replies[0].signed);
        assert_eq!(replies[0].text("Subject").unwrap(), subject);
    }

    /// Send one request and return the replies it produced.
    pub fn request(&mut self, client: &mut Client, command: Command, args: Vec<Value>) -> Vec<Message> {
        client.send(command, args);
        self.run();
        client.recv()
    }
}
