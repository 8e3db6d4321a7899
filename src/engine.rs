//! Protocol state machine.
//!
//! Each connection is driven by a chain of [`Step`]s. Running a step returns
//! the next one, which the caller pushes back on the shared [`TaskQueue`];
//! a session therefore has at most one pending step at any time, and steps
//! from different sessions interleave in FIFO order.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use tracing::{debug, info, trace, warn};

use crate::crypto::{SessionCrypto, SessionKey};
use crate::journal::{Direction, JournalEntry, TransferJournal, TransferStatus};
use crate::protocol::{backoff, kdf, limits, Command, CHUNK_SIZE, FRAME_SIZE, VERSION};
use crate::protocol_core::{escape, normalize_virtual, Message, Value};
use crate::request::{Request, RequestError};
use crate::scheduler::{Clock, TaskQueue};
use crate::session::{Outbox, Phase, Session, SessionId, Transfer, TransferIo};
use crate::store::Store;
use crate::transport::{Recv, Transport};

/// Tunables the state machine needs at runtime.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub version: String,
    pub kdf_rounds: u32,
    pub target_latency_ms: u64,
    pub block_step_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            version: VERSION.to_string(),
            kdf_rounds: kdf::ROUNDS,
            target_latency_ms: backoff::TARGET_LATENCY_MS,
            block_step_ms: backoff::STEP_MS,
        }
    }
}

/// Which handler a freshly read frame goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Hello,
    Ready,
    PushChunk,
}

#[derive(Debug)]
pub enum Step {
    /// Parse one buffered frame, or read more.
    ReadFrame(Stage),
    /// One throttled receive, then back to `ReadFrame`.
    ReadPart(Stage),
    /// Act on the decoded pending message.
    Handle(Stage),
    /// Flush the outbox, then continue.
    Send(Box<Step>),
    ErrorReply { reason: String, then: Box<Step> },
    Die,
    Close,
    Authenticate { subject: String, salt: Vec<u8> },
    Delegate(Request),
    BeginPull { file: String },
    PullChunk,
    BeginPush { file: String, cur_part: u64, end_part: u64 },
}

impl Step {
    fn phase(&self) -> Option<Phase> {
        Some(match self {
            Step::ReadFrame(Stage::Hello) | Step::ReadPart(Stage::Hello) => Phase::AwaitingHello,
            Step::ReadFrame(Stage::Ready) | Step::ReadPart(Stage::Ready) => Phase::Ready,
            Step::ReadFrame(Stage::PushChunk) | Step::ReadPart(Stage::PushChunk) | Step::BeginPush { .. } => {
                Phase::PushingFile
            }
            Step::BeginPull { .. } | Step::PullChunk => Phase::PullingFile,
            Step::Authenticate { .. } => Phase::Authenticating,
            Step::Delegate(req) => Phase::Delegating(req.command()),
            Step::ErrorReply { .. } => Phase::ErrorReply,
            Step::Die | Step::Close => Phase::Terminating,
            Step::Handle(_) | Step::Send(_) => return None,
        })
    }
}

pub type Task = (SessionId, Step);

fn ready() -> Step {
    Step::ReadFrame(Stage::Ready)
}

/// Error reply followed by termination.
fn fail(reason: impl ToString) -> Step {
    Step::ErrorReply { reason: reason.to_string(), then: Box::new(Step::Die) }
}

/// Queue `command` on the outbox and continue with `next` once it is sent.
fn reply(session: &mut Session, command: Command, args: &[Value], next: Step) -> Step {
    match session.encode(command, args) {
        Ok(frame) => {
            trace!(session = session.id(), %command, "queued reply");
            session.outbox = Some(Outbox { frame, sent: 0 });
            Step::Send(Box::new(next))
        }
        Err(e) => fail(e),
    }
}

/// Longest prefix of `reason` whose escaped form fits the error field.
fn clip_reason(reason: &str) -> String {
    let mut out = String::new();
    let mut encoded = 0;
    for c in reason.chars() {
        let cost = if c.is_ascii_graphic() && c != '%' && c != ',' { 1 } else { 3 * c.len_utf8() };
        if encoded + cost > limits::ERROR_MESSAGE {
            break;
        }
        encoded += cost;
        out.push(c);
    }
    out
}

/// Longest prefix of `items` that fits the list field once encoded.
fn fit_list(items: Vec<String>) -> Vec<String> {
    let mut used = 0;
    let mut out = Vec::new();
    for item in items {
        let cost = escape(&item).len() + usize::from(!out.is_empty());
        if used + cost > limits::LIST {
            break;
        }
        used += cost;
        out.push(item);
    }
    out
}

/// Fill `buf` from `reader` until it is full or the reader is exhausted.
fn read_chunk(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

pub struct Engine<S: Store, C: Clock> {
    core: Core<S, C>,
    sessions: HashMap<SessionId, Session>,
    next_id: SessionId,
}

struct Core<S: Store, C: Clock> {
    settings: EngineSettings,
    store: S,
    clock: C,
    journal: Option<TransferJournal>,
}

impl<S: Store, C: Clock> Engine<S, C> {
    pub fn new(settings: EngineSettings, store: S, clock: C) -> Self {
        Self {
            core: Core { settings, store, clock, journal: None },
            sessions: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn with_journal(mut self, journal: TransferJournal) -> Self {
        self.core.journal = Some(journal);
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.core.settings
    }

    pub fn store(&self) -> &S {
        &self.core.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.core.store
    }

    pub fn clock(&self) -> &C {
        &self.core.clock
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Register a new connection and schedule its handshake.
    pub fn accept(&mut self, queue: &mut TaskQueue<Task>, transport: Box<dyn Transport>) -> SessionId {
        let id = self.next_id;
        self.next_id += 1;
        let session = Session::new(id, transport);
        info!(session = id, peer = session.peer(), "accepted connection");
        self.sessions.insert(id, session);
        queue.push((id, Step::ReadFrame(Stage::Hello)));
        id
    }

    /// Pop and run one step. Returns false if the queue was empty.
    pub fn step(&mut self, queue: &mut TaskQueue<Task>) -> bool {
        let Some((id, step)) = queue.pop() else {
            return false;
        };
        if let Some(next) = self.run(id, step) {
            queue.push((id, next));
        }
        true
    }

    /// Run up to `max` steps; returns how many ran.
    pub fn run_steps(&mut self, queue: &mut TaskQueue<Task>, max: usize) -> usize {
        let mut ran = 0;
        while ran < max && self.step(queue) {
            ran += 1;
        }
        ran
    }

    /// Close every session, e.g. on shutdown.
    pub fn close_all(&mut self) {
        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in ids {
            self.close(id);
        }
    }

    fn run(&mut self, id: SessionId, step: Step) -> Option<Step> {
        if matches!(step, Step::Close) {
            self.close(id);
            return None;
        }
        // Steps for a session that is already gone are dropped
        let session = self.sessions.get_mut(&id)?;
        if let Some(phase) = step.phase() {
            session.phase = phase;
        }
        Some(self.core.run(session, step))
    }

    fn close(&mut self, id: SessionId) {
        let Some(mut session) = self.sessions.remove(&id) else {
            return;
        };
        session.phase = Phase::Terminating;
        session.transport.shutdown();
        if let Some(transfer) = session.transfer.take() {
            self.core.finish(&session, transfer, TransferStatus::Interrupted, None);
        }
        info!(session = id, peer = session.peer(), "connection closed");
    }
}

impl<S: Store, C: Clock> Core<S, C> {
    fn run(&mut self, session: &mut Session, step: Step) -> Step {
        match step {
            Step::ReadFrame(stage) => self.read_frame(session, stage),
            Step::ReadPart(stage) => self.read_part(session, stage),
            Step::Handle(stage) => self.handle(session, stage),
            Step::Send(next) => self.send(session, *next),
            Step::ErrorReply { reason, then } => self.error_reply(session, &reason, *then),
            Step::Die => self.die(session),
            Step::Close => Step::Close,
            Step::Authenticate { subject, salt } => self.authenticate(session, subject, &salt),
            Step::Delegate(request) => self.delegate(session, request),
            Step::BeginPull { file } => self.begin_pull(session, &file),
            Step::PullChunk => self.pull_chunk(session),
            Step::BeginPush { file, cur_part, end_part } => self.begin_push(session, &file, cur_part, end_part),
        }
    }

    fn read_frame(&mut self, session: &mut Session, stage: Stage) -> Step {
        if session.pending.is_some() {
            return fail("Never scan for a message before the previous one is handled");
        }
        match session.next_frame() {
            Some(Ok(msg)) => {
                debug!(session = session.id(), command = %msg.command, "received frame");
                session.pending = Some(msg);
                Step::Handle(stage)
            }
            Some(Err(e)) => {
                warn!(session = session.id(), error = %e, class = ?e.class(), "rejected frame");
                fail(e)
            }
            None => Step::ReadPart(stage),
        }
    }

    /// One non-blocking receive. An empty read sleeps for the adaptive block
    /// time so an idle connection does not spin.
    fn read_part(&mut self, session: &mut Session, stage: Stage) -> Step {
        let block = session.timing.update(
            self.clock.now_ms(),
            self.settings.target_latency_ms,
            self.settings.block_step_ms,
        );
        let mut buf = [0u8; FRAME_SIZE];
        match session.transport.recv(&mut buf) {
            Ok(Recv::Data(n)) => {
                trace!(session = session.id(), bytes = n, "read");
                session.buffer.extend_from_slice(&buf[..n]);
            }
            Ok(Recv::Pending) => self.clock.sleep_ms(block),
            Ok(Recv::Closed) => {
                debug!(session = session.id(), "peer closed the stream");
                return Step::Close;
            }
            Err(e) => {
                warn!(session = session.id(), error = %e, "read failed");
                return Step::Close;
            }
        }
        Step::ReadFrame(stage)
    }

    fn send(&mut self, session: &mut Session, next: Step) -> Step {
        let Some(outbox) = session.outbox.as_mut() else {
            return next;
        };
        match session.transport.send(&outbox.frame[outbox.sent..]) {
            Ok(n) => outbox.sent += n,
            Err(e) => {
                warn!(session = session.id(), error = %e, "write failed");
                return Step::Close;
            }
        }
        if outbox.sent < outbox.frame.len() {
            return Step::Send(Box::new(next));
        }
        session.outbox = None;
        next
    }

    fn error_reply(&mut self, session: &mut Session, reason: &str, then: Step) -> Step {
        let reason = clip_reason(reason);
        warn!(session = session.id(), peer = session.peer(), %reason, "sending error reply");
        match session.encode(Command::ErrorServer, &[Value::Text(reason)]) {
            Ok(frame) => {
                session.outbox = Some(Outbox { frame, sent: 0 });
                Step::Send(Box::new(then))
            }
            Err(e) => {
                warn!(session = session.id(), error = %e, "could not encode error reply");
                Step::Close
            }
        }
    }

    fn die(&mut self, session: &mut Session) -> Step {
        match session.encode(Command::Die, &[]) {
            Ok(frame) => {
                session.outbox = Some(Outbox { frame, sent: 0 });
                Step::Send(Box::new(Step::Close))
            }
            Err(_) => Step::Close,
        }
    }

    fn handle(&mut self, session: &mut Session, stage: Stage) -> Step {
        let Some(msg) = session.pending.take() else {
            return fail("No message to handle");
        };
        match stage {
            Stage::Hello => self.hello(session, &msg),
            Stage::Ready => self.dispatch(session, &msg),
            Stage::PushChunk => self.push_chunk(session, &msg),
        }
    }

    fn hello(&mut self, session: &mut Session, msg: &Message) -> Step {
        let version = match Request::from_message(msg, &session.cwd) {
            Ok(Request::Hello { version }) => version,
            Ok(_) | Err(RequestError::Unexpected(_)) => return fail("Expected client greeting"),
            Err(e) => return fail(e),
        };
        if version != self.settings.version {
            warn!(session = session.id(), client = %version, "version mismatch");
            return fail(format!("Version mismatch: server speaks {}", self.settings.version));
        }
        info!(session = session.id(), version = %version, "handshake complete");
        let own = Value::Text(self.settings.version.clone());
        reply(session, Command::HelloServer, &[own], ready())
    }

    /// Route one request from the Ready state.
    fn dispatch(&mut self, session: &mut Session, msg: &Message) -> Step {
        let request = match Request::from_message(msg, &session.cwd) {
            Ok(r) => r,
            Err(e) => return fail(e),
        };
        match request {
            Request::Die => {
                info!(session = session.id(), "client requested disconnect");
                Step::Close
            }
            Request::Authenticate { subject, salt } => Step::Authenticate { subject, salt },
            Request::PullFile { file } => Step::BeginPull { file },
            // Data is ignored; payload follows in XFER_FILE frames
            Request::PushFile { file, cur_part, end_part } => Step::BeginPush { file, cur_part, end_part },
            Request::Hello { .. } | Request::Xfer { .. } => fail(format!("Unexpected message type {}", msg.command)),
            other => Step::Delegate(other),
        }
    }

    fn authenticate(&mut self, session: &mut Session, subject: String, salt: &[u8]) -> Step {
        if session.crypto.is_some() {
            return fail("Session is already authenticated");
        }
        if salt.is_empty() {
            return fail("Salt must not be empty");
        }
        match self.store.subject_secret(&subject) {
            Err(e) => fail(e),
            Ok(None) => {
                info!(session = session.id(), %subject, "authentication rejected");
                reply(session, Command::RejectAuth, &[], ready())
            }
            Ok(Some(secret)) => {
                let key = SessionKey::derive(&secret, salt, self.settings.kdf_rounds);
                session.crypto = Some(SessionCrypto::for_server(&key));
                session.identity = Some(subject.clone());
                info!(session = session.id(), %subject, "authenticated");
                reply(session, Command::ConfirmAuth, &[Value::Text(subject)], ready())
            }
        }
    }

    fn begin_pull(&mut self, session: &mut Session, file: &str) -> Step {
        let Some(subject) = session.identity.clone() else {
            return fail("Authentication required");
        };
        let path = match normalize_virtual(&session.cwd, file) {
            Ok(p) => p,
            Err(e) => return fail(e),
        };
        if !self.store.object_exists(&path) {
            return fail(format!("Object does not exist: {}", path));
        }
        let reader = match self.store.open_read(&subject, &path) {
            Ok(r) => r,
            Err(e) => return fail(e),
        };
        info!(session = session.id(), %subject, %path, "pull started");
        session.transfer = Some(Transfer::pull(path, reader));
        Step::PullChunk
    }

    /// Send the next chunk. The first chunk shorter than `CHUNK_SIZE`
    /// (possibly empty) ends the transfer.
    fn pull_chunk(&mut self, session: &mut Session) -> Step {
        let Some(mut transfer) = session.transfer.take() else {
            return fail("No transfer in progress");
        };
        let mut chunk = vec![0u8; CHUNK_SIZE];
        let read = match &mut transfer.io {
            TransferIo::Pull { reader } => read_chunk(reader.as_mut(), &mut chunk),
            TransferIo::Push { .. } => Err(io::Error::new(io::ErrorKind::Other, "not a pull transfer")),
        };
        let n = match read {
            Ok(n) => n,
            Err(e) => {
                let reason = format!("Error reading file: {}", e);
                self.finish(session, transfer, TransferStatus::Failed, Some(reason.clone()));
                return fail(reason);
            }
        };
        chunk.truncate(n);

        let part = transfer.next_part;
        transfer.next_part += 1;
        transfer.bytes += n as u64;
        let next = if n < CHUNK_SIZE {
            self.finish(session, transfer, TransferStatus::Completed, None);
            ready()
        } else {
            session.transfer = Some(transfer);
            Step::PullChunk
        };
        let args = [Value::Bytes(chunk), Value::Int(part), Value::Int(n as u64)];
        reply(session, Command::XferFile, &args, next)
    }

    fn begin_push(&mut self, session: &mut Session, file: &str, cur_part: u64, end_part: u64) -> Step {
        let Some(subject) = session.identity.clone() else {
            return fail("Authentication required");
        };
        if cur_part != 0 {
            return fail("Push must start at part 0");
        }
        if end_part == 0 {
            return fail("File must have at least one part");
        }
        let path = match normalize_virtual(&session.cwd, file) {
            Ok(p) => p,
            Err(e) => return fail(e),
        };
        if self.store.object_exists(&path) {
            return fail(format!("Object already exists: {}", path));
        }
        if let Err(e) = self.store.insert_object(&subject, &path) {
            return fail(e);
        }
        let writer = match self.store.open_write(&subject, &path) {
            Ok(w) => w,
            Err(e) => {
                self.discard(&subject, &path);
                return fail(e);
            }
        };
        info!(session = session.id(), %subject, %path, parts = end_part, "push started");
        session.transfer = Some(Transfer::push(path, writer, end_part));
        Step::ReadFrame(Stage::PushChunk)
    }

    fn push_chunk(&mut self, session: &mut Session, msg: &Message) -> Step {
        let Some(mut transfer) = session.transfer.take() else {
            return fail("No transfer in progress");
        };
        let (data, cur_part, size) = match Request::from_message(msg, &session.cwd) {
            Ok(Request::Xfer { data, cur_part, size }) => (data, cur_part, size),
            Ok(Request::Die) => {
                // Close records the transfer as interrupted
                session.transfer = Some(transfer);
                return Step::Close;
            }
            Ok(other) => {
                let reason = format!("Bad message sequence: expected XFER_FILE, got {}", other.command());
                return self.abort(session, transfer, reason);
            }
            Err(e) => return self.abort(session, transfer, e.to_string()),
        };
        if cur_part != transfer.next_part {
            let reason = format!("Bad message sequence: expected part {}, got {}", transfer.next_part, cur_part);
            return self.abort(session, transfer, reason);
        }
        if size != data.len() as u64 {
            let reason = format!("Chunk size mismatch: BSize {} but {} bytes", size, data.len());
            return self.abort(session, transfer, reason);
        }

        let written = match &mut transfer.io {
            TransferIo::Push { writer, end_part } => writer.write_all(&data).map(|_| *end_part),
            TransferIo::Pull { .. } => Err(io::Error::new(io::ErrorKind::Other, "not a push transfer")),
        };
        let end_part = match written {
            Ok(end) => end,
            Err(e) => return self.abort(session, transfer, format!("Error writing file: {}", e)),
        };
        transfer.next_part += 1;
        transfer.bytes += data.len() as u64;
        trace!(session = session.id(), part = cur_part, bytes = data.len(), "chunk written");

        if transfer.next_part < end_part {
            session.transfer = Some(transfer);
            return Step::ReadFrame(Stage::PushChunk);
        }
        let flushed = match &mut transfer.io {
            TransferIo::Push { writer, .. } => writer.flush(),
            TransferIo::Pull { .. } => Ok(()),
        };
        if let Err(e) = flushed {
            return self.abort(session, transfer, format!("Error writing file: {}", e));
        }
        self.finish(session, transfer, TransferStatus::Completed, None);
        ready()
    }

    /// A failed push leaves nothing behind, so the same name can be retried.
    fn abort(&mut self, session: &mut Session, transfer: Transfer, reason: String) -> Step {
        let path = transfer.path.clone();
        let push = transfer.direction() == Direction::Push;
        // Journal first; this also drops the open writer
        self.finish(session, transfer, TransferStatus::Failed, Some(reason.clone()));
        if let (true, Some(subject)) = (push, session.identity.clone()) {
            self.discard(&subject, &path);
        }
        fail(reason)
    }

    fn discard(&mut self, subject: &str, path: &str) {
        if let Err(e) = self.store.delete_object(subject, path) {
            warn!(%subject, %path, error = %e, "failed to discard partial upload");
        }
    }

    fn finish(&self, session: &Session, transfer: Transfer, status: TransferStatus, error: Option<String>) {
        info!(
            session = session.id(),
            path = %transfer.path,
            direction = ?transfer.direction(),
            ?status,
            bytes = transfer.bytes,
            chunks = transfer.next_part,
            "transfer finished"
        );
        let Some(journal) = &self.journal else {
            return;
        };
        let subject = session.identity().unwrap_or("-");
        let mut entry = JournalEntry::now(transfer.id, subject, &transfer.path, transfer.direction(), status);
        entry.bytes = transfer.bytes;
        entry.chunks = transfer.next_part;
        entry.error = error;
        if let Err(e) = journal.add_entry(&entry) {
            warn!(error = %e, path = %journal.path().display(), "failed to append transfer journal");
        }
    }

    fn delegate(&mut self, session: &mut Session, request: Request) -> Step {
        let Some(subject) = session.identity.clone() else {
            return fail("Authentication required");
        };
        let command = request.command();
        match self.apply(session, &subject, request) {
            Ok(args) => {
                debug!(session = session.id(), %subject, %command, "delegation succeeded");
                let answer = match command {
                    Command::ListSubjectClient => Command::ListSubjectServer,
                    Command::ListObjectClient => Command::ListObjectServer,
                    other => other,
                };
                reply(session, answer, &args, ready())
            }
            Err(e) => {
                warn!(session = session.id(), %subject, %command, error = %e, "delegation failed");
                fail(e)
            }
        }
    }

    /// Forward a directory, ticket or subject operation to the store.
    /// Returns the reply arguments with paths resolved.
    fn apply(&mut self, session: &mut Session, subject: &str, request: Request) -> anyhow::Result<Vec<Value>> {
        let store = &mut self.store;
        let args = match request {
            Request::ListSubjects => vec![Value::List(fit_list(store.list_subjects(subject)?))],
            Request::ListObjects => vec![Value::List(fit_list(store.list_objects(subject, &session.cwd)?))],
            Request::GiveTicket { subject: receiver, ticket } => {
                store.give_ticket(subject, &receiver, &ticket)?;
                vec![Value::Text(receiver), Value::Text(ticket.to_string())]
            }
            Request::TakeTicket { subject: source, ticket } => {
                store.take_ticket(subject, &source, &ticket)?;
                vec![Value::Text(source), Value::Text(ticket.to_string())]
            }
            Request::MakeDirectory { directory } => {
                let path = normalize_virtual(&session.cwd, &directory)?;
                store.make_directory(subject, &path)?;
                vec![Value::Text(path)]
            }
            Request::MakeSubject { subject: name, password } => {
                store.make_subject(subject, &name, &password)?;
                // The password is not echoed
                vec![Value::Text(name), Value::Text(String::new())]
            }
            Request::ChangeDirectory { path } => {
                let path = normalize_virtual(&session.cwd, &path)?;
                store.directory_exists(subject, &path)?;
                session.cwd = path.clone();
                vec![Value::Text(path)]
            }
            Request::MakeFilter { subject1, subject2, ticket } => {
                store.make_filter(subject, &subject1, &subject2, &ticket)?;
                vec![Value::Text(subject1), Value::Text(subject2), Value::Text(ticket.to_string())]
            }
            Request::MakeLink { subject1, subject2 } => {
                store.make_link(subject, &subject1, &subject2)?;
                vec![Value::Text(subject1), Value::Text(subject2)]
            }
            Request::DeleteFile { file } => {
                let path = normalize_virtual(&session.cwd, &file)?;
                store.delete_object(subject, &path)?;
                vec![Value::Text(path)]
            }
            Request::ClearFilters { subject: target } => {
                let removed = store.clear_filters(subject, &target)?;
                debug!(%target, removed, "filters cleared");
                vec![Value::Text(target)]
            }
            Request::ClearLinks { subject: target } => {
                let removed = store.clear_links(subject, &target)?;
                debug!(%target, removed, "links cleared");
                vec![Value::Text(target)]
            }
            Request::DeleteSubject { subject: target } => {
                store.delete_subject(subject, &target)?;
                vec![Value::Text(target)]
            }
            other => anyhow::bail!("Unexpected message type {}", other.command()),
        };
        Ok(args)
    }
}
