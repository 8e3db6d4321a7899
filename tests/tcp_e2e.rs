use anyhow::Result;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use spm::config::{AdminConfig, ServerConfig};
use spm::crypto::{SessionCrypto, SessionKey};
use spm::engine::{Engine, EngineSettings};
use spm::protocol::{Command, CHUNK_SIZE, FRAME_SIZE, VERSION};
use spm::protocol_core::{decode, encode, Message, Value};
use spm::scheduler::SystemClock;
use spm::server;
use spm::store::Store;
use spm::ticket::Ticket;

const ROUNDS: u32 = 32;

struct TcpClient {
    stream: TcpStream,
    crypto: Option<SessionCrypto>,
}

impl TcpClient {
    fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(10)))?;
        Ok(Self { stream, crypto: None })
    }

    fn send(&mut self, command: Command, args: &[Value]) -> Result<()> {
        let frame = match self.crypto.as_mut() {
            Some(c) => encode(command, args, Some(&mut c.outbound), Some(&c.signer))?,
            None => encode(command, args, None, None)?,
        };
        self.stream.write_all(&frame)?;
        Ok(())
    }

    fn recv(&mut self) -> Result<Message> {
        let mut frame = vec![0u8; FRAME_SIZE];
        self.stream.read_exact(&mut frame)?;
        let msg = match self.crypto.as_mut() {
            Some(c) => decode(&frame, Some(&mut c.inbound), Some(&c.signer))?,
            None => decode(&frame, None, None)?,
        };
        Ok(msg)
    }

    fn login(&mut self, subject: &str, password: &str) -> Result<()> {
        self.send(Command::HelloClient, &[VERSION.into()])?;
        assert_eq!(self.recv()?.command, Command::HelloServer);

        let salt = b"tcp-salt".to_vec();
        self.send(Command::AuthSubject, &[subject.into(), Value::Bytes(salt.clone())])?;
        let key = SessionKey::derive(password, &salt, ROUNDS);
        self.crypto = Some(SessionCrypto::for_client(&key));
        let confirm = self.recv()?;
        assert_eq!(confirm.command, Command::ConfirmAuth);
        assert!(confirm.signed);
        Ok(())
    }
}

#[test]
fn tcp_push_pull_round_trip() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut config = ServerConfig::default();
    config.root = tmp.path().join("store");
    config.admin = Some(AdminConfig { name: "root".to_string(), password: "root-pw".to_string() });

    let mut store = server::open_store(&config)?;
    store.add_subject("alice", "alice-pw", false)?;
    store.give_ticket("root", "alice", &Ticket::parse("rw:/", "/")?)?;

    let settings = EngineSettings { kdf_rounds: ROUNDS, target_latency_ms: 50, ..EngineSettings::default() };
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?.to_string();
    let shutdown = Arc::new(AtomicBool::new(false));

    let flag = shutdown.clone();
    let server_thread = thread::spawn(move || -> Result<()> {
        let mut engine = Engine::new(settings, store, SystemClock::default());
        server::serve(listener, &mut engine, &flag, 5)
    });

    let payload: Vec<u8> = (0..CHUNK_SIZE + 700).map(|i| (i % 253) as u8).collect();
    let chunks: Vec<&[u8]> = payload.chunks(CHUNK_SIZE).collect();

    let mut client = TcpClient::connect(&addr)?;
    client.login("alice", "alice-pw")?;
    client.send(
        Command::PushFile,
        &["blob.bin".into(), Value::Bytes(Vec::new()), Value::Int(0), Value::Int(chunks.len() as u64)],
    )?;
    for (i, chunk) in chunks.iter().enumerate() {
        client.send(
            Command::XferFile,
            &[Value::Bytes(chunk.to_vec()), Value::Int(i as u64), Value::Int(chunk.len() as u64)],
        )?;
    }

    // Pushes get no reply; a listing on the same session orders after it
    client.send(Command::ListObjectClient, &[])?;
    let listing = client.recv()?;
    assert_eq!(listing.command, Command::ListObjectServer);
    assert_eq!(listing.list("Objects")?, ["blob.bin".to_string()]);

    // A second connection sees the upload
    let mut reader = TcpClient::connect(&addr)?;
    reader.login("alice", "alice-pw")?;

    reader.send(Command::PullFile, &["/blob.bin".into()])?;
    let mut received = Vec::new();
    loop {
        let msg = reader.recv()?;
        assert_eq!(msg.command, Command::XferFile);
        let data = msg.bytes("Data")?;
        received.extend_from_slice(data);
        if data.len() < CHUNK_SIZE {
            break;
        }
    }
    assert_eq!(received, payload);

    reader.send(Command::Die, &[])?;
    client.send(Command::Die, &[])?;

    shutdown.store(true, Ordering::SeqCst);
    server_thread.join().expect("server thread panicked")?;

    // The catalog was persisted on disk
    let reopened = server::open_store(&config)?;
    assert!(reopened.object_exists("/blob.bin"));
    Ok(())
}
