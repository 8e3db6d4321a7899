//! Wire codec and virtual path handling shared by the engine and the stores
//!
//! A frame is a space-separated token line: the command name, one token per
//! argument in descriptor order, optionally an authentication tag, then a
//! newline. The line is right-padded with spaces to [`FRAME_SIZE`] and, in
//! private mode, encrypted as a whole.

use anyhow::{bail, Result};
use std::fmt::Write as _;
use thiserror::Error;

use crate::crypto::{FrameCipher, Signer};
use crate::protocol::{ArgKind, ArgSpec, Command, CommandSpec, FRAME_SIZE};

/// Token used for empty text, byte blocks and lists.
const EMPTY: &str = "-";

/// Taxonomy class of a codec failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Framing,
    Integrity,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("empty frame")]
    Empty,
    #[error("frame is not valid UTF-8")]
    NotText,
    #[error("frame larger than {FRAME_SIZE} bytes ({0})")]
    Oversize(usize),
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("bad message format: {command} expects {expected} tokens, got {got}")]
    TokenCount { command: &'static str, expected: usize, got: usize },
    #[error("{command} expects {expected} arguments, got {got}")]
    ArgCount { command: &'static str, expected: usize, got: usize },
    #[error("argument {name} has the wrong kind")]
    ArgKind { name: &'static str },
    #[error("argument {name} is malformed")]
    Malformed { name: &'static str },
    #[error("argument {name} exceeds {max} bytes")]
    FieldTooLong { name: &'static str, max: usize },
    #[error("{0} must be signed but no signing key is installed")]
    Unsigned(&'static str),
    #[error("HMAC failure")]
    BadTag,
}

impl WireError {
    pub fn class(&self) -> ErrorClass {
        match self {
            WireError::Unsigned(_) | WireError::BadTag => ErrorClass::Integrity,
            _ => ErrorClass::Framing,
        }
    }
}

/// One typed argument value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Text(String),
    Bytes(Vec<u8>),
    Int(u64),
    List(Vec<String>),
}

impl Value {
    fn kind(&self) -> ArgKind {
        match self {
            Value::Text(_) => ArgKind::Text,
            Value::Bytes(_) => ArgKind::Bytes,
            Value::Int(_) => ArgKind::Int,
            Value::List(_) => ArgKind::List,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Int(n)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

/// A decoded frame: command plus arguments in descriptor order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub command: Command,
    pub args: Vec<Value>,
    /// Whether a tag was present and verified.
    pub signed: bool,
}

impl Message {
    pub fn new(command: Command, args: Vec<Value>) -> Self {
        Self { command, args, signed: false }
    }

    pub fn spec(&self) -> &'static CommandSpec {
        self.command.spec()
    }

    pub fn get(&self, name: &'static str) -> Result<&Value, WireError> {
        self.spec()
            .arg_index(name)
            .and_then(|i| self.args.get(i))
            .ok_or(WireError::Malformed { name })
    }

    pub fn text(&self, name: &'static str) -> Result<&str, WireError> {
        match self.get(name)? {
            Value::Text(s) => Ok(s),
            _ => Err(WireError::ArgKind { name }),
        }
    }

    pub fn bytes(&self, name: &'static str) -> Result<&[u8], WireError> {
        match self.get(name)? {
            Value::Bytes(b) => Ok(b),
            _ => Err(WireError::ArgKind { name }),
        }
    }

    pub fn int(&self, name: &'static str) -> Result<u64, WireError> {
        match self.get(name)? {
            Value::Int(n) => Ok(*n),
            _ => Err(WireError::ArgKind { name }),
        }
    }

    pub fn list(&self, name: &'static str) -> Result<&[String], WireError> {
        match self.get(name)? {
            Value::List(items) => Ok(items),
            _ => Err(WireError::ArgKind { name }),
        }
    }
}

/// Build one fixed-size frame.
///
/// A tag is appended when the command's signing policy requires it for the
/// current mode; the mode is private iff a signer is supplied.
pub fn encode(
    command: Command,
    args: &[Value],
    cipher: Option<&mut FrameCipher>,
    signer: Option<&Signer>,
) -> Result<Vec<u8>, WireError> {
    let spec = command.spec();
    if args.len() != spec.args.len() {
        return Err(WireError::ArgCount { command: spec.name, expected: spec.args.len(), got: args.len() });
    }

    let mut line = String::from(spec.name);
    for (arg, value) in spec.args.iter().zip(args) {
        line.push(' ');
        encode_value(arg, value, &mut line)?;
    }

    if spec.signing.required(signer.is_some()) {
        let signer = signer.ok_or(WireError::Unsigned(spec.name))?;
        let tag = signer.sign(&line);
        line.push(' ');
        line.push_str(&tag);
    }
    line.push('\n');

    if line.len() > FRAME_SIZE {
        return Err(WireError::Oversize(line.len()));
    }
    let mut frame = line.into_bytes();
    frame.resize(FRAME_SIZE, b' ');

    if let Some(cipher) = cipher {
        cipher.apply(&mut frame);
    }
    Ok(frame)
}

/// Parse one frame; padding may be any length up to [`FRAME_SIZE`].
pub fn decode(
    raw: &[u8],
    cipher: Option<&mut FrameCipher>,
    signer: Option<&Signer>,
) -> Result<Message, WireError> {
    if raw.len() > FRAME_SIZE {
        return Err(WireError::Oversize(raw.len()));
    }
    let mut buf = raw.to_vec();
    if let Some(cipher) = cipher {
        cipher.apply(&mut buf);
    }
    let text = std::str::from_utf8(&buf).map_err(|_| WireError::NotText)?;

    let tokens: Vec<&str> = text.split_ascii_whitespace().collect();
    let first = tokens.first().ok_or(WireError::Empty)?;
    let spec = Command::lookup(first).ok_or_else(|| WireError::UnknownCommand(truncate(first, 64)))?;

    let signed = spec.signing.required(signer.is_some());
    let expected = 1 + spec.args.len() + usize::from(signed);
    if tokens.len() != expected {
        return Err(WireError::TokenCount { command: spec.name, expected, got: tokens.len() });
    }

    if signed {
        let signer = signer.ok_or(WireError::Unsigned(spec.name))?;
        let (tag, body) = tokens.split_last().ok_or(WireError::Empty)?;
        if !signer.verify(&body.join(" "), tag) {
            return Err(WireError::BadTag);
        }
    }

    let args = spec
        .args
        .iter()
        .zip(&tokens[1..])
        .map(|(arg, token)| decode_value(arg, token))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Message { command: spec.command, args, signed })
}

fn encode_value(arg: &ArgSpec, value: &Value, out: &mut String) -> Result<(), WireError> {
    if value.kind() != arg.kind {
        return Err(WireError::ArgKind { name: arg.name });
    }
    match value {
        Value::Text(s) => {
            check_len(arg, s.len())?;
            out.push_str(&escape(s));
        }
        Value::Bytes(b) => {
            check_len(arg, b.len())?;
            if b.is_empty() {
                out.push_str(EMPTY);
            } else {
                out.push_str(&hex::encode(b));
            }
        }
        Value::Int(n) => {
            let _ = write!(out, "{}", n);
        }
        Value::List(items) => {
            if items.is_empty() {
                out.push_str(EMPTY);
                return Ok(());
            }
            if items.iter().any(|i| i.is_empty()) {
                return Err(WireError::Malformed { name: arg.name });
            }
            let joined = items.iter().map(|i| escape(i)).collect::<Vec<_>>().join(",");
            check_len(arg, joined.len())?;
            out.push_str(&joined);
        }
    }
    Ok(())
}

fn decode_value(arg: &ArgSpec, token: &str) -> Result<Value, WireError> {
    let malformed = || WireError::Malformed { name: arg.name };
    match arg.kind {
        ArgKind::Text => {
            let s = unescape(token).ok_or_else(malformed)?;
            check_len(arg, s.len())?;
            Ok(Value::Text(s))
        }
        ArgKind::Bytes => {
            if token == EMPTY {
                return Ok(Value::Bytes(Vec::new()));
            }
            // Check before decoding so oversize payloads are not materialised
            check_len(arg, token.len() / 2)?;
            hex::decode(token).map(Value::Bytes).map_err(|_| malformed())
        }
        ArgKind::Int => {
            if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
                return Err(malformed());
            }
            token.parse::<u64>().map(Value::Int).map_err(|_| malformed())
        }
        ArgKind::List => {
            check_len(arg, token.len())?;
            if token == EMPTY {
                return Ok(Value::List(Vec::new()));
            }
            token
                .split(',')
                .map(|item| match unescape(item) {
                    Some(s) if !s.is_empty() => Ok(s),
                    _ => Err(malformed()),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List)
        }
    }
}

fn check_len(arg: &ArgSpec, len: usize) -> Result<(), WireError> {
    if len > arg.max_len {
        return Err(WireError::FieldTooLong { name: arg.name, max: arg.max_len });
    }
    Ok(())
}

/// Percent-escape a text value into a single whitespace-free token.
pub fn escape(s: &str) -> String {
    if s.is_empty() {
        return EMPTY.to_string();
    }
    if s == EMPTY {
        return "%2D".to_string();
    }
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_graphic() && b != b'%' && b != b',' {
            out.push(b as char);
        } else {
            let _ = write!(out, "%{:02X}", b);
        }
    }
    out
}

/// Inverse of [`escape`]; `None` for malformed escapes or invalid UTF-8.
pub fn unescape(token: &str) -> Option<String> {
    if token == EMPTY {
        return Some(String::new());
    }
    let bytes = token.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hi = (*bytes.get(i + 1)? as char).to_digit(16)?;
            let lo = (*bytes.get(i + 2)? as char).to_digit(16)?;
            out.push((hi * 16 + lo) as u8);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Resolve `name` against the virtual working directory `cwd`.
///
/// The result is absolute, uses `/` separators, has no `.`/`..` components
/// and no trailing slash (except the root itself).
/// This prevents path traversal by:
/// 1. Rejecting NUL bytes and backslashes
/// 2. Refusing `..` that would climb above the root
pub fn normalize_virtual(cwd: &str, name: &str) -> Result<String> {
    if name.contains('\0') {
        bail!("path contains NUL byte");
    }
    if name.contains('\\') {
        bail!("path contains backslash");
    }
    if name.is_empty() {
        bail!("empty path");
    }

    let mut parts: Vec<&str> = Vec::new();
    let start = if name.starts_with('/') { "" } else { cwd };
    for component in start.split('/').chain(name.split('/')) {
        match component {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    bail!("path {:?} escapes root", name);
                }
            }
            other => parts.push(other),
        }
    }
    Ok(format!("/{}", parts.join("/")))
}

/// Parent directory of a normalized virtual path (`None` for the root).
pub fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(i) => Some(&path[..i]),
        None => None,
    }
}

/// True if `path` equals `dir` or lies beneath it.
pub fn is_within(path: &str, dir: &str) -> bool {
    if dir == "/" || path == dir {
        return true;
    }
    path.strip_prefix(dir).map_or(false, |rest| rest.starts_with('/'))
}
