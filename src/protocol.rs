//! Shared protocol constants and the command registry for SPM framed transport

use lazy_static::lazy_static;
use std::collections::HashMap;

// Version string exchanged in HELLO_CLIENT / HELLO_SERVER
pub const VERSION: &str = "SPM/1";

// Every frame on the wire is exactly this many bytes, padded with spaces.
// Fixed size hides the length of short control messages.
pub const FRAME_SIZE: usize = 4096;

// Payload bytes carried by one XFER_FILE frame (hex encoded on the wire)
pub const CHUNK_SIZE: usize = 1920;

// Field limits (decoded lengths)
pub mod limits {
    pub const SUBJECT: usize = 64;
    pub const PASSWORD: usize = 64;
    pub const SALT: usize = 32;
    pub const PATH: usize = 256;
    pub const TICKET: usize = 4 + PATH;
    pub const VERSION: usize = 32;
    pub const ERROR_MESSAGE: usize = 2048;
    pub const PUSH_DATA: usize = 256;
    // Encoded size budget for LIST_*_SERVER payloads
    pub const LIST: usize = 3072;
}

// Worst-case XFER_FILE: name, hex payload, two u64s, tag, separators, newline
const XFER_OVERHEAD: usize = 9 + 20 + 20 + 64 + 5;
const _: () = assert!(CHUNK_SIZE * 2 + XFER_OVERHEAD <= FRAME_SIZE);

// Session key derivation
pub mod kdf {
    pub const ROUNDS: u32 = 1 << 14;
    // 32 bytes ChaCha20 key + 64 bytes HMAC key
    pub const KEY_MATERIAL: usize = 96;
}

// Adaptive read back-off defaults (ms)
pub mod backoff {
    // Aim to keep each connection's read-to-read interval near this value
    pub const TARGET_LATENCY_MS: u64 = 500;
    // Added to the block duration whenever the server looks idle
    pub const STEP_MS: u64 = 10;
}

/// How a command's frames are authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signing {
    /// Never carries a tag (handshake, authentication).
    Never,
    /// Always carries a tag; rejected when no signer is installed.
    Always,
    /// Carries a tag iff the session has been upgraded to private mode.
    Session,
}

impl Signing {
    /// Whether a frame of this kind carries a tag given the session mode.
    pub fn required(self, private: bool) -> bool {
        match self {
            Signing::Never => false,
            Signing::Always => true,
            Signing::Session => private,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Text,
    Bytes,
    Int,
    List,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgSpec {
    pub name: &'static str,
    pub kind: ArgKind,
    pub max_len: usize,
}

const fn text(name: &'static str, max_len: usize) -> ArgSpec {
    ArgSpec { name, kind: ArgKind::Text, max_len }
}

const fn bytes(name: &'static str, max_len: usize) -> ArgSpec {
    ArgSpec { name, kind: ArgKind::Bytes, max_len }
}

const fn int(name: &'static str) -> ArgSpec {
    ArgSpec { name, kind: ArgKind::Int, max_len: 20 }
}

const fn list(name: &'static str) -> ArgSpec {
    ArgSpec { name, kind: ArgKind::List, max_len: limits::LIST }
}

/// Static descriptor of one command kind.
#[derive(Debug)]
pub struct CommandSpec {
    pub command: Command,
    pub name: &'static str,
    pub args: &'static [ArgSpec],
    pub signing: Signing,
}

impl CommandSpec {
    pub fn arg_index(&self, name: &str) -> Option<usize> {
        self.args.iter().position(|a| a.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    HelloServer,
    HelloClient,
    Die,
    PullFile,
    PushFile,
    ErrorServer,
    AuthSubject,
    ListSubjectClient,
    ListSubjectServer,
    ListObjectClient,
    ListObjectServer,
    GiveTicketSubject,
    TakeTicketSubject,
    MakeDirectory,
    MakeSubject,
    Cd,
    MakeFilter,
    MakeLink,
    DeleteFile,
    ClearFilters,
    ClearLinks,
    DeleteSubject,
    XferFile,
    ConfirmAuth,
    RejectAuth,
}

use limits::{ERROR_MESSAGE, PASSWORD, PATH, PUSH_DATA, SALT, SUBJECT, TICKET};

static SPECS: &[CommandSpec] = &[
    CommandSpec { command: Command::HelloServer, name: "HELLO_SERVER", args: &[text("Version", limits::VERSION)], signing: Signing::Never },
    CommandSpec { command: Command::HelloClient, name: "HELLO_CLIENT", args: &[text("Version", limits::VERSION)], signing: Signing::Never },
    CommandSpec { command: Command::Die, name: "DIE", args: &[], signing: Signing::Session },
    CommandSpec { command: Command::PullFile, name: "PULL_FILE", args: &[text("FileName", PATH)], signing: Signing::Always },
    CommandSpec {
        command: Command::PushFile,
        name: "PUSH_FILE",
        args: &[text("FileName", PATH), bytes("Data", PUSH_DATA), int("CurPart"), int("EndPart")],
        signing: Signing::Always,
    },
    CommandSpec { command: Command::ErrorServer, name: "ERROR_SERVER", args: &[text("Message", ERROR_MESSAGE)], signing: Signing::Session },
    CommandSpec { command: Command::AuthSubject, name: "AUTH_SUBJECT", args: &[text("Subject", SUBJECT), bytes("Salt", SALT)], signing: Signing::Never },
    CommandSpec { command: Command::ListSubjectClient, name: "LIST_SUBJECT_CLIENT", args: &[], signing: Signing::Always },
    CommandSpec { command: Command::ListSubjectServer, name: "LIST_SUBJECT_SERVER", args: &[list("Subjects")], signing: Signing::Always },
    CommandSpec { command: Command::ListObjectClient, name: "LIST_OBJECT_CLIENT", args: &[], signing: Signing::Always },
    CommandSpec { command: Command::ListObjectServer, name: "LIST_OBJECT_SERVER", args: &[list("Objects")], signing: Signing::Always },
    CommandSpec {
        command: Command::GiveTicketSubject,
        name: "GIVE_TICKET_SUBJECT",
        args: &[text("Subject", SUBJECT), text("Ticket", TICKET)],
        signing: Signing::Always,
    },
    CommandSpec {
        command: Command::TakeTicketSubject,
        name: "TAKE_TICKET_SUBJECT",
        args: &[text("Subject", SUBJECT), text("Ticket", TICKET)],
        signing: Signing::Always,
    },
    CommandSpec { command: Command::MakeDirectory, name: "MAKE_DIRECTORY", args: &[text("Directory", PATH)], signing: Signing::Always },
    CommandSpec {
        command: Command::MakeSubject,
        name: "MAKE_SUBJECT",
        args: &[text("Subject", SUBJECT), text("Password", PASSWORD)],
        signing: Signing::Always,
    },
    CommandSpec { command: Command::Cd, name: "CD", args: &[text("Path", PATH)], signing: Signing::Always },
    CommandSpec {
        command: Command::MakeFilter,
        name: "MAKE_FILTER",
        args: &[text("Subject1", SUBJECT), text("Subject2", SUBJECT), text("Ticket", TICKET)],
        signing: Signing::Always,
    },
    CommandSpec {
        command: Command::MakeLink,
        name: "MAKE_LINK",
        args: &[text("Subject1", SUBJECT), text("Subject2", SUBJECT)],
        signing: Signing::Always,
    },
    CommandSpec { command: Command::DeleteFile, name: "DELETE_FILE", args: &[text("FileName", PATH)], signing: Signing::Always },
    CommandSpec { command: Command::ClearFilters, name: "CLEAR_FILTERS", args: &[text("Subject", SUBJECT)], signing: Signing::Always },
    CommandSpec { command: Command::ClearLinks, name: "CLEAR_LINKS", args: &[text("Subject", SUBJECT)], signing: Signing::Always },
    CommandSpec { command: Command::DeleteSubject, name: "DELETE_SUBJECT", args: &[text("Subject", SUBJECT)], signing: Signing::Always },
    CommandSpec {
        command: Command::XferFile,
        name: "XFER_FILE",
        args: &[bytes("Data", CHUNK_SIZE), int("CurPart"), int("BSize")],
        signing: Signing::Always,
    },
    CommandSpec { command: Command::ConfirmAuth, name: "CONFIRM_AUTH", args: &[text("Subject", SUBJECT)], signing: Signing::Always },
    CommandSpec { command: Command::RejectAuth, name: "REJECT_AUTH", args: &[], signing: Signing::Never },
];

lazy_static! {
    // Built once, read-only afterwards
    static ref REGISTRY: HashMap<&'static str, &'static CommandSpec> =
        SPECS.iter().map(|spec| (spec.name, spec)).collect();
}

impl Command {
    pub const ALL: [Command; 25] = [
        Command::HelloServer,
        Command::HelloClient,
        Command::Die,
        Command::PullFile,
        Command::PushFile,
        Command::ErrorServer,
        Command::AuthSubject,
        Command::ListSubjectClient,
        Command::ListSubjectServer,
        Command::ListObjectClient,
        Command::ListObjectServer,
        Command::GiveTicketSubject,
        Command::TakeTicketSubject,
        Command::MakeDirectory,
        Command::MakeSubject,
        Command::Cd,
        Command::MakeFilter,
        Command::MakeLink,
        Command::DeleteFile,
        Command::ClearFilters,
        Command::ClearLinks,
        Command::DeleteSubject,
        Command::XferFile,
        Command::ConfirmAuth,
        Command::RejectAuth,
    ];

    /// Descriptor for this command. `SPECS` is ordered like the enum.
    pub fn spec(self) -> &'static CommandSpec {
        &SPECS[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.spec().name
    }

    /// Look up a command by its exact wire name.
    pub fn lookup(name: &str) -> Option<&'static CommandSpec> {
        REGISTRY.get(name).copied()
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_registry_has_no_duplicates() {
        let names: HashSet<_> = SPECS.iter().map(|s| s.name).collect();
        assert_eq!(names.len(), SPECS.len());
        assert_eq!(REGISTRY.len(), SPECS.len());
    }

    #[test]
    fn test_every_command_has_matching_descriptor() {
        for command in Command::ALL {
            let spec = command.spec();
            assert_eq!(spec.command, command);
            let found = Command::lookup(spec.name).unwrap();
            assert_eq!(found.command, command);
        }
    }

    #[test]
    fn test_lookup_is_exact_match() {
        assert!(Command::lookup("hello_client").is_none());
        assert!(Command::lookup("HELLO_CLIENT ").is_none());
        assert!(Command::lookup("HELLO").is_none());
    }

    #[test]
    fn test_signing_policy() {
        assert!(!Signing::Never.required(true));
        assert!(Signing::Always.required(false));
        assert!(Signing::Session.required(true));
        assert!(!Signing::Session.required(false));
        assert_eq!(Command::AuthSubject.spec().signing, Signing::Never);
        assert_eq!(Command::ErrorServer.spec().signing, Signing::Session);
        assert_eq!(Command::XferFile.spec().signing, Signing::Always);
    }

    #[test]
    fn test_arg_index() {
        let spec = Command::PushFile.spec();
        assert_eq!(spec.arg_index("FileName"), Some(0));
        assert_eq!(spec.arg_index("EndPart"), Some(3));
        assert_eq!(spec.arg_index("Nope"), None);
    }
}
