//! Client requests decoded from messages, one variant per command kind

use thiserror::Error;

use crate::protocol::Command;
use crate::protocol_core::{Message, WireError};
use crate::ticket::{Ticket, TicketError};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("BadTicketError: {0}")]
    Ticket(#[from] TicketError),
    #[error("Unexpected message type {0}")]
    Unexpected(Command),
}

/// A client-originated request. Each variant carries only its own fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Hello { version: String },
    Die,
    PullFile { file: String },
    PushFile { file: String, cur_part: u64, end_part: u64 },
    Authenticate { subject: String, salt: Vec<u8> },
    ListSubjects,
    ListObjects,
    GiveTicket { subject: String, ticket: Ticket },
    TakeTicket { subject: String, ticket: Ticket },
    MakeDirectory { directory: String },
    MakeSubject { subject: String, password: String },
    ChangeDirectory { path: String },
    MakeFilter { subject1: String, subject2: String, ticket: Ticket },
    MakeLink { subject1: String, subject2: String },
    DeleteFile { file: String },
    ClearFilters { subject: String },
    ClearLinks { subject: String },
    DeleteSubject { subject: String },
    Xfer { data: Vec<u8>, cur_part: u64, size: u64 },
}

impl Request {
    /// Convert a decoded message; ticket paths resolve against `cwd`.
    ///
    /// Server-originated commands are rejected as unexpected.
    pub fn from_message(msg: &Message, cwd: &str) -> Result<Self, RequestError> {
        let text = |name: &'static str| msg.text(name).map(str::to_string);
        let ticket = |name: &'static str| -> Result<Ticket, RequestError> { Ok(Ticket::parse(msg.text(name)?, cwd)?) };

        let req = match msg.command {
            Command::HelloClient => Request::Hello { version: text("Version")? },
            Command::Die => Request::Die,
            Command::PullFile => Request::PullFile { file: text("FileName")? },
            Command::PushFile => Request::PushFile {
                file: text("FileName")?,
                cur_part: msg.int("CurPart")?,
                end_part: msg.int("EndPart")?,
            },
            Command::AuthSubject => Request::Authenticate {
                subject: text("Subject")?,
                salt: msg.bytes("Salt")?.to_vec(),
            },
            Command::ListSubjectClient => Request::ListSubjects,
            Command::ListObjectClient => Request::ListObjects,
            Command::GiveTicketSubject => Request::GiveTicket { subject: text("Subject")?, ticket: ticket("Ticket")? },
            Command::TakeTicketSubject => Request::TakeTicket { subject: text("Subject")?, ticket: ticket("Ticket")? },
            Command::MakeDirectory => Request::MakeDirectory { directory: text("Directory")? },
            Command::MakeSubject => Request::MakeSubject { subject: text("Subject")?, password: text("Password")? },
            Command::Cd => Request::ChangeDirectory { path: text("Path")? },
            Command::MakeFilter => Request::MakeFilter {
                subject1: text("Subject1")?,
                subject2: text("Subject2")?,
                ticket: ticket("Ticket")?,
            },
            Command::MakeLink => Request::MakeLink { subject1: text("Subject1")?, subject2: text("Subject2")? },
            Command::DeleteFile => Request::DeleteFile { file: text("FileName")? },
            Command::ClearFilters => Request::ClearFilters { subject: text("Subject")? },
            Command::ClearLinks => Request::ClearLinks { subject: text("Subject")? },
            Command::DeleteSubject => Request::DeleteSubject { subject: text("Subject")? },
            Command::XferFile => Request::Xfer {
                data: msg.bytes("Data")?.to_vec(),
                cur_part: msg.int("CurPart")?,
                size: msg.int("BSize")?,
            },
            other @ (Command::HelloServer
            | Command::ErrorServer
            | Command::ListSubjectServer
            | Command::ListObjectServer
            | Command::ConfirmAuth
            | Command::RejectAuth) => return Err(RequestError::Unexpected(other)),
        };
        Ok(req)
    }

    /// The command this request was decoded from.
    pub fn command(&self) -> Command {
        match self {
            Request::Hello { .. } => Command::HelloClient,
            Request::Die => Command::Die,
            Request::PullFile { .. } => Command::PullFile,
            Request::PushFile { .. } => Command::PushFile,
            Request::Authenticate { .. } => Command::AuthSubject,
            Request::ListSubjects => Command::ListSubjectClient,
            Request::ListObjects => Command::ListObjectClient,
            Request::GiveTicket { .. } => Command::GiveTicketSubject,
            Request::TakeTicket { .. } => Command::TakeTicketSubject,
            Request::MakeDirectory { .. } => Command::MakeDirectory,
            Request::MakeSubject { .. } => Command::MakeSubject,
            Request::ChangeDirectory { .. } => Command::Cd,
            Request::MakeFilter { .. } => Command::MakeFilter,
            Request::MakeLink { .. } => Command::MakeLink,
            Request::DeleteFile { .. } => Command::DeleteFile,
            Request::ClearFilters { .. } => Command::ClearFilters,
            Request::ClearLinks { .. } => Command::ClearLinks,
            Request::DeleteSubject { .. } => Command::DeleteSubject,
            Request::Xfer { .. } => Command::XferFile,
        }
    }
}
