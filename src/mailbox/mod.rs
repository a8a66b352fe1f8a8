//! Mail server access: protocol client, session, search and paging.

pub mod pager;
pub mod parse;
pub mod session;
pub mod transport;
pub mod wire;

pub use pager::{FetchedChunk, PageStream, Pager};
pub use parse::{AttachmentMeta, Envelope, FetchedMessage};
pub use session::{LivenessSource, Session, SessionSnapshot};
pub use transport::{Connector, MailTransport, MailboxInfo, RawMessage};
pub use wire::ImapConnector;
