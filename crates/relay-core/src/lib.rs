//! Shared vocabulary of the relay gateway: identifiers, records kept in the
//! state store, inbound transport events, and the contracts of the external
//! collaborators (transport adapter, reply engine, channel directory).

pub mod directory;
pub mod errors;
pub mod events;
pub mod ids;
pub mod mock;
pub mod monitor;
pub mod presence;
pub mod record;
pub mod reply;
pub mod session;
pub mod transport;

pub use errors::{ReplyError, TransportError};
pub use ids::{BotId, ChannelId, ChatId, ServerId, SessionKey};
pub use record::Record;
