pub mod envelope;
pub mod error;
pub mod messages;
pub mod msg_id;
pub mod status;

pub use envelope::{Envelope, Header};
pub use error::ProtoError;
pub use messages::PEER_HANDSHAKE_MAGIC;
pub use msg_id::MsgId;
pub use status::CloseReason;
