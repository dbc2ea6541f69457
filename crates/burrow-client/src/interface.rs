//! Seams to the out-of-scope collaborators: the user interface above the
//! session manager and the encrypted local store beside it.

use std::sync::Arc;

use tokio::sync::{mpsc, Notify};

use burrow_proto::{messages, Envelope};

use crate::error::ClientError;

/// The control surface the user interface drives.
pub trait ClientControl {
    /// Submit an outbound envelope to the upstream pipeline.
    fn upstream_message(&self, envelope: Envelope) -> Result<(), ClientError>;

    /// Share one friend's id (and our local display name for them) with a peer.
    fn share_friend(&self, peer: &str, friend: &str, name: &str) -> Result<(), ClientError>;

    /// Subscribe to a user's presence.
    fn add_friend(&self, user: &str) -> Result<(), ClientError>;

    /// Tear the connection down. No goodbye is sent; the relay infers logout
    /// from socket closure.
    fn graceful_shutdown(&self);
}

/// Cloneable handle to a running [`crate::manager::SessionManager`].
#[derive(Clone)]
pub struct ClientHandle {
    pub(crate) upstream: mpsc::UnboundedSender<Envelope>,
    pub(crate) shutdown: Arc<Notify>,
}

impl ClientControl for ClientHandle {
    fn upstream_message(&self, envelope: Envelope) -> Result<(), ClientError> {
        self.upstream
            .send(envelope)
            .map_err(|_| ClientError::Transport("session manager is gone".into()))
    }

    fn share_friend(&self, peer: &str, friend: &str, name: &str) -> Result<(), ClientError> {
        self.upstream_message(messages::share_friend(peer, friend, name))
    }

    fn add_friend(&self, user: &str) -> Result<(), ClientError> {
        self.upstream_message(messages::add_friend(user))
    }

    fn graceful_shutdown(&self) {
        self.shutdown.notify_one();
    }
}

/// A friend record as the upper layer persists it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Friend {
    pub user_id: String,
    pub name: String,
}

/// Delivery state tracked per user-message cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    NotDelivered,
}

/// Contract of the encrypted local store. The core never requires
/// transactional semantics across calls.
pub trait LocalStore {
    fn save_message(&self, peer: &str, message: &Envelope) -> Result<(), ClientError>;
    fn message_history(&self, peer: &str) -> Result<Vec<Envelope>, ClientError>;
    fn add_friend(&self, friend: &Friend) -> Result<(), ClientError>;
    fn remove_friend(&self, user_id: &str) -> Result<(), ClientError>;
    fn update_friend(&self, friend: &Friend) -> Result<(), ClientError>;
    fn friend(&self, user_id: &str) -> Result<Option<Friend>, ClientError>;
    fn update_message_status(&self, cookie: &str, status: DeliveryStatus)
        -> Result<(), ClientError>;
}
