use burrow_proto::{CloseReason, Envelope};

/// Events delivered to a session's bounded queue. The downstream writer
/// transforms them into envelopes (or a close frame) before they reach the
/// wire; events themselves never cross it.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A routed envelope to pass through.
    Message(Envelope),
    /// A subscribed peer logged in; the writer attaches a vended key bundle.
    Login(String),
    /// A subscribed or watched peer logged out.
    Logout(String),
    /// Ask the client for this many fresh one-time keys.
    Replenish(usize),
    /// Terminate the connection with the given close code.
    Close(CloseReason),
}
