//! Single-writer arbitration for a session.
//!
//! When a connection binds to a session that already has a writer, the
//! registry asks [`decide`] what kind of bind this is and, after publishing
//! the new writer, hands the previous one to [`displace`].

use relayterm_protocol::{ControlMessage, Frame, close_code};
use tracing::{debug, info};

use crate::session::ConnectionRef;

/// Outcome of binding `incoming` to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindDecision {
    /// The session had no writer.
    Attach,
    /// `incoming` is already the writer.
    AlreadyActive,
    /// Same logical client on a new socket. The stale socket closes quietly.
    Reattach,
    /// A different client claims the session.
    Takeover,
}

pub fn decide(current: Option<&ConnectionRef>, incoming: &ConnectionRef) -> BindDecision {
    let Some(current) = current else {
        return BindDecision::Attach;
    };
    if current.id() == incoming.id() {
        return BindDecision::AlreadyActive;
    }
    match (current.client_id(), incoming.client_id()) {
        (Some(a), Some(b)) if a == b => BindDecision::Reattach,
        _ => BindDecision::Takeover,
    }
}

/// Notify and close the writer that just lost the session.
///
/// Must run after the new writer has been published. The notice is
/// best-effort; the close is what removes the old socket.
pub(crate) fn displace(previous: &ConnectionRef, decision: BindDecision, session: &str) {
    match decision {
        BindDecision::Takeover => {
            if !previous.try_send(Frame::Control(ControlMessage::takeover())) {
                debug!(conn = %previous.id(), "Takeover notice not queued, outbound queue full");
            }
            previous.close(close_code::TAKEOVER, "session taken over by another client");
            info!(session = %session, conn = %previous.id(), "Session taken over");
        }
        BindDecision::Reattach => {
            previous.close(close_code::SUPERSEDED, "superseded by a newer connection");
            debug!(session = %session, conn = %previous.id(), "Stale connection superseded by reattach");
        }
        BindDecision::Attach | BindDecision::AlreadyActive => {}
    }
}
