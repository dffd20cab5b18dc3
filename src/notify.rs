//! Lifecycle callbacks.
//!
//! The supervisor invokes these synchronously, in program order:
//! `connected` once, then zero or more `disconnected`/`reconnected` pairs,
//! then at most one `exited`. Implementations must not block — hand off to
//! a channel or task for anything slow.

use crate::error::TunnelError;

pub trait Notifier: Send + Sync + 'static {
    /// First successful connect of this supervisor.
    fn connected(&self) {}

    /// The live session broke (serve loop returned or heartbeat escalated).
    fn disconnected(&self, _err: &TunnelError) {}

    /// A later dial cycle re-established the session.
    fn reconnected(&self) {}

    /// Terminal stop: no further reconnect attempts will be made.
    fn exited(&self, _err: &TunnelError) {}
}

/// Default observer: ignores everything.
pub struct NoopNotifier;

impl Notifier for NoopNotifier {}
