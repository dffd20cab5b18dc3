//! The live session: one multiplexed transport plus everything negotiated
//! while establishing it. Created by the supervisor on a successful
//! handshake, swapped atomically into the dispatcher's cell, and torn down
//! when the serve loop unwinds or the heartbeat escalates.

use std::net::SocketAddr;

use crate::address::Address;
use crate::ident::{Identity, SessionGrant};
use crate::mux::MuxSession;

pub(crate) struct Session {
    pub mux: MuxSession,
    pub grant: SessionGrant,
    pub ident: Identity,
    pub addr: Address,
    pub local: SocketAddr,
    pub peer: SocketAddr,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.grant.id)
            .field("addr", &self.addr)
            .field("local", &self.local)
            .field("peer", &self.peer)
            .finish()
    }
}
