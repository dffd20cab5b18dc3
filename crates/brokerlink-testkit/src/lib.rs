// brokerlink-testkit: An in-process mock broker for integration tests.
//
// Accepts agent connections on 127.0.0.1:<random>, answers the CONNECT
// handshake with a scripted status sequence, and on 202 speaks the real
// multiplexer protocol: it serves the agent's control endpoints (ping,
// echo, attachment download, websocket echo) and can dial HTTP requests
// back into the agent. Tests drive failure injection through the handle
// (blackholed pings, killed sessions, scripted 406/409 handshakes).

mod mock_broker;
mod recording;

pub use mock_broker::{AttachmentFixture, BrokerScript, MockBroker};
pub use recording::{CountingIdentifier, RecordingNotifier};
