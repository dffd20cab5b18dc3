//! Connection supervisor.
//!
//! Drives the lifecycle: dial → handshake → session → serve + heartbeat →
//! detect breakage → backoff → redial, with terminal exits on `406`, a
//! single machine-id rebuild on `409`, and cancellation threaded through
//! every blocking step.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::address::AddressBook;
use crate::config::Config;
use crate::dial::Dialer;
use crate::dispatch::Tunnel;
use crate::error::TunnelError;
use crate::handshake;
use crate::heartbeat;
use crate::ident::Identity;
use crate::listener::{ClosedServer, InboundServer, StreamListener};
use crate::machine_id::{Identifier, MachineId};
use crate::mux::MuxSession;
use crate::notify::{NoopNotifier, Notifier};
use crate::secret::{Cipher, PresharedCipher};
use crate::session::Session;

const DIAL_TIMEOUT: Duration = Duration::from_secs(3);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Sessions shorter than this are flapping; wait it out before redialing.
const FLAP_GUARD: Duration = Duration::from_secs(5);

/// Backoff before the next dial, as a pure function of time elapsed since
/// the current attempt cycle began.
pub(crate) fn backoff_delay(elapsed: Duration) -> Duration {
    const MIN: u64 = 60;
    match elapsed.as_secs() {
        s if s < 3 * MIN => Duration::from_secs(2),
        s if s < 10 * MIN => Duration::from_secs(10),
        s if s < 30 * MIN => Duration::from_secs(30),
        s if s < 60 * MIN => Duration::from_secs(60),
        s if s < 12 * 60 * MIN => Duration::from_secs(5 * 60),
        _ => Duration::from_secs(10 * 60),
    }
}

/// Connect with defaults: no notifier, no inbound server, heartbeat off.
pub async fn open(cfg: Config) -> Result<Tunnel, TunnelError> {
    TunnelBuilder::new().open(cfg).await
}

/// Assembles a supervisor. All parts have working defaults; embedders
/// override the seams they care about.
pub struct TunnelBuilder {
    notifier: Arc<dyn Notifier>,
    identifier: Arc<dyn Identifier>,
    cipher: Arc<dyn Cipher>,
    server: Arc<dyn InboundServer>,
    heartbeat: Duration,
    clamp_heartbeat: bool,
    token: CancellationToken,
}

impl TunnelBuilder {
    pub fn new() -> TunnelBuilder {
        TunnelBuilder {
            notifier: Arc::new(NoopNotifier),
            identifier: Arc::new(MachineId::default()),
            cipher: Arc::new(PresharedCipher::default()),
            server: Arc::new(ClosedServer),
            heartbeat: Duration::ZERO,
            clamp_heartbeat: true,
            token: CancellationToken::new(),
        }
    }

    /// Lifecycle observer. Callbacks fire synchronously; keep them quick.
    pub fn notifier(mut self, notifier: impl Notifier) -> TunnelBuilder {
        self.notifier = Arc::new(notifier);
        self
    }

    /// Machine-id source; defaults to the cached SHA-1 fingerprint.
    pub fn identifier(mut self, identifier: impl Identifier) -> TunnelBuilder {
        self.identifier = Arc::new(identifier);
        self
    }

    /// Handshake envelope crypto; defaults to the built-in pre-shared key.
    pub fn cipher(mut self, cipher: impl Cipher) -> TunnelBuilder {
        self.cipher = Arc::new(cipher);
        self
    }

    /// Server for broker-originated requests; defaults to accept-and-drop.
    pub fn server(mut self, server: impl InboundServer) -> TunnelBuilder {
        self.server = Arc::new(server);
        self
    }

    /// Heartbeat interval. Zero disables the monitor; non-zero values are
    /// clamped to `[1 min, 20 min]`.
    pub fn heartbeat_interval(mut self, interval: Duration) -> TunnelBuilder {
        self.heartbeat = interval;
        self.clamp_heartbeat = true;
        self
    }

    /// Test hook: accept the interval verbatim so suites can tick fast.
    #[doc(hidden)]
    pub fn heartbeat_interval_unclamped(mut self, interval: Duration) -> TunnelBuilder {
        self.heartbeat = interval;
        self.clamp_heartbeat = false;
        self
    }

    /// Parent cancellation: cancelling this token stops the supervisor and
    /// fails in-flight operations.
    pub fn cancellation(mut self, token: CancellationToken) -> TunnelBuilder {
        self.token = token;
        self
    }

    /// Validate, dial, handshake, and hand back the live [`Tunnel`].
    ///
    /// `connected` has fired by the time this returns `Ok`; the serve loop
    /// and heartbeat monitor are running in background tasks. A terminal
    /// failure during this first cycle (`406`, cancellation) is returned
    /// directly without a `exited` callback.
    pub async fn open(self, cfg: Config) -> Result<Tunnel, TunnelError> {
        cfg.validate()?;
        let book = AddressBook::parse(&cfg.addresses, cfg.server_name.as_deref())?;

        let interval = if self.clamp_heartbeat {
            heartbeat::clamp_interval(self.heartbeat)
        } else if self.heartbeat.is_zero() {
            None
        } else {
            Some(self.heartbeat)
        };

        let base_ident = Identity::collect(&cfg, interval.unwrap_or(Duration::ZERO));
        let identifier = self.identifier.clone();
        let machine_id = {
            let identifier = identifier.clone();
            tokio::task::spawn_blocking(move || identifier.machine_id(false))
                .await
                .map_err(|e| TunnelError::Handshake(format!("machine id task failed: {e}")))?
        };

        let tunnel = Tunnel::new(cfg.clone(), self.token.clone());
        let mut supervisor = Supervisor {
            dialer: Dialer::new(book),
            base_ident,
            machine_id,
            rebuilt: false,
            identifier,
            cipher: self.cipher,
            notifier: self.notifier,
            server: self.server,
            token: self.token,
            tunnel: tunnel.clone(),
        };

        let session = supervisor.dial_cycle().await?;
        tunnel.install(session);
        supervisor.notifier.connected();
        info!(
            id = tunnel.id(),
            broker = %tunnel.broker_addr().map(|a| a.to_string()).unwrap_or_default(),
            "tunnel established"
        );

        if let Some(interval) = interval {
            tokio::spawn(heartbeat::run(
                tunnel.clone(),
                interval,
                supervisor.token.clone(),
            ));
        }
        tokio::spawn(supervisor.run());

        Ok(tunnel)
    }
}

impl Default for TunnelBuilder {
    fn default() -> Self {
        TunnelBuilder::new()
    }
}

struct Supervisor {
    dialer: Dialer,
    base_ident: Identity,
    machine_id: String,
    /// The one-shot duplicate-registration recovery has been used.
    rebuilt: bool,
    identifier: Arc<dyn Identifier>,
    cipher: Arc<dyn Cipher>,
    notifier: Arc<dyn Notifier>,
    server: Arc<dyn InboundServer>,
    token: CancellationToken,
    tunnel: Tunnel,
}

impl Supervisor {
    /// Serve loop: runs after the first connect, reconnecting until a
    /// terminal failure or cancellation.
    async fn run(mut self) {
        loop {
            let Some(session) = self.tunnel.current_session() else {
                break;
            };
            let listener = StreamListener::new(session.mux.clone());
            let connected_at = Instant::now();
            let server = self.server.clone();
            let serve = server.serve(listener);
            tokio::pin!(serve);
            let err: TunnelError = tokio::select! {
                () = self.token.cancelled() => {
                    // Tear the session down so the serve loop unwinds now
                    // instead of at the next natural breakage.
                    session.mux.close();
                    let _ = serve.as_mut().await;
                    TunnelError::Cancelled
                }
                r = &mut serve => match r {
                    Err(e) => e.into(),
                    Ok(()) => std::io::Error::new(
                        std::io::ErrorKind::ConnectionAborted,
                        "inbound server stopped",
                    )
                    .into(),
                },
            };
            // Whatever broke the serve loop, make sure the whole session
            // is down before redialing.
            session.mux.close();
            warn!(error = %err, "session lost");
            self.notifier.disconnected(&err);

            if self.token.is_cancelled() {
                let err = TunnelError::Cancelled;
                self.notifier.exited(&err);
                break;
            }
            if connected_at.elapsed() < FLAP_GUARD && self.sleep(FLAP_GUARD).await.is_err() {
                self.notifier.exited(&TunnelError::Cancelled);
                break;
            }

            match self.dial_cycle().await {
                Ok(session) => {
                    self.tunnel.install(session);
                    info!(id = self.tunnel.id(), "tunnel re-established");
                    self.notifier.reconnected();
                }
                Err(e) => {
                    warn!(error = %e, "reconnect abandoned");
                    self.notifier.exited(&e);
                    break;
                }
            }
        }
    }

    /// Dial endpoints under the backoff schedule until a session is
    /// established or a terminal error stops the cycle.
    async fn dial_cycle(&mut self) -> Result<Arc<Session>, TunnelError> {
        let started = Instant::now();
        loop {
            if self.token.is_cancelled() {
                return Err(TunnelError::Cancelled);
            }
            let err = match self.attempt().await {
                Ok(session) => return Ok(session),
                Err(e) if e.is_terminal() => return Err(e),
                Err(e) => e,
            };

            if let TunnelError::Http(he) = &err {
                if he.is_conflict() && !self.rebuilt {
                    // Duplicate registration: likely a cloned image. Rebuild
                    // the machine id once; if the broker still refuses, the
                    // collision is not ours to fix.
                    self.rebuilt = true;
                    let identifier = self.identifier.clone();
                    let before = self.machine_id.clone();
                    self.machine_id =
                        tokio::task::spawn_blocking(move || identifier.machine_id(true))
                            .await
                            .unwrap_or(before.clone());
                    warn!(
                        before = %before,
                        after = %self.machine_id,
                        "duplicate registration, machine id rebuilt"
                    );
                }
            }

            let mut delay = backoff_delay(started.elapsed());
            if delay <= Duration::from_secs(2) {
                // Spread thundering herds of freshly-restarted agents.
                delay += Duration::from_millis(rand::rng().random_range(0..=1000));
            }
            warn!(error = %err, delay = ?delay, "connect failed, backing off");
            self.sleep(delay).await?;
        }
    }

    /// One endpoint: dial, handshake, wrap the socket in a session.
    async fn attempt(&mut self) -> Result<Arc<Session>, TunnelError> {
        let (mut io, addr) = self.dialer.dial_next(&self.token, DIAL_TIMEOUT).await?;
        let local = io.local_addr()?;
        let peer = io.peer_addr()?;
        let mac = self.dialer.lookup_mac(local.ip());
        let ident = self.base_ident.stamp(&self.machine_id, local.ip(), mac);

        let handshake = handshake::perform(&mut io, &addr, &ident, self.cipher.as_ref());
        let grant = tokio::select! {
            () = self.token.cancelled() => return Err(TunnelError::Cancelled),
            r = tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake) => match r {
                Ok(v) => v?,
                Err(_) => return Err(TunnelError::Timeout),
            },
        };

        info!(addr = %addr, id = grant.id, "broker accepted handshake");
        let mux = MuxSession::client(io, &grant.passwd, local, peer);
        Ok(Arc::new(Session {
            mux,
            grant,
            ident,
            addr,
            local,
            peer,
        }))
    }

    async fn sleep(&self, delay: Duration) -> Result<(), TunnelError> {
        tokio::select! {
            () = self.token.cancelled() => Err(TunnelError::Cancelled),
            () = tokio::time::sleep(delay) => Ok(()),
        }
    }
}
