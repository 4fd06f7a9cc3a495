//! The per-session finite-state machine.
//!
//! A session couples two worlds: the outer dispatcher feeding it decoded
//! client frames, and the remote task it spawns to own the SSH connection.
//! The two rendezvous through three one-shot channels (credential,
//! fingerprint decision, live remote handle); each may carry at most one
//! value for the lifetime of the session, and dropping a sender is how
//! teardown wakes a blocked waiter with a cancelled outcome.

use crate::config::ProxyConfig;
use crate::conn::{Dialer, ReadRetryPolicy};
use crate::error::{BootupError, SessionError, SessionResult};
use crate::hooks::Hooks;
use crate::remote::{RemoteHandle, RemoteTask};
use crate::stream::StreamResponder;
use shared::codec::{parse_string, Address};
use shared::frame::{AuthMethod, ClientSignal, FrameReader};
use shared::StreamErrorCode;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Cap on a client-supplied credential payload.
pub const SSH_CREDENTIAL_MAX_SIZE: usize = 4096;

/// Port used when the bootup address record carries none.
pub const SSH_DEFAULT_PORT: u16 = 22;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Waiting for the bootup payload.
    #[default]
    Bootup,
    /// Shell protocol: client frames are dispatched to the remote.
    Local,
    /// Torn down; nothing further is accepted.
    Closed,
}

/// One SSH session bridged onto a framed client stream.
pub struct Session<W, D, H>
where
    W: StreamResponder,
    D: Dialer,
    H: Hooks,
{
    responder: Arc<W>,
    dialer: Arc<D>,
    hooks: Arc<H>,
    config: ProxyConfig,
    state: SessionState,
    cancel: CancellationToken,
    retry: Arc<ReadRetryPolicy>,

    credential_tx: Option<oneshot::Sender<Zeroizing<Vec<u8>>>>,
    credential_rx: Option<oneshot::Receiver<Zeroizing<Vec<u8>>>>,
    credential_used: bool,

    fingerprint_tx: Option<oneshot::Sender<bool>>,
    fingerprint_rx: Option<oneshot::Receiver<bool>>,
    fingerprint_used: bool,

    remote_tx: Option<oneshot::Sender<RemoteHandle>>,
    remote_rx: Option<oneshot::Receiver<RemoteHandle>>,
    remote: Option<RemoteHandle>,
    remote_join: Option<JoinHandle<()>>,
}

impl<W, D, H> Session<W, D, H>
where
    W: StreamResponder,
    D: Dialer,
    H: Hooks,
{
    pub fn new(responder: W, dialer: D, hooks: H, config: ProxyConfig) -> Self {
        let (credential_tx, credential_rx) = oneshot::channel();
        let (fingerprint_tx, fingerprint_rx) = oneshot::channel();
        let (remote_tx, remote_rx) = oneshot::channel();

        Self {
            responder: Arc::new(responder),
            dialer: Arc::new(dialer),
            hooks: Arc::new(hooks),
            config,
            state: SessionState::Bootup,
            cancel: CancellationToken::new(),
            retry: Arc::new(ReadRetryPolicy::default()),
            credential_tx: Some(credential_tx),
            credential_rx: Some(credential_rx),
            credential_used: false,
            fingerprint_tx: Some(fingerprint_tx),
            fingerprint_rx: Some(fingerprint_rx),
            fingerprint_used: false,
            remote_tx: Some(remote_tx),
            remote_rx: Some(remote_rx),
            remote: None,
            remote_join: None,
        }
    }

    /// Current FSM state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Consume the bootup payload (user name, address record, auth method),
    /// spawn the remote task and enter the `Local` state.
    pub async fn bootup(&mut self, r: &mut FrameReader) -> Result<(), BootupError> {
        if self.state != SessionState::Bootup {
            return Err(BootupError::new(
                StreamErrorCode::BadUserName,
                SessionError::NotAcceptingFrames,
            ));
        }

        let user = parse_string(r)
            .map_err(|e| BootupError::new(StreamErrorCode::BadUserName, e))?;

        let address = Address::parse(r)
            .map_err(|e| BootupError::new(StreamErrorCode::BadRemoteAddress, e))?;
        let authority = address.to_authority(SSH_DEFAULT_PORT);

        let method = r
            .fetch_byte()
            .map_err(|e| BootupError::new(StreamErrorCode::BadAuthMethod, e))?;
        let auth_method = AuthMethod::try_from(method).map_err(|_| {
            BootupError::new(StreamErrorCode::BadAuthMethod, SessionError::InvalidAuthMethod)
        })?;

        debug!(user = %user, address = %authority, ?auth_method, "Session bootup");

        let task = RemoteTask {
            responder: Arc::clone(&self.responder),
            dialer: Arc::clone(&self.dialer),
            hooks: Arc::clone(&self.hooks),
            config: self.config.clone(),
            cancel: self.cancel.clone(),
            retry: Arc::clone(&self.retry),
            user,
            address: authority,
            auth_method,
            credential_rx: self.credential_rx.take(),
            fingerprint_rx: self.fingerprint_rx.take(),
            remote_tx: self.remote_tx.take(),
        };
        self.remote_join = Some(tokio::spawn(task.run()));

        self.state = SessionState::Local;
        Ok(())
    }

    /// Dispatch one client frame while in the `Local` state.
    pub async fn dispatch(&mut self, marker: u8, r: &mut FrameReader) -> SessionResult<()> {
        if self.state != SessionState::Local {
            return Err(SessionError::NotAcceptingFrames);
        }

        let signal =
            ClientSignal::try_from(marker).map_err(|_| SessionError::UnknownClientSignal)?;

        match signal {
            ClientSignal::StdIn => {
                let remote = self.get_remote().await?;

                while let Some(chunk) = r.buffered() {
                    if let Err(e) = remote.write_stdin(chunk).await {
                        // The stream is already doomed; close and let the
                        // teardown propagate instead of surfacing the error.
                        remote.close();
                        debug!(error = %e, "Failed to write data to remote");
                        break;
                    }
                }

                Ok(())
            }

            ClientSignal::Resize => {
                let remote = self.get_remote().await?;

                let mut dims = [0u8; 4];
                r.read_exact(&mut dims)?;
                let rows = u16::from_be_bytes([dims[0], dims[1]]);
                let cols = u16::from_be_bytes([dims[2], dims[3]]);

                if let Err(e) = remote.window_change(rows, cols).await {
                    debug!(rows, cols, error = %e, "Failed to resize");
                }

                Ok(())
            }

            ClientSignal::RespondFingerprint => {
                if self.fingerprint_used {
                    return Err(SessionError::UnexpectedFingerprintRespond);
                }
                self.fingerprint_used = true;

                let confirmed = r.fetch_byte()? == 0x00;

                if let Some(tx) = self.fingerprint_tx.take() {
                    let _ = tx.send(confirmed);
                }

                if !confirmed {
                    // Best-effort abort of whatever the remote task reached.
                    if let Ok(remote) = self.get_remote().await {
                        remote.close();
                    }
                }

                Ok(())
            }

            ClientSignal::RespondCredential => {
                if self.credential_used {
                    return Err(SessionError::UnexpectedCredentialRespond);
                }
                self.credential_used = true;

                let cap = r.remains().min(SSH_CREDENTIAL_MAX_SIZE);
                let mut credential = Zeroizing::new(Vec::with_capacity(cap));
                let mut total = 0usize;

                while let Some(chunk) = r.buffered() {
                    let chunk = Zeroizing::new(chunk);
                    total += chunk.len();
                    if total > cap {
                        return Err(SessionError::CredentialTooLarge);
                    }
                    credential.extend_from_slice(&chunk);
                }

                if let Some(tx) = self.credential_tx.take() {
                    let _ = tx.send(credential);
                }

                Ok(())
            }
        }
    }

    /// The live remote handle: cached after the first successful wait on
    /// the connection channel.
    async fn get_remote(&mut self) -> SessionResult<RemoteHandle> {
        if let Some(remote) = &self.remote {
            return Ok(remote.clone());
        }

        let rx = self
            .remote_rx
            .take()
            .ok_or(SessionError::RemoteConnUnavailable)?;

        match rx.await {
            Ok(remote) => {
                self.remote = Some(remote.clone());
                Ok(remote)
            }
            Err(_) => Err(SessionError::RemoteConnUnavailable),
        }
    }

    /// Tear the session down and wait for the remote task to finish.
    ///
    /// Order matters: the rendezvous senders are dropped first so that any
    /// callback blocked on them is released with a cancelled outcome, which
    /// lets the SSH handshake abort and the remote task reach its cleanup.
    /// Idempotent.
    pub async fn close(&mut self) {
        self.credential_used = true;
        self.fingerprint_used = true;

        self.credential_tx.take();
        self.fingerprint_tx.take();

        // If bootup never ran, the connection channel's sender is still
        // ours; dropping it keeps the wait below from blocking forever.
        self.remote_tx.take();

        if let Ok(remote) = self.get_remote().await {
            remote.close();
        }

        self.cancel.cancel();

        if let Some(join) = self.remote_join.take() {
            if let Err(e) = join.await {
                warn!(error = %e, "Remote task aborted abnormally");
            }
        }

        self.state = SessionState::Closed;
    }

    /// Lightweight teardown: only cancels the session scope. Used when the
    /// outer layer discards the session without draining it.
    pub fn release(&self) {
        self.cancel.cancel();
    }
}
