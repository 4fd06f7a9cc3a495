//! The remote task: establishes the SSH connection, drives the interactive
//! rendezvous with the client, starts the shell and pumps remote output
//! back as tagged frames.

use crate::config::ProxyConfig;
use crate::conn::{Dialer, GuardedConn, ReadRetryPolicy};
use crate::error::{SessionError, SessionResult};
use crate::hooks::{HookParameters, HookPhase, Hooks};
use crate::stream::{ControlSignal, StreamResponder};
use russh::client::{self, AuthResult, Handle};
use russh::keys::ssh_key::Algorithm;
use russh::keys::{decode_secret_key, HashAlg, PrivateKeyWithHashAlg, PublicKey};
use russh::{Channel, ChannelMsg, Disconnect, Pty};
use shared::frame::{AuthMethod, ServerSignal};
use std::io;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Frame scratch-buffer size. Payload space per frame is this minus the
/// multiplexer's header region.
pub(crate) const FRAME_BUFFER_SIZE: usize = 4096;

/// Commands the control task feeds into the pump loop.
#[derive(Debug)]
enum RemoteCommand {
    Stdin(Vec<u8>),
    WindowChange { rows: u16, cols: u16 },
}

/// Live handle onto the remote shell, published on the session's connection
/// channel once the shell is running. Cloned freely; the closer is
/// idempotent and either task may invoke it.
#[derive(Debug, Clone)]
pub(crate) struct RemoteHandle {
    commands: mpsc::Sender<RemoteCommand>,
    closer: CancellationToken,
}

impl RemoteHandle {
    /// Queue one stdin chunk, preserving arrival order.
    pub(crate) async fn write_stdin(&self, data: Vec<u8>) -> SessionResult<()> {
        self.commands
            .send(RemoteCommand::Stdin(data))
            .await
            .map_err(|_| SessionError::RemoteConnUnavailable)
    }

    /// Request a window-change on the remote PTY.
    pub(crate) async fn window_change(&self, rows: u16, cols: u16) -> SessionResult<()> {
        self.commands
            .send(RemoteCommand::WindowChange { rows, cols })
            .await
            .map_err(|_| SessionError::RemoteConnUnavailable)
    }

    /// Close the SSH session, then the underlying connection.
    pub(crate) fn close(&self) {
        self.closer.cancel();
    }
}

/// Writes tagged frames through the responder, reserving the header region
/// at the front of its scratch buffer. Oversized payloads are split.
struct FrameWriter<W> {
    responder: Arc<W>,
    buf: Box<[u8; FRAME_BUFFER_SIZE]>,
}

impl<W: StreamResponder> FrameWriter<W> {
    fn new(responder: Arc<W>) -> Self {
        Self {
            responder,
            buf: Box::new([0u8; FRAME_BUFFER_SIZE]),
        }
    }

    async fn send(&mut self, signal: ServerSignal, payload: &[u8]) -> io::Result<()> {
        let header = self.responder.header_size();
        let capacity = FRAME_BUFFER_SIZE - header;

        if payload.is_empty() {
            return self
                .responder
                .send_manual(signal.marker(), &mut self.buf[..header])
                .await;
        }

        for chunk in payload.chunks(capacity) {
            self.buf[header..header + chunk.len()].copy_from_slice(chunk);
            self.responder
                .send_manual(signal.marker(), &mut self.buf[..header + chunk.len()])
                .await?;
        }

        Ok(())
    }
}

/// russh client event handler carrying the fingerprint rendezvous.
struct ClientHandler<W> {
    writer: FrameWriter<W>,
    retry: Arc<ReadRetryPolicy>,
    fingerprint_rx: Option<oneshot::Receiver<bool>>,
}

impl<W: StreamResponder> ClientHandler<W> {
    async fn confirm_fingerprint(&mut self, key: &PublicKey) -> Result<bool, SessionError> {
        let fingerprint = key.fingerprint(HashAlg::Sha256).to_string();
        debug!(fingerprint = %fingerprint, "Requesting fingerprint confirmation");

        self.writer
            .send(
                ServerSignal::ConnectVerifyFingerprint,
                fingerprint.as_bytes(),
            )
            .await?;

        let rx = self
            .fingerprint_rx
            .take()
            .ok_or(SessionError::FingerprintVerificationCancelled)?;

        match rx.await {
            Ok(true) => Ok(true),
            Ok(false) => Err(SessionError::FingerprintRefused),
            Err(_) => Err(SessionError::FingerprintVerificationCancelled),
        }
    }
}

impl<W: StreamResponder> client::Handler for ClientHandler<W> {
    type Error = SessionError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        // The wait on the human spans the whole rendezvous; reads on the
        // wrapped connection must keep retrying their deadline meanwhile.
        self.retry.enable();
        let result = self.confirm_fingerprint(server_public_key).await;
        self.retry.disable();
        result
    }
}

/// State owned by the remote task for one session.
pub(crate) struct RemoteTask<W, D, H> {
    pub responder: Arc<W>,
    pub dialer: Arc<D>,
    pub hooks: Arc<H>,
    pub config: ProxyConfig,
    pub cancel: CancellationToken,
    pub retry: Arc<ReadRetryPolicy>,
    pub user: String,
    pub address: String,
    pub auth_method: AuthMethod,
    pub credential_rx: Option<oneshot::Receiver<Zeroizing<Vec<u8>>>>,
    pub fingerprint_rx: Option<oneshot::Receiver<bool>>,
    pub remote_tx: Option<oneshot::Sender<RemoteHandle>>,
}

impl<W, D, H> RemoteTask<W, D, H>
where
    W: StreamResponder,
    D: Dialer,
    H: Hooks,
{
    /// Run the remote side of the session to completion.
    pub(crate) async fn run(mut self) {
        if let Err(err) = self.serve().await {
            let text = err.to_string();
            debug!(address = %self.address, error = %text, "Unable to serve remote session");
            let mut writer = FrameWriter::new(Arc::clone(&self.responder));
            let _ = writer.send(ServerSignal::ConnectFailed, text.as_bytes()).await;
        }

        // Teardown order matters: the terminal stream marker goes out first,
        // then pending connection-channel readers are woken, then the
        // session scope is cancelled.
        let _ = self.responder.signal(ControlSignal::Close).await;
        self.remote_tx.take();
        self.cancel.cancel();
    }

    async fn serve(&mut self) -> SessionResult<()> {
        let mut writer = FrameWriter::new(Arc::clone(&self.responder));

        self.run_before_connecting_hook(&mut writer).await?;

        let stream = self
            .dialer
            .dial(&self.cancel, &self.address, self.config.dial_timeout())
            .await
            .map_err(|e| SessionError::ConnectionFailed(e.to_string()))?;

        let conn = GuardedConn::new(
            stream,
            Arc::clone(&self.retry),
            self.config.handshake_timeout(),
            self.config.dial_timeout(),
        );

        let ssh_config = Arc::new(client::Config {
            inactivity_timeout: None,
            ..client::Config::default()
        });

        let handler = ClientHandler {
            writer: FrameWriter::new(Arc::clone(&self.responder)),
            retry: Arc::clone(&self.retry),
            fingerprint_rx: self.fingerprint_rx.take(),
        };

        let mut handle = client::connect_stream(ssh_config, conn, handler).await?;
        debug!(address = %self.address, "SSH handshake complete");

        self.authenticate(&mut handle, &mut writer).await?;
        debug!(address = %self.address, user = %self.user, "Authentication successful");

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| SessionError::ChannelOpenFailed(e.to_string()))?;

        // 80 rows by 40 columns; request_pty takes columns first.
        channel
            .request_pty(
                false,
                "xterm",
                40,
                80,
                0,
                0,
                &[
                    (Pty::ECHO, 1),
                    (Pty::TTY_OP_ISPEED, 14400),
                    (Pty::TTY_OP_OSPEED, 14400),
                ],
            )
            .await
            .map_err(|e| SessionError::PtyRequestFailed(e.to_string()))?;

        channel
            .request_shell(false)
            .await
            .map_err(|e| SessionError::ShellStartFailed(e.to_string()))?;

        // The shell is live: release the handshake read deadline and turn
        // the connection into an unbounded streaming link.
        self.retry.clear_initial_deadline();

        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let closer = CancellationToken::new();
        if let Some(remote_tx) = self.remote_tx.take() {
            let _ = remote_tx.send(RemoteHandle {
                commands: cmd_tx,
                closer: closer.clone(),
            });
        }

        writer.send(ServerSignal::ConnectSucceed, &[]).await?;
        info!(address = %self.address, "Serving");

        self.pump(handle, channel, cmd_rx, closer, writer).await;

        Ok(())
    }

    async fn run_before_connecting_hook(
        &self,
        writer: &mut FrameWriter<W>,
    ) -> SessionResult<()> {
        let params = HookParameters::new()
            .insert("Remote Type", "SSH")
            .insert("Remote Address", self.address.clone());

        let (output_tx, mut output_rx) = mpsc::channel::<Vec<u8>>(8);
        let run = self
            .hooks
            .run(&self.cancel, HookPhase::BeforeConnecting, &params, output_tx);

        let forward = async {
            while let Some(chunk) = output_rx.recv().await {
                if writer
                    .send(ServerSignal::HookOutputBeforeConnecting, &chunk)
                    .await
                    .is_err()
                {
                    break;
                }
            }
        };

        let (result, ()) = tokio::join!(run, forward);
        result.map_err(SessionError::from)
    }

    async fn authenticate(
        &mut self,
        handle: &mut Handle<ClientHandler<W>>,
        writer: &mut FrameWriter<W>,
    ) -> SessionResult<()> {
        let auth_result = match self.auth_method {
            AuthMethod::None => handle.authenticate_none(&self.user).await?,

            AuthMethod::Passphrase => {
                let blob = self.request_credential(writer).await?;
                let passphrase = credential_string(&blob);
                handle.authenticate_password(&self.user, &*passphrase).await?
            }

            AuthMethod::PrivateKey => {
                let blob = self.request_credential(writer).await?;
                let pem = credential_string(&blob);
                let key = decode_secret_key(&pem, None)
                    .map_err(|e| SessionError::InvalidPrivateKey(e.to_string()))?;
                let hash = if matches!(key.algorithm(), Algorithm::Rsa { .. }) {
                    match handle.best_supported_rsa_hash().await {
                        Ok(hash) => hash.flatten(),
                        Err(_) => None,
                    }
                } else {
                    None
                };
                handle
                    .authenticate_publickey(
                        &self.user,
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash),
                    )
                    .await?
            }
        };

        match auth_result {
            AuthResult::Success => Ok(()),
            AuthResult::Failure {
                remaining_methods, ..
            } => Err(SessionError::AuthenticationFailed(format!(
                "remaining methods: {:?}",
                remaining_methods
            ))),
        }
    }

    /// Ask the client for a credential and wait for its one-shot answer.
    async fn request_credential(
        &mut self,
        writer: &mut FrameWriter<W>,
    ) -> SessionResult<Zeroizing<Vec<u8>>> {
        self.retry.enable();

        let result = async {
            writer
                .send(ServerSignal::ConnectRequestCredential, &[])
                .await?;

            let rx = self
                .credential_rx
                .take()
                .ok_or(SessionError::AuthCancelled)?;

            rx.await.map_err(|_| SessionError::AuthCancelled)
        }
        .await;

        self.retry.disable();
        result
    }

    async fn pump(
        &self,
        handle: Handle<ClientHandler<W>>,
        mut channel: Channel<client::Msg>,
        mut commands: mpsc::Receiver<RemoteCommand>,
        closer: CancellationToken,
        mut writer: FrameWriter<W>,
    ) {
        let (stderr_tx, stderr_rx) = mpsc::channel::<Vec<u8>>(32);
        let stderr_join = tokio::spawn(stderr_pump(
            FrameWriter::new(Arc::clone(&self.responder)),
            stderr_rx,
        ));

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = closer.cancelled() => break,

                cmd = commands.recv() => match cmd {
                    Some(RemoteCommand::Stdin(data)) => {
                        if let Err(e) = channel.data(&data[..]).await {
                            debug!(error = %e, "Failed to write data to remote");
                            closer.cancel();
                            break;
                        }
                    }
                    Some(RemoteCommand::WindowChange { rows, cols }) => {
                        // It's ok for it to fail.
                        if let Err(e) = channel
                            .window_change(cols as u32, rows as u32, 0, 0)
                            .await
                        {
                            debug!(rows, cols, error = %e, "Failed to resize");
                        }
                    }
                    None => break,
                },

                msg = channel.wait() => match msg {
                    Some(ChannelMsg::Data { data }) => {
                        if writer
                            .send(ServerSignal::RemoteStdOut, &data[..])
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                        if stderr_tx.send(data.to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::ExtendedData { .. }) => {}
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) => break,
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        info!(exit_status, "Process exited");
                    }
                    Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                        info!(signal = ?signal_name, "Process killed by signal");
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }

        // Session channel first, then the underlying connection.
        if let Err(e) = channel.eof().await {
            debug!(error = %e, "Failed to send channel EOF");
        }
        if let Err(e) = handle
            .disconnect(Disconnect::ByApplication, "session closed", "en")
            .await
        {
            debug!(error = %e, "Failed to disconnect");
        }

        drop(stderr_tx);
        let _ = stderr_join.await;
    }
}

/// Reinterpret a client credential as a string without altering its bytes.
/// The remote decides what the bytes mean, not the proxy, so invalid UTF-8
/// must survive the trip unmodified.
fn credential_string(blob: &[u8]) -> Zeroizing<String> {
    Zeroizing::new(String::from_utf8(blob.to_vec()).unwrap_or_else(|e| {
        // SAFETY: the string is only handed to the SSH library, which
        // writes its raw bytes to the wire without inspecting chars.
        unsafe { String::from_utf8_unchecked(e.into_bytes()) }
    }))
}

/// Pumps stderr chunks into `RemoteStdErr` frames until the channel drains
/// or a frame write fails. Owns its own scratch buffer.
async fn stderr_pump<W: StreamResponder>(
    mut writer: FrameWriter<W>,
    mut stderr_rx: mpsc::Receiver<Vec<u8>>,
) {
    while let Some(data) = stderr_rx.recv().await {
        if writer
            .send(ServerSignal::RemoteStdErr, &data)
            .await
            .is_err()
        {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_string_valid_utf8() {
        let passphrase = credential_string(b"hunter2");
        assert_eq!(passphrase.as_bytes(), b"hunter2");
    }

    #[test]
    fn test_credential_string_preserves_invalid_utf8() {
        // Latin-1 "p\xe9w" is not valid UTF-8; the exact bytes must come
        // out the other side, with no replacement characters.
        let raw = [b'p', 0xe9, b'w'];
        let passphrase = credential_string(&raw);
        assert_eq!(passphrase.as_bytes(), &raw);
        assert_eq!(passphrase.len(), raw.len());
    }
}
