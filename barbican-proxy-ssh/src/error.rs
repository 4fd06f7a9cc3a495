//! Error types for barbican-proxy-ssh.

use shared::codec::CodecError;
use shared::frame::FrameError;
use shared::StreamErrorCode;
use thiserror::Error;

/// Errors that can occur during SSH session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The credential rendezvous was torn down before a value arrived.
    #[error("authentication has been cancelled")]
    AuthCancelled,

    /// The bootup payload selected an unknown auth method.
    #[error("invalid auth method")]
    InvalidAuthMethod,

    /// The bootup payload carried an unusable remote address.
    #[error("invalid address")]
    InvalidAddress,

    /// The fingerprint rendezvous was torn down before a decision arrived.
    #[error("server Fingerprint verification process has been cancelled")]
    FingerprintVerificationCancelled,

    /// The client refused the presented host key.
    #[error("server Fingerprint has been refused")]
    FingerprintRefused,

    /// No live remote handle is, or will become, available.
    #[error("remote SSH connection is unavailable")]
    RemoteConnUnavailable,

    /// A second fingerprint response arrived for this session.
    #[error("unexpected fingerprint verification respond")]
    UnexpectedFingerprintRespond,

    /// A second credential response arrived for this session.
    #[error("unexpected credential data respond")]
    UnexpectedCredentialRespond,

    /// The credential payload exceeded the size cap.
    #[error("credential was too large")]
    CredentialTooLarge,

    /// The frame marker does not name a known client signal.
    #[error("unknown client signal")]
    UnknownClientSignal,

    /// A frame arrived while the session was not accepting them.
    #[error("session is not accepting frames")]
    NotAcceptingFrames,

    /// The received private key could not be parsed.
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    /// Failed to reach the remote host.
    #[error("SSH connection failed: {0}")]
    ConnectionFailed(String),

    /// The server rejected the offered authentication.
    #[error("SSH authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Failed to open the SSH session channel.
    #[error("Failed to open SSH channel: {0}")]
    ChannelOpenFailed(String),

    /// Failed to request a PTY.
    #[error("Failed to request PTY: {0}")]
    PtyRequestFailed(String),

    /// Failed to start the login shell.
    #[error("Failed to start shell: {0}")]
    ShellStartFailed(String),

    /// A pre-connect hook failed.
    #[error(transparent)]
    Hook(#[from] HookError),

    /// Underlying SSH protocol error.
    #[error(transparent)]
    Ssh(#[from] russh::Error),

    /// Malformed frame payload.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// I/O error on the session stream.
    #[error("session I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A rejected bootup payload, carrying the FSM error-channel code.
#[derive(Debug, Error)]
#[error("bootup rejected ({code:?}): {source}")]
pub struct BootupError {
    code: StreamErrorCode,
    #[source]
    source: BootupCause,
}

/// What went wrong while decoding the bootup payload.
#[derive(Debug, Error)]
pub enum BootupCause {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl BootupError {
    pub fn new(code: StreamErrorCode, source: impl Into<BootupCause>) -> Self {
        Self {
            code,
            source: source.into(),
        }
    }

    /// The wire error code reported through the FSM error channel.
    pub fn code(&self) -> StreamErrorCode {
        self.code
    }
}

/// Errors that can occur while running a pre-connect hook.
#[derive(Debug, Error)]
pub enum HookError {
    /// The hook process could not be spawned.
    #[error("hook spawn failed: {0}")]
    Spawn(std::io::Error),

    /// The hook process exited unsuccessfully.
    #[error("hook exited with {0}")]
    Failed(std::process::ExitStatus),

    /// The hook was aborted by session teardown.
    #[error("hook cancelled")]
    Cancelled,

    /// I/O error while streaming hook output.
    #[error("hook I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;
