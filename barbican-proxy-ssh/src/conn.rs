//! Remote connection plumbing: the cancellable dialer and the connection
//! wrapper that converts handshake read timeouts into transparent retries.
//!
//! The SSH handshake may block indefinitely on a human decision (credential
//! entry, fingerprint confirmation). While such a wait is in progress the
//! session enables retry, so an expired read deadline re-arms instead of
//! failing the handshake. Disabling retry grants exactly one further retry:
//! a read already blocked when retry was disabled must get one chance to
//! observe the resumed handshake traffic.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{self, Sleep};
use tokio_util::sync::CancellationToken;

/// Shared retry state between a session and its connection wrapper.
#[derive(Debug, Default)]
pub struct ReadRetryPolicy {
    flags: Mutex<RetryFlags>,
    unbounded: AtomicBool,
}

#[derive(Debug, Default)]
struct RetryFlags {
    retry_enabled: bool,
    force_next: bool,
}

impl ReadRetryPolicy {
    fn flags(&self) -> MutexGuard<'_, RetryFlags> {
        self.flags.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enter a human-blocking wait: expired read deadlines re-arm.
    pub fn enable(&self) {
        self.flags().retry_enabled = true;
    }

    /// Leave a human-blocking wait. Sets the one-shot grace latch for the
    /// read that may already be in flight.
    pub fn disable(&self) {
        let mut flags = self.flags();
        flags.retry_enabled = false;
        flags.force_next = true;
    }

    /// Called once the shell is live: drop the handshake read deadline
    /// entirely, turning the connection into an unbounded streaming link.
    pub fn clear_initial_deadline(&self) {
        {
            let mut flags = self.flags();
            flags.retry_enabled = false;
            flags.force_next = true;
        }
        self.unbounded.store(true, Ordering::SeqCst);
    }

    /// Whether reads are no longer deadline-bounded.
    pub fn is_unbounded(&self) -> bool {
        self.unbounded.load(Ordering::SeqCst)
    }

    /// Consulted by the connection wrapper when a read deadline expires.
    /// Returns true when the read should re-arm its deadline and continue.
    pub fn request_retry(&self) -> bool {
        let mut flags = self.flags();
        if !flags.retry_enabled {
            if !flags.force_next {
                return false;
            }
            flags.force_next = false;
        }
        true
    }
}

/// Connection wrapper enforcing the handshake deadline discipline.
///
/// Reads carry a deadline of `read_timeout`, converted into retries per the
/// [`ReadRetryPolicy`]; once the policy is unbounded the deadline is
/// disarmed. Writes carry a fresh `write_timeout` deadline per write, kept
/// for the lifetime of the connection.
pub struct GuardedConn<S> {
    inner: S,
    policy: Arc<ReadRetryPolicy>,
    read_timeout: Duration,
    write_timeout: Duration,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl<S> GuardedConn<S> {
    pub fn new(
        inner: S,
        policy: Arc<ReadRetryPolicy>,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        Self {
            inner,
            policy,
            read_timeout,
            write_timeout,
            read_deadline: None,
            write_deadline: None,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for GuardedConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if let Poll::Ready(result) = Pin::new(&mut this.inner).poll_read(cx, buf) {
                this.read_deadline = None;
                return Poll::Ready(result);
            }

            if this.policy.is_unbounded() {
                this.read_deadline = None;
                return Poll::Pending;
            }

            let timeout = this.read_timeout;
            let deadline = this
                .read_deadline
                .get_or_insert_with(|| Box::pin(time::sleep(timeout)));

            match deadline.as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(()) => {
                    if this.policy.request_retry() {
                        this.read_deadline = Some(Box::pin(time::sleep(timeout)));
                        continue;
                    }
                    this.read_deadline = None;
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "read deadline exceeded",
                    )));
                }
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for GuardedConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.write_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                let timeout = this.write_timeout;
                let deadline = this
                    .write_deadline
                    .get_or_insert_with(|| Box::pin(time::sleep(timeout)));

                match deadline.as_mut().poll(cx) {
                    Poll::Pending => Poll::Pending,
                    Poll::Ready(()) => {
                        this.write_deadline = None;
                        Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "write deadline exceeded",
                        )))
                    }
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Produces connected transports, honoring session cancellation.
pub trait Dialer: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Dial `addr` within `timeout`; aborts early when `cancel` fires.
    fn dial(
        &self,
        cancel: &CancellationToken,
        addr: &str,
        timeout: Duration,
    ) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// Plain TCP dialer.
#[derive(Debug, Default, Clone)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
    type Stream = TcpStream;

    async fn dial(
        &self,
        cancel: &CancellationToken,
        addr: &str,
        timeout: Duration,
    ) -> io::Result<TcpStream> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "dial aborted by session close",
            )),
            result = time::timeout(timeout, TcpStream::connect(addr)) => match result {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    Ok(stream)
                }
                Ok(Err(e)) => Err(e),
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "dial timed out")),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_retry_denied_by_default() {
        let policy = ReadRetryPolicy::default();
        assert!(!policy.request_retry());
    }

    #[test]
    fn test_retry_granted_while_enabled() {
        let policy = ReadRetryPolicy::default();
        policy.enable();
        assert!(policy.request_retry());
        assert!(policy.request_retry());
    }

    #[test]
    fn test_disable_grants_one_grace_retry() {
        let policy = ReadRetryPolicy::default();
        policy.enable();
        policy.disable();
        assert!(policy.request_retry());
        assert!(!policy.request_retry());
    }

    #[test]
    fn test_reenable_after_disable() {
        let policy = ReadRetryPolicy::default();
        policy.enable();
        policy.disable();
        policy.enable();
        assert!(policy.request_retry());
        policy.disable();
        assert!(policy.request_retry());
        assert!(!policy.request_retry());
    }

    #[test]
    fn test_clear_initial_deadline_is_unbounded_with_grace() {
        let policy = ReadRetryPolicy::default();
        policy.enable();
        policy.clear_initial_deadline();
        assert!(policy.is_unbounded());
        // The in-flight read still gets its one grace retry, nothing more.
        assert!(policy.request_retry());
        assert!(!policy.request_retry());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_times_out_without_retry() {
        let (client, _server) = tokio::io::duplex(64);
        let policy = Arc::new(ReadRetryPolicy::default());
        let mut conn = GuardedConn::new(
            client,
            policy,
            Duration::from_secs(1),
            Duration::from_secs(1),
        );

        let mut buf = [0u8; 8];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_survives_deadlines_while_retry_enabled() {
        let (client, mut server) = tokio::io::duplex(64);
        let policy = Arc::new(ReadRetryPolicy::default());
        policy.enable();

        let mut conn = GuardedConn::new(
            client,
            Arc::clone(&policy),
            Duration::from_millis(100),
            Duration::from_secs(1),
        );

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.map(|_| buf)
        });

        // Several deadline periods elapse while the "human" is thinking.
        time::sleep(Duration::from_millis(350)).await;
        server.write_all(b"hello").await.unwrap();

        let buf = reader.await.unwrap().unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_unbounded_after_clear() {
        let (client, _server) = tokio::io::duplex(64);
        let policy = Arc::new(ReadRetryPolicy::default());
        policy.clear_initial_deadline();

        let mut conn = GuardedConn::new(
            client,
            policy,
            Duration::from_millis(100),
            Duration::from_secs(1),
        );

        let mut buf = [0u8; 8];
        let waited = time::timeout(Duration::from_secs(600), conn.read(&mut buf)).await;
        assert!(waited.is_err(), "read must stay pending, not time out");
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_times_out_when_peer_stalls() {
        // Duplex buffer of 1 byte: the second write cannot make progress
        // until the peer drains, which it never does.
        let (client, _server) = tokio::io::duplex(1);
        let policy = Arc::new(ReadRetryPolicy::default());
        let mut conn = GuardedConn::new(
            client,
            policy,
            Duration::from_secs(1),
            Duration::from_millis(100),
        );

        conn.write_all(b"a").await.unwrap();
        let err = conn.write_all(b"b").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_tcp_dial_and_cancel() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let dialer = TcpDialer;
        let cancel = CancellationToken::new();
        let stream = dialer
            .dial(&cancel, &addr, Duration::from_secs(5))
            .await
            .unwrap();
        drop(stream);

        cancel.cancel();
        let err = dialer
            .dial(&cancel, &addr, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }
}
