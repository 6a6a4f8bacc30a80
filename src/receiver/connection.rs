//! Per-connection conversation worker
//!
//! Each accepted socket gets one worker task and one watchdog task. The
//! worker loops read → authenticate → dispatch → write until the peer goes
//! away, the watchdog gives up on it, or another connection pre-empts it.
//! Cleanup always runs: player stopped if owned, RTP torn down, the session
//! slot released, the watchdog cancelled.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::{Instant, interval, sleep, timeout};

use crate::metadata::{MetadataPipeline, codes};
use crate::player::PortTriple;
use crate::protocol::rtsp::{
    ParseError, RequestParser, RtspMessage, SharedMessage, encode_response, status,
};

use super::handlers;
use super::server::ReceiverContext;
use super::session::StreamConfig;

/// Budget for writing one response.
const SEND_BUDGET: Duration = Duration::from_secs(3);

/// Watchdog tick.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(2);

/// Largest single read during the body phase.
const MAX_BODY_READ: usize = 64 * 1024;

/// Body stall threshold before the `stal` event fires.
const BODY_STALL_THRESHOLD: Duration = Duration::from_secs(15);

/// Pause before retrying a failed read.
const READ_RETRY_DELAY: Duration = Duration::from_millis(20);

/// Courtesy reply for unparseable requests.
const BAD_PACKET_RESPONSE: &[u8] = b"RTSP/1.0 400 Bad Request\r\nServer: AirTunes/105.1\r\n\r\n";

/// Shared identity and liveness of one connection.
///
/// The session slot, the watchdog and the listener all hold this; the worker
/// checks the stop flag between I/O phases and the `Notify` wakes it out of
/// a blocking read.
#[derive(Debug)]
pub struct ConnHandle {
    number: u64,
    stop: AtomicBool,
    stopper: Notify,
    running: AtomicBool,
    bark_time: Mutex<Instant>,
}

impl ConnHandle {
    /// Create a handle for connection `number`.
    #[must_use]
    pub fn new(number: u64) -> Self {
        Self {
            number,
            stop: AtomicBool::new(false),
            stopper: Notify::new(),
            running: AtomicBool::new(false),
            bark_time: Mutex::new(Instant::now()),
        }
    }

    /// Connection number, unique per accept.
    #[must_use]
    pub fn number(&self) -> u64 {
        self.number
    }

    /// Ask the worker to terminate at its next suspension point.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.stopper.notify_waiters();
    }

    /// Whether termination has been requested.
    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Wait until termination is requested.
    pub async fn stopped(&self) {
        loop {
            let notified = self.stopper.notified();
            if self.stop_requested() {
                return;
            }
            notified.await;
        }
    }

    /// Whether the worker is between startup and cleanup.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    /// Record forward progress for the watchdog.
    pub(crate) fn bark(&self) {
        let mut t = self
            .bark_time
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *t = Instant::now();
    }

    fn time_since_bark(&self) -> Duration {
        let t = self
            .bark_time
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        t.elapsed()
    }
}

/// How a request read ended without producing a request.
#[derive(Debug, thiserror::Error)]
pub enum ReadRequestError {
    /// Peer closed the connection (zero-byte read)
    #[error("connection closed by peer")]
    ChannelClosed,

    /// The connection's stop flag was raised
    #[error("shutdown requested")]
    Shutdown,

    /// The request could not be parsed
    #[error("bad packet: {0}")]
    BadPacket(#[from] ParseError),

    /// The socket read failed
    #[error("read failed: {0}")]
    Read(io::Error),
}

/// Read-loop knobs; split out so tests can shrink the stall threshold.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReadTuning {
    pub pacing: Duration,
    pub stall_threshold: Duration,
}

/// Read one complete RTSP request.
///
/// Headers are read in 4 KiB chunks. Body reads are capped at 64 KiB and
/// paced — small senders starve when the receiver reads too eagerly. If the
/// body phase stalls past the threshold, a single `ssnc`/`stal` event goes
/// out and reading continues. The stop flag is honoured between every read.
pub(crate) async fn read_request<S>(
    stream: &mut S,
    parser: &mut RequestParser,
    handle: &ConnHandle,
    tuning: ReadTuning,
    metadata: &MetadataPipeline,
) -> Result<RtspMessage, ReadRequestError>
where
    S: AsyncRead + Unpin,
{
    let mut body_deadline: Option<Instant> = None;
    let mut stall_reported = false;

    loop {
        if let Some(msg) = parser.poll()? {
            return Ok(msg);
        }
        if handle.stop_requested() {
            tracing::debug!("connection {}: shutdown requested", handle.number());
            return Err(ReadRequestError::Shutdown);
        }

        let cap = match parser.body_remaining() {
            Some(remaining) => {
                let deadline =
                    *body_deadline.get_or_insert_with(|| Instant::now() + tuning.stall_threshold);
                if !stall_reported && Instant::now() >= deadline {
                    tracing::debug!(
                        "error receiving metadata from source -- transmission seems to be stalled"
                    );
                    metadata.publish_ssnc(codes::STALLED, &[], None);
                    stall_reported = true;
                }
                sleep(tuning.pacing).await;
                remaining.min(MAX_BODY_READ)
            }
            None => 4096,
        };

        let mut chunk = vec![0u8; cap];
        let n = tokio::select! {
            result = stream.read(&mut chunk) => match result {
                Ok(n) => n,
                Err(e) if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                ) => continue,
                Err(e) => {
                    if e.kind() != io::ErrorKind::ConnectionReset {
                        tracing::debug!(
                            "connection {}: read error: {e}",
                            handle.number()
                        );
                    }
                    return Err(ReadRequestError::Read(e));
                }
            },
            () = handle.stopped() => {
                tracing::debug!("connection {}: shutdown requested", handle.number());
                return Err(ReadRequestError::Shutdown);
            }
        };

        if n == 0 {
            tracing::debug!("connection {}: channel closed", handle.number());
            return Err(ReadRequestError::ChannelClosed);
        }
        parser.feed(&chunk[..n]);
    }
}

/// Per-connection conversation state.
pub(crate) struct Connection {
    pub handle: Arc<ConnHandle>,
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub authorized: bool,
    pub auth_nonce: Option<String>,
    pub stream: Option<StreamConfig>,
    pub rtp_running: bool,
    pub remote_control_port: u16,
    pub remote_timing_port: u16,
    pub local_ports: Option<PortTriple>,
    pub dacp_id: Option<String>,
    pub dacp_active_remote: Option<String>,
    pub user_agent: Option<String>,
    pub airplay_version: Option<u32>,
    pub player_running: bool,
}

impl Connection {
    fn new(handle: Arc<ConnHandle>, local: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            handle,
            local,
            remote,
            authorized: false,
            auth_nonce: None,
            stream: None,
            rtp_running: false,
            remote_control_port: 0,
            remote_timing_port: 0,
            local_ports: None,
            dacp_id: None,
            dacp_active_remote: None,
            user_agent: None,
            airplay_version: None,
            player_running: false,
        }
    }
}

/// Run one connection to completion, cleanup included.
pub(crate) async fn run(stream: TcpStream, handle: Arc<ConnHandle>, ctx: ReceiverContext) {
    let (Ok(local), Ok(remote)) = (stream.local_addr(), stream.peer_addr()) else {
        tracing::debug!("connection {}: could not resolve addresses", handle.number());
        handle.set_running(false);
        return;
    };
    tracing::debug!(
        "connection {}: new connection from {remote} to self at {local}",
        handle.number()
    );

    handle.bark();
    let watchdog = tokio::spawn(watchdog(
        handle.clone(),
        ctx.config.idle_timeout,
        ctx.config.unfixable_command.clone(),
    ));

    ctx.rtp.initialise(handle.number()).await;

    let mut conn = Connection::new(handle.clone(), local, remote);
    conversation(stream, &mut conn, &ctx).await;

    // cleanup: nothing below may be skipped
    if conn.player_running && ctx.slot.holder_is(&handle) {
        ctx.player.stop().await;
    }
    ctx.rtp.terminate(handle.number()).await;
    watchdog.abort();
    let _ = watchdog.await;
    ctx.slot.release_if(&handle);
    handle.set_running(false);
    tracing::debug!("connection {}: terminated", handle.number());
}

async fn conversation(mut stream: TcpStream, conn: &mut Connection, ctx: &ReceiverContext) {
    let mut parser = RequestParser::new();
    let tuning = ReadTuning {
        pacing: ctx.config.body_pacing,
        stall_threshold: BODY_STALL_THRESHOLD,
    };
    let mut retries_left: u32 = 1;

    while !conn.handle.stop_requested() {
        match read_request(&mut stream, &mut parser, &conn.handle, tuning, &ctx.metadata).await {
            Ok(req) => {
                conn.handle.bark();
                let req = SharedMessage::new(req);
                let mut resp = RtspMessage::response(status::BAD_REQUEST);
                handlers::handle_request(ctx, conn, &req, &mut resp).await;

                if conn.handle.stop_requested() {
                    break;
                }
                let bytes = encode_response(&resp);
                match timeout(SEND_BUDGET, stream.write_all(&bytes)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::debug!(
                            "connection {}: unable to write an RTSP response ({e}), terminating",
                            conn.handle.number()
                        );
                        abort_socket(&stream, conn.handle.number());
                        break;
                    }
                    Err(_) => {
                        tracing::debug!(
                            "connection {}: response write timed out, terminating",
                            conn.handle.number()
                        );
                        abort_socket(&stream, conn.handle.number());
                        break;
                    }
                }
            }
            Err(ReadRequestError::Shutdown | ReadRequestError::ChannelClosed) => break,
            Err(ReadRequestError::BadPacket(e)) => {
                tracing::debug!(
                    "connection {}: bad RTSP packet: {e}",
                    conn.handle.number()
                );
                let _ = stream.write_all(BAD_PACKET_RESPONSE).await;
                parser = RequestParser::new();
                if !retry(&mut retries_left).await {
                    abort_socket(&stream, conn.handle.number());
                    break;
                }
            }
            Err(ReadRequestError::Read(_)) => {
                if !retry(&mut retries_left).await {
                    abort_socket(&stream, conn.handle.number());
                    break;
                }
            }
        }
    }
}

/// Burn one retry; false means the budget is exhausted.
async fn retry(retries_left: &mut u32) -> bool {
    if *retries_left == 0 {
        return false;
    }
    *retries_left -= 1;
    sleep(READ_RETRY_DELAY).await;
    true
}

/// Set linger-zero so the close turns into an RST.
fn abort_socket(stream: &TcpStream, number: u64) {
    if let Err(e) = stream.set_linger(Some(Duration::ZERO)) {
        tracing::debug!("connection {number}: could not set the RTSP socket to abort: {e}");
    }
}

/// Per-connection watchdog.
///
/// Wakes every two seconds. On the first overrun of the idle timeout it
/// stops the worker; if two further overruns pass without the worker going
/// away, the configured unfixable command runs (once per connection).
async fn watchdog(handle: Arc<ConnHandle>, idle_timeout: Option<Duration>, unfixable: Option<String>) {
    let mut barks: u32 = 0;
    let mut unfixable_reported = false;
    let mut tick = interval(WATCHDOG_INTERVAL);
    tick.tick().await; // completes immediately

    loop {
        tick.tick().await;
        let Some(limit) = idle_timeout else {
            continue;
        };
        if handle.time_since_bark() < limit {
            continue;
        }
        barks += 1;
        if barks == 1 {
            tracing::debug!(
                "connection {}: idle timeout overrun, stopping the conversation",
                handle.number()
            );
            handle.request_stop();
        } else if barks == 3 {
            if let Some(command) = unfixable.as_deref() {
                if !unfixable_reported {
                    unfixable_reported = true;
                    run_unfixable(command);
                }
            } else {
                tracing::warn!(
                    "an unrecoverable error, \"unable_to_cancel_play_session\", has been detected"
                );
            }
        }
    }
}

fn run_unfixable(command: &str) {
    tracing::debug!("running unfixable command: {command}");
    let spawned = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .arg("sh")
        .arg("unable_to_cancel_play_session")
        .spawn();
    if let Err(e) = spawned {
        tracing::warn!("could not run unfixable command: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;

    fn tuning() -> ReadTuning {
        ReadTuning {
            pacing: Duration::from_millis(1),
            stall_threshold: Duration::from_secs(15),
        }
    }

    #[tokio::test]
    async fn test_read_simple_request() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(b"OPTIONS * RTSP/1.0\r\nCSeq: 1\r\n\r\n")
            .await
            .unwrap();

        let handle = ConnHandle::new(1);
        let mut parser = RequestParser::new();
        let metadata = MetadataPipeline::disabled();
        let req = read_request(&mut server, &mut parser, &handle, tuning(), &metadata)
            .await
            .unwrap();
        assert_eq!(req.method.as_deref(), Some("OPTIONS"));
    }

    #[tokio::test]
    async fn test_read_body_in_pieces() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let handle = Arc::new(ConnHandle::new(1));
        let metadata = MetadataPipeline::disabled();

        let writer = tokio::spawn(async move {
            client
                .write_all(b"ANNOUNCE * RTSP/1.0\r\nContent-Length: 10\r\n\r\n")
                .await
                .unwrap();
            for piece in [b"01234".as_slice(), b"56789".as_slice()] {
                sleep(Duration::from_millis(5)).await;
                client.write_all(piece).await.unwrap();
            }
            client
        });

        let mut parser = RequestParser::new();
        let req = read_request(&mut server, &mut parser, &handle, tuning(), &metadata)
            .await
            .unwrap();
        assert_eq!(&req.content[..], b"0123456789");
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_read_channel_closed() {
        let (client, mut server) = tokio::io::duplex(1024);
        drop(client);

        let handle = ConnHandle::new(1);
        let mut parser = RequestParser::new();
        let metadata = MetadataPipeline::disabled();
        let err = read_request(&mut server, &mut parser, &handle, tuning(), &metadata)
            .await
            .unwrap_err();
        assert!(matches!(err, ReadRequestError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_read_stop_interrupts_blocked_read() {
        let (_client, mut server) = tokio::io::duplex(1024);
        let handle = Arc::new(ConnHandle::new(1));
        let metadata = MetadataPipeline::disabled();

        let stopper = {
            let handle = handle.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(20)).await;
                handle.request_stop();
            })
        };

        let mut parser = RequestParser::new();
        let err = read_request(&mut server, &mut parser, &handle, tuning(), &metadata)
            .await
            .unwrap_err();
        assert!(matches!(err, ReadRequestError::Shutdown));
        stopper.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_bad_packet() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(b"OPTIONS * HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        let handle = ConnHandle::new(1);
        let mut parser = RequestParser::new();
        let metadata = MetadataPipeline::disabled();
        let err = read_request(&mut server, &mut parser, &handle, tuning(), &metadata)
            .await
            .unwrap_err();
        assert!(matches!(err, ReadRequestError::BadPacket(_)));
    }

    #[tokio::test]
    async fn test_stalled_body_emits_single_stal_event() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let handle = Arc::new(ConnHandle::new(1));

        let config = crate::receiver::config::MetadataConfig::default();
        let metadata = MetadataPipeline::start(&config, None);
        let mut sub = metadata.subscribe();

        let slow_tuning = ReadTuning {
            pacing: Duration::from_millis(1),
            stall_threshold: Duration::from_millis(40),
        };

        let writer = tokio::spawn(async move {
            client
                .write_all(b"SET_PARAMETER * RTSP/1.0\r\nContent-Length: 6\r\n\r\n")
                .await
                .unwrap();
            for piece in [b"ab".as_slice(), b"cd".as_slice(), b"ef".as_slice()] {
                sleep(Duration::from_millis(60)).await;
                client.write_all(piece).await.unwrap();
            }
            client
        });

        let mut parser = RequestParser::new();
        let req = read_request(&mut server, &mut parser, &handle, slow_tuning, &metadata)
            .await
            .unwrap();
        assert_eq!(&req.content[..], b"abcdef");

        let event = sub.recv().await.unwrap();
        assert_eq!(event.code, codes::STALLED);

        // exactly one stal event: the next hub item, if any, must not be stal
        metadata.publish_ssnc(codes::PROGRESS, b"marker", None);
        let next = sub.recv().await.unwrap();
        assert_eq!(next.code, codes::PROGRESS);

        metadata.shutdown();
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_handle_stopped_wakes_existing_waiters() {
        let handle = Arc::new(ConnHandle::new(7));
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.stopped().await })
        };
        sleep(Duration::from_millis(10)).await;
        handle.request_stop();
        timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
