//! End-to-end RTSP session scenarios over real sockets

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use raop::player::PortTriple;
use raop::protocol::crypto::RaopKey;
use raop::protocol::rtsp::digest_response;
use raop::receiver::{RaopReceiver, ReceiverConfig};
use raop::testing::{FixedPortTransport, NullTransport, PlayerEvent, RecordingPlayer};

const PCM_SDP: &str = "v=0\r\n\
    o=iTunes 1234567890 0 IN IP4 192.168.1.5\r\n\
    s=iTunes\r\n\
    m=audio 0 RTP/AVP 96\r\n\
    a=rtpmap:96 L16/44100/2\r\n";

struct Response {
    code: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Response {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

async fn roundtrip(stream: &mut TcpStream, request: &str) -> Response {
    stream.write_all(request.as_bytes()).await.unwrap();
    read_response(stream).await
}

async fn read_response(stream: &mut TcpStream) -> Response {
    let mut buf = Vec::new();
    let header_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let mut chunk = [0u8; 1024];
        let n = timeout(Duration::from_secs(10), stream.read(&mut chunk))
            .await
            .expect("response timed out")
            .unwrap();
        assert_ne!(n, 0, "connection closed mid-response");
        buf.extend_from_slice(&chunk[..n]);
    };

    let header_text = String::from_utf8(buf[..header_end].to_vec()).unwrap();
    let mut lines = header_text.split("\r\n");
    let status_line = lines.next().unwrap();
    assert!(status_line.starts_with("RTSP/1.0 "), "bad status line: {status_line}");
    let code: u16 = status_line.split_whitespace().nth(1).unwrap().parse().unwrap();

    let headers: Vec<(String, String)> = lines
        .filter_map(|line| {
            line.split_once(": ")
                .map(|(n, v)| (n.to_string(), v.to_string()))
        })
        .collect();

    let content_length: usize = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("Content-Length"))
        .map_or(0, |(_, v)| v.parse().unwrap());

    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let mut chunk = [0u8; 1024];
        let n = timeout(Duration::from_secs(10), stream.read(&mut chunk))
            .await
            .expect("body timed out")
            .unwrap();
        assert_ne!(n, 0);
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Response { code, headers, body }
}

fn announce_request(cseq: u32, sdp: &str) -> String {
    format!(
        "ANNOUNCE rtsp://192.168.1.20/1234 RTSP/1.0\r\n\
         CSeq: {cseq}\r\n\
         X-Apple-Client-Name: Integration Test\r\n\
         User-Agent: iTunes/12.9 AirPlay/380\r\n\
         Content-Type: application/sdp\r\n\
         Content-Length: {}\r\n\r\n{sdp}",
        sdp.len()
    )
}

fn setup_request(cseq: u32) -> String {
    format!(
        "SETUP rtsp://192.168.1.20/1234 RTSP/1.0\r\n\
         CSeq: {cseq}\r\n\
         DACP-ID: D62FEB55D8E573F1\r\n\
         Active-Remote: 3344556677\r\n\
         Transport: RTP/AVP/UDP;unicast;interleaved=0-1;mode=record;\
         control_port=6001;timing_port=6002\r\n\r\n"
    )
}

async fn start_receiver(
    config: ReceiverConfig,
) -> (RaopReceiver, Arc<RecordingPlayer>, Arc<FixedPortTransport>, u16) {
    let player = Arc::new(RecordingPlayer::new());
    let transport = Arc::new(FixedPortTransport::new(PortTriple {
        audio: 6010,
        control: 6011,
        timing: 6012,
    }));
    let mut receiver = RaopReceiver::new(config.port(0), player.clone(), transport.clone());
    let port = receiver.start().await.unwrap();
    (receiver, player, transport, port)
}

async fn connect(port: u16) -> TcpStream {
    TcpStream::connect(("127.0.0.1", port)).await.unwrap()
}

#[tokio::test]
async fn password_gated_options() {
    let (mut receiver, _player, _transport, port) =
        start_receiver(ReceiverConfig::with_name("gated").password("pw")).await;
    let mut stream = connect(port).await;

    let resp = roundtrip(&mut stream, "OPTIONS * RTSP/1.0\r\nCSeq: 1\r\n\r\n").await;
    assert_eq!(resp.code, 401);
    assert_eq!(resp.header("CSeq"), Some("1"));
    let challenge = resp.header("WWW-Authenticate").unwrap().to_string();
    assert!(challenge.starts_with("Digest realm=\"raop\", nonce=\""));
    let nonce = challenge
        .split("nonce=\"")
        .nth(1)
        .unwrap()
        .trim_end_matches('"')
        .to_string();
    assert_eq!(BASE64.decode(&nonce).unwrap().len(), 8);

    let response = digest_response("itunes", "raop", "pw", "OPTIONS", "*", &nonce);
    let authed = format!(
        "OPTIONS * RTSP/1.0\r\n\
         CSeq: 2\r\n\
         Authorization: Digest username=\"itunes\", realm=\"raop\", nonce=\"{nonce}\", \
         uri=\"*\", response=\"{response}\"\r\n\r\n"
    );
    let resp = roundtrip(&mut stream, &authed).await;
    assert_eq!(resp.code, 200);
    assert_eq!(
        resp.header("Public"),
        Some(
            "ANNOUNCE, SETUP, RECORD, PAUSE, FLUSH, TEARDOWN, OPTIONS, \
             GET_PARAMETER, SET_PARAMETER"
        )
    );
    assert_eq!(resp.header("Server"), Some("AirTunes/105.1"));

    receiver.shutdown().await;
}

#[tokio::test]
async fn pcm_session_lifecycle() {
    let (mut receiver, player, transport, port) =
        start_receiver(ReceiverConfig::with_name("lifecycle")).await;
    let mut stream = connect(port).await;

    let resp = roundtrip(&mut stream, &announce_request(1, PCM_SDP)).await;
    assert_eq!(resp.code, 200);

    let resp = roundtrip(&mut stream, &setup_request(2)).await;
    assert_eq!(resp.code, 200);
    assert_eq!(resp.header("Session"), Some("1"));
    let transport_hdr = resp.header("Transport").unwrap();
    assert!(transport_hdr.contains("server_port=6010"));
    assert!(transport_hdr.contains("control_port=6011"));
    assert!(transport_hdr.contains("timing_port=6012"));
    assert_eq!(transport.setup_calls(), 1);

    let resp = roundtrip(
        &mut stream,
        "RECORD rtsp://192.168.1.20/1234 RTSP/1.0\r\nCSeq: 3\r\n\
         RTP-Info: seq=1000;rtptime=43210\r\n\r\n",
    )
    .await;
    assert_eq!(resp.code, 200);
    assert_eq!(resp.header("Audio-Latency"), Some("11025"));

    let resp = roundtrip(
        &mut stream,
        "FLUSH rtsp://192.168.1.20/1234 RTSP/1.0\r\nCSeq: 4\r\n\
         RTP-Info: rtptime=99999\r\n\r\n",
    )
    .await;
    assert_eq!(resp.code, 200);

    let resp = roundtrip(
        &mut stream,
        "TEARDOWN rtsp://192.168.1.20/1234 RTSP/1.0\r\nCSeq: 5\r\n\r\n",
    )
    .await;
    assert_eq!(resp.code, 200);
    assert_eq!(resp.header("Connection"), Some("close"));

    let events = player.events();
    assert_eq!(events[0], PlayerEvent::Play(1));
    assert!(events.contains(&PlayerEvent::Flush(43210)));
    assert!(events.contains(&PlayerEvent::Flush(99999)));
    assert_eq!(events.last(), Some(&PlayerEvent::Stop));

    // the slot frees up once the connection goes away
    drop(stream);
    sleep(Duration::from_millis(100)).await;
    let mut second = connect(port).await;
    let resp = roundtrip(&mut second, &announce_request(1, PCM_SDP)).await;
    assert_eq!(resp.code, 200);

    receiver.shutdown().await;
}

#[tokio::test]
async fn duplicate_setup_keeps_original_transport() {
    let (mut receiver, _player, transport, port) =
        start_receiver(ReceiverConfig::with_name("dup-setup")).await;
    let mut stream = connect(port).await;

    assert_eq!(roundtrip(&mut stream, &announce_request(1, PCM_SDP)).await.code, 200);
    assert_eq!(roundtrip(&mut stream, &setup_request(2)).await.code, 200);
    let resp = roundtrip(&mut stream, &setup_request(3)).await;
    assert_eq!(resp.code, 200);
    // identical re-setup is tolerated and does not reach the transport again
    assert_eq!(transport.setup_calls(), 1);

    receiver.shutdown().await;
}

#[tokio::test]
async fn session_verbs_require_announce() {
    let (mut receiver, player, _transport, port) =
        start_receiver(ReceiverConfig::with_name("no-announce")).await;
    let mut stream = connect(port).await;

    for request in [
        "SETUP rtsp://x/1 RTSP/1.0\r\nCSeq: 1\r\nTransport: control_port=1;timing_port=2\r\n\r\n",
        "RECORD rtsp://x/1 RTSP/1.0\r\nCSeq: 2\r\n\r\n",
        "FLUSH rtsp://x/1 RTSP/1.0\r\nCSeq: 3\r\n\r\n",
        "TEARDOWN rtsp://x/1 RTSP/1.0\r\nCSeq: 4\r\n\r\n",
    ] {
        let resp = roundtrip(&mut stream, request).await;
        assert_eq!(resp.code, 451);
    }
    assert!(player.events().is_empty());

    receiver.shutdown().await;
}

#[tokio::test]
async fn second_sender_rejected_without_interruption() {
    let (mut receiver, _player, _transport, port) =
        start_receiver(ReceiverConfig::with_name("no-preempt")).await;

    let mut first = connect(port).await;
    assert_eq!(roundtrip(&mut first, &announce_request(1, PCM_SDP)).await.code, 200);

    let mut second = connect(port).await;
    let resp = roundtrip(&mut second, &announce_request(1, PCM_SDP)).await;
    assert_eq!(resp.code, 453);

    // the first sender is untouched
    let resp = roundtrip(&mut first, "OPTIONS * RTSP/1.0\r\nCSeq: 2\r\n\r\n").await;
    assert_eq!(resp.code, 200);

    receiver.shutdown().await;
}

#[tokio::test]
async fn second_sender_preempts_when_allowed() {
    let (mut receiver, _player, _transport, port) = start_receiver(
        ReceiverConfig::with_name("preempt").allow_session_interruption(true),
    )
    .await;

    let mut first = connect(port).await;
    assert_eq!(roundtrip(&mut first, &announce_request(1, PCM_SDP)).await.code, 200);

    let mut second = connect(port).await;
    let resp = timeout(
        Duration::from_secs(5),
        roundtrip(&mut second, &announce_request(1, PCM_SDP)),
    )
    .await
    .expect("preemption should finish inside the acquisition budget");
    assert_eq!(resp.code, 200);

    // the first connection was cancelled; its socket reads EOF (or reset)
    let mut buf = [0u8; 16];
    let outcome = timeout(Duration::from_secs(5), first.read(&mut buf)).await;
    match outcome {
        Ok(Ok(n)) => assert_eq!(n, 0),
        Ok(Err(_)) => {}
        Err(_) => panic!("first connection was not terminated"),
    }

    receiver.shutdown().await;
}

#[tokio::test]
async fn oversize_apple_challenge_is_ignored() {
    let key = Arc::new(RaopKey::generate().unwrap());
    let config = ReceiverConfig::with_name("challenge")
        .airplay_key(key)
        .hw_addr([0, 1, 2, 3, 4, 5]);
    let (mut receiver, _player, _transport, port) = start_receiver(config).await;
    let mut stream = connect(port).await;

    let oversize = BASE64.encode([0u8; 17]);
    let resp = roundtrip(
        &mut stream,
        &format!("OPTIONS * RTSP/1.0\r\nCSeq: 1\r\nApple-Challenge: {oversize}\r\n\r\n"),
    )
    .await;
    assert_eq!(resp.code, 200);
    assert!(resp.header("Apple-Response").is_none());

    // connection survives; a well-sized challenge now gets answered
    let good = BASE64.encode([7u8; 16]);
    let resp = roundtrip(
        &mut stream,
        &format!("OPTIONS * RTSP/1.0\r\nCSeq: 2\r\nApple-Challenge: {good}\r\n\r\n"),
    )
    .await;
    assert_eq!(resp.code, 200);
    assert!(resp.header("Apple-Response").is_some());

    receiver.shutdown().await;
}

#[tokio::test]
async fn get_and_set_volume() {
    let (mut receiver, player, _transport, port) =
        start_receiver(ReceiverConfig::with_name("volume")).await;
    let mut stream = connect(port).await;

    assert_eq!(roundtrip(&mut stream, &announce_request(1, PCM_SDP)).await.code, 200);

    let body = "volume: -18.500000\r\n";
    let resp = roundtrip(
        &mut stream,
        &format!(
            "SET_PARAMETER rtsp://x/1 RTSP/1.0\r\nCSeq: 2\r\n\
             Content-Type: text/parameters\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        ),
    )
    .await;
    assert_eq!(resp.code, 200);
    assert!(player.events().contains(&PlayerEvent::Volume(-18.5)));

    let query = "volume\r\n";
    let resp = roundtrip(
        &mut stream,
        &format!(
            "GET_PARAMETER rtsp://x/1 RTSP/1.0\r\nCSeq: 3\r\n\
             Content-Length: {}\r\n\r\n{query}",
            query.len()
        ),
    )
    .await;
    assert_eq!(resp.code, 200);
    assert_eq!(
        String::from_utf8_lossy(&resp.body),
        "\r\nvolume: -18.500000\r\n"
    );

    receiver.shutdown().await;
}

#[tokio::test]
async fn unknown_method_answers_400_and_survives() {
    let (mut receiver, _player, _transport, port) =
        start_receiver(ReceiverConfig::with_name("unknown")).await;
    let mut stream = connect(port).await;

    let resp = roundtrip(&mut stream, "DESCRIBE rtsp://x/1 RTSP/1.0\r\nCSeq: 1\r\n\r\n").await;
    assert_eq!(resp.code, 400);

    let resp = roundtrip(&mut stream, "OPTIONS * RTSP/1.0\r\nCSeq: 2\r\n\r\n").await;
    assert_eq!(resp.code, 200);

    receiver.shutdown().await;
}

#[tokio::test]
async fn watchdog_drops_idle_connection() {
    let config = ReceiverConfig::with_name("watchdog")
        .idle_timeout(Some(Duration::from_millis(100)));
    let player = Arc::new(RecordingPlayer::new());
    let mut receiver = RaopReceiver::new(config.port(0), player, Arc::new(NullTransport));
    let port = receiver.start().await.unwrap();

    let mut stream = connect(port).await;
    assert_eq!(
        roundtrip(&mut stream, "OPTIONS * RTSP/1.0\r\nCSeq: 1\r\n\r\n").await.code,
        200
    );

    // watchdog ticks every 2 s; the idle timeout overruns on the first tick
    let mut buf = [0u8; 16];
    let outcome = timeout(Duration::from_secs(10), stream.read(&mut buf)).await;
    match outcome {
        Ok(Ok(n)) => assert_eq!(n, 0),
        Ok(Err(_)) => {}
        Err(_) => panic!("idle connection was not dropped"),
    }

    receiver.shutdown().await;
}
