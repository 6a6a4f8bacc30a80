//! UDP metadata sink
//!
//! Sends each package as a datagram of `type || code || payload` when it
//! fits, otherwise as a numbered chunk sequence under the `ssncchnk`
//! protocol header. All multi-byte integers are big-endian.

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use super::{MetadataPackage, SinkReceiver};

/// Send-buffer size requested for the metadata socket.
const METADATA_SNDBUF: usize = 4 * 1024 * 1024;

/// Header overhead of a plain datagram: type + code.
const PLAIN_HEADER: usize = 8;

/// Header overhead of a chunked datagram:
/// `"ssnc" || "chnk" || chunk_ix || chunk_total || type || code`.
const CHUNK_HEADER: usize = 24;

/// Encode a package that fits in one datagram.
pub(crate) fn encode_plain(package: &MetadataPackage) -> Vec<u8> {
    let mut out = Vec::with_capacity(PLAIN_HEADER + package.data.len());
    out.extend_from_slice(&package.mtype.to_be_bytes());
    out.extend_from_slice(&package.code.to_be_bytes());
    out.extend_from_slice(&package.data);
    out
}

/// Encode an oversized package as a chunk sequence.
pub(crate) fn encode_chunked(package: &MetadataPackage, msg_length: usize) -> Vec<Vec<u8>> {
    let payload_per_chunk = msg_length - CHUNK_HEADER;
    let chunk_total = package.data.len().div_ceil(payload_per_chunk);

    package
        .data
        .chunks(payload_per_chunk)
        .enumerate()
        .map(|(chunk_ix, slice)| {
            let mut out = Vec::with_capacity(CHUNK_HEADER + slice.len());
            out.extend_from_slice(b"ssnc");
            out.extend_from_slice(b"chnk");
            out.extend_from_slice(&u32::try_from(chunk_ix).unwrap_or(u32::MAX).to_be_bytes());
            out.extend_from_slice(&u32::try_from(chunk_total).unwrap_or(u32::MAX).to_be_bytes());
            out.extend_from_slice(&package.mtype.to_be_bytes());
            out.extend_from_slice(&package.code.to_be_bytes());
            out.extend_from_slice(slice);
            out
        })
        .collect()
}

fn open_socket(target: SocketAddr) -> std::io::Result<UdpSocket> {
    let domain = if target.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_send_buffer_size(METADATA_SNDBUF)?;
    let bind_addr: SocketAddr = if target.is_ipv6() {
        "[::]:0".parse().map_err(std::io::Error::other)?
    } else {
        "0.0.0.0:0".parse().map_err(std::io::Error::other)?
    };
    socket.bind(&bind_addr.into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// Consumer loop for the UDP sink.
pub(crate) async fn run(mut rx: SinkReceiver, target: SocketAddr, msg_length: usize) {
    let socket = match open_socket(target) {
        Ok(socket) => socket,
        Err(e) => {
            tracing::warn!("could not open metadata socket: {e}");
            return;
        }
    };

    while let Some(package) = rx.take().await {
        tracing::debug!(
            "multicast: type {:x}, code {:x}, length {}",
            package.mtype,
            package.code,
            package.data.len()
        );
        if package.data.len() <= msg_length - PLAIN_HEADER {
            if let Err(e) = socket.send_to(&encode_plain(&package), target).await {
                tracing::debug!("metadata datagram send failed: {e}");
            }
        } else {
            for datagram in encode_chunked(&package, msg_length) {
                if let Err(e) = socket.send_to(&datagram, target).await {
                    tracing::debug!("metadata chunk send failed: {e}");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::codes;
    use bytes::Bytes;

    const MSG_LENGTH: usize = 500;

    fn package(data: Vec<u8>) -> MetadataPackage {
        MetadataPackage {
            mtype: codes::TYPE_CORE,
            code: codes::fourcc(b"minm"),
            data: Bytes::from(data),
            carrier: None,
        }
    }

    #[test]
    fn test_encode_plain() {
        let out = encode_plain(&package(b"title".to_vec()));
        assert_eq!(&out[0..4], b"core");
        assert_eq!(&out[4..8], b"minm");
        assert_eq!(&out[8..], b"title");
    }

    #[test]
    fn test_encode_chunked_framing() {
        let payload = vec![7u8; 1000];
        let chunks = encode_chunked(&package(payload), MSG_LENGTH);

        // 1000 bytes at 476 per chunk => 3 chunks
        assert_eq!(chunks.len(), 3);
        for (ix, chunk) in chunks.iter().enumerate() {
            assert_eq!(&chunk[0..8], b"ssncchnk");
            assert_eq!(chunk[8..12], u32::try_from(ix).unwrap().to_be_bytes());
            assert_eq!(chunk[12..16], 3u32.to_be_bytes());
            assert_eq!(&chunk[16..20], b"core");
            assert_eq!(&chunk[20..24], b"minm");
            assert!(chunk.len() <= MSG_LENGTH);
        }
        let total: usize = chunks.iter().map(|c| c.len() - CHUNK_HEADER).sum();
        assert_eq!(total, 1000);
    }

    #[test]
    fn test_chunk_total_exact_multiple() {
        let payload = vec![1u8; (MSG_LENGTH - CHUNK_HEADER) * 2];
        let chunks = encode_chunked(&package(payload), MSG_LENGTH);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0][12..16], 2u32.to_be_bytes());
    }

    proptest::proptest! {
        #[test]
        fn prop_chunked_payload_reassembles(payload in proptest::collection::vec(proptest::prelude::any::<u8>(), 1..4096)) {
            let expected = payload.clone();
            let chunks = encode_chunked(&package(payload), MSG_LENGTH);
            proptest::prop_assert!(chunks.iter().all(|c| c.len() <= MSG_LENGTH));
            let reassembled: Vec<u8> = chunks
                .iter()
                .flat_map(|c| c[CHUNK_HEADER..].iter().copied())
                .collect();
            proptest::prop_assert_eq!(reassembled, expected);
        }
    }

    #[tokio::test]
    async fn test_send_small_datagram() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = receiver.local_addr().unwrap();

        let (q, rx) = crate::metadata::sink_queue("multicast");
        let worker = tokio::spawn(run(rx, target, MSG_LENGTH));
        q.offer(package(b"hi".to_vec())).unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"coreminmhi");

        drop(q);
        let _ = worker.await;
    }
}
