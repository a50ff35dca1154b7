/// End-to-end loopback tests: a real receiver on an ephemeral port, a real
/// sender, byte-for-byte comparison of what lands in the download dir.
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use beam_crypto::{key_hash, SegmentCipher};
use beam_protocol::{
    FrameHeader, StreamHandshake, StreamSegment, TransferHeader, SENTINEL_FRAME,
};
use beam_transfer::{
    send_path, NullProgress, Receiver, ReceiverConfig, StaticAuthorizer, TransferError,
    TransferOptions,
};

const KEY: &str = "ABC123";

async fn start_receiver(download_dir: &Path, key: &str, accept: bool) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let receiver = Receiver::new(ReceiverConfig {
        download_dir: download_dir.to_path_buf(),
        authorizer: Arc::new(StaticAuthorizer {
            accept_all: accept,
            key: key.into(),
        }),
        progress: Arc::new(NullProgress),
    });
    tokio::spawn(receiver.run(listener));
    addr
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn write_source(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
}

async fn roundtrip(data: &[u8], options: &TransferOptions) -> Vec<u8> {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let source = write_source(src.path(), "payload.bin", data);
    let addr = start_receiver(dst.path(), KEY, true).await;

    send_path(&source, addr, KEY, options, Arc::new(NullProgress))
        .await
        .unwrap();
    std::fs::read(dst.path().join("payload.bin")).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn small_file_roundtrip() {
    let data = patterned(1024 * 1024);
    let out = roundtrip(&data, &TransferOptions::default()).await;
    assert_eq!(out, data);
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_file_roundtrip() {
    let out = roundtrip(&[], &TransferOptions::default()).await;
    assert!(out.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn compressed_roundtrip_at_several_levels() {
    let data: Vec<u8> = (0..2 * 1024 * 1024u32).map(|i| (i % 17) as u8).collect();
    for level in [1u8, 6, 9] {
        let options = TransferOptions {
            compress: true,
            compression_level: level,
            ..Default::default()
        };
        let out = roundtrip(&data, &options).await;
        assert_eq!(out, data, "level {level} corrupted the payload");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn level_zero_sends_uncompressed() {
    let data = patterned(512 * 1024);
    let options = TransferOptions {
        compress: true,
        compression_level: 0,
        ..Default::default()
    };
    let out = roundtrip(&data, &options).await;
    assert_eq!(out, data);
}

#[tokio::test(flavor = "multi_thread")]
async fn multi_stream_roundtrip() {
    // A lowered threshold exercises the 3-connection fan-out without a
    // multi-hundred-megabyte fixture.
    let data = patterned(4 * 1024 * 1024 + 7);
    let options = TransferOptions {
        parallel_streams: 3,
        multi_stream_threshold: 1024 * 1024,
        ..Default::default()
    };
    let out = roundtrip(&data, &options).await;
    assert_eq!(out, data);
}

#[tokio::test(flavor = "multi_thread")]
async fn multi_stream_compressed_roundtrip() {
    let data: Vec<u8> = (0..3 * 1024 * 1024u32).map(|i| (i % 13) as u8).collect();
    let options = TransferOptions {
        parallel_streams: 4,
        multi_stream_threshold: 1024 * 1024,
        compress: true,
        compression_level: 6,
        ..Default::default()
    };
    let out = roundtrip(&data, &options).await;
    assert_eq!(out, data);
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_key_declines_before_any_payload() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let source = write_source(src.path(), "secret.bin", &patterned(64 * 1024));
    let addr = start_receiver(dst.path(), "BBBBBB", true).await;

    let result = send_path(
        &source,
        addr,
        "AAAAAA",
        &TransferOptions::default(),
        Arc::new(NullProgress),
    )
    .await;
    assert!(matches!(result, Err(TransferError::Declined)));
    assert!(!dst.path().join("secret.bin").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn operator_rejection_declines() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let source = write_source(src.path(), "unwanted.bin", b"no thanks");
    let addr = start_receiver(dst.path(), KEY, false).await;

    let result = send_path(
        &source,
        addr,
        KEY,
        &TransferOptions::default(),
        Arc::new(NullProgress),
    )
    .await;
    assert!(matches!(result, Err(TransferError::Declined)));
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_stream_handshake_is_dropped_silently() {
    let dst = tempfile::tempdir().unwrap();
    let addr = start_receiver(dst.path(), KEY, true).await;

    // A STRM handshake for a transfer nobody registered.
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let handshake = StreamHandshake {
        stream_index: 1,
        transfer_id: [0xEE; 16],
    };
    stream.write_all(&handshake.encode()).await.unwrap();
    // The receiver closes without a byte.
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("receiver should close the connection");
    assert_eq!(read.unwrap(), 0);

    // The listener must still serve real transfers afterwards.
    let src = tempfile::tempdir().unwrap();
    let source = write_source(src.path(), "after.bin", &patterned(128 * 1024));
    send_path(
        &source,
        addr,
        KEY,
        &TransferOptions::default(),
        Arc::new(NullProgress),
    )
    .await
    .unwrap();
    assert_eq!(
        std::fs::read(dst.path().join("after.bin")).unwrap(),
        patterned(128 * 1024)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn mid_transfer_disconnect_removes_the_partial_file() {
    let dst = tempfile::tempdir().unwrap();
    let addr = start_receiver(dst.path(), KEY, true).await;

    let hash = key_hash(KEY);
    let iv = [7u8; 16];
    let chunk_size = 256 * 1024u32;
    let total = 1024 * 1024u64;
    let header = TransferHeader {
        filename: "broken.bin".into(),
        total_size: total,
        key_hash: hash,
        flags: 0,
        compression_level: 0,
        chunk_size,
        transfer_id: [0x11; 16],
        segments: vec![StreamSegment {
            iv,
            offset: 0,
            length: total,
        }],
    };

    {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&header.encode().unwrap()).await.unwrap();
        assert_eq!(stream.read_u8().await.unwrap(), b'Y');

        // One valid frame, then vanish mid-transfer.
        let mut chunk = patterned(chunk_size as usize);
        SegmentCipher::new(&hash, &iv).apply(&mut chunk);
        let frame = FrameHeader {
            plain_len: chunk_size,
            payload_len: chunk_size,
        };
        stream.write_all(&frame.encode()).await.unwrap();
        stream.write_all(&chunk).await.unwrap();
        stream.flush().await.unwrap();
    }

    // The receiver records the broken stream and deletes the partial file.
    let path = dst.path().join("broken.bin");
    let mut gone = false;
    for _ in 0..100 {
        if !path.exists() {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(gone, "partial output file was not removed");

    // And the listener is still alive.
    let src = tempfile::tempdir().unwrap();
    let source = write_source(src.path(), "healthy.bin", &patterned(64 * 1024));
    send_path(
        &source,
        addr,
        KEY,
        &TransferOptions::default(),
        Arc::new(NullProgress),
    )
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn bytes_after_the_sentinel_are_not_consumed() {
    let dst = tempfile::tempdir().unwrap();
    let addr = start_receiver(dst.path(), KEY, true).await;

    let hash = key_hash(KEY);
    let chunk = 256 * 1024usize;
    let ivs = [[1u8; 16], [2u8; 16]];
    let transfer_id = [0x22u8; 16];
    let header = TransferHeader {
        filename: "twostream.bin".into(),
        total_size: 2 * chunk as u64,
        key_hash: hash,
        flags: beam_protocol::FLAG_MULTI_STREAM,
        compression_level: 0,
        chunk_size: chunk as u32,
        transfer_id,
        segments: vec![
            StreamSegment {
                iv: ivs[0],
                offset: 0,
                length: chunk as u64,
            },
            StreamSegment {
                iv: ivs[1],
                offset: chunk as u64,
                length: chunk as u64,
            },
        ],
    };

    let mut primary = TcpStream::connect(addr).await.unwrap();
    primary.write_all(&header.encode().unwrap()).await.unwrap();
    assert_eq!(primary.read_u8().await.unwrap(), b'Y');

    let frame = FrameHeader {
        plain_len: chunk as u32,
        payload_len: chunk as u32,
    };

    // Auxiliary stream: segment 1, sentinel, then garbage. If the receiver
    // kept reading past the sentinel it would see a malformed frame and
    // fail the whole transfer.
    let mut aux = TcpStream::connect(addr).await.unwrap();
    let handshake = StreamHandshake {
        stream_index: 1,
        transfer_id,
    };
    aux.write_all(&handshake.encode()).await.unwrap();
    let mut part_b = vec![0xB7u8; chunk];
    let expected_b = part_b.clone();
    SegmentCipher::new(&hash, &ivs[1]).apply(&mut part_b);
    aux.write_all(&frame.encode()).await.unwrap();
    aux.write_all(&part_b).await.unwrap();
    aux.write_all(&SENTINEL_FRAME.encode()).await.unwrap();
    aux.write_all(&[0xFFu8; 64]).await.unwrap();
    aux.flush().await.unwrap();

    // Primary stream: segment 0 and its sentinel.
    let mut part_a = vec![0xA5u8; chunk];
    let expected_a = part_a.clone();
    SegmentCipher::new(&hash, &ivs[0]).apply(&mut part_a);
    primary.write_all(&frame.encode()).await.unwrap();
    primary.write_all(&part_a).await.unwrap();
    primary.write_all(&SENTINEL_FRAME.encode()).await.unwrap();
    primary.flush().await.unwrap();

    let verdict = tokio::time::timeout(Duration::from_secs(10), primary.read_u8())
        .await
        .expect("verdict should arrive")
        .unwrap();
    assert_eq!(verdict, b'Y');

    let out = std::fs::read(dst.path().join("twostream.bin")).unwrap();
    assert_eq!(&out[..chunk], &expected_a[..]);
    assert_eq!(&out[chunk..], &expected_b[..]);
}

#[tokio::test(flavor = "multi_thread")]
async fn directory_roundtrip_and_dedup() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();

    let source = src.path().join("proj");
    std::fs::create_dir_all(source.join("docs/deep")).unwrap();
    std::fs::write(source.join("readme.md"), b"hello").unwrap();
    std::fs::write(source.join("docs/deep/data.bin"), patterned(300_000)).unwrap();

    let addr = start_receiver(dst.path(), KEY, true).await;
    let options = TransferOptions {
        compress: true,
        compression_level: 6,
        ..Default::default()
    };

    send_path(&source, addr, KEY, &options, Arc::new(NullProgress))
        .await
        .unwrap();
    let first = dst.path().join("proj");
    assert_eq!(std::fs::read(first.join("readme.md")).unwrap(), b"hello");
    assert_eq!(
        std::fs::read(first.join("docs/deep/data.bin")).unwrap(),
        patterned(300_000)
    );

    // Sending again lands in a deduplicated directory.
    send_path(&source, addr, KEY, &options, Arc::new(NullProgress))
        .await
        .unwrap();
    let second = dst.path().join("proj_1");
    assert_eq!(std::fs::read(second.join("readme.md")).unwrap(), b"hello");
}
