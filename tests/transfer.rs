//! 루프백 종단 간 전송 시나리오
//!
//! 송신·수신 엔진을 한 프로세스에서 띄워 실제 UDP로 파일을 옮긴다.
//! 테스트마다 포트 대역을 분리해 병렬 실행과 충돌하지 않게 한다.

use std::path::Path;
use std::time::Duration;

use sha2::{Digest, Sha256};

use hruft::{Error, Receiver, Sender, SessionConfig};

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn configs(base_port: u16) -> (SessionConfig, SessionConfig) {
    let recv = SessionConfig {
        control_port: base_port,
        local_data_port: base_port + 10,
        data_sockets: 2,
        chunk_size_mb: 1,
        window_size: 4,
        worker_threads: 2,
        handshake_timeout_ms: 10_000,
        ..SessionConfig::default()
    };

    let send = SessionConfig {
        remote_host: "127.0.0.1".to_string(),
        control_port: base_port,
        local_data_port: base_port + 20,
        remote_data_port: base_port + 10,
        data_sockets: 2,
        chunk_size_mb: 1,
        window_size: 4,
        worker_threads: 2,
        handshake_timeout_ms: 10_000,
        ..SessionConfig::default()
    };

    (recv, send)
}

/// 파일 하나를 루프백으로 옮기고 커밋된 내용을 돌려준다
async fn transfer(
    data: &[u8],
    recv_config: SessionConfig,
    send_config: SessionConfig,
) -> Vec<u8> {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("source.bin");
    let dst = dir.path().join("received.bin");
    std::fs::write(&src, data).unwrap();

    let recv_task = {
        let dst = dst.clone();
        tokio::spawn(async move {
            let receiver = Receiver::start(recv_config, &dst).await?;
            let result = receiver.wait_for_completion().await;
            receiver.stop().await;
            result
        })
    };

    // 수신측이 SYN 대기에 들어갈 시간
    tokio::time::sleep(Duration::from_millis(200)).await;

    let sender = Sender::start(send_config, &src).await.unwrap();
    sender.wait_for_completion().await.unwrap();
    sender.stop().await;

    recv_task.await.unwrap().unwrap();

    // 커밋 불변식: 최종 파일만 남는다
    assert!(dst.exists());
    assert!(!tmp_of(&dst).exists());

    std::fs::read(&dst).unwrap()
}

fn tmp_of(path: &Path) -> std::path::PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    std::path::PathBuf::from(name)
}

#[tokio::test(flavor = "multi_thread")]
async fn transfer_tiny_file() {
    let (recv_config, send_config) = configs(47100);

    let received = tokio::time::timeout(
        Duration::from_secs(60),
        transfer(b"hello", recv_config, send_config),
    )
    .await
    .expect("transfer timed out");

    assert_eq!(received, b"hello");
    assert_eq!(
        sha256(&received),
        // SHA-256("hello")
        [
            0x2c, 0xf2, 0x4d, 0xba, 0x5f, 0xb0, 0xa3, 0x0e, 0x26, 0xe8, 0x3b, 0x2a, 0xc5, 0xb9,
            0xe2, 0x9e, 0x1b, 0x16, 0x1e, 0x5c, 0x1f, 0xa7, 0x42, 0x5e, 0x73, 0x04, 0x33, 0x62,
            0x93, 0x8b, 0x98, 0x24
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn transfer_multi_chunk_file() {
    let (recv_config, send_config) = configs(47200);

    // 1MB 청크 3개 (마지막은 부분 청크)
    let data: Vec<u8> = (0..2_500_000u32).map(|i| (i * 31 % 251) as u8).collect();
    let expected_hash = sha256(&data);

    let received = tokio::time::timeout(
        Duration::from_secs(120),
        transfer(&data, recv_config, send_config),
    )
    .await
    .expect("transfer timed out");

    assert_eq!(received.len(), data.len());
    assert_eq!(sha256(&received), expected_hash);
}

#[tokio::test(flavor = "multi_thread")]
async fn transfer_empty_file() {
    let (recv_config, send_config) = configs(47300);

    let received = tokio::time::timeout(
        Duration::from_secs(60),
        transfer(b"", recv_config, send_config),
    )
    .await
    .expect("transfer timed out");

    assert!(received.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn transfer_encrypted() {
    let (mut recv_config, mut send_config) = configs(47400);

    for config in [&mut recv_config, &mut send_config] {
        config.enable_encryption = true;
        config.encryption_key = "Sup3rSecretTestKey".to_string();
    }

    let data: Vec<u8> = (0..200_000u32).map(|i| (i * 7 % 253) as u8).collect();
    let expected_hash = sha256(&data);

    let received = tokio::time::timeout(
        Duration::from_secs(120),
        transfer(&data, recv_config, send_config),
    )
    .await
    .expect("transfer timed out");

    assert_eq!(sha256(&received), expected_hash);
}

#[tokio::test(flavor = "multi_thread")]
async fn sender_handshake_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("source.bin");
    std::fs::write(&src, b"data").unwrap();

    // 아무도 듣지 않는 포트로
    let config = SessionConfig {
        remote_host: "127.0.0.1".to_string(),
        control_port: 47501,
        local_data_port: 47510,
        remote_data_port: 47511,
        data_sockets: 1,
        handshake_timeout_ms: 500,
        ..SessionConfig::default()
    };

    let result = Sender::start(config, &src).await;
    assert!(matches!(result, Err(Error::HandshakeTimeout(500))));
}
