//! 데이터 플레인 전송
//!
//! - 연속 포트 N개에 데이터 소켓 바인드, 소켓별 수신 태스크
//! - 송신은 원자 라운드로빈으로 소켓 분산
//! - 수신 데이터그램은 파싱해서 채널로 전달, 파싱 실패는 조용히 폐기
//!
//! 소켓 i는 상대 데이터 베이스 포트 + i로 보낸다. 양측이 같은 소켓 수를
//! 쓴다는 전제 (세션 설정에서 맞춘다).

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::crypto::SecureEnvelope;
use crate::error::Result;
use crate::protocol::{DataHeader, DataPacket};
use crate::MAX_DATAGRAM_SIZE;

/// 소켓당 수신 버퍼 크기 (바이트)
const RECV_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// 수신 루프 폴링 타임아웃 (밀리초)
const RECV_POLL_MS: u64 = 50;

/// 멀티포트 데이터 플레인
pub struct DataPlane {
    sockets: Vec<Arc<UdpSocket>>,
    local_ports: Vec<u16>,
    rr_counter: AtomicUsize,
    remote: RwLock<Option<(IpAddr, u16)>>,
    envelope: Option<Arc<SecureEnvelope>>,
    running: Arc<AtomicBool>,
    invalid_frames: Arc<AtomicU64>,
    recv_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DataPlane {
    /// `[base_port, base_port + count)` 연속 포트에 바인드
    ///
    /// base_port가 0이면 count는 1이어야 한다 (임시 포트는 연속 보장 불가).
    pub async fn bind(
        bind_ip: IpAddr,
        base_port: u16,
        count: u16,
        envelope: Option<Arc<SecureEnvelope>>,
    ) -> Result<Self> {
        assert!(count >= 1);
        assert!(base_port != 0 || count == 1);

        let mut sockets = Vec::with_capacity(count as usize);
        let mut local_ports = Vec::with_capacity(count as usize);

        for i in 0..count {
            let addr = SocketAddr::new(bind_ip, base_port.wrapping_add(i));

            let raw = Socket::new(
                match bind_ip {
                    IpAddr::V4(_) => Domain::IPV4,
                    IpAddr::V6(_) => Domain::IPV6,
                },
                Type::DGRAM,
                Some(Protocol::UDP),
            )?;

            if let Err(e) = raw.set_recv_buffer_size(RECV_BUFFER_SIZE) {
                warn!("수신 버퍼 설정 실패 (port {}): {}", addr.port(), e);
            }
            raw.set_nonblocking(true)?;
            raw.bind(&addr.into())?;

            let socket = UdpSocket::from_std(raw.into())?;
            local_ports.push(socket.local_addr()?.port());
            sockets.push(Arc::new(socket));
        }

        debug!("데이터 플레인 바인드: ports {:?}", local_ports);

        Ok(Self {
            sockets,
            local_ports,
            rr_counter: AtomicUsize::new(0),
            remote: RwLock::new(None),
            envelope,
            running: Arc::new(AtomicBool::new(false)),
            invalid_frames: Arc::new(AtomicU64::new(0)),
            recv_tasks: Mutex::new(Vec::new()),
        })
    }

    /// 상대 주소 설정 (호스트 + 데이터 베이스 포트)
    pub fn set_remote(&self, host: IpAddr, data_base_port: u16) {
        *self.remote.write() = Some((host, data_base_port));
    }

    /// 소켓별 수신 태스크 시작. 파싱된 패킷은 tx로 전달된다.
    pub fn start(&self, tx: mpsc::Sender<DataPacket>) {
        self.running.store(true, Ordering::SeqCst);
        let mut tasks = self.recv_tasks.lock();

        for socket in &self.sockets {
            let socket = socket.clone();
            let tx = tx.clone();
            let running = self.running.clone();
            let invalid_frames = self.invalid_frames.clone();
            let envelope = self.envelope.clone();

            tasks.push(tokio::spawn(async move {
                let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

                while running.load(Ordering::SeqCst) {
                    let received = tokio::time::timeout(
                        Duration::from_millis(RECV_POLL_MS),
                        socket.recv_from(&mut buf),
                    )
                    .await;

                    match received {
                        Ok(Ok((len, _addr))) => {
                            match parse_datagram(&buf[..len], envelope.as_deref()) {
                                Ok(packet) => {
                                    if tx.send(packet).await.is_err() {
                                        break;
                                    }
                                }
                                Err(_) => {
                                    // 손상 프레임은 조용히 폐기, 카운터만 증가
                                    invalid_frames.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                        }
                        Ok(Err(e)) => {
                            warn!("데이터 수신 에러: {}", e);
                        }
                        Err(_) => {
                            // 폴링 타임아웃, running 재확인
                        }
                    }
                }
            }));
        }
    }

    /// 데이터 패킷 송신 (라운드로빈 분산)
    pub async fn send_packet(&self, packet: &DataPacket) -> Result<()> {
        let remote = *self.remote.read();
        let (host, base_port) = remote.ok_or(crate::Error::ConnectionClosed)?;

        let idx = self.rr_counter.fetch_add(1, Ordering::Relaxed) % self.sockets.len();
        let dest = SocketAddr::new(host, base_port.wrapping_add(idx as u16));

        let bytes = match &self.envelope {
            Some(envelope) => envelope.seal(packet),
            None => packet.to_bytes(),
        };

        self.sockets[idx].send_to(&bytes, dest).await?;
        Ok(())
    }

    /// 수신 태스크 정지 및 조인
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);

        let tasks: Vec<JoinHandle<()>> = self.recv_tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    pub fn local_ports(&self) -> &[u16] {
        &self.local_ports
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    /// 폐기한 손상 프레임 수
    pub fn invalid_frames(&self) -> u64 {
        self.invalid_frames.load(Ordering::Relaxed)
    }
}

/// 데이터그램 파싱 (암호화 봉투 처리 포함)
fn parse_datagram(buf: &[u8], envelope: Option<&SecureEnvelope>) -> Result<DataPacket> {
    let header = DataHeader::from_bytes(buf)?;

    if header.is_encrypted() {
        match envelope {
            Some(env) => env.open(buf),
            // 암호화 비활성 세션에 암호화 패킷: 폐기
            None => Err(crate::Error::HmacMismatch),
        }
    } else {
        DataPacket::from_bytes(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_loopback_roundtrip() {
        let plane = DataPlane::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, 1, None)
            .await
            .unwrap();

        let port = plane.local_ports()[0];
        plane.set_remote(IpAddr::V4(Ipv4Addr::LOCALHOST), port);

        let (tx, mut rx) = mpsc::channel(16);
        plane.start(tx);

        let packet = DataPacket::new(3, 7, 1400, Bytes::from_static(b"payload"), 0);
        plane.send_packet(&packet).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(received.header.chunk_id, 3);
        assert_eq!(received.header.seq, 7);
        assert_eq!(received.data.as_ref(), b"payload");

        plane.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_frame_dropped() {
        let plane = DataPlane::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, 1, None)
            .await
            .unwrap();

        let port = plane.local_ports()[0];
        let (tx, mut rx) = mpsc::channel(16);
        plane.start(tx);

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(b"not a hruft frame", ("127.0.0.1", port))
            .await
            .unwrap();

        // 파싱 실패 → 채널에 아무것도 오지 않는다
        let result = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(result.is_err());
        assert_eq!(plane.invalid_frames(), 1);

        plane.shutdown().await;
    }
}
