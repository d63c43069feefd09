//! 컨트롤 채널
//!
//! 세션 수명주기 메시지(핸드쉐이크, 청크 메타, 확인, NACK, 재시도,
//! heartbeat, 완료)를 모두 나르는 단일 데이터그램 소켓.
//!
//! 두 가지 모드:
//! 1. 핸드쉐이크 중: `recv_timeout`으로 동기 수신
//! 2. 전송 중: `start_events`로 비동기 채널 전달

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;
use crate::protocol::{decode_control, encode_control, ControlHeader, ControlType};

/// 컨트롤 소켓 버퍼 크기 (바이트)
const CONTROL_BUFFER_SIZE: usize = 1024 * 1024;

/// 수신 루프 폴링 타임아웃 (밀리초)
const RECV_POLL_MS: u64 = 50;

/// 수신된 컨트롤 프레임
#[derive(Debug, Clone)]
pub struct ControlEvent {
    pub header: ControlHeader,
    pub payload: Bytes,
    pub from: SocketAddr,
}

/// 컨트롤 채널
pub struct ControlChannel {
    socket: Arc<UdpSocket>,
    running: Arc<AtomicBool>,
    invalid_frames: Arc<AtomicU64>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl ControlChannel {
    /// 컨트롤 소켓 바인드 (port 0이면 임시 포트)
    pub async fn bind(bind_ip: IpAddr, port: u16) -> Result<Self> {
        let raw = Socket::new(
            match bind_ip {
                IpAddr::V4(_) => Domain::IPV4,
                IpAddr::V6(_) => Domain::IPV6,
            },
            Type::DGRAM,
            Some(Protocol::UDP),
        )?;

        if let Err(e) = raw.set_recv_buffer_size(CONTROL_BUFFER_SIZE) {
            warn!("컨트롤 수신 버퍼 설정 실패: {}", e);
        }
        if let Err(e) = raw.set_send_buffer_size(CONTROL_BUFFER_SIZE) {
            warn!("컨트롤 송신 버퍼 설정 실패: {}", e);
        }
        raw.set_nonblocking(true)?;
        raw.bind(&SocketAddr::new(bind_ip, port).into())?;

        let socket = Arc::new(UdpSocket::from_std(raw.into())?);
        debug!("컨트롤 채널 바인드: {}", socket.local_addr()?);

        Ok(Self {
            socket,
            running: Arc::new(AtomicBool::new(false)),
            invalid_frames: Arc::new(AtomicU64::new(0)),
            event_task: Mutex::new(None),
        })
    }

    /// 컨트롤 프레임 송신
    pub async fn send(
        &self,
        addr: SocketAddr,
        ctype: ControlType,
        chunk_id: u32,
        payload: &[u8],
    ) -> Result<()> {
        let frame = encode_control(ctype, chunk_id, payload);
        self.socket.send_to(&frame, addr).await?;
        Ok(())
    }

    /// 동기 수신 (핸드쉐이크용)
    ///
    /// 타임아웃이나 파싱 실패면 None. 호출측이 전체 마감까지 루프를 돈다.
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<Option<ControlEvent>> {
        let mut buf = vec![0u8; crate::MAX_DATAGRAM_SIZE];

        match tokio::time::timeout(timeout, self.socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => match decode_control(&buf[..len]) {
                Ok((header, payload)) => Ok(Some(ControlEvent {
                    header,
                    payload,
                    from,
                })),
                Err(_) => {
                    self.invalid_frames.fetch_add(1, Ordering::Relaxed);
                    Ok(None)
                }
            },
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Ok(None),
        }
    }

    /// 비동기 이벤트 루프 시작 (전송 페이즈용)
    pub fn start_events(&self, tx: mpsc::Sender<ControlEvent>) {
        self.running.store(true, Ordering::SeqCst);

        let socket = self.socket.clone();
        let running = self.running.clone();
        let invalid_frames = self.invalid_frames.clone();

        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; crate::MAX_DATAGRAM_SIZE];

            while running.load(Ordering::SeqCst) {
                let received = tokio::time::timeout(
                    Duration::from_millis(RECV_POLL_MS),
                    socket.recv_from(&mut buf),
                )
                .await;

                match received {
                    Ok(Ok((len, from))) => match decode_control(&buf[..len]) {
                        Ok((header, payload)) => {
                            let event = ControlEvent {
                                header,
                                payload,
                                from,
                            };
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => {
                            invalid_frames.fetch_add(1, Ordering::Relaxed);
                        }
                    },
                    Ok(Err(e)) => {
                        warn!("컨트롤 수신 에러: {}", e);
                    }
                    Err(_) => {
                        // 폴링 타임아웃
                    }
                }
            }
        });

        *self.event_task.lock() = Some(task);
    }

    /// 이벤트 루프 정지 및 조인
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);

        let task = self.event_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub fn local_port(&self) -> u16 {
        self.socket.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// 폐기한 손상 프레임 수
    pub fn invalid_frames(&self) -> u64 {
        self.invalid_frames.load(Ordering::Relaxed)
    }
}
