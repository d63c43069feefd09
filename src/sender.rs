//! 송신 엔진
//!
//! - 핸드쉐이크 (SYN / SYN_ACK)
//! - 워커별 청크 펌프: 윈도우 슬롯 획득 → CHUNK_META → 패킷 일괄 송신
//! - 재전송 워커: 윈도우에서 후보 인출, 배치 재전송
//! - 데드락 감시자: 진행 정지 시 슬롯 강제 해제 + heartbeat

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashSet;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chunk::ChunkManager;
use crate::config::SessionConfig;
use crate::control::{ControlChannel, ControlEvent};
use crate::crypto::{derive_session_id, SecureEnvelope};
use crate::error::{Error, Result};
use crate::protocol::{
    ChunkMetaPayload, ChunkNackPayload, ControlType, DataPacket, FileDonePayload, SynAckPayload,
    SynPayload, FLAG_LAST_PACKET, FLAG_RETRANSMIT,
};
use crate::session::{Phase, SessionState};
use crate::transport::DataPlane;
use crate::window::SlidingWindow;

/// SYN 재전송 간격 (밀리초)
const SYN_RESEND_MS: u64 = 500;

/// 패킷 송신 간 페이싱 (마이크로초)
const SEND_PACING_US: u64 = 100;

/// 재전송 페이싱 (마이크로초, 긴급이면 생략)
const RETRANSMIT_PACING_US: u64 = 10;

/// 재전송 배치 크기
const RETRANSMIT_BATCH: usize = 10;

/// 감시자 주기 (초)
const WATCHDOG_INTERVAL_SECS: u64 = 5;

/// 진행 정지 판정 (밀리초)
const STALL_TIMEOUT_MS: u64 = 30_000;

/// 송신 세션
pub struct Sender {
    state: Arc<SessionState>,
    running: Arc<AtomicBool>,
    control: Arc<ControlChannel>,
    data_plane: Arc<DataPlane>,
    retransmit_notify: Arc<Notify>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Sender {
    /// 송신 세션 시작
    ///
    /// 핸드쉐이크까지 마친 뒤 전송 태스크들을 띄우고 핸들을 반환한다.
    pub async fn start(config: SessionConfig, file_path: &Path) -> Result<Self> {
        config.validate()?;

        let state = Arc::new(SessionState::new());
        state.advance(Phase::Handshake);

        let remote_ip: IpAddr = config
            .remote_host
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("잘못된 주소: {}", config.remote_host)))?;
        let remote_ctrl = SocketAddr::new(remote_ip, config.control_port);

        let chunker = Arc::new(ChunkManager::init_for_send(
            file_path,
            config.chunk_size_bytes(),
            config.packet_size,
        )?);
        let total_chunks = chunker.total_chunks();
        state.set_total_chunks(total_chunks);

        let filename = file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        // 송신측 컨트롤 소켓은 임시 포트
        let control = Arc::new(ControlChannel::bind(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0).await?);

        info!(
            "송신 시작: {} ({} bytes, {} chunks) → {}",
            filename,
            chunker.file_size(),
            total_chunks,
            remote_ctrl
        );

        if let Err(e) =
            perform_handshake(&config, &control, remote_ctrl, &chunker, &filename, &state).await
        {
            state.fail(e.to_string());
            return Err(e);
        }

        let envelope = if config.enable_encryption {
            Some(Arc::new(SecureEnvelope::new(
                &config.encryption_key,
                derive_session_id(&config.encryption_key, &filename, chunker.file_size()),
            )))
        } else {
            None
        };

        let data_plane = Arc::new(
            DataPlane::bind(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                config.local_data_port,
                config.data_sockets,
                envelope,
            )
            .await?,
        );
        data_plane.set_remote(remote_ip, config.remote_data_port);

        state.advance(Phase::Transfer);
        state.touch_progress();

        let sender = Self {
            state: state.clone(),
            running: Arc::new(AtomicBool::new(true)),
            control: control.clone(),
            data_plane: data_plane.clone(),
            retransmit_notify: Arc::new(Notify::new()),
            tasks: Mutex::new(Vec::new()),
        };

        let window = Arc::new(SlidingWindow::new(config.window_size as usize, total_chunks));
        let urgent_chunks = Arc::new(DashSet::new());

        sender.spawn_tasks(&config, chunker, window, urgent_chunks, remote_ctrl);

        Ok(sender)
    }

    fn spawn_tasks(
        &self,
        config: &SessionConfig,
        chunker: Arc<ChunkManager>,
        window: Arc<SlidingWindow>,
        urgent_chunks: Arc<DashSet<u32>>,
        remote_ctrl: SocketAddr,
    ) {
        let mut tasks = self.tasks.lock();

        // 컨트롤 이벤트 루프
        let (event_tx, event_rx) = mpsc::channel::<ControlEvent>(1000);
        self.control.start_events(event_tx);
        tasks.push(tokio::spawn(control_loop(
            event_rx,
            self.state.clone(),
            window.clone(),
            urgent_chunks.clone(),
            self.retransmit_notify.clone(),
        )));

        // 워커들
        for worker_id in 0..config.worker_threads {
            tasks.push(tokio::spawn(worker_loop(
                worker_id,
                self.running.clone(),
                self.state.clone(),
                chunker.clone(),
                window.clone(),
                self.control.clone(),
                self.data_plane.clone(),
                self.retransmit_notify.clone(),
                remote_ctrl,
            )));
        }

        // 재전송 워커
        tasks.push(tokio::spawn(retransmit_loop(
            self.running.clone(),
            self.state.clone(),
            chunker.clone(),
            window.clone(),
            urgent_chunks.clone(),
            self.data_plane.clone(),
            self.retransmit_notify.clone(),
        )));

        // 데드락 감시자
        tasks.push(tokio::spawn(watchdog_loop(
            self.running.clone(),
            self.state.clone(),
            window.clone(),
            urgent_chunks,
            self.control.clone(),
            remote_ctrl,
            config.chunk_timeout_ms,
            config.max_retries,
        )));

        // 완료 감시
        tasks.push(tokio::spawn(completion_loop(
            self.running.clone(),
            self.state.clone(),
            chunker,
            window,
            self.control.clone(),
            remote_ctrl,
        )));
    }

    /// 세션 종료(COMPLETED/ERROR)까지 대기
    pub async fn wait_for_completion(&self) -> Result<()> {
        match self.state.wait_until_terminal().await {
            Phase::Completed => Ok(()),
            _ => Err(Error::Session(
                self.state.error().unwrap_or_else(|| "unknown".into()),
            )),
        }
    }

    /// 진행 스냅샷
    pub fn snapshot(&self) -> crate::session::ProgressSnapshot {
        self.state.snapshot()
    }

    /// 정지: 플래그 내리고 태스크 조인, 소켓 정리
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.retransmit_notify.notify_waiters();

        self.control.shutdown().await;
        self.data_plane.shutdown().await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

/// SYN 송신 → SYN_ACK 대기. 타임아웃까지 500ms 간격으로 SYN 재전송.
async fn perform_handshake(
    config: &SessionConfig,
    control: &ControlChannel,
    remote_ctrl: SocketAddr,
    chunker: &ChunkManager,
    filename: &str,
    state: &SessionState,
) -> Result<()> {
    let syn = SynPayload {
        file_size: chunker.file_size(),
        chunk_size: chunker.chunk_size() as u32,
        total_chunks: chunker.total_chunks(),
        filename: filename.to_string(),
    }
    .to_bytes();

    let deadline = Instant::now() + Duration::from_millis(config.handshake_timeout_ms);
    let mut last_syn: Option<Instant> = None;

    loop {
        if Instant::now() >= deadline {
            return Err(Error::HandshakeTimeout(config.handshake_timeout_ms));
        }

        let resend_due = last_syn
            .map(|t| t.elapsed().as_millis() >= SYN_RESEND_MS as u128)
            .unwrap_or(true);
        if resend_due {
            control.send(remote_ctrl, ControlType::Syn, 0, &syn).await?;
            last_syn = Some(Instant::now());
        }

        if let Some(event) = control.recv_timeout(Duration::from_millis(100)).await? {
            if event.header.ctype == ControlType::SynAck {
                let ack = SynAckPayload::from_bytes(&event.payload)?;

                if !ack.accept {
                    return Err(Error::HandshakeRejected(ack.reason));
                }

                debug!(
                    "SYN_ACK 수신: available_space={}, max_chunk_size={}",
                    ack.available_space, ack.max_chunk_size
                );
                state.touch_progress();
                return Ok(());
            }
        }
    }
}

/// 컨트롤 이벤트 처리 (확인 / NACK / 재시도 / heartbeat)
async fn control_loop(
    mut event_rx: mpsc::Receiver<ControlEvent>,
    state: Arc<SessionState>,
    window: Arc<SlidingWindow>,
    urgent_chunks: Arc<DashSet<u32>>,
    retransmit_notify: Arc<Notify>,
) {
    while let Some(event) = event_rx.recv().await {
        match event.header.ctype {
            ControlType::ChunkConfirm => {
                window.force_complete(event.header.chunk_id);
                state.set_completed_chunks(window.completed());
                state.touch_progress();
            }

            ControlType::ChunkNack | ControlType::ChunkRetry => {
                if let Ok(nack) = ChunkNackPayload::from_bytes(&event.payload) {
                    debug!(
                        "재전송 요청: chunk={}, missing={}",
                        event.header.chunk_id,
                        nack.missing_packets.len()
                    );
                    window.mark_for_retransmit(event.header.chunk_id, &nack.missing_packets);
                    urgent_chunks.insert(event.header.chunk_id);
                    retransmit_notify.notify_one();
                }
            }

            ControlType::Heartbeat => {
                state.touch_progress();
            }

            ControlType::Error => {
                let reason = String::from_utf8_lossy(&event.payload).into_owned();
                warn!("상대측 에러 통지: {}", reason);
                state.fail(reason);
            }

            _ => {}
        }
    }
}

/// 워커 루프: 슬롯 획득 → 청크 송신
#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    worker_id: u32,
    running: Arc<AtomicBool>,
    state: Arc<SessionState>,
    chunker: Arc<ChunkManager>,
    window: Arc<SlidingWindow>,
    control: Arc<ControlChannel>,
    data_plane: Arc<DataPlane>,
    retransmit_notify: Arc<Notify>,
    remote_ctrl: SocketAddr,
) {
    while running.load(Ordering::SeqCst) {
        match window.try_acquire_slot() {
            Some(chunk_id) => {
                if let Err(e) = send_chunk(
                    chunk_id,
                    &running,
                    &state,
                    &chunker,
                    &control,
                    &data_plane,
                    remote_ctrl,
                )
                .await
                {
                    warn!("워커 {}: 청크 {} 송신 실패: {}", worker_id, chunk_id, e);
                }
            }
            None => {
                if window.is_exhausted() {
                    debug!("워커 {} 종료: 청크 소진", worker_id);
                    break;
                }

                // 윈도우 포화: 재전송 워커를 깨우고 잠시 대기
                retransmit_notify.notify_one();
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

/// 청크 하나 송신: CHUNK_META 후 전 패킷 순서대로
async fn send_chunk(
    chunk_id: u32,
    running: &AtomicBool,
    state: &SessionState,
    chunker: &ChunkManager,
    control: &ControlChannel,
    data_plane: &DataPlane,
    remote_ctrl: SocketAddr,
) -> Result<()> {
    let desc = chunker
        .descriptor(chunk_id)
        .ok_or(Error::InvalidChunkId(chunk_id))?;

    let meta = ChunkMetaPayload {
        hash: desc.hash,
        packet_count: desc.packet_count,
    };
    control
        .send(remote_ctrl, ControlType::ChunkMeta, chunk_id, &meta.to_bytes())
        .await?;

    for seq in 0..desc.packet_count {
        if !running.load(Ordering::SeqCst) {
            break;
        }

        let (data, offset, last) = chunker
            .packet_payload(chunk_id, seq)
            .ok_or(Error::InvalidChunkId(chunk_id))?;
        let len = data.len() as u64;

        let flags = if last { FLAG_LAST_PACKET } else { 0 };
        let packet = DataPacket::new(chunk_id, seq, offset, data, flags);
        data_plane.send_packet(&packet).await?;

        state.add_bytes_transferred(len);

        // 거친 페이싱
        tokio::time::sleep(Duration::from_micros(SEND_PACING_US)).await;
    }

    Ok(())
}

/// 재전송 워커: 윈도우에서 후보를 인출해 배치 단위로 재송신
async fn retransmit_loop(
    running: Arc<AtomicBool>,
    state: Arc<SessionState>,
    chunker: Arc<ChunkManager>,
    window: Arc<SlidingWindow>,
    urgent_chunks: Arc<DashSet<u32>>,
    data_plane: Arc<DataPlane>,
    retransmit_notify: Arc<Notify>,
) {
    while running.load(Ordering::SeqCst) {
        tokio::select! {
            _ = retransmit_notify.notified() => {}
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }

        for (chunk_id, seqs) in window.take_retransmit_candidates() {
            let urgent = urgent_chunks.remove(&chunk_id).is_some();

            for batch in seqs.chunks(RETRANSMIT_BATCH) {
                for &seq in batch {
                    if !running.load(Ordering::SeqCst) {
                        return;
                    }

                    let Some((data, offset, last)) = chunker.packet_payload(chunk_id, seq) else {
                        continue;
                    };
                    let len = data.len() as u64;

                    let mut flags = FLAG_RETRANSMIT;
                    if last {
                        flags |= FLAG_LAST_PACKET;
                    }

                    let packet = DataPacket::new(chunk_id, seq, offset, data, flags);
                    if let Err(e) = data_plane.send_packet(&packet).await {
                        warn!("재전송 실패: chunk={} seq={}: {}", chunk_id, seq, e);
                        continue;
                    }

                    state.add_bytes_transferred(len);

                    if !urgent {
                        tokio::time::sleep(Duration::from_micros(RETRANSMIT_PACING_US)).await;
                    }
                }
            }

            window.touch(chunk_id);
            state.increment_retry();
        }
    }
}

/// 데드락 감시자: 진행 정지 시 복구 시도
#[allow(clippy::too_many_arguments)]
async fn watchdog_loop(
    running: Arc<AtomicBool>,
    state: Arc<SessionState>,
    window: Arc<SlidingWindow>,
    urgent_chunks: Arc<DashSet<u32>>,
    control: Arc<ControlChannel>,
    remote_ctrl: SocketAddr,
    chunk_timeout_ms: u64,
    max_retries: u32,
) {
    let mut stall_cycles = 0u32;

    'outer: while running.load(Ordering::SeqCst) {
        for _ in 0..WATCHDOG_INTERVAL_SECS {
            if !running.load(Ordering::SeqCst) || state.phase().is_terminal() {
                break 'outer;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        if state.millis_since_progress() <= STALL_TIMEOUT_MS {
            stall_cycles = 0;
            continue;
        }

        stall_cycles += 1;
        warn!("진행 정지 감지 (cycle {}), 복구 시도", stall_cycles);

        if stall_cycles > max_retries {
            state.fail(Error::PeerStalled(state.millis_since_progress()).to_string());
            break;
        }

        // 타임아웃 슬롯 강제 해제 (정확성보다 생존성)
        for chunk_id in window.check_timeouts(Duration::from_millis(chunk_timeout_ms)) {
            warn!("데드락 복구: 청크 {} 강제 완료", chunk_id);
            window.force_complete(chunk_id);
            state.increment_retry();
        }

        window.clear_retransmits();
        urgent_chunks.clear();

        let _ = control
            .send(remote_ctrl, ControlType::Heartbeat, 0, &[])
            .await;
        state.touch_progress();
    }
}

/// 완료 감시: 전 청크 확인 시 FILE_DONE 송신 후 COMPLETED
async fn completion_loop(
    running: Arc<AtomicBool>,
    state: Arc<SessionState>,
    chunker: Arc<ChunkManager>,
    window: Arc<SlidingWindow>,
    control: Arc<ControlChannel>,
    remote_ctrl: SocketAddr,
) {
    while running.load(Ordering::SeqCst) {
        if state.phase().is_terminal() {
            return;
        }

        state.set_completed_chunks(window.completed());

        if window.is_exhausted() && window.is_all_completed() {
            let done = FileDonePayload {
                file_hash: chunker.file_hash(),
            };

            // UDP라 유실 대비 몇 번 반복
            for _ in 0..3 {
                let _ = control
                    .send(remote_ctrl, ControlType::FileDone, 0, &done.to_bytes())
                    .await;
                tokio::time::sleep(Duration::from_millis(200)).await;
            }

            info!("전 청크 확인 완료, FILE_DONE 송신");
            state.advance(Phase::Completed);
            return;
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
