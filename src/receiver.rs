//! 수신 엔진
//!
//! - 핸드쉐이크: SYN 대기 → 디스크 게이트 → SYN_ACK
//! - 패킷 적재: 데이터 플레인 → 청크 관리자
//! - 주동 NACK 모니터 (20Hz)
//! - 청크별 검증 (CHUNK_CONFIRM / CHUNK_RETRY)
//! - 최종 커밋: 파일 해시 대조 후 `<이름>.tmp` → `<이름>` 원자 개명
//!
//! 청크 상태를 건드리는 처리 전부를 단일 태스크가 커맨드 채널로 소비한다.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chunk::ChunkManager;
use crate::config::SessionConfig;
use crate::control::{ControlChannel, ControlEvent};
use crate::crypto::{derive_session_id, SecureEnvelope};
use crate::error::{Error, Result};
use crate::platform;
use crate::protocol::{
    ChunkMetaPayload, ChunkNackPayload, ControlType, DataPacket, FileDonePayload, SynAckPayload,
    SynPayload,
};
use crate::session::{Phase, SessionState};
use crate::transport::DataPlane;

/// NACK 모니터 주기 (밀리초, 20Hz)
const NACK_MONITOR_MS: u64 = 50;

/// 여유 공간 요구 배율
const SPACE_MARGIN: f64 = 1.2;

/// 최소 여유 공간 (바이트)
const MIN_FREE_SPACE: u64 = 100 * 1024 * 1024;

/// 할당 테스트 크기 (바이트)
const ALLOC_TEST_SIZE: u64 = 10 * 1024 * 1024;

/// 내부 커맨드
enum ReceiverCmd {
    Data(DataPacket),
    Control(ControlEvent),
    SendNacks,
    Stop,
}

/// 수신 세션
pub struct Receiver {
    state: Arc<SessionState>,
    running: Arc<AtomicBool>,
    control: Arc<ControlChannel>,
    data_plane: Arc<DataPlane>,
    cmd_tx: mpsc::Sender<ReceiverCmd>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Receiver {
    /// 수신 세션 시작
    ///
    /// SYN이 올 때까지 기다려 핸드쉐이크를 마치고, 임시 파일을 만들고,
    /// 적재 태스크들을 띄운 뒤 핸들을 반환한다. 거부 시 에러.
    pub async fn start(config: SessionConfig, output_path: &Path) -> Result<Self> {
        config.validate()?;

        let state = Arc::new(SessionState::new());
        state.advance(Phase::Handshake);

        let control = Arc::new(
            ControlChannel::bind(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.control_port).await?,
        );

        info!(
            "수신 대기: 컨트롤 포트 {}, 출력 {:?}",
            control.local_port(),
            output_path
        );

        let (syn, sender_ctrl, available_space) =
            match perform_handshake(&config, &control, output_path).await {
                Ok(v) => v,
                Err(e) => {
                    state.fail(e.to_string());
                    return Err(e);
                }
            };

        let tmp_path = tmp_path_for(output_path);
        let chunker = Arc::new(ChunkManager::init_for_receive(
            &tmp_path,
            syn.file_size,
            syn.total_chunks,
            syn.chunk_size as u64,
            config.packet_size,
        )?);
        state.set_total_chunks(syn.total_chunks);

        let envelope = if config.enable_encryption {
            Some(Arc::new(SecureEnvelope::new(
                &config.encryption_key,
                derive_session_id(&config.encryption_key, &syn.filename, syn.file_size),
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

        // 데이터 소켓이 준비된 다음에야 수락을 알린다
        // (첫 패킷이 바인드 전에 도착해 사라지는 일 방지)
        let syn_ack_bytes = SynAckPayload {
            available_space,
            max_chunk_size: syn.chunk_size,
            accept: true,
            reason: String::new(),
        }
        .to_bytes();
        control
            .send(sender_ctrl, ControlType::SynAck, 0, &syn_ack_bytes)
            .await?;

        state.advance(Phase::Transfer);
        state.touch_progress();

        let running = Arc::new(AtomicBool::new(true));
        let (cmd_tx, cmd_rx) = mpsc::channel::<ReceiverCmd>(10_000);
        let mut tasks = Vec::new();

        // 데이터 플레인 → 커맨드 채널
        let (data_tx, mut data_rx) = mpsc::channel::<DataPacket>(10_000);
        data_plane.start(data_tx);
        {
            let cmd_tx = cmd_tx.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(packet) = data_rx.recv().await {
                    if cmd_tx.send(ReceiverCmd::Data(packet)).await.is_err() {
                        break;
                    }
                }
            }));
        }

        // 컨트롤 이벤트 → 커맨드 채널
        let (event_tx, mut event_rx) = mpsc::channel::<ControlEvent>(1000);
        control.start_events(event_tx);
        {
            let cmd_tx = cmd_tx.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(event) = event_rx.recv().await {
                    if cmd_tx.send(ReceiverCmd::Control(event)).await.is_err() {
                        break;
                    }
                }
            }));
        }

        // NACK 타이머 (20Hz)
        {
            let cmd_tx = cmd_tx.clone();
            let running = running.clone();
            tasks.push(tokio::spawn(async move {
                while running.load(Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_millis(NACK_MONITOR_MS)).await;
                    if cmd_tx.send(ReceiverCmd::SendNacks).await.is_err() {
                        break;
                    }
                }
            }));
        }

        // 메인 처리 태스크
        {
            let processor = Processor {
                state: state.clone(),
                chunker,
                control: control.clone(),
                sender_ctrl,
                syn_ack_bytes,
                tmp_path,
                final_path: output_path.to_path_buf(),
                confirmed: HashSet::new(),
                pending_file_hash: None,
                committed: false,
            };
            tasks.push(tokio::spawn(processor.run(cmd_rx)));
        }

        Ok(Self {
            state,
            running,
            control,
            data_plane,
            cmd_tx,
            tasks: Mutex::new(tasks),
        })
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

    /// 정지: 플래그 내리고 태스크 조인, 소켓·매핑 정리
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.cmd_tx.send(ReceiverCmd::Stop).await;

        self.control.shutdown().await;
        self.data_plane.shutdown().await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

/// SYN 대기 → 디스크 게이트
///
/// 수락이면 (SYN, 송신측 주소, 여유 공간)을 반환하고 SYN_ACK는 호출측이
/// 데이터 플레인 준비 후 보낸다. 거부면 즉시 거부 SYN_ACK를 보내고 에러.
async fn perform_handshake(
    config: &SessionConfig,
    control: &ControlChannel,
    output_path: &Path,
) -> Result<(SynPayload, SocketAddr, u64)> {
    let deadline = Instant::now() + Duration::from_millis(config.handshake_timeout_ms);

    loop {
        if Instant::now() >= deadline {
            return Err(Error::HandshakeTimeout(config.handshake_timeout_ms));
        }

        let Some(event) = control.recv_timeout(Duration::from_millis(100)).await? else {
            continue;
        };

        if event.header.ctype != ControlType::Syn {
            continue;
        }

        let syn = SynPayload::from_bytes(&event.payload)?;
        info!(
            "SYN 수신: {} ({} bytes, {} chunks) from {}",
            syn.filename, syn.file_size, syn.total_chunks, event.from
        );

        let (available_space, accept, reason) = disk_gate(output_path, syn.file_size);

        if !accept {
            let nack = SynAckPayload {
                available_space,
                max_chunk_size: syn.chunk_size,
                accept: false,
                reason: reason.clone(),
            };
            control
                .send(event.from, ControlType::SynAck, 0, &nack.to_bytes())
                .await?;
            return Err(Error::HandshakeRejected(reason));
        }

        return Ok((syn, event.from, available_space));
    }
}

/// 디스크 공간 게이트
///
/// (여유 공간, 수락 여부, 거부 사유) 반환. 여유는 1.2배 마진과
/// 100MiB 하한을 요구하고, 임시 디렉터리에 10MiB 할당 테스트를 한다.
fn disk_gate(output_path: &Path, file_size: u64) -> (u64, bool, String) {
    let dir = output_path.parent().filter(|p| !p.as_os_str().is_empty());
    let free = platform::free_disk_space(dir.unwrap_or(Path::new("."))).unwrap_or(0);

    if (free as f64) < file_size as f64 * SPACE_MARGIN {
        return (
            free,
            false,
            format!(
                "Insufficient disk space. Required: {} (with overhead), Available: {}",
                platform::format_bytes(file_size),
                platform::format_bytes(free)
            ),
        );
    }

    if free < MIN_FREE_SPACE {
        return (
            free,
            false,
            format!(
                "Low disk space. Available: {} (less than 100MB)",
                platform::format_bytes(free)
            ),
        );
    }

    if !platform::can_allocate(&platform::temp_directory(), ALLOC_TEST_SIZE) {
        return (
            free,
            false,
            "Cannot allocate test file. Disk may be read-only or full.".to_string(),
        );
    }

    (free, true, String::new())
}

fn tmp_path_for(output_path: &Path) -> PathBuf {
    let mut name = output_path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// 메인 처리 태스크 상태 (단일 태스크에서만 접근)
struct Processor {
    state: Arc<SessionState>,
    chunker: Arc<ChunkManager>,
    control: Arc<ControlChannel>,
    sender_ctrl: SocketAddr,
    syn_ack_bytes: Vec<u8>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    confirmed: HashSet<u32>,
    pending_file_hash: Option<[u8; 32]>,
    committed: bool,
}

impl Processor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<ReceiverCmd>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                ReceiverCmd::Data(packet) => self.handle_data(packet).await,
                ReceiverCmd::Control(event) => self.handle_control(event).await,
                ReceiverCmd::SendNacks => self.send_nacks().await,
                ReceiverCmd::Stop => break,
            }

            if self.state.phase() == Phase::Error {
                break;
            }
        }
    }

    async fn handle_data(&mut self, packet: DataPacket) {
        let chunk_id = packet.header.chunk_id;

        let written = match self.chunker.process_received_packet(
            chunk_id,
            packet.header.seq,
            packet.header.offset,
            &packet.data,
        ) {
            Ok(n) => n,
            Err(e) => {
                debug!("패킷 거부: chunk={} seq={}: {}", chunk_id, packet.header.seq, e);
                return;
            }
        };

        if written == 0 {
            return;
        }

        self.state.add_bytes_transferred(written as u64);
        self.state
            .set_completed_chunks(self.chunker.completed_chunks());

        if self.chunker.is_chunk_complete(chunk_id) {
            self.verify_and_report(chunk_id).await;
        }

        self.try_finalize().await;
    }

    async fn handle_control(&mut self, event: ControlEvent) {
        match event.header.ctype {
            ControlType::ChunkMeta => {
                if let Ok(meta) = ChunkMetaPayload::from_bytes(&event.payload) {
                    match self
                        .chunker
                        .set_expected_hash(event.header.chunk_id, meta.hash)
                    {
                        Ok(true) => self.verify_and_report(event.header.chunk_id).await,
                        Ok(false) => {}
                        Err(e) => debug!("CHUNK_META 무시: {}", e),
                    }
                }
            }

            // 송신측이 SYN_ACK를 놓치고 SYN을 재전송한 경우
            ControlType::Syn => {
                let _ = self
                    .control
                    .send(event.from, ControlType::SynAck, 0, &self.syn_ack_bytes)
                    .await;
            }

            ControlType::FileDone => {
                if let Ok(done) = FileDonePayload::from_bytes(&event.payload) {
                    self.pending_file_hash = Some(done.file_hash);
                    self.try_finalize().await;
                }
            }

            ControlType::Heartbeat => {
                self.state.touch_progress();
            }

            ControlType::Error => {
                let reason = String::from_utf8_lossy(&event.payload).into_owned();
                warn!("상대측 에러 통지: {}", reason);
                self.state.fail(reason);
            }

            _ => {}
        }
    }

    /// 완성된 청크 검증: 확인 또는 전체 재전송 요청
    async fn verify_and_report(&mut self, chunk_id: u32) {
        if self.confirmed.contains(&chunk_id) || !self.chunker.hash_known(chunk_id) {
            return;
        }

        match self.chunker.verify_chunk(chunk_id) {
            Ok(true) => {
                self.confirmed.insert(chunk_id);
                let _ = self
                    .control
                    .send(self.sender_ctrl, ControlType::ChunkConfirm, chunk_id, &[])
                    .await;
            }
            Ok(false) => {
                warn!("청크 {} 해시 불일치, 전체 재수신", chunk_id);

                let seqs = match self.chunker.reset_chunk(chunk_id) {
                    Ok(seqs) => seqs,
                    Err(e) => {
                        debug!("청크 리셋 실패: {}", e);
                        return;
                    }
                };
                self.state
                    .set_completed_chunks(self.chunker.completed_chunks());
                self.state.increment_retry();

                let retry = ChunkNackPayload {
                    missing_packets: seqs,
                };
                let _ = self
                    .control
                    .send(
                        self.sender_ctrl,
                        ControlType::ChunkRetry,
                        chunk_id,
                        &retry.to_bytes(),
                    )
                    .await;
            }
            Err(e) => debug!("청크 검증 실패: {}", e),
        }
    }

    /// 주동 NACK 송신
    async fn send_nacks(&mut self) {
        if self.state.phase().is_terminal() {
            return;
        }

        for nack in self.chunker.proactive_nacks() {
            debug!(
                "NACK 송신: chunk={}, missing={}, urgent={}",
                nack.chunk_id,
                nack.missing_packets.len(),
                nack.urgent
            );

            let payload = ChunkNackPayload {
                missing_packets: nack.missing_packets,
            };
            let _ = self
                .control
                .send(
                    self.sender_ctrl,
                    ControlType::ChunkNack,
                    nack.chunk_id,
                    &payload.to_bytes(),
                )
                .await;

            self.state.increment_retry();
        }
    }

    /// 전 청크 완성 + FILE_DONE 수신이면 파일 해시 대조 후 커밋
    ///
    /// 파일 해시는 모든 비트가 선 다음에만 계산한다. 송신측 주장은
    /// 트리거일 뿐 신뢰하지 않는다.
    async fn try_finalize(&mut self) {
        if self.committed || !self.chunker.is_complete() {
            return;
        }

        self.state.advance(Phase::Verification);

        let Some(expected) = self.pending_file_hash else {
            return;
        };

        let actual = self.chunker.file_hash();
        if actual != expected {
            warn!("파일 해시 불일치, 임시 파일 제거");
            let _ = std::fs::remove_file(&self.tmp_path);
            self.state.fail(Error::FileHashMismatch.to_string());
            return;
        }

        if let Err(e) = self.chunker.sync() {
            self.state.fail(format!("동기화 실패: {}", e));
            return;
        }

        if let Err(e) = commit_file(&self.tmp_path, &self.final_path) {
            self.state.fail(format!("커밋 실패: {}", e));
            return;
        }

        info!("수신 완료: {:?}", self.final_path);
        self.committed = true;
        self.state.advance(Phase::Completed);
    }
}

/// 임시 파일을 최종 이름으로 커밋
///
/// rename이 실패하면 (다른 파일시스템 등) 복사 후 삭제로 폴백
fn commit_file(tmp: &Path, final_path: &Path) -> Result<()> {
    match std::fs::rename(tmp, final_path) {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!("rename 실패 ({}), 복사 폴백", e);
            std::fs::copy(tmp, final_path)?;
            std::fs::remove_file(tmp)?;
            Ok(())
        }
    }
}
