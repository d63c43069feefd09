//! 청크 관리자
//!
//! - 파일을 고정 크기 청크로, 청크를 고정 크기 패킷으로 분해
//! - 메모리 맵 기반 읽기(송신) / 쓰기(수신)
//! - 청크별 SHA-256 계산·검증
//! - 패킷 비트셋 + 갭 감지로 주동 NACK 후보 생성
//!
//! 청크 상태와 매핑은 전부 내부 뮤텍스 뒤에 있다. 청크끼리는 서로 겹치지
//! 않는 바이트 범위를 소유하므로 맵 쓰기에 별도 구간 동기화는 필요 없다.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use bytes::Bytes;
use memmap2::{Mmap, MmapMut};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Error, Result};

/// 일반 NACK 임계값 (시퀀스 점프)
const NACK_THRESHOLD_NORMAL: u32 = 3;

/// 긴급 NACK 임계값 (시퀀스 점프)
const NACK_THRESHOLD_URGENT: u32 = 10;

/// 청크당 NACK 쿨다운 (밀리초)
const NACK_COOLDOWN_MS: u64 = 100;

/// NACK 1회당 최대 패킷 수
const MAX_PACKETS_PER_NACK: usize = 50;

/// 청크 하나의 상태
#[derive(Debug)]
struct Chunk {
    id: u32,
    offset: u64,
    size: u64,

    /// 패킷별 수신 여부
    packet_received: Vec<bool>,

    /// SHA-256 (송신: init 시 계산, 수신: CHUNK_META로 수신)
    hash: [u8; 32],
    hash_known: bool,

    completed: bool,
    verified: bool,

    // 갭 감지용 필드
    next_expected_seq: u32,
    pending_nacks: Vec<u32>,
    last_nack_time: Option<Instant>,
    nack_count: u32,
    urgent_nack: bool,
}

impl Chunk {
    fn new(id: u32, offset: u64, size: u64, packet_count: u32, received: bool) -> Self {
        Self {
            id,
            offset,
            size,
            packet_received: vec![received; packet_count as usize],
            hash: [0u8; 32],
            hash_known: false,
            completed: received,
            verified: false,
            next_expected_seq: 0,
            pending_nacks: Vec::new(),
            last_nack_time: None,
            nack_count: 0,
            urgent_nack: false,
        }
    }
}

/// 청크 디스크립터 (외부 공개용 스냅샷)
#[derive(Debug, Clone, Copy)]
pub struct ChunkDescriptor {
    pub id: u32,
    pub offset: u64,
    pub size: u64,
    pub packet_count: u32,
    pub hash: [u8; 32],
}

/// 주동 NACK 정보
#[derive(Debug, Clone)]
pub struct NackInfo {
    pub chunk_id: u32,
    pub missing_packets: Vec<u32>,
    pub urgent: bool,
}

enum Backing {
    /// 송신측: 읽기 전용 매핑 (빈 파일이면 None)
    Send(Option<Mmap>),
    /// 수신측: 읽기·쓰기 매핑
    Recv(Option<MmapMut>),
}

impl Backing {
    fn bytes(&self) -> &[u8] {
        match self {
            Backing::Send(Some(m)) => m,
            Backing::Recv(Some(m)) => m,
            _ => &[],
        }
    }
}

struct Inner {
    chunks: Vec<Chunk>,
    backing: Backing,
}

/// 청크 관리자
///
/// 파일 매핑의 소유자. 다른 컴포넌트는 바이트 범위 뷰만 요청한다.
pub struct ChunkManager {
    path: PathBuf,
    chunk_size: u64,
    packet_size: u32,
    total_file_size: u64,
    inner: Mutex<Inner>,
    next_chunk_to_send: AtomicU32,
    completed_chunks: AtomicU32,
}

impl ChunkManager {
    /// 송신용 초기화
    ///
    /// 파일을 읽기 전용으로 매핑하고 청크마다 매핑 범위에서 직접 SHA-256을
    /// 계산한다. 송신측 비트셋은 전부 수신됨으로 표시한다.
    pub fn init_for_send(path: &Path, chunk_size: u64, packet_size: u32) -> Result<Self> {
        let file = File::open(path)?;
        let total_file_size = file.metadata()?.len();

        let mmap = if total_file_size > 0 {
            // SAFETY: 파일은 세션 동안 외부에서 수정되지 않는다는 전제
            Some(unsafe { Mmap::map(&file)? })
        } else {
            None
        };

        let mut chunks = Vec::new();
        let total_chunks = total_file_size.div_ceil(chunk_size) as u32;

        for id in 0..total_chunks {
            let offset = id as u64 * chunk_size;
            let size = chunk_size.min(total_file_size - offset);
            let packet_count = size.div_ceil(packet_size as u64) as u32;

            let mut chunk = Chunk::new(id, offset, size, packet_count, true);

            let data = &mmap.as_ref().unwrap()[offset as usize..(offset + size) as usize];
            chunk.hash = sha256(data);
            chunk.hash_known = true;

            chunks.push(chunk);
        }

        debug!(
            "송신 초기화: {:?}, {} bytes, {} chunks",
            path, total_file_size, total_chunks
        );

        Ok(Self {
            path: path.to_path_buf(),
            chunk_size,
            packet_size,
            total_file_size,
            inner: Mutex::new(Inner {
                chunks,
                backing: Backing::Send(mmap),
            }),
            next_chunk_to_send: AtomicU32::new(0),
            completed_chunks: AtomicU32::new(total_chunks),
        })
    }

    /// 수신용 초기화
    ///
    /// 선언된 크기의 희소 파일을 만들어 읽기·쓰기로 매핑한다.
    /// 비트셋은 전부 미수신으로 시작한다.
    pub fn init_for_receive(
        path: &Path,
        file_size: u64,
        total_chunks: u32,
        chunk_size: u64,
        packet_size: u32,
    ) -> Result<Self> {
        let expected_chunks = file_size.div_ceil(chunk_size) as u32;
        if expected_chunks != total_chunks {
            return Err(Error::InvalidConfig(format!(
                "청크 수 불일치: declared {}, implied {}",
                total_chunks, expected_chunks
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(file_size)?;

        let mmap = if file_size > 0 {
            // SAFETY: 임시 파일은 이 세션만 접근한다
            Some(unsafe { MmapMut::map_mut(&file)? })
        } else {
            None
        };

        let mut chunks = Vec::with_capacity(total_chunks as usize);
        for id in 0..total_chunks {
            let offset = id as u64 * chunk_size;
            let size = chunk_size.min(file_size - offset);
            let packet_count = size.div_ceil(packet_size as u64) as u32;
            chunks.push(Chunk::new(id, offset, size, packet_count, false));
        }

        debug!(
            "수신 초기화: {:?}, {} bytes, {} chunks",
            path, file_size, total_chunks
        );

        Ok(Self {
            path: path.to_path_buf(),
            chunk_size,
            packet_size,
            total_file_size: file_size,
            inner: Mutex::new(Inner {
                chunks,
                backing: Backing::Recv(mmap),
            }),
            next_chunk_to_send: AtomicU32::new(0),
            completed_chunks: AtomicU32::new(0),
        })
    }

    /// 다음 미발송 청크 ID (단조 증가 반복자)
    pub fn next_chunk_to_send(&self) -> Option<u32> {
        let total = self.total_chunks();
        let id = self.next_chunk_to_send.fetch_add(1, Ordering::SeqCst);
        if id < total {
            Some(id)
        } else {
            None
        }
    }

    /// 청크 디스크립터 조회
    pub fn descriptor(&self, chunk_id: u32) -> Option<ChunkDescriptor> {
        let inner = self.inner.lock();
        inner.chunks.get(chunk_id as usize).map(|c| ChunkDescriptor {
            id: c.id,
            offset: c.offset,
            size: c.size,
            packet_count: c.packet_received.len() as u32,
            hash: c.hash,
        })
    }

    /// 패킷 페이로드 뷰 (송신측)
    ///
    /// (페이로드, 파일 내 절대 오프셋, 청크 마지막 패킷 여부) 반환
    pub fn packet_payload(&self, chunk_id: u32, seq: u32) -> Option<(Bytes, u64, bool)> {
        let inner = self.inner.lock();
        let chunk = inner.chunks.get(chunk_id as usize)?;

        let packet_count = chunk.packet_received.len() as u32;
        if seq >= packet_count {
            return None;
        }

        let packet_offset = seq as u64 * self.packet_size as u64;
        let len = (self.packet_size as u64).min(chunk.size - packet_offset);
        let abs_offset = chunk.offset + packet_offset;

        let data = Bytes::copy_from_slice(
            &inner.backing.bytes()[abs_offset as usize..(abs_offset + len) as usize],
        );

        Some((data, abs_offset, seq == packet_count - 1))
    }

    /// 수신 패킷 처리
    ///
    /// 범위를 벗어나는 패킷은 거부한다. 처음 수신한 비트면 갭 감지를
    /// 수행하고, 비트셋이 가득 차면 청크를 완료로 표시한다.
    /// 새로 기록된 바이트 수를 반환한다 (중복이면 0).
    pub fn process_received_packet(
        &self,
        chunk_id: u32,
        seq: u32,
        offset: u64,
        data: &[u8],
    ) -> Result<usize> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;

        let chunk = inner
            .chunks
            .get_mut(chunk_id as usize)
            .ok_or(Error::InvalidChunkId(chunk_id))?;

        if seq as usize >= chunk.packet_received.len() {
            return Err(Error::BadLength {
                expected: chunk.packet_received.len(),
                got: seq as usize,
            });
        }

        let packet_offset = seq as u64 * self.packet_size as u64;
        if packet_offset + data.len() as u64 > chunk.size {
            return Err(Error::BadLength {
                expected: chunk.size as usize,
                got: (packet_offset as usize) + data.len(),
            });
        }

        // 헤더가 주장하는 오프셋과 seq가 함의하는 오프셋의 일치 검증
        if offset != chunk.offset + packet_offset {
            return Err(Error::BadLength {
                expected: (chunk.offset + packet_offset) as usize,
                got: offset as usize,
            });
        }

        let abs = (chunk.offset + packet_offset) as usize;
        match &mut inner.backing {
            Backing::Recv(Some(m)) => {
                m[abs..abs + data.len()].copy_from_slice(data);
            }
            _ => return Err(Error::ConnectionClosed),
        }

        let seq_idx = seq as usize;
        if chunk.packet_received[seq_idx] {
            return Ok(0);
        }
        chunk.packet_received[seq_idx] = true;

        update_receive_state(chunk, seq);

        if !chunk.completed && chunk.packet_received.iter().all(|&r| r) {
            chunk.completed = true;
            chunk.pending_nacks.clear();
            self.completed_chunks.fetch_add(1, Ordering::SeqCst);
            debug!("청크 {} 완료", chunk_id);
        }

        Ok(data.len())
    }

    /// 기대 해시 수신 여부
    pub fn hash_known(&self, chunk_id: u32) -> bool {
        let inner = self.inner.lock();
        inner
            .chunks
            .get(chunk_id as usize)
            .map(|c| c.hash_known)
            .unwrap_or(false)
    }

    /// CHUNK_META로 받은 기대 해시 기록
    ///
    /// 청크가 이미 완료 상태면 true를 반환한다 (즉시 검증 가능).
    pub fn set_expected_hash(&self, chunk_id: u32, hash: [u8; 32]) -> Result<bool> {
        let mut inner = self.inner.lock();
        let chunk = inner
            .chunks
            .get_mut(chunk_id as usize)
            .ok_or(Error::InvalidChunkId(chunk_id))?;

        chunk.hash = hash;
        chunk.hash_known = true;
        Ok(chunk.completed)
    }

    /// 청크 해시 검증
    ///
    /// 매핑된 바이트의 SHA-256을 기대 해시와 대조한다. 일치하면 verified
    /// 표시 후 true. 미완료이거나 해시 미수신이면 false.
    pub fn verify_chunk(&self, chunk_id: u32) -> Result<bool> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;

        let chunk = inner
            .chunks
            .get_mut(chunk_id as usize)
            .ok_or(Error::InvalidChunkId(chunk_id))?;

        if !chunk.completed || !chunk.hash_known {
            return Ok(false);
        }

        let data =
            &inner.backing.bytes()[chunk.offset as usize..(chunk.offset + chunk.size) as usize];
        let actual = sha256(data);

        let verified = actual == chunk.hash;
        chunk.verified = verified;
        Ok(verified)
    }

    /// 청크 상태 리셋 (해시 불일치 시 전체 재수신 준비)
    ///
    /// 모든 패킷 시퀀스 목록을 반환한다.
    pub fn reset_chunk(&self, chunk_id: u32) -> Result<Vec<u32>> {
        let mut inner = self.inner.lock();
        let chunk = inner
            .chunks
            .get_mut(chunk_id as usize)
            .ok_or(Error::InvalidChunkId(chunk_id))?;

        if chunk.completed {
            self.completed_chunks.fetch_sub(1, Ordering::SeqCst);
        }

        for bit in chunk.packet_received.iter_mut() {
            *bit = false;
        }
        chunk.completed = false;
        chunk.verified = false;
        chunk.next_expected_seq = 0;
        chunk.pending_nacks.clear();
        chunk.urgent_nack = false;

        Ok((0..chunk.packet_received.len() as u32).collect())
    }

    /// 주동 NACK 후보 수집
    ///
    /// 미완료 청크마다 쿨다운(100ms)을 지키며 최대 50개 시퀀스를 모은다.
    /// 긴급 NACK은 쿨다운을 한 번 무시하고, 긴급 플래그는 리셋된다.
    pub fn proactive_nacks(&self) -> Vec<NackInfo> {
        let mut nacks = Vec::new();
        let mut inner = self.inner.lock();
        let now = Instant::now();

        for chunk in inner.chunks.iter_mut() {
            if chunk.completed || chunk.pending_nacks.is_empty() {
                continue;
            }

            let in_cooldown = chunk
                .last_nack_time
                .is_some_and(|t| now.duration_since(t).as_millis() < NACK_COOLDOWN_MS as u128);

            if in_cooldown && !chunk.urgent_nack {
                continue;
            }

            let count = chunk.pending_nacks.len().min(MAX_PACKETS_PER_NACK);
            let missing_packets: Vec<u32> = chunk.pending_nacks.drain(..count).collect();

            nacks.push(NackInfo {
                chunk_id: chunk.id,
                missing_packets,
                urgent: chunk.urgent_nack,
            });

            chunk.last_nack_time = Some(now);
            chunk.nack_count += 1;
            chunk.urgent_nack = false;

            debug!("청크 {} NACK #{} 적재", chunk.id, chunk.nack_count);
        }

        nacks
    }

    /// 청크의 현재 누락 패킷 목록
    pub fn missing_packets(&self, chunk_id: u32) -> Vec<u32> {
        let inner = self.inner.lock();
        match inner.chunks.get(chunk_id as usize) {
            Some(chunk) => chunk
                .packet_received
                .iter()
                .enumerate()
                .filter(|(_, &r)| !r)
                .map(|(i, _)| i as u32)
                .collect(),
            None => Vec::new(),
        }
    }

    /// 파일 전체 SHA-256
    pub fn file_hash(&self) -> [u8; 32] {
        let inner = self.inner.lock();
        sha256(&inner.backing.bytes()[..self.total_file_size as usize])
    }

    /// 매핑을 디스크에 동기화 (수신측)
    pub fn sync(&self) -> Result<()> {
        let inner = self.inner.lock();
        if let Backing::Recv(Some(m)) = &inner.backing {
            m.flush()?;
        }
        Ok(())
    }

    pub fn is_chunk_complete(&self, chunk_id: u32) -> bool {
        let inner = self.inner.lock();
        inner
            .chunks
            .get(chunk_id as usize)
            .map(|c| c.completed)
            .unwrap_or(false)
    }

    pub fn completed_chunks(&self) -> u32 {
        self.completed_chunks.load(Ordering::SeqCst)
    }

    pub fn total_chunks(&self) -> u32 {
        self.inner.lock().chunks.len() as u32
    }

    pub fn is_complete(&self) -> bool {
        self.completed_chunks() >= self.total_chunks()
    }

    pub fn all_verified(&self) -> bool {
        let inner = self.inner.lock();
        inner.chunks.iter().all(|c| c.verified)
    }

    pub fn progress(&self) -> f64 {
        let total = self.total_chunks();
        if total == 0 {
            return 1.0;
        }
        self.completed_chunks() as f64 / total as f64
    }

    pub fn file_size(&self) -> u64 {
        self.total_file_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// 갭 감지 (수신 상태 갱신)
///
/// seq가 기대 시퀀스면 수신된 접두사만큼 전진시키고, 임계값 이상 점프면
/// 중간의 미수신 시퀀스를 pending_nacks에 적재한다.
fn update_receive_state(chunk: &mut Chunk, seq: u32) {
    if seq > chunk.next_expected_seq + NACK_THRESHOLD_URGENT {
        // 큰 점프: 누락 구간 전체 + 현재 seq까지 긴급 적재
        for i in chunk.next_expected_seq..seq {
            if !chunk.packet_received[i as usize] {
                chunk.pending_nacks.push(i);
            }
        }
        chunk.pending_nacks.push(seq);
        chunk.urgent_nack = true;
    } else if seq > chunk.next_expected_seq + NACK_THRESHOLD_NORMAL {
        for i in chunk.next_expected_seq..seq {
            if !chunk.packet_received[i as usize] {
                chunk.pending_nacks.push(i);
            }
        }
    }

    if seq == chunk.next_expected_seq {
        while (chunk.next_expected_seq as usize) < chunk.packet_received.len()
            && chunk.packet_received[chunk.next_expected_seq as usize]
        {
            chunk.next_expected_seq += 1;
        }
    }

    chunk.pending_nacks.sort_unstable();
    chunk.pending_nacks.dedup();
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file_with(data: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(data).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn test_init_for_send_hashes() {
        let data = b"hello";
        let f = temp_file_with(data);

        let mgr = ChunkManager::init_for_send(f.path(), 4 * 1024 * 1024, 1400).unwrap();
        assert_eq!(mgr.total_chunks(), 1);
        assert_eq!(mgr.file_size(), 5);

        let desc = mgr.descriptor(0).unwrap();
        assert_eq!(desc.size, 5);
        assert_eq!(desc.packet_count, 1);
        assert_eq!(desc.hash, sha256(data));

        // SHA-256("hello")
        assert_eq!(
            hex(&mgr.file_hash()),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_packet_payload_views() {
        let data: Vec<u8> = (0..2500u32).map(|i| (i % 256) as u8).collect();
        let f = temp_file_with(&data);

        let mgr = ChunkManager::init_for_send(f.path(), 4 * 1024 * 1024, 1000).unwrap();
        let desc = mgr.descriptor(0).unwrap();
        assert_eq!(desc.packet_count, 3);

        let (p0, off0, last0) = mgr.packet_payload(0, 0).unwrap();
        assert_eq!(p0.len(), 1000);
        assert_eq!(off0, 0);
        assert!(!last0);

        let (p2, off2, last2) = mgr.packet_payload(0, 2).unwrap();
        assert_eq!(p2.len(), 500);
        assert_eq!(off2, 2000);
        assert!(last2);

        assert!(mgr.packet_payload(0, 3).is_none());
        assert!(mgr.packet_payload(1, 0).is_none());
    }

    fn recv_manager(dir: &tempfile::TempDir, file_size: u64, packet_size: u32) -> ChunkManager {
        let path = dir.path().join("out.bin.tmp");
        let chunk_size = 4 * 1024 * 1024u64;
        let total = file_size.div_ceil(chunk_size) as u32;
        ChunkManager::init_for_receive(&path, file_size, total, chunk_size, packet_size).unwrap()
    }

    #[test]
    fn test_receive_completion() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = recv_manager(&dir, 2500, 1000);

        assert_eq!(mgr.process_received_packet(0, 0, 0, &[1u8; 1000]).unwrap(), 1000);
        assert!(!mgr.is_chunk_complete(0));

        assert_eq!(mgr.process_received_packet(0, 1, 1000, &[2u8; 1000]).unwrap(), 1000);
        assert_eq!(mgr.process_received_packet(0, 2, 2000, &[3u8; 500]).unwrap(), 500);

        assert!(mgr.is_chunk_complete(0));
        assert_eq!(mgr.completed_chunks(), 1);

        // 중복 수신은 0 바이트
        assert_eq!(mgr.process_received_packet(0, 0, 0, &[9u8; 1000]).unwrap(), 0);
    }

    #[test]
    fn test_bounds_rejection() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = recv_manager(&dir, 2500, 1000);

        // 청크 크기 초과
        assert!(mgr.process_received_packet(0, 2, 2000, &[0u8; 1000]).is_err());
        // 잘못된 청크 ID
        assert!(mgr.process_received_packet(5, 0, 0, &[0u8; 10]).is_err());
        // 오프셋 불일치
        assert!(mgr.process_received_packet(0, 1, 999, &[0u8; 100]).is_err());
    }

    #[test]
    fn test_gap_detection_normal() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = recv_manager(&dir, 10_000, 1000);

        mgr.process_received_packet(0, 0, 0, &[0u8; 1000]).unwrap();

        // seq 1 누락, 2~4는 임계값 이내라 조용
        for seq in 2..5u32 {
            mgr.process_received_packet(0, seq, seq as u64 * 1000, &[0u8; 1000])
                .unwrap();
        }
        assert!(mgr.proactive_nacks().is_empty());

        // seq 5 > next_expected(1) + 3 → [1, 5) 미수신분 적재
        mgr.process_received_packet(0, 5, 5000, &[0u8; 1000]).unwrap();

        let nacks = mgr.proactive_nacks();
        assert_eq!(nacks.len(), 1);
        assert_eq!(nacks[0].chunk_id, 0);
        assert_eq!(nacks[0].missing_packets, vec![1]);
        assert!(!nacks[0].urgent);
    }

    #[test]
    fn test_gap_detection_urgent() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = recv_manager(&dir, 30_000, 1000);

        for seq in 0..5u32 {
            mgr.process_received_packet(0, seq, seq as u64 * 1000, &[0u8; 1000])
                .unwrap();
        }

        // seq 16 > next_expected(5) + 10 → 5..16 + 16 긴급 적재
        mgr.process_received_packet(0, 16, 16_000, &[0u8; 1000]).unwrap();

        let nacks = mgr.proactive_nacks();
        assert_eq!(nacks.len(), 1);
        assert!(nacks[0].urgent);

        let expected: Vec<u32> = (5..16).chain(std::iter::once(16)).collect();
        assert_eq!(nacks[0].missing_packets, expected);
        assert_eq!(nacks[0].missing_packets.len(), 12);

        // 긴급 플래그는 1회성: 새 갭 없이는 더 내보내지 않는다
        mgr.process_received_packet(0, 6, 6_000, &[0u8; 1000]).unwrap();
        assert!(mgr.proactive_nacks().is_empty());
    }

    #[test]
    fn test_nack_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = recv_manager(&dir, 30_000, 1000);

        mgr.process_received_packet(0, 0, 0, &[0u8; 1000]).unwrap();
        mgr.process_received_packet(0, 5, 5000, &[0u8; 1000]).unwrap();

        let first = mgr.proactive_nacks();
        assert_eq!(first.len(), 1);

        // 쿨다운 내 재시도: 새 갭이 있어도 침묵
        mgr.process_received_packet(0, 10, 10_000, &[0u8; 1000]).unwrap();
        assert!(mgr.proactive_nacks().is_empty());

        std::thread::sleep(std::time::Duration::from_millis(110));
        let second = mgr.proactive_nacks();
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn test_verify_and_reset() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = recv_manager(&dir, 100, 1000);

        let payload = [7u8; 100];
        mgr.process_received_packet(0, 0, 0, &payload).unwrap();
        assert!(mgr.is_chunk_complete(0));

        // 해시 미수신 상태에서는 검증 불가
        assert!(!mgr.verify_chunk(0).unwrap());

        assert!(mgr.set_expected_hash(0, sha256(&payload)).unwrap());
        assert!(mgr.verify_chunk(0).unwrap());
        assert!(mgr.all_verified());

        // 잘못된 해시 → 리셋하면 전 패킷 재요청 목록
        mgr.set_expected_hash(0, [0u8; 32]).unwrap();
        assert!(!mgr.verify_chunk(0).unwrap());

        let seqs = mgr.reset_chunk(0).unwrap();
        assert_eq!(seqs, vec![0]);
        assert!(!mgr.is_chunk_complete(0));
        assert_eq!(mgr.completed_chunks(), 0);
    }

    #[test]
    fn test_next_chunk_iterator() {
        let data = vec![0u8; 3000];
        let f = temp_file_with(&data);

        let mgr = ChunkManager::init_for_send(f.path(), 1000, 500).unwrap();
        assert_eq!(mgr.total_chunks(), 3);

        assert_eq!(mgr.next_chunk_to_send(), Some(0));
        assert_eq!(mgr.next_chunk_to_send(), Some(1));
        assert_eq!(mgr.next_chunk_to_send(), Some(2));
        assert_eq!(mgr.next_chunk_to_send(), None);
    }

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }
}
