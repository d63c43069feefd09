//! 세션 설정

use crate::{Error, Result, DEFAULT_PACKET_SIZE, MAX_DATAGRAM_SIZE};

/// HRUFT 세션 설정 (시작 후 불변)
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// 상대 호스트 주소 (IP)
    pub remote_host: String,

    /// 컨트롤 포트 (수신측이 바인드, 송신측이 목적지로 사용)
    pub control_port: u16,

    /// 로컬 데이터 포트 베이스 (여기부터 data_sockets개 연속 바인드)
    pub local_data_port: u16,

    /// 상대측 데이터 포트 베이스
    pub remote_data_port: u16,

    /// 데이터 소켓 수 (연속 포트 수)
    pub data_sockets: u16,

    /// 청크 크기 (MB 단위, 1 ~ 1024)
    pub chunk_size_mb: u32,

    /// 패킷 크기 (바이트, 경로 MTU - 헤더 이하)
    pub packet_size: u32,

    /// 윈도우 크기 (동시 전송 청크 수, 1 ~ 256)
    pub window_size: u32,

    /// 워커 수 (1 ~ 64, 윈도우 크기 이하)
    pub worker_threads: u32,

    /// 핸드쉐이크 타임아웃 (밀리초)
    pub handshake_timeout_ms: u64,

    /// 청크 타임아웃 (밀리초)
    pub chunk_timeout_ms: u64,

    /// 최대 재시도 횟수
    pub max_retries: u32,

    /// 사전 공유키 (암호화 활성 시 필수)
    pub encryption_key: String,

    /// 암호화 활성화
    pub enable_encryption: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            remote_host: "127.0.0.1".to_string(),
            control_port: 10000,
            local_data_port: 10001,
            remote_data_port: 10001,
            data_sockets: 4,
            chunk_size_mb: 4,
            packet_size: DEFAULT_PACKET_SIZE,
            window_size: 16,
            worker_threads: 8,
            handshake_timeout_ms: 5000,
            chunk_timeout_ms: 30000,
            max_retries: 5,
            encryption_key: String::new(),
            enable_encryption: false,
        }
    }
}

impl SessionConfig {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 청크 크기 (바이트)
    pub fn chunk_size_bytes(&self) -> u64 {
        self.chunk_size_mb as u64 * 1024 * 1024
    }

    /// 청크당 패킷 수
    pub fn packets_per_chunk(&self) -> u32 {
        ((self.chunk_size_bytes() + self.packet_size as u64 - 1) / self.packet_size as u64) as u32
    }

    /// 설정 검증 (세션 시작 전 호출)
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size_mb < 1 || self.chunk_size_mb > 1024 {
            return Err(Error::InvalidConfig(format!(
                "청크 크기 범위 초과: {} MB (1 ~ 1024)",
                self.chunk_size_mb
            )));
        }

        if self.window_size < 1 || self.window_size > 256 {
            return Err(Error::InvalidConfig(format!(
                "윈도우 크기 범위 초과: {} (1 ~ 256)",
                self.window_size
            )));
        }

        if self.worker_threads < 1 || self.worker_threads > 64 {
            return Err(Error::InvalidConfig(format!(
                "워커 수 범위 초과: {} (1 ~ 64)",
                self.worker_threads
            )));
        }

        if self.worker_threads > self.window_size {
            return Err(Error::InvalidConfig(format!(
                "워커 수({})는 윈도우 크기({}) 이하여야 함",
                self.worker_threads, self.window_size
            )));
        }

        let mut overhead = crate::protocol::DATA_HEADER_LEN;
        if self.enable_encryption {
            overhead += crate::crypto::ENVELOPE_OVERHEAD;
        }
        if self.packet_size as usize + overhead > MAX_DATAGRAM_SIZE {
            return Err(Error::InvalidConfig(format!(
                "패킷 크기 초과: {} + 오버헤드 {} > {}",
                self.packet_size, overhead, MAX_DATAGRAM_SIZE
            )));
        }

        if self.data_sockets == 0 {
            return Err(Error::InvalidConfig("데이터 소켓 수는 1 이상".into()));
        }

        if self.enable_encryption && self.encryption_key.is_empty() {
            return Err(Error::InvalidConfig("암호화 활성 시 키 필요".into()));
        }

        Ok(())
    }

    /// 손실 많은 링크용 설정
    pub fn lossy_link() -> Self {
        Self {
            chunk_size_mb: 2,
            window_size: 32,
            worker_threads: 8,
            chunk_timeout_ms: 15000,
            max_retries: 10,
            ..Self::default()
        }
    }
}
