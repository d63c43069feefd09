//! 에러 타입 정의

use thiserror::Error;

/// HRUFT 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("유효하지 않은 매직 넘버: expected {expected:08X}, got {got:08X}")]
    BadMagic { expected: u32, got: u32 },

    #[error("유효하지 않은 프로토콜 버전: expected {expected:04X}, got {got:04X}")]
    BadVersion { expected: u16, got: u16 },

    #[error("알 수 없는 패킷 타입: {0:#04X}")]
    BadType(u8),

    #[error("패킷 길이 불일치: expected {expected}, got {got}")]
    BadLength { expected: usize, got: usize },

    #[error("CRC 불일치: expected {expected:08X}, got {got:08X}")]
    BadCrc { expected: u32, got: u32 },

    #[error("핸드쉐이크 타임아웃 ({0} ms)")]
    HandshakeTimeout(u64),

    #[error("핸드쉐이크 거부: {0}")]
    HandshakeRejected(String),

    #[error("청크 해시 불일치: chunk_id={0}")]
    ChunkHashMismatch(u32),

    #[error("파일 해시 불일치")]
    FileHashMismatch,

    #[error("디스크 공간 부족: required {required}, available {available}")]
    InsufficientSpace { required: u64, available: u64 },

    #[error("상대측 정지 감지 (진행 없음 {0} ms)")]
    PeerStalled(u64),

    #[error("유효하지 않은 청크 ID: {0}")]
    InvalidChunkId(u32),

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),

    #[error("HMAC 검증 실패")]
    HmacMismatch,

    #[error("세션 실패: {0}")]
    Session(String),

    #[error("연결 종료")]
    ConnectionClosed,
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
