//! 와이어 코덱
//!
//! - 컨트롤 헤더 / 데이터 헤더 / 페이로드 구조체의 직렬화·역직렬화
//! - 리틀엔디언, 패딩 없는 밀집 배치
//! - 페이로드 CRC32 (IEEE 802.3) 계산·검증
//!
//! 코덱 실패(BadMagic/BadVersion/BadType/BadLength/BadCrc)는 호출측에서
//! 전부 "패킷 폐기"로 처리한다.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::{MAGIC_NUMBER, PROTOCOL_VERSION};

/// 컨트롤 헤더 크기 (바이트)
pub const CONTROL_HEADER_LEN: usize = 15;

/// 데이터 헤더 크기 (바이트)
pub const DATA_HEADER_LEN: usize = 30;

/// 마지막 패킷 플래그
pub const FLAG_LAST_PACKET: u16 = 0x01;

/// 재전송 플래그
pub const FLAG_RETRANSMIT: u16 = 0x02;

/// 암호화 플래그
pub const FLAG_ENCRYPTED: u16 = 0x04;

/// 컨트롤 패킷 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlType {
    /// 핸드쉐이크 요청 (송신 → 수신)
    Syn = 0x01,

    /// 핸드쉐이크 응답 (수신 → 송신)
    SynAck = 0x02,

    /// 청크 메타데이터 (해시 + 패킷 수)
    ChunkMeta = 0x03,

    /// 청크 검증 완료 확인
    ChunkConfirm = 0x04,

    /// 청크 전체 재전송 요청 (해시 불일치 시)
    ChunkRetry = 0x05,

    /// 파일 전송 완료 (전체 파일 해시 포함)
    FileDone = 0x06,

    /// 주동 NACK (누락 패킷 목록)
    ChunkNack = 0x07,

    /// Heartbeat (생존 확인)
    Heartbeat = 0x08,

    /// 에러 통지
    Error = 0xFF,
}

impl ControlType {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0x01 => Ok(Self::Syn),
            0x02 => Ok(Self::SynAck),
            0x03 => Ok(Self::ChunkMeta),
            0x04 => Ok(Self::ChunkConfirm),
            0x05 => Ok(Self::ChunkRetry),
            0x06 => Ok(Self::FileDone),
            0x07 => Ok(Self::ChunkNack),
            0x08 => Ok(Self::Heartbeat),
            0xFF => Ok(Self::Error),
            other => Err(Error::BadType(other)),
        }
    }
}

fn get_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn get_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn get_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(b)
}

fn check_magic_version(magic: u32, version: u16) -> Result<()> {
    if magic != MAGIC_NUMBER {
        return Err(Error::BadMagic {
            expected: MAGIC_NUMBER,
            got: magic,
        });
    }
    if version != PROTOCOL_VERSION {
        return Err(Error::BadVersion {
            expected: PROTOCOL_VERSION,
            got: version,
        });
    }
    Ok(())
}

/// 컨트롤 헤더 (15바이트)
///
/// `magic u32 | version u16 | type u8 | chunk_id u32 | payload_len u16 | reserved u8[2]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlHeader {
    pub magic: u32,
    pub version: u16,
    pub ctype: ControlType,
    pub chunk_id: u32,
    pub payload_len: u16,
}

impl ControlHeader {
    pub fn new(ctype: ControlType, chunk_id: u32, payload_len: u16) -> Self {
        Self {
            magic: MAGIC_NUMBER,
            version: PROTOCOL_VERSION,
            ctype,
            chunk_id,
            payload_len,
        }
    }

    /// 바이트로 직렬화
    pub fn to_bytes(&self) -> [u8; CONTROL_HEADER_LEN] {
        let mut buf = [0u8; CONTROL_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6] = self.ctype as u8;
        buf[7..11].copy_from_slice(&self.chunk_id.to_le_bytes());
        buf[11..13].copy_from_slice(&self.payload_len.to_le_bytes());
        // buf[13..15]: reserved
        buf
    }

    /// 바이트에서 역직렬화
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < CONTROL_HEADER_LEN {
            return Err(Error::BadLength {
                expected: CONTROL_HEADER_LEN,
                got: buf.len(),
            });
        }

        let magic = get_u32(buf, 0);
        let version = get_u16(buf, 4);
        check_magic_version(magic, version)?;

        Ok(Self {
            magic,
            version,
            ctype: ControlType::from_u8(buf[6])?,
            chunk_id: get_u32(buf, 7),
            payload_len: get_u16(buf, 11),
        })
    }
}

/// 컨트롤 프레임 (헤더 + 페이로드) 직렬화
pub fn encode_control(ctype: ControlType, chunk_id: u32, payload: &[u8]) -> Vec<u8> {
    let header = ControlHeader::new(ctype, chunk_id, payload.len() as u16);
    let mut buf = Vec::with_capacity(CONTROL_HEADER_LEN + payload.len());
    buf.extend_from_slice(&header.to_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// 컨트롤 프레임 역직렬화. (헤더, 페이로드) 반환
pub fn decode_control(buf: &[u8]) -> Result<(ControlHeader, Bytes)> {
    let header = ControlHeader::from_bytes(buf)?;
    let total = CONTROL_HEADER_LEN + header.payload_len as usize;

    if buf.len() < total {
        return Err(Error::BadLength {
            expected: total,
            got: buf.len(),
        });
    }

    let payload = Bytes::copy_from_slice(&buf[CONTROL_HEADER_LEN..total]);
    Ok((header, payload))
}

/// 데이터 헤더 (30바이트)
///
/// `magic u32 | version u16 | chunk_id u32 | seq u32 | offset u64 | data_len u16 | flags u16 | crc32 u32`
///
/// crc32는 페이로드만 커버한다 (암호화 시 암호문 기준).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    pub magic: u32,
    pub version: u16,
    pub chunk_id: u32,
    pub seq: u32,
    pub offset: u64,
    pub data_len: u16,
    pub flags: u16,
    pub crc32: u32,
}

impl DataHeader {
    pub fn new(chunk_id: u32, seq: u32, offset: u64, data_len: u16, flags: u16) -> Self {
        Self {
            magic: MAGIC_NUMBER,
            version: PROTOCOL_VERSION,
            chunk_id,
            seq,
            offset,
            data_len,
            flags,
            crc32: 0,
        }
    }

    pub fn is_last_packet(&self) -> bool {
        self.flags & FLAG_LAST_PACKET != 0
    }

    pub fn is_retransmit(&self) -> bool {
        self.flags & FLAG_RETRANSMIT != 0
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }

    /// 바이트로 직렬화
    pub fn to_bytes(&self) -> [u8; DATA_HEADER_LEN] {
        let mut buf = [0u8; DATA_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6..10].copy_from_slice(&self.chunk_id.to_le_bytes());
        buf[10..14].copy_from_slice(&self.seq.to_le_bytes());
        buf[14..22].copy_from_slice(&self.offset.to_le_bytes());
        buf[22..24].copy_from_slice(&self.data_len.to_le_bytes());
        buf[24..26].copy_from_slice(&self.flags.to_le_bytes());
        buf[26..30].copy_from_slice(&self.crc32.to_le_bytes());
        buf
    }

    /// 바이트에서 역직렬화
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < DATA_HEADER_LEN {
            return Err(Error::BadLength {
                expected: DATA_HEADER_LEN,
                got: buf.len(),
            });
        }

        let magic = get_u32(buf, 0);
        let version = get_u16(buf, 4);
        check_magic_version(magic, version)?;

        Ok(Self {
            magic,
            version,
            chunk_id: get_u32(buf, 6),
            seq: get_u32(buf, 10),
            offset: get_u64(buf, 14),
            data_len: get_u16(buf, 22),
            flags: get_u16(buf, 24),
            crc32: get_u32(buf, 26),
        })
    }
}

/// 데이터 패킷 (헤더 + 페이로드)
#[derive(Debug, Clone)]
pub struct DataPacket {
    pub header: DataHeader,
    pub data: Bytes,
}

impl DataPacket {
    /// 새 데이터 패킷 생성 (CRC 계산 포함)
    pub fn new(chunk_id: u32, seq: u32, offset: u64, data: Bytes, flags: u16) -> Self {
        let mut header = DataHeader::new(chunk_id, seq, offset, data.len() as u16, flags);
        header.crc32 = crc32fast::hash(&data);
        Self { header, data }
    }

    /// 바이트로 직렬화
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(DATA_HEADER_LEN + self.data.len());
        buf.extend_from_slice(&self.header.to_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    /// 바이트에서 역직렬화 + 검증
    ///
    /// data_len은 데이터그램 길이가 함의하는 크기와 일치해야 하고,
    /// 페이로드 CRC32가 헤더 값과 일치해야 한다.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let header = DataHeader::from_bytes(buf)?;

        let actual_len = buf.len() - DATA_HEADER_LEN;
        if actual_len != header.data_len as usize {
            return Err(Error::BadLength {
                expected: header.data_len as usize,
                got: actual_len,
            });
        }

        let data = Bytes::copy_from_slice(&buf[DATA_HEADER_LEN..]);

        let crc = crc32fast::hash(&data);
        if crc != header.crc32 {
            return Err(Error::BadCrc {
                expected: header.crc32,
                got: crc,
            });
        }

        Ok(Self { header, data })
    }
}

/// SYN 페이로드 (송신 → 수신)
///
/// `file_size u64 | chunk_size u32 | total_chunks u32 | filename_len u16 | filename[..]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynPayload {
    pub file_size: u64,
    pub chunk_size: u32,
    pub total_chunks: u32,
    pub filename: String,
}

impl SynPayload {
    pub fn to_bytes(&self) -> Vec<u8> {
        let name = self.filename.as_bytes();
        let mut buf = Vec::with_capacity(18 + name.len());
        buf.extend_from_slice(&self.file_size.to_le_bytes());
        buf.extend_from_slice(&self.chunk_size.to_le_bytes());
        buf.extend_from_slice(&self.total_chunks.to_le_bytes());
        buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
        buf.extend_from_slice(name);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < 18 {
            return Err(Error::BadLength {
                expected: 18,
                got: buf.len(),
            });
        }

        let filename_len = get_u16(buf, 16) as usize;
        if buf.len() < 18 + filename_len {
            return Err(Error::BadLength {
                expected: 18 + filename_len,
                got: buf.len(),
            });
        }

        Ok(Self {
            file_size: get_u64(buf, 0),
            chunk_size: get_u32(buf, 8),
            total_chunks: get_u32(buf, 12),
            filename: String::from_utf8_lossy(&buf[18..18 + filename_len]).into_owned(),
        })
    }
}

/// SYN_ACK 페이로드 (수신 → 송신)
///
/// `available_space u64 | max_chunk_size u32 | accept u8 | reason[256]` (NUL 종단)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynAckPayload {
    pub available_space: u64,
    pub max_chunk_size: u32,
    pub accept: bool,
    pub reason: String,
}

/// SYN_ACK reason 필드 고정 크기
const SYN_ACK_REASON_LEN: usize = 256;

impl SynAckPayload {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(13 + SYN_ACK_REASON_LEN);
        buf.extend_from_slice(&self.available_space.to_le_bytes());
        buf.extend_from_slice(&self.max_chunk_size.to_le_bytes());
        buf.push(if self.accept { 1 } else { 0 });

        let mut reason = [0u8; SYN_ACK_REASON_LEN];
        let src = self.reason.as_bytes();
        let n = src.len().min(SYN_ACK_REASON_LEN - 1);
        reason[..n].copy_from_slice(&src[..n]);
        buf.extend_from_slice(&reason);
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < 13 + SYN_ACK_REASON_LEN {
            return Err(Error::BadLength {
                expected: 13 + SYN_ACK_REASON_LEN,
                got: buf.len(),
            });
        }

        let reason_bytes = &buf[13..13 + SYN_ACK_REASON_LEN];
        let end = reason_bytes.iter().position(|&b| b == 0).unwrap_or(SYN_ACK_REASON_LEN);

        Ok(Self {
            available_space: get_u64(buf, 0),
            max_chunk_size: get_u32(buf, 8),
            accept: buf[12] != 0,
            reason: String::from_utf8_lossy(&reason_bytes[..end]).into_owned(),
        })
    }
}

/// CHUNK_META 페이로드
///
/// `hash[32] | packet_count u32`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMetaPayload {
    pub hash: [u8; 32],
    pub packet_count: u32,
}

impl ChunkMetaPayload {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(36);
        buf.extend_from_slice(&self.hash);
        buf.extend_from_slice(&self.packet_count.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < 36 {
            return Err(Error::BadLength {
                expected: 36,
                got: buf.len(),
            });
        }

        let mut hash = [0u8; 32];
        hash.copy_from_slice(&buf[..32]);

        Ok(Self {
            hash,
            packet_count: get_u32(buf, 32),
        })
    }
}

/// CHUNK_NACK / CHUNK_RETRY 페이로드
///
/// `missing_count u32 | missing_packets[missing_count] u32`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkNackPayload {
    pub missing_packets: Vec<u32>,
}

impl ChunkNackPayload {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.missing_packets.len() * 4);
        buf.extend_from_slice(&(self.missing_packets.len() as u32).to_le_bytes());
        for seq in &self.missing_packets {
            buf.extend_from_slice(&seq.to_le_bytes());
        }
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(Error::BadLength {
                expected: 4,
                got: buf.len(),
            });
        }

        // 선언된 개수와 실제 길이 중 작은 쪽만 신뢰
        let declared = get_u32(buf, 0) as usize;
        let available = (buf.len() - 4) / 4;
        let count = declared.min(available);

        let mut missing_packets = Vec::with_capacity(count);
        for i in 0..count {
            missing_packets.push(get_u32(buf, 4 + i * 4));
        }

        Ok(Self { missing_packets })
    }
}

/// FILE_DONE 페이로드
///
/// `file_hash[32]` (파일 전체 SHA-256)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDonePayload {
    pub file_hash: [u8; 32],
}

impl FileDonePayload {
    pub fn to_bytes(&self) -> Vec<u8> {
        self.file_hash.to_vec()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < 32 {
            return Err(Error::BadLength {
                expected: 32,
                got: buf.len(),
            });
        }

        let mut file_hash = [0u8; 32];
        file_hash.copy_from_slice(&buf[..32]);
        Ok(Self { file_hash })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_constants() {
        assert_eq!(MAGIC_NUMBER, 0x48525546);
        assert_eq!(PROTOCOL_VERSION, 0x0001);

        assert_eq!(ControlType::Syn as u8, 0x01);
        assert_eq!(ControlType::FileDone as u8, 0x06);
        assert_eq!(ControlType::Error as u8, 0xFF);

        assert_eq!(FLAG_LAST_PACKET, 0x01);
        assert_eq!(FLAG_RETRANSMIT, 0x02);
        assert_eq!(FLAG_ENCRYPTED, 0x04);
    }

    #[test]
    fn test_control_header_roundtrip() {
        let header = ControlHeader::new(ControlType::Syn, 123, 456);
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), CONTROL_HEADER_LEN);

        let restored = ControlHeader::from_bytes(&bytes).unwrap();
        assert_eq!(restored, header);
    }

    #[test]
    fn test_control_header_bad_magic() {
        let mut bytes = ControlHeader::new(ControlType::Syn, 0, 0).to_bytes();
        bytes[0] = 0;
        assert!(matches!(
            ControlHeader::from_bytes(&bytes),
            Err(Error::BadMagic { .. })
        ));
    }

    #[test]
    fn test_control_header_bad_type() {
        let mut bytes = ControlHeader::new(ControlType::Syn, 0, 0).to_bytes();
        bytes[6] = 0x99;
        assert!(matches!(
            ControlHeader::from_bytes(&bytes),
            Err(Error::BadType(0x99))
        ));
    }

    #[test]
    fn test_data_header_roundtrip() {
        let mut header = DataHeader::new(1, 100, 4096, 1400, FLAG_LAST_PACKET);
        header.crc32 = 0xDEADBEEF;

        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), DATA_HEADER_LEN);

        let restored = DataHeader::from_bytes(&bytes).unwrap();
        assert_eq!(restored, header);
        assert!(restored.is_last_packet());
        assert!(!restored.is_retransmit());
    }

    #[test]
    fn test_data_packet_roundtrip() {
        let data = Bytes::from(vec![0x01, 0x02, 0x03, 0x04, 0x05]);
        let packet = DataPacket::new(2, 50, 8192, data.clone(), 0);

        let bytes = packet.to_bytes();
        assert_eq!(bytes.len(), DATA_HEADER_LEN + 5);

        let restored = DataPacket::from_bytes(&bytes).unwrap();
        assert_eq!(restored.header.chunk_id, 2);
        assert_eq!(restored.header.seq, 50);
        assert_eq!(restored.header.offset, 8192);
        assert_eq!(restored.data, data);
    }

    #[test]
    fn test_data_packet_crc_flip() {
        let packet = DataPacket::new(0, 0, 0, Bytes::from_static(b"hello"), 0);
        let mut bytes = packet.to_bytes();

        // 페이로드 1비트 반전
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;

        assert!(matches!(
            DataPacket::from_bytes(&bytes),
            Err(Error::BadCrc { .. })
        ));
    }

    #[test]
    fn test_data_packet_length_mismatch() {
        let packet = DataPacket::new(0, 0, 0, Bytes::from_static(b"hello"), 0);
        let mut bytes = packet.to_bytes();
        bytes.push(0xAA);

        assert!(matches!(
            DataPacket::from_bytes(&bytes),
            Err(Error::BadLength { .. })
        ));
    }

    #[test]
    fn test_syn_roundtrip() {
        let syn = SynPayload {
            file_size: 1024 * 1024 * 100,
            chunk_size: 4 * 1024 * 1024,
            total_chunks: 25,
            filename: "data.bin".to_string(),
        };

        let restored = SynPayload::from_bytes(&syn.to_bytes()).unwrap();
        assert_eq!(restored, syn);
    }

    #[test]
    fn test_syn_ack_roundtrip() {
        let ack = SynAckPayload {
            available_space: 0,
            max_chunk_size: 4 * 1024 * 1024,
            accept: false,
            reason: "Insufficient disk space".to_string(),
        };

        let bytes = ack.to_bytes();
        assert_eq!(bytes.len(), 13 + 256);

        let restored = SynAckPayload::from_bytes(&bytes).unwrap();
        assert_eq!(restored, ack);
    }

    #[test]
    fn test_syn_ack_reason_truncated() {
        let ack = SynAckPayload {
            available_space: 1,
            max_chunk_size: 1,
            accept: true,
            reason: "x".repeat(500),
        };

        let restored = SynAckPayload::from_bytes(&ack.to_bytes()).unwrap();
        assert_eq!(restored.reason.len(), 255);
    }

    #[test]
    fn test_chunk_meta_roundtrip() {
        let meta = ChunkMetaPayload {
            hash: [0xAB; 32],
            packet_count: 2996,
        };

        let restored = ChunkMetaPayload::from_bytes(&meta.to_bytes()).unwrap();
        assert_eq!(restored, meta);
    }

    #[test]
    fn test_nack_roundtrip() {
        let nack = ChunkNackPayload {
            missing_packets: vec![1, 5, 9, 100],
        };

        let restored = ChunkNackPayload::from_bytes(&nack.to_bytes()).unwrap();
        assert_eq!(restored, nack);
    }

    #[test]
    fn test_nack_count_clamped_to_buffer() {
        let mut bytes = ChunkNackPayload {
            missing_packets: vec![1, 2],
        }
        .to_bytes();

        // 선언 개수를 조작해도 버퍼 길이까지만 읽는다
        bytes[0..4].copy_from_slice(&1000u32.to_le_bytes());
        let restored = ChunkNackPayload::from_bytes(&bytes).unwrap();
        assert_eq!(restored.missing_packets, vec![1, 2]);
    }

    #[test]
    fn test_control_frame_roundtrip() {
        let payload = ChunkNackPayload {
            missing_packets: vec![3, 4],
        }
        .to_bytes();

        let frame = encode_control(ControlType::ChunkNack, 7, &payload);
        let (header, decoded) = decode_control(&frame).unwrap();

        assert_eq!(header.ctype, ControlType::ChunkNack);
        assert_eq!(header.chunk_id, 7);
        assert_eq!(decoded.as_ref(), payload.as_slice());
    }

    #[test]
    fn test_file_done_roundtrip() {
        let done = FileDonePayload {
            file_hash: [0x5A; 32],
        };
        let restored = FileDonePayload::from_bytes(&done.to_bytes()).unwrap();
        assert_eq!(restored, done);
    }
}
