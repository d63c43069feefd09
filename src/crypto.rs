//! 암호화 봉투 - 사전 공유키 기반 AES-256-CTR + HMAC-SHA-256
//!
//! 새 메시지 타입을 추가하지 않는 봉투 방식. ENCRYPTED 플래그가 선 데이터
//! 패킷은 와이어에서 다음 형태가 된다:
//!
//! `[데이터 헤더 | nonce u64 | 암호문 | HMAC-SHA-256(헤더 || nonce || 암호문)]`
//!
//! - 키: SHA-256(사전 공유키 문자열)
//! - IV: session_id(8바이트 LE) || nonce(8바이트 LE)
//! - nonce: 세션당 0부터 패킷마다 단조 증가, 봉투에 명시 포함
//!   (손실·재정렬되는 데이터그램에서 수신측이 카운터를 복원할 수 없으므로)
//! - 헤더의 crc32와 data_len은 암호문 기준
//! - 검증 순서: HMAC 먼저, 복호화는 그 다음

use std::sync::atomic::{AtomicU64, Ordering};

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::protocol::{DataPacket, FLAG_ENCRYPTED, DATA_HEADER_LEN};

type Aes256Ctr = Ctr128BE<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// HMAC 태그 크기 (바이트)
pub const HMAC_LEN: usize = 32;

/// nonce 필드 크기 (바이트)
pub const NONCE_LEN: usize = 8;

/// 봉투가 패킷에 더하는 크기 (바이트)
pub const ENVELOPE_OVERHEAD: usize = NONCE_LEN + HMAC_LEN;

/// 패킷 봉투 (세션당 하나, 송수신 공용)
pub struct SecureEnvelope {
    key: [u8; 32],
    session_id: u64,
    nonce: AtomicU64,
}

impl SecureEnvelope {
    /// 사전 공유키로 봉투 생성
    pub fn new(pre_shared_key: &str, session_id: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(pre_shared_key.as_bytes());

        Self {
            key: hasher.finalize().into(),
            session_id,
            nonce: AtomicU64::new(0),
        }
    }

    fn iv(&self, nonce: u64) -> [u8; 16] {
        let mut iv = [0u8; 16];
        iv[..8].copy_from_slice(&self.session_id.to_le_bytes());
        iv[8..].copy_from_slice(&nonce.to_le_bytes());
        iv
    }

    fn hmac_tag(&self, data: &[u8]) -> [u8; HMAC_LEN] {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC key length");
        mac.update(data);
        mac.finalize().into_bytes().into()
    }

    /// 데이터 패킷 봉인
    ///
    /// 평문 패킷을 받아 암호화 와이어 바이트를 만든다. 재전송도 매번 새
    /// nonce를 쓴다 (같은 평문이라도 무방).
    pub fn seal(&self, packet: &DataPacket) -> Vec<u8> {
        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst);

        let mut ciphertext = packet.data.to_vec();
        let mut cipher = Aes256Ctr::new(&self.key.into(), &self.iv(nonce).into());
        cipher.apply_keystream(&mut ciphertext);

        let mut header = packet.header;
        header.flags |= FLAG_ENCRYPTED;
        header.data_len = ciphertext.len() as u16;
        header.crc32 = crc32fast::hash(&ciphertext);

        let mut buf =
            Vec::with_capacity(DATA_HEADER_LEN + NONCE_LEN + ciphertext.len() + HMAC_LEN);
        buf.extend_from_slice(&header.to_bytes());
        buf.extend_from_slice(&nonce.to_le_bytes());
        buf.extend_from_slice(&ciphertext);

        let tag = self.hmac_tag(&buf);
        buf.extend_from_slice(&tag);
        buf
    }

    /// 봉투 개봉
    ///
    /// HMAC 검증 → CRC 검증 → 복호화 순. 어느 단계든 실패하면 폐기 대상.
    pub fn open(&self, buf: &[u8]) -> Result<DataPacket> {
        let header = crate::protocol::DataHeader::from_bytes(buf)?;

        let expected = DATA_HEADER_LEN + NONCE_LEN + header.data_len as usize + HMAC_LEN;
        if buf.len() != expected {
            return Err(Error::BadLength {
                expected,
                got: buf.len(),
            });
        }

        let signed_len = buf.len() - HMAC_LEN;
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC key length");
        mac.update(&buf[..signed_len]);
        if mac.verify_slice(&buf[signed_len..]).is_err() {
            return Err(Error::HmacMismatch);
        }

        let nonce = u64::from_le_bytes(
            buf[DATA_HEADER_LEN..DATA_HEADER_LEN + NONCE_LEN]
                .try_into()
                .expect("nonce slice"),
        );

        let ciphertext = &buf[DATA_HEADER_LEN + NONCE_LEN..signed_len];
        let crc = crc32fast::hash(ciphertext);
        if crc != header.crc32 {
            return Err(Error::BadCrc {
                expected: header.crc32,
                got: crc,
            });
        }

        let mut plaintext = ciphertext.to_vec();
        let mut cipher = Aes256Ctr::new(&self.key.into(), &self.iv(nonce).into());
        cipher.apply_keystream(&mut plaintext);

        Ok(DataPacket {
            header,
            data: plaintext.into(),
        })
    }

    /// 현재 nonce (테스트·진단용)
    pub fn current_nonce(&self) -> u64 {
        self.nonce.load(Ordering::SeqCst)
    }
}

/// 세션 ID 유도
///
/// 와이어에 세션 ID 필드가 없으므로 양측이 핸드쉐이크에서 공유하는 값
/// (키, 파일명, 파일 크기)에서 결정적으로 유도한다.
pub fn derive_session_id(key: &str, filename: &str, file_size: u64) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update(filename.as_bytes());
    hasher.update(file_size.to_le_bytes());

    let digest = hasher.finalize();
    u64::from_le_bytes(digest[..8].try_into().expect("digest slice"))
}

/// 랜덤 키 생성 (영숫자, 암호학적 RNG)
pub fn generate_key(length: usize) -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn packet() -> DataPacket {
        DataPacket::new(1, 2, 2800, Bytes::from_static(b"secret chunk bytes"), 0)
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let env = SecureEnvelope::new("test-key", 42);

        let sealed = env.seal(&packet());
        let opened = env.open(&sealed).unwrap();

        assert_eq!(opened.header.chunk_id, 1);
        assert_eq!(opened.header.seq, 2);
        assert!(opened.header.is_encrypted());
        assert_eq!(opened.data.as_ref(), b"secret chunk bytes");
    }

    #[test]
    fn test_ciphertext_differs_from_plaintext() {
        let env = SecureEnvelope::new("test-key", 42);
        let sealed = env.seal(&packet());

        let body = &sealed[DATA_HEADER_LEN + NONCE_LEN..sealed.len() - HMAC_LEN];
        assert_ne!(body, b"secret chunk bytes");
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let env = SecureEnvelope::new("test-key", 42);
        let mut sealed = env.seal(&packet());

        sealed[DATA_HEADER_LEN + NONCE_LEN] ^= 0x01;
        assert!(matches!(env.open(&sealed), Err(Error::HmacMismatch)));
    }

    #[test]
    fn test_tampered_tag_rejected() {
        let env = SecureEnvelope::new("test-key", 42);
        let mut sealed = env.seal(&packet());

        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(env.open(&sealed), Err(Error::HmacMismatch)));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let sender = SecureEnvelope::new("key-a", 42);
        let receiver = SecureEnvelope::new("key-b", 42);

        let sealed = sender.seal(&packet());
        assert!(matches!(receiver.open(&sealed), Err(Error::HmacMismatch)));
    }

    #[test]
    fn test_nonce_monotonic() {
        let env = SecureEnvelope::new("test-key", 42);
        assert_eq!(env.current_nonce(), 0);

        let a = env.seal(&packet());
        let b = env.seal(&packet());
        assert_eq!(env.current_nonce(), 2);

        // 같은 평문이라도 nonce가 달라 암호문이 달라진다
        assert_ne!(
            &a[DATA_HEADER_LEN + NONCE_LEN..a.len() - HMAC_LEN],
            &b[DATA_HEADER_LEN + NONCE_LEN..b.len() - HMAC_LEN]
        );
    }

    #[test]
    fn test_generate_key() {
        let key = generate_key(32);
        assert_eq!(key.len(), 32);
        assert!(key.chars().all(|c| c.is_ascii_alphanumeric()));

        assert_ne!(generate_key(32), generate_key(32));
    }
}
