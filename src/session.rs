//! 세션 상태
//!
//! 페이즈 머신 + 진행 카운터. 다른 태스크가 락 없이 읽을 수 있도록
//! 전부 원자 필드로 구성한다. 페이즈 전이는 전진만 허용하고, 어느
//! 페이즈에서든 ERROR로는 갈 수 있다.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// 세션 페이즈
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Phase {
    Init = 0,
    Handshake = 1,
    Transfer = 2,
    Verification = 3,
    Completed = 4,
    Error = 5,
}

impl Phase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Phase::Init,
            1 => Phase::Handshake,
            2 => Phase::Transfer,
            3 => Phase::Verification,
            4 => Phase::Completed,
            _ => Phase::Error,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Error)
    }
}

/// 진행 상황 스냅샷
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub phase: Phase,
    pub completed_chunks: u32,
    pub total_chunks: u32,
    pub bytes_transferred: u64,
    pub retry_count: u32,
    pub throughput_bps: f64,
    pub error: Option<String>,
}

impl ProgressSnapshot {
    pub fn progress(&self) -> f64 {
        if self.total_chunks == 0 {
            return 1.0;
        }
        self.completed_chunks as f64 / self.total_chunks as f64
    }
}

/// 세션 상태 (엔진과 관찰자가 공유)
pub struct SessionState {
    phase: AtomicU8,
    completed_chunks: AtomicU32,
    total_chunks: AtomicU32,
    bytes_transferred: AtomicU64,
    retry_count: AtomicU32,

    start: Instant,
    /// 마지막 진행 시각 (start 기준 마이크로초) - 정지 감지용
    last_progress_us: AtomicU64,

    error: Mutex<String>,
    terminal_notify: Notify,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(Phase::Init as u8),
            completed_chunks: AtomicU32::new(0),
            total_chunks: AtomicU32::new(0),
            bytes_transferred: AtomicU64::new(0),
            retry_count: AtomicU32::new(0),
            start: Instant::now(),
            last_progress_us: AtomicU64::new(0),
            error: Mutex::new(String::new()),
            terminal_notify: Notify::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// 페이즈 전진. 역방향 전이는 무시된다 (ERROR 제외).
    pub fn advance(&self, phase: Phase) {
        let mut current = self.phase.load(Ordering::SeqCst);
        while phase as u8 > current {
            match self.phase.compare_exchange(
                current,
                phase as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        if phase.is_terminal() {
            self.terminal_notify.notify_waiters();
        }
    }

    /// 에러 기록 + ERROR 페이즈 전이
    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        {
            let mut error = self.error.lock();
            if error.is_empty() {
                *error = message;
            }
        }
        self.advance(Phase::Error);
    }

    pub fn error(&self) -> Option<String> {
        let error = self.error.lock();
        if error.is_empty() {
            None
        } else {
            Some(error.clone())
        }
    }

    pub fn set_total_chunks(&self, total: u32) {
        self.total_chunks.store(total, Ordering::SeqCst);
    }

    pub fn set_completed_chunks(&self, completed: u32) {
        self.completed_chunks.store(completed, Ordering::SeqCst);
    }

    /// 전송 바이트 누적 + 진행 시각 갱신
    pub fn add_bytes_transferred(&self, bytes: u64) {
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
        self.touch_progress();
    }

    /// 진행 시각만 갱신 (heartbeat 등)
    pub fn touch_progress(&self) {
        let us = self.start.elapsed().as_micros() as u64;
        self.last_progress_us.store(us, Ordering::Relaxed);
    }

    /// 마지막 진행 이후 경과 (밀리초)
    pub fn millis_since_progress(&self) -> u64 {
        let last = self.last_progress_us.load(Ordering::Relaxed);
        let now = self.start.elapsed().as_micros() as u64;
        now.saturating_sub(last) / 1000
    }

    pub fn increment_retry(&self) {
        self.retry_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::Relaxed)
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::Relaxed)
    }

    /// 진행 스냅샷 (락 없는 읽기)
    pub fn snapshot(&self) -> ProgressSnapshot {
        let elapsed = self.start.elapsed().as_secs_f64();
        let bytes = self.bytes_transferred();

        ProgressSnapshot {
            phase: self.phase(),
            completed_chunks: self.completed_chunks.load(Ordering::SeqCst),
            total_chunks: self.total_chunks.load(Ordering::SeqCst),
            bytes_transferred: bytes,
            retry_count: self.retry_count(),
            throughput_bps: if elapsed > 0.0 {
                bytes as f64 / elapsed
            } else {
                0.0
            },
            error: self.error(),
        }
    }

    /// 종료 페이즈(COMPLETED/ERROR) 도달까지 대기
    pub async fn wait_until_terminal(&self) -> Phase {
        loop {
            let phase = self.phase();
            if phase.is_terminal() {
                return phase;
            }

            let notified = self.terminal_notify.notified();
            if self.phase().is_terminal() {
                return self.phase();
            }
            notified.await;
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_one_way() {
        let state = SessionState::new();
        assert_eq!(state.phase(), Phase::Init);

        state.advance(Phase::Transfer);
        assert_eq!(state.phase(), Phase::Transfer);

        // 역방향 전이는 무시
        state.advance(Phase::Handshake);
        assert_eq!(state.phase(), Phase::Transfer);

        state.advance(Phase::Completed);
        assert_eq!(state.phase(), Phase::Completed);
    }

    #[test]
    fn test_fail_from_any_phase() {
        let state = SessionState::new();
        state.advance(Phase::Handshake);
        state.fail("handshake timed out");

        assert_eq!(state.phase(), Phase::Error);
        assert_eq!(state.error().as_deref(), Some("handshake timed out"));

        // 첫 에러 메시지 유지
        state.fail("second error");
        assert_eq!(state.error().as_deref(), Some("handshake timed out"));
    }

    #[test]
    fn test_snapshot_progress() {
        let state = SessionState::new();
        state.set_total_chunks(4);
        state.set_completed_chunks(1);
        state.add_bytes_transferred(1000);

        let snap = state.snapshot();
        assert_eq!(snap.completed_chunks, 1);
        assert_eq!(snap.bytes_transferred, 1000);
        assert!((snap.progress() - 0.25).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_wait_until_terminal() {
        let state = std::sync::Arc::new(SessionState::new());

        let waiter = state.clone();
        let handle = tokio::spawn(async move { waiter.wait_until_terminal().await });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        state.advance(Phase::Completed);

        assert_eq!(handle.await.unwrap(), Phase::Completed);
    }
}
