//! 슬라이딩 윈도우
//!
//! 동시 전송 청크 수를 제한하는 고정 용량 슬롯 집합. 청크 ID는 윈도우가
//! 0부터 단조 증가로 배정한다 (워커는 ID를 고르지 않는다).
//!
//! 재전송 의도의 단일 출처: 슬롯이 needs_retransmit 플래그와 누락 패킷
//! 목록을 들고, 재전송 워커가 윈도우에서 후보를 가져간다.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

/// 슬롯 재활용 기준 재시도 횟수
const RECLAIM_RETRY_LIMIT: u32 = 3;

/// 윈도우 전역 긴급 플래그 기준 재시도 횟수
const URGENT_RETRY_LIMIT: u32 = 5;

/// 청크당 최대 대기 재전송 패킷 수
const MAX_PENDING_RETRANSMITS: usize = 100;

/// 윈도우 슬롯
#[derive(Debug, Clone)]
pub struct WindowSlot {
    pub chunk_id: u32,
    pub send_time: Instant,
    pub acknowledged: bool,
    pub needs_retransmit: bool,
    pub missing_packets: Vec<u32>,
    pub retry_count: u32,
}

struct Inner {
    slots: Vec<WindowSlot>,
    in_flight: HashSet<u32>,
    completed: HashSet<u32>,
    next_chunk_id: u32,
    urgent: bool,
}

/// 송신측 슬라이딩 윈도우
pub struct SlidingWindow {
    capacity: usize,
    total_chunks: u32,
    inner: Mutex<Inner>,
}

impl SlidingWindow {
    pub fn new(capacity: usize, total_chunks: u32) -> Self {
        Self {
            capacity,
            total_chunks,
            inner: Mutex::new(Inner {
                slots: Vec::with_capacity(capacity),
                in_flight: HashSet::new(),
                completed: HashSet::new(),
                next_chunk_id: 0,
                urgent: false,
            }),
        }
    }

    /// 슬롯 획득 시도
    ///
    /// 배정된 청크 ID를 반환한다. 전 청크를 배정했으면 None (소진),
    /// 윈도우가 가득 찼으면 재시도 과다 슬롯 하나를 회수해 본 뒤 None.
    pub fn try_acquire_slot(&self) -> Option<u32> {
        let mut inner = self.inner.lock();

        if inner.next_chunk_id >= self.total_chunks {
            return None;
        }

        if inner.in_flight.len() >= self.capacity {
            // 재시도 과다 슬롯의 기회적 회수
            let stuck = inner
                .slots
                .iter()
                .find(|s| s.needs_retransmit && s.retry_count > RECLAIM_RETRY_LIMIT)
                .map(|s| s.chunk_id);

            if let Some(chunk_id) = stuck {
                debug!("윈도우 회수: 청크 {} (재시도 과다)", chunk_id);
                complete_locked(&mut inner, chunk_id);
            }

            if inner.in_flight.len() >= self.capacity {
                return None;
            }
        }

        let chunk_id = inner.next_chunk_id;
        inner.next_chunk_id += 1;

        inner.slots.push(WindowSlot {
            chunk_id,
            send_time: Instant::now(),
            acknowledged: false,
            needs_retransmit: false,
            missing_packets: Vec::new(),
            retry_count: 0,
        });
        inner.in_flight.insert(chunk_id);

        Some(chunk_id)
    }

    /// 재전송 표시
    ///
    /// 누락 목록을 슬롯에 누적하고 재시도 횟수를 올린다.
    /// 횟수가 한계를 넘으면 윈도우 전역 긴급 플래그를 세운다.
    pub fn mark_for_retransmit(&self, chunk_id: u32, missing_packets: &[u32]) {
        let mut inner = self.inner.lock();

        let mut set_urgent = false;
        if let Some(slot) = inner.slots.iter_mut().find(|s| s.chunk_id == chunk_id) {
            slot.needs_retransmit = true;
            slot.missing_packets.extend_from_slice(missing_packets);
            slot.missing_packets.sort_unstable();
            slot.missing_packets.dedup();
            slot.missing_packets.truncate(MAX_PENDING_RETRANSMITS);
            slot.retry_count += 1;

            if slot.retry_count > URGENT_RETRY_LIMIT {
                set_urgent = true;
            }
        }

        if set_urgent {
            inner.urgent = true;
        }
    }

    /// 강제 완료 (확인 수신 또는 데드락 복구)
    pub fn force_complete(&self, chunk_id: u32) {
        let mut inner = self.inner.lock();
        complete_locked(&mut inner, chunk_id);
    }

    /// 타임아웃 슬롯 검사
    ///
    /// 미확인이고 재전송 표시도 없는 채로 타임아웃을 넘긴 청크 ID 목록
    pub fn check_timeouts(&self, timeout: Duration) -> Vec<u32> {
        let now = Instant::now();
        let inner = self.inner.lock();

        inner
            .slots
            .iter()
            .filter(|s| {
                !s.acknowledged
                    && !s.needs_retransmit
                    && now.duration_since(s.send_time) > timeout
            })
            .map(|s| s.chunk_id)
            .collect()
    }

    /// 재전송 후보 인출
    ///
    /// 표시된 슬롯의 누락 목록을 비우면서 가져간다. 재시도 횟수는 유지.
    pub fn take_retransmit_candidates(&self) -> Vec<(u32, Vec<u32>)> {
        let mut inner = self.inner.lock();
        let mut candidates = Vec::new();

        for slot in inner.slots.iter_mut() {
            if slot.needs_retransmit && !slot.missing_packets.is_empty() {
                candidates.push((slot.chunk_id, std::mem::take(&mut slot.missing_packets)));
                slot.needs_retransmit = false;
            }
        }

        candidates
    }

    /// 재전송 의도 전체 해제 (데드락 복구)
    pub fn clear_retransmits(&self) {
        let mut inner = self.inner.lock();
        for slot in inner.slots.iter_mut() {
            slot.needs_retransmit = false;
            slot.missing_packets.clear();
        }
        inner.urgent = false;
    }

    /// 슬롯 전송 시간 갱신 (재전송 직후)
    pub fn touch(&self, chunk_id: u32) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.slots.iter_mut().find(|s| s.chunk_id == chunk_id) {
            slot.send_time = Instant::now();
        }
    }

    pub fn available_slots(&self) -> usize {
        let inner = self.inner.lock();
        self.capacity - inner.in_flight.len()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    pub fn completed(&self) -> u32 {
        self.inner.lock().completed.len() as u32
    }

    /// 전 청크 완료 여부
    pub fn is_all_completed(&self) -> bool {
        self.completed() >= self.total_chunks
    }

    /// 전 청크 ID 배정 완료 여부
    pub fn is_exhausted(&self) -> bool {
        self.inner.lock().next_chunk_id >= self.total_chunks
    }

    pub fn is_urgent(&self) -> bool {
        self.inner.lock().urgent
    }
}

fn complete_locked(inner: &mut Inner, chunk_id: u32) {
    if inner.in_flight.remove(&chunk_id) {
        inner.completed.insert(chunk_id);
        inner.slots.retain(|s| s.chunk_id != chunk_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_monotonic_and_bounded() {
        let window = SlidingWindow::new(4, 100);

        for expected in 0..4 {
            assert_eq!(window.try_acquire_slot(), Some(expected));
        }

        // 윈도우 포화
        assert_eq!(window.try_acquire_slot(), None);
        assert!(window.in_flight() <= 4);

        window.force_complete(0);
        assert_eq!(window.try_acquire_slot(), Some(4));
    }

    #[test]
    fn test_exhaustion() {
        let window = SlidingWindow::new(8, 2);
        assert_eq!(window.try_acquire_slot(), Some(0));
        assert_eq!(window.try_acquire_slot(), Some(1));
        assert_eq!(window.try_acquire_slot(), None);

        window.force_complete(0);
        window.force_complete(1);
        assert!(window.is_all_completed());
        assert_eq!(window.try_acquire_slot(), None);
    }

    #[test]
    fn test_reclaim_stuck_slot() {
        let window = SlidingWindow::new(2, 10);
        window.try_acquire_slot().unwrap();
        window.try_acquire_slot().unwrap();
        assert_eq!(window.try_acquire_slot(), None);

        // 재시도 4회 → 회수 대상
        for _ in 0..4 {
            window.mark_for_retransmit(0, &[1, 2]);
        }

        assert_eq!(window.try_acquire_slot(), Some(2));
        assert_eq!(window.completed(), 1);
    }

    #[test]
    fn test_urgent_flag() {
        let window = SlidingWindow::new(4, 10);
        window.try_acquire_slot().unwrap();

        for _ in 0..5 {
            window.mark_for_retransmit(0, &[0]);
        }
        assert!(!window.is_urgent());

        window.mark_for_retransmit(0, &[0]);
        assert!(window.is_urgent());
    }

    #[test]
    fn test_take_retransmit_candidates() {
        let window = SlidingWindow::new(4, 10);
        window.try_acquire_slot().unwrap();
        window.try_acquire_slot().unwrap();

        window.mark_for_retransmit(0, &[3, 1, 3]);
        window.mark_for_retransmit(1, &[7]);

        let mut candidates = window.take_retransmit_candidates();
        candidates.sort_by_key(|(id, _)| *id);

        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0], (0, vec![1, 3]));
        assert_eq!(candidates[1], (1, vec![7]));

        // 인출 후에는 비어 있다
        assert!(window.take_retransmit_candidates().is_empty());
    }

    #[test]
    fn test_pending_cap() {
        let window = SlidingWindow::new(4, 10);
        window.try_acquire_slot().unwrap();

        let many: Vec<u32> = (0..500).collect();
        window.mark_for_retransmit(0, &many);

        let candidates = window.take_retransmit_candidates();
        assert_eq!(candidates[0].1.len(), 100);
    }

    #[test]
    fn test_check_timeouts() {
        let window = SlidingWindow::new(4, 10);
        window.try_acquire_slot().unwrap();
        window.try_acquire_slot().unwrap();

        // 아직 타임아웃 전
        assert!(window.check_timeouts(Duration::from_secs(60)).is_empty());

        std::thread::sleep(Duration::from_millis(20));
        let timed_out = window.check_timeouts(Duration::from_millis(10));
        assert_eq!(timed_out, vec![0, 1]);

        // 재전송 표시된 슬롯은 타임아웃 목록에서 빠진다
        window.mark_for_retransmit(0, &[1]);
        assert_eq!(window.check_timeouts(Duration::from_millis(10)), vec![1]);
    }
}
