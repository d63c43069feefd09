//! 플랫폼 추상화
//!
//! 코어가 소비하는 얇은 능력 계층: 여유 공간 조회, 임시 디렉터리,
//! 할당 가능성 테스트. 환경 변수는 읽지 않는다.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;

/// 경로가 속한 파일시스템의 여유 공간 (바이트)
pub fn free_disk_space(path: &Path) -> Result<u64> {
    Ok(fs2::available_space(path)?)
}

/// 임시 디렉터리
pub fn temp_directory() -> PathBuf {
    std::env::temp_dir()
}

/// 실제 할당 가능성 테스트
///
/// 지정 디렉터리에 테스트 파일을 만들어 크기를 잡아 본다.
/// 읽기 전용이거나 가득 찬 디스크를 미리 걸러낸다.
pub fn can_allocate(dir: &Path, bytes: u64) -> bool {
    let test_path = dir.join("hruft_space_test.tmp");

    let ok = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&test_path)
        .and_then(|f| f.set_len(bytes))
        .is_ok();

    if let Err(e) = std::fs::remove_file(&test_path) {
        debug!("테스트 파일 삭제 실패: {}", e);
    }

    ok
}

/// 바이트 수를 읽기 좋은 문자열로
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    format!("{:.2} {}", value, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(4 * 1024 * 1024), "4.00 MB");
    }

    #[test]
    fn test_free_disk_space() {
        let free = free_disk_space(&temp_directory()).unwrap();
        assert!(free > 0);
    }

    #[test]
    fn test_can_allocate_small() {
        let dir = tempfile::tempdir().unwrap();
        assert!(can_allocate(dir.path(), 1024 * 1024));
    }

    #[test]
    fn test_can_allocate_readonly_dir_fails() {
        assert!(!can_allocate(Path::new("/nonexistent-hruft-dir"), 1024));
    }
}
