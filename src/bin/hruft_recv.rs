//! HRUFT 수신 바이너리
//!
//! 사용법:
//!   cargo run --release --bin hruft_recv -- --file <PATH> [OPTIONS]
//!
//! 예시:
//!   # 기본 수신 (컨트롤 포트 10000에서 대기)
//!   cargo run --release --bin hruft_recv -- -f received.bin
//!
//!   # 암호화 수신
//!   cargo run --release --bin hruft_recv -- -f received.bin -k MySecretKey123

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use hruft::platform::format_bytes;
use hruft::{Receiver, SessionConfig};

struct RecvArgs {
    file: Option<PathBuf>,
    config: SessionConfig,
}

fn parse_args() -> RecvArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = RecvArgs {
        file: None,
        config: SessionConfig::default(),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--file" | "-f" => {
                if i + 1 < args.len() {
                    parsed.file = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    parsed.config.control_port = args[i + 1].parse().expect("유효한 포트 필요");
                    i += 1;
                }
            }
            "--data-port" => {
                if i + 1 < args.len() {
                    parsed.config.local_data_port = args[i + 1].parse().expect("유효한 포트 필요");
                    i += 1;
                }
            }
            "--sockets" => {
                if i + 1 < args.len() {
                    parsed.config.data_sockets = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--handshake-timeout" => {
                if i + 1 < args.len() {
                    parsed.config.handshake_timeout_ms =
                        args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--encrypt-key" | "-k" => {
                if i + 1 < args.len() {
                    parsed.config.encryption_key = args[i + 1].clone();
                    parsed.config.enable_encryption = true;
                    i += 1;
                }
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                eprintln!("알 수 없는 옵션: {}", other);
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    parsed
}

fn print_usage() {
    println!(
        r#"HRUFT Recv - High-Rate UDP File Transfer 수신측

사용법:
  cargo run --release --bin hruft_recv -- --file <PATH> [OPTIONS]

옵션:
  -f, --file <PATH>          저장할 파일 경로 (필수)
  -p, --port <PORT>          컨트롤 포트 (기본: 10000)
  --data-port <PORT>         데이터 포트 베이스 (기본: 10001)
  --sockets <N>              데이터 소켓 수 (기본: 4)
  --handshake-timeout <MS>   SYN 대기 시간 (기본: 5000)
  -k, --encrypt-key <KEY>    사전 공유키 (지정 시 암호화 활성)
  -h, --help                 이 도움말 출력

수신 완료 후 검증이 끝나면 <PATH>.tmp가 <PATH>로 개명된다.
"#
    );
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = parse_args();
    let Some(file) = args.file else {
        eprintln!("--file 필요");
        print_usage();
        std::process::exit(1);
    };

    info!("HRUFT Recv starting...");
    info!("Output: {:?}", file);
    info!("Control port: {}", args.config.control_port);

    let start = Instant::now();
    let receiver = match Receiver::start(args.config, &file).await {
        Ok(r) => r,
        Err(e) => {
            error!("세션 시작 실패: {}", e);
            std::process::exit(1);
        }
    };

    // 진행률 로깅 (2초마다)
    let mut last_progress = Instant::now();
    loop {
        tokio::time::sleep(Duration::from_millis(200)).await;

        let snap = receiver.snapshot();
        if snap.phase.is_terminal() {
            break;
        }

        if last_progress.elapsed() > Duration::from_secs(2) {
            info!(
                "Progress: {}/{} chunks ({:.1}%), {} received, {}/s",
                snap.completed_chunks,
                snap.total_chunks,
                snap.progress() * 100.0,
                format_bytes(snap.bytes_transferred),
                format_bytes(snap.throughput_bps as u64)
            );
            last_progress = Instant::now();
        }
    }

    let result = receiver.wait_for_completion().await;
    let snap = receiver.snapshot();
    receiver.stop().await;

    match result {
        Ok(()) => {
            let elapsed = start.elapsed();
            info!("수신 완료!");
            info!("  Time: {:.2}s", elapsed.as_secs_f64());
            info!("  Bytes: {}", format_bytes(snap.bytes_transferred));
            info!("  File: {:?}", file);
            Ok(())
        }
        Err(e) => {
            error!("수신 실패: {}", e);
            std::process::exit(1);
        }
    }
}
