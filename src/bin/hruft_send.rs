//! HRUFT 송신 바이너리
//!
//! 사용법:
//!   cargo run --release --bin hruft_send -- --remote <IP> --file <PATH> [OPTIONS]
//!
//! 예시:
//!   # 기본 송신
//!   cargo run --release --bin hruft_send -- -r 192.168.0.10 -f big.bin
//!
//!   # 암호화 송신
//!   cargo run --release --bin hruft_send -- -r 192.168.0.10 -f big.bin -k MySecretKey123

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use hruft::platform::format_bytes;
use hruft::{Sender, SessionConfig};

struct SendArgs {
    file: Option<PathBuf>,
    config: SessionConfig,
}

fn parse_args() -> SendArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = SendArgs {
        file: None,
        config: SessionConfig::default(),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--remote" | "-r" => {
                if i + 1 < args.len() {
                    parsed.config.remote_host = args[i + 1].clone();
                    i += 1;
                }
            }
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
            "--remote-data-port" => {
                if i + 1 < args.len() {
                    parsed.config.remote_data_port =
                        args[i + 1].parse().expect("유효한 포트 필요");
                    i += 1;
                }
            }
            "--sockets" => {
                if i + 1 < args.len() {
                    parsed.config.data_sockets = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--chunk-size" | "-c" => {
                if i + 1 < args.len() {
                    parsed.config.chunk_size_mb = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--window" | "-w" => {
                if i + 1 < args.len() {
                    parsed.config.window_size = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--workers" | "-t" => {
                if i + 1 < args.len() {
                    parsed.config.worker_threads = args[i + 1].parse().expect("유효한 숫자 필요");
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
            "--gen-key" => {
                println!("{}", hruft::crypto::generate_key(32));
                std::process::exit(0);
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
        r#"HRUFT Send - High-Rate UDP File Transfer 송신측

사용법:
  cargo run --release --bin hruft_send -- --remote <IP> --file <PATH> [OPTIONS]

옵션:
  -r, --remote <IP>          수신측 주소 (필수)
  -f, --file <PATH>          보낼 파일 (필수)
  -p, --port <PORT>          수신측 컨트롤 포트 (기본: 10000)
  --data-port <PORT>         로컬 데이터 포트 베이스 (기본: 10001)
  --remote-data-port <PORT>  수신측 데이터 포트 베이스 (기본: 10001)
  --sockets <N>              데이터 소켓 수 (기본: 4)
  -c, --chunk-size <MB>      청크 크기 (1 ~ 1024, 기본: 4)
  -w, --window <N>           윈도우 크기 (1 ~ 256, 기본: 16)
  -t, --workers <N>          워커 수 (1 ~ 64, 기본: 8)
  -k, --encrypt-key <KEY>    사전 공유키 (지정 시 암호화 활성)
  --gen-key                  랜덤 키 생성 후 종료
  -h, --help                 이 도움말 출력

예시:
  # 100MB 파일을 32청크 윈도우로 송신
  cargo run --release --bin hruft_send -- -r 192.168.0.10 -f data.bin -w 32
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

    info!("HRUFT Send starting...");
    info!("File: {:?}", file);
    info!(
        "Remote: {}:{}",
        args.config.remote_host, args.config.control_port
    );

    let start = Instant::now();
    let sender = Sender::start(args.config, &file).await?;

    // 진행률 로깅 (2초마다)
    let mut last_progress = Instant::now();
    loop {
        tokio::time::sleep(Duration::from_millis(200)).await;

        let snap = sender.snapshot();
        if snap.phase.is_terminal() {
            break;
        }

        if last_progress.elapsed() > Duration::from_secs(2) {
            info!(
                "Progress: {}/{} chunks ({:.1}%), {} sent, {}/s, retries: {}",
                snap.completed_chunks,
                snap.total_chunks,
                snap.progress() * 100.0,
                format_bytes(snap.bytes_transferred),
                format_bytes(snap.throughput_bps as u64),
                snap.retry_count
            );
            last_progress = Instant::now();
        }
    }

    let result = sender.wait_for_completion().await;
    let snap = sender.snapshot();
    sender.stop().await;

    match result {
        Ok(()) => {
            let elapsed = start.elapsed();
            info!("전송 완료!");
            info!("  Time: {:.2}s", elapsed.as_secs_f64());
            info!("  Bytes: {}", format_bytes(snap.bytes_transferred));
            info!(
                "  Throughput: {}/s",
                format_bytes((snap.bytes_transferred as f64 / elapsed.as_secs_f64().max(0.001)) as u64)
            );
            info!("  Retries: {}", snap.retry_count);
            Ok(())
        }
        Err(e) => {
            error!("전송 실패: {}", e);
            std::process::exit(1);
        }
    }
}
