//! meshblob 배포자 - UDP 위의 BLOB 배포
//!
//! NACK 기반 블록 전송 프로토콜로 파일을 수신 노드 집합에 밀어 넣는다.
//! 메시 주소는 커맨드라인에서 준 정적 피어 테이블로 UDP 엔드포인트에
//! 매핑된다.
//!
//! 사용법:
//!   cargo run --release --bin meshblob-distributor -- [OPTIONS]
//!
//! 예시:
//!   cargo run --release --bin meshblob-distributor -- \
//!       --file firmware.bin --peer 0x0001=127.0.0.1:9001 --peer 0x0002=127.0.0.1:9002

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use meshblob::{
    Addr, ClientEvent, DfdPhase, DfdSrv, Message, TransferInputs, Transport, XferMode,
};
use meshblob::config::ProtocolConfig;
use meshblob::dfd::DistributionParams;

struct DistributorConfig {
    bind_addr: SocketAddr,
    file: Option<PathBuf>,
    peers: Vec<(Addr, SocketAddr)>,
    mode: XferMode,
    group: Option<Addr>,
    ttl: u8,
    timeout_base: u16,
    apply: bool,
    lossy: bool,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9000".parse().unwrap(),
            file: None,
            peers: Vec::new(),
            mode: XferMode::Push,
            group: None,
            ttl: 7,
            timeout_base: 1,
            apply: false,
            lossy: false,
        }
    }
}

fn parse_addr(s: &str) -> Addr {
    let s = s.trim_start_matches("0x");
    u16::from_str_radix(s, 16).expect("메시 주소는 16진수 필요, 예: 0x0001")
}

fn parse_args() -> DistributorConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = DistributorConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    config.bind_addr = args[i + 1].parse().expect("유효한 바인드 주소 필요");
                    i += 1;
                }
            }
            "--file" | "-f" => {
                if i + 1 < args.len() {
                    config.file = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--peer" | "-p" => {
                if i + 1 < args.len() {
                    let (addr, sock) = args[i + 1]
                        .split_once('=')
                        .expect("피어 형식: <메시주소>=<ip:port>");
                    config
                        .peers
                        .push((parse_addr(addr), sock.parse().expect("유효한 피어 엔드포인트 필요")));
                    i += 1;
                }
            }
            "--mode" | "-m" => {
                if i + 1 < args.len() {
                    config.mode = match args[i + 1].as_str() {
                        "push" => XferMode::Push,
                        "pull" => XferMode::Pull,
                        other => panic!("알 수 없는 모드: {other}"),
                    };
                    i += 1;
                }
            }
            "--group" | "-g" => {
                if i + 1 < args.len() {
                    config.group = Some(parse_addr(&args[i + 1]));
                    i += 1;
                }
            }
            "--ttl" => {
                if i + 1 < args.len() {
                    config.ttl = args[i + 1].parse().expect("유효한 ttl 필요");
                    i += 1;
                }
            }
            "--timeout-base" => {
                if i + 1 < args.len() {
                    config.timeout_base = args[i + 1].parse().expect("유효한 타임아웃 베이스 필요");
                    i += 1;
                }
            }
            "--apply" | "-a" => {
                config.apply = true;
            }
            "--lossy" => {
                config.lossy = true;
            }
            "--help" | "-h" => {
                println!(
                    r#"meshblob 배포자 - UDP 위의 BLOB 배포

NACK 기반 블록 전송으로 파일을 수신 노드 집합에 밀어 넣는다.

사용법:
  cargo run --release --bin meshblob-distributor -- [OPTIONS]

옵션:
  -b, --bind <ADDR>        로컬 바인드 주소 (기본: 0.0.0.0:9000)
  -f, --file <PATH>        배포할 파일 (필수)
  -p, --peer <A>=<EP>      수신 노드 메시 주소와 UDP 엔드포인트, 반복 가능
  -m, --mode <push|pull>   전달 모드 (기본: push)
  -g, --group <ADDR>       청크를 멀티캐스트할 그룹 주소
      --ttl <N>            time to live (기본: 7)
      --timeout-base <N>   타임아웃 베이스 배율 (기본: 1)
  -a, --apply              전송 성공 후 대상에서 적용
      --lossy              손실 많은 메시용 재시도 파라미터 사용
  -h, --help               이 도움말 출력

예시:
  cargo run --release --bin meshblob-distributor -- \
      --file firmware.bin --peer 0x0001=127.0.0.1:9001 --peer 0x0002=127.0.0.1:9002"#
                );
                std::process::exit(0);
            }
            other => {
                eprintln!("알 수 없는 옵션: {other} (--help 참고)");
                std::process::exit(1);
            }
        }
        i += 1;
    }

    config
}

/// 메시 주소를 UDP 엔드포인트에 매핑한다. 그룹 주소는 메시 멀티캐스트
/// 대신 모든 피어에게 청크를 뿌린다
struct UdpTransport {
    socket: Arc<UdpSocket>,
    peers: Arc<DashMap<Addr, SocketAddr>>,
    group: Option<Addr>,
}

impl Transport for UdpTransport {
    fn send(&mut self, dst: Addr, msg: &Message) -> meshblob::Result<()> {
        let bytes = msg.to_bytes();
        if Some(dst) == self.group {
            for peer in self.peers.iter() {
                let _ = self.socket.try_send_to(&bytes, *peer.value());
            }
            return Ok(());
        }
        let Some(peer) = self.peers.get(&dst) else {
            return Err(meshblob::Error::NotFound);
        };
        self.socket.try_send_to(&bytes, *peer.value())?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = parse_args();
    let Some(file) = config.file.clone() else {
        eprintln!("--file이 필요합니다 (--help 참고)");
        std::process::exit(1);
    };
    if config.peers.is_empty() {
        eprintln!("--peer가 최소 하나 필요합니다 (--help 참고)");
        std::process::exit(1);
    }

    let socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);
    info!(addr = %socket.local_addr()?, "배포자 수신 대기");

    let peers: Arc<DashMap<Addr, SocketAddr>> = Arc::new(DashMap::new());
    for (addr, endpoint) in &config.peers {
        peers.insert(*addr, *endpoint);
    }

    let transport = UdpTransport {
        socket: Arc::clone(&socket),
        peers: Arc::clone(&peers),
        group: config.group,
    };
    let protocol = if config.lossy {
        ProtocolConfig::lossy_mesh()
    } else {
        ProtocolConfig::default()
    };
    let mut dfd = DfdSrv::new(transport, protocol);

    let data = std::fs::read(&file)?;
    info!(file = %file.display(), size = data.len(), "이미지 로드됨");

    // 일반 파일에는 펌웨어 매니페스트가 없다. 동시 실행을 구분하는
    // 데는 랜덤 id면 충분하다
    let fwid: [u8; 8] = rand::random();
    let slot = dfd.slot_add(fwid.to_vec(), Bytes::from(data), Vec::new())?;

    for (addr, _) in &config.peers {
        dfd.receivers_add(*addr, 0);
    }

    let inputs = TransferInputs {
        group: config.group,
        app_key_idx: 0,
        ttl: config.ttl,
        timeout_base: config.timeout_base,
    };

    // 주기적 진행률 보고
    let progress = Arc::new(RwLock::new(0u8));
    {
        let progress = Arc::clone(&progress);
        tokio::spawn(async move {
            let mut last = 0u8;
            loop {
                tokio::time::sleep(Duration::from_secs(2)).await;
                let now = *progress.read();
                if now != last {
                    info!(progress = now, "전송 진행률");
                    last = now;
                }
            }
        });
    }

    let status = dfd.start(
        DistributionParams {
            slot_idx: slot,
            mode: config.mode,
            apply_on_success: config.apply,
            inputs,
        },
        Instant::now(),
    );
    if status != meshblob::DfdStatus::Success {
        eprintln!("배포 시작 실패: {status:?}");
        std::process::exit(1);
    }

    let mut buf = vec![0u8; 65536];
    loop {
        let now = Instant::now();
        let wake = dfd
            .next_timeout()
            .unwrap_or(now + Duration::from_millis(100));
        let sleep = tokio::time::sleep(wake.saturating_duration_since(now));

        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (len, src) = received?;
                let Some(from) = peers.iter().find(|p| *p.value() == src).map(|p| *p.key()) else {
                    warn!(%src, "모르는 엔드포인트에서 온 패킷");
                    continue;
                };
                let Some(msg) = Message::from_bytes(&buf[..len]) else {
                    continue;
                };
                dfd.handle_message(from, msg, Instant::now());
            }
            _ = sleep => {
                dfd.poll(Instant::now());
            }
        }

        *progress.write() = dfd.progress();
        while let Some(event) = dfd.poll_event() {
            match event {
                ClientEvent::LostTarget { addr } => warn!(addr, "대상 손실"),
                ClientEvent::End { success } => {
                    info!(success, "배포 종료: {}", dfd.stats().summary());
                }
                _ => {}
            }
        }

        match dfd.phase() {
            DfdPhase::Completed | DfdPhase::Failed | DfdPhase::Cancelled => break,
            _ => {}
        }
    }

    let failed = matches!(dfd.phase(), DfdPhase::Failed);
    if failed {
        std::process::exit(1);
    }
    Ok(())
}
