//! meshblob 노드 - UDP 위의 BLOB 수신기
//!
//! 배포자로부터 BLOB을 한 번에 하나씩 받아 디스크에 쓴다. 메시 주소는
//! 정적 피어 테이블로 UDP 엔드포인트에 매핑되고, 들어오는 전송 시작이
//! 해당 전송 id의 수신을 준비시킨다.
//!
//! 사용법:
//!   cargo run --release --bin meshblob-node -- [OPTIONS]
//!
//! 예시:
//!   cargo run --release --bin meshblob-node -- \
//!       --bind 0.0.0.0:9001 --peer 0x0100=127.0.0.1:9000 --output image.bin

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use meshblob::config::ProtocolConfig;
use meshblob::{
    Addr, BlobSrv, Capabilities, FileBlob, Message, SrvEvent, Transport,
};

struct NodeConfig {
    bind_addr: SocketAddr,
    peers: Vec<(Addr, SocketAddr)>,
    output: PathBuf,
    max_size: u32,
    lossy: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9001".parse().unwrap(),
            peers: Vec::new(),
            output: PathBuf::from("received.bin"),
            max_size: 512 * 1024,
            lossy: false,
        }
    }
}

fn parse_addr(s: &str) -> Addr {
    let s = s.trim_start_matches("0x");
    u16::from_str_radix(s, 16).expect("메시 주소는 16진수 필요, 예: 0x0100")
}

fn parse_args() -> NodeConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = NodeConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    config.bind_addr = args[i + 1].parse().expect("유효한 바인드 주소 필요");
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
            "--output" | "-o" => {
                if i + 1 < args.len() {
                    config.output = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--max-size" => {
                if i + 1 < args.len() {
                    config.max_size = args[i + 1].parse().expect("유효한 크기 필요");
                    i += 1;
                }
            }
            "--lossy" => {
                config.lossy = true;
            }
            "--help" | "-h" => {
                println!(
                    r#"meshblob 노드 - UDP 위의 BLOB 수신기

BLOB을 한 번에 하나씩 받아 디스크에 쓴다.

사용법:
  cargo run --release --bin meshblob-node -- [OPTIONS]

옵션:
  -b, --bind <ADDR>      로컬 바인드 주소 (기본: 0.0.0.0:9001)
  -p, --peer <A>=<EP>    배포자 메시 주소와 UDP 엔드포인트, 반복 가능
  -o, --output <PATH>    수신한 blob 저장 경로 (기본: received.bin)
      --max-size <N>     수락할 최대 blob 크기, 바이트 (기본: 524288)
      --lossy            손실 많은 메시용 ack 파라미터 사용
  -h, --help             이 도움말 출력"#
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

struct UdpTransport {
    socket: Arc<UdpSocket>,
    peers: Arc<DashMap<Addr, SocketAddr>>,
}

impl Transport for UdpTransport {
    fn send(&mut self, dst: Addr, msg: &Message) -> meshblob::Result<()> {
        let Some(peer) = self.peers.get(&dst) else {
            return Err(meshblob::Error::NotFound);
        };
        self.socket.try_send_to(&msg.to_bytes(), *peer.value())?;
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
    if config.peers.is_empty() {
        eprintln!("--peer가 최소 하나 필요합니다 (--help 참고)");
        std::process::exit(1);
    }

    let socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);
    info!(addr = %socket.local_addr()?, "노드 수신 대기");

    let peers: Arc<DashMap<Addr, SocketAddr>> = Arc::new(DashMap::new());
    for (addr, endpoint) in &config.peers {
        peers.insert(*addr, *endpoint);
    }

    let transport = UdpTransport {
        socket: Arc::clone(&socket),
        peers: Arc::clone(&peers),
    };
    let protocol = if config.lossy {
        ProtocolConfig::lossy_mesh()
    } else {
        ProtocolConfig::default()
    };
    let caps = Capabilities {
        max_size: config.max_size,
        ..Default::default()
    };
    let mut srv = BlobSrv::new(transport, protocol, caps);

    let mut buf = vec![0u8; 65536];
    loop {
        let now = Instant::now();
        let wake = srv
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

                // 새 전송 시작이 해당 id의 수신을 준비시킨다
                if let Message::XferStart(xfer) = &msg {
                    let io = Box::new(FileBlob::create(&config.output));
                    if let Err(err) = srv.recv(xfer.id, io) {
                        warn!(id = xfer.id, %err, "전송을 받을 수 없음");
                    }
                }
                srv.handle_message(from, msg, Instant::now());
            }
            _ = sleep => {
                srv.poll(Instant::now());
            }
        }

        while let Some(event) = srv.poll_event() {
            match event {
                SrvEvent::XferAccepted { id, from } => info!(id, from, "전송 수락"),
                SrvEvent::BlockComplete { block_number } => {
                    info!(block = block_number, progress = srv.progress(), "블록 완료");
                }
                SrvEvent::End { id } => {
                    info!(id, "blob 수신 완료: {}", srv.stats().summary());
                    srv.verified()?;
                    info!(output = %config.output.display(), "blob 저장됨");
                }
                SrvEvent::Cancelled { id } => warn!(id, "송신측에서 전송 취소"),
                SrvEvent::Discarded { id } => warn!(id, "전송 타임아웃, 부분 데이터 폐기"),
            }
        }
    }
}
