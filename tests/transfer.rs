//! 인메모리 링크 위의 종단 간 전송 테스트
//!
//! 클라이언트와 수신기 집합이 FIFO 메시지 큐와 수동 시계를 공유하므로
//! 손실, 재전송, 타임아웃 동작이 실제 sleep 없이 결정적으로 돈다.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use meshblob::config::ProtocolConfig;
use meshblob::{
    Addr, BlobClient, BlobSrv, BlobStatus, Capabilities, ClientEvent, FileBlob, Message,
    TargetPhase, TargetRegistry, TransferInputs, Transport, Xfer, XferMode, XferPhase,
};

const DIST: Addr = 0x0100;
const GROUP: Addr = 0xC000;

type Net = Rc<RefCell<VecDeque<(Addr, Addr, Message)>>>;

/// 공유 큐 위의 엔드포인트 하나. `drop_chunks` 만큼의 송신 청크
/// 메시지를 삼켜서 손실을 흉내 낸다
struct TestLink {
    src: Addr,
    net: Net,
    drop_chunks: Rc<Cell<u32>>,
}

impl Transport for TestLink {
    fn send(&mut self, dst: Addr, msg: &Message) -> meshblob::Result<()> {
        if matches!(msg, Message::Chunk { .. }) && self.drop_chunks.get() > 0 {
            self.drop_chunks.set(self.drop_chunks.get() - 1);
            return Ok(());
        }
        self.net.borrow_mut().push_back((self.src, dst, msg.clone()));
        Ok(())
    }
}

struct World {
    now: Instant,
    net: Net,
    cli: BlobClient<TestLink>,
    reg: TargetRegistry,
    srvs: Vec<(Addr, BlobSrv<TestLink>)>,
    drop_chunks: Rc<Cell<u32>>,
}

impl World {
    /// `targets`는 클라이언트 레지스트리로 들어가고, 링크에 실제로
    /// 응답하는 건 `servers`뿐이다. 서버 없는 대상은 도달 불가 노드처럼
    /// 동작한다
    fn new(targets: &[Addr], servers: &[Addr], drop_chunks: u32) -> Self {
        let net: Net = Rc::new(RefCell::new(VecDeque::new()));
        let drop_chunks = Rc::new(Cell::new(drop_chunks));

        let cli = BlobClient::new(
            TestLink {
                src: DIST,
                net: Rc::clone(&net),
                drop_chunks: Rc::clone(&drop_chunks),
            },
            ProtocolConfig::default(),
        );

        let mut reg = TargetRegistry::new();
        for &addr in targets {
            reg.add(addr, 0).unwrap();
        }

        let srvs = servers
            .iter()
            .map(|&addr| {
                let srv = BlobSrv::new(
                    TestLink {
                        src: addr,
                        net: Rc::clone(&net),
                        drop_chunks: Rc::new(Cell::new(0)),
                    },
                    ProtocolConfig::default(),
                    Capabilities::default(),
                );
                (addr, srv)
            })
            .collect();

        Self {
            now: Instant::now(),
            net,
            cli,
            reg,
            srvs,
            drop_chunks,
        }
    }

    /// 링크가 조용해질 때까지 큐의 메시지를 배달한다
    fn pump(&mut self) {
        for _ in 0..100_000 {
            let next = self.net.borrow_mut().pop_front();
            let Some((from, to, msg)) = next else { return };
            if to == DIST {
                self.cli.handle_message(&mut self.reg, from, msg, self.now);
            } else if to == GROUP {
                for (_, srv) in &mut self.srvs {
                    srv.handle_message(from, msg.clone(), self.now);
                }
            } else if let Some((_, srv)) = self.srvs.iter_mut().find(|(a, _)| *a == to) {
                srv.handle_message(from, msg, self.now);
            }
        }
        panic!("메시지 폭주: 링크가 조용해지지 않음");
    }

    /// 클라이언트가 전송 종료를 보고하거나 `max`가 지날 때까지
    /// 메시지를 배달하며 시계를 타이머 기한 너머로 전진시킨다
    fn run_to_end(&mut self, max: Duration) -> Vec<ClientEvent> {
        let deadline = self.now + max;
        let mut events = Vec::new();
        loop {
            self.pump();
            while let Some(event) = self.cli.poll_event() {
                let end = matches!(event, ClientEvent::End { .. });
                events.push(event);
                if end {
                    return events;
                }
            }

            let next = self
                .cli
                .next_timeout(&self.reg)
                .into_iter()
                .chain(self.srvs.iter().filter_map(|(_, s)| s.next_timeout()))
                .min();
            let Some(wake) = next else { return events };
            if wake > deadline {
                return events;
            }

            self.now = self.now.max(wake + Duration::from_millis(1));
            self.cli.poll(&mut self.reg, self.now);
            for (_, srv) in &mut self.srvs {
                srv.poll(self.now);
            }
        }
    }

    fn srv(&mut self, addr: Addr) -> &mut BlobSrv<TestLink> {
        &mut self.srvs.iter_mut().find(|(a, _)| *a == addr).unwrap().1
    }
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 13) as u8).collect()
}

fn xfer(id: u64, size: u32, mode: XferMode) -> Xfer {
    Xfer {
        id,
        size,
        block_size_log: 6,
        chunk_size: 32,
        mode,
    }
}

fn end_success(events: &[ClientEvent]) -> Option<bool> {
    events.iter().find_map(|e| match e {
        ClientEvent::End { success } => Some(*success),
        _ => None,
    })
}

#[test]
fn push_transfer_delivers_to_all_targets() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(100);
    let mut world = World::new(&[0x0001, 0x0002], &[0x0001, 0x0002], 0);

    let out1 = dir.path().join("t1.bin");
    let out2 = dir.path().join("t2.bin");
    world.srv(0x0001).recv(7, Box::new(FileBlob::create(&out1))).unwrap();
    world.srv(0x0002).recv(7, Box::new(FileBlob::create(&out2))).unwrap();

    let io = Box::new(meshblob::MemoryBlob::from_bytes(&data[..]));
    world
        .cli
        .send(
            &mut world.reg,
            xfer(7, 100, XferMode::Push),
            io,
            TransferInputs::default(),
            world.now,
        )
        .unwrap();

    let events = world.run_to_end(Duration::from_secs(120));
    assert_eq!(end_success(&events), Some(true));

    for addr in [0x0001, 0x0002] {
        assert_eq!(world.reg.get(addr).unwrap().phase, TargetPhase::Success);
        assert_eq!(world.srv(addr).phase(), XferPhase::Complete);
        world.srv(addr).verified().unwrap();
    }
    assert_eq!(std::fs::read(&out1).unwrap(), data);
    assert_eq!(std::fs::read(&out2).unwrap(), data);
    assert_eq!(world.cli.progress(&world.reg), 100);
}

#[test]
fn lost_target_does_not_stall_the_others() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(100);
    // 0x0003은 등록돼 있지만 도달 불가
    let mut world = World::new(&[0x0001, 0x0002, 0x0003], &[0x0001, 0x0002], 0);

    let out1 = dir.path().join("t1.bin");
    let out2 = dir.path().join("t2.bin");
    world.srv(0x0001).recv(9, Box::new(FileBlob::create(&out1))).unwrap();
    world.srv(0x0002).recv(9, Box::new(FileBlob::create(&out2))).unwrap();

    let io = Box::new(meshblob::MemoryBlob::from_bytes(&data[..]));
    world
        .cli
        .send(
            &mut world.reg,
            xfer(9, 100, XferMode::Push),
            io,
            TransferInputs::default(),
            world.now,
        )
        .unwrap();

    let events = world.run_to_end(Duration::from_secs(600));
    assert_eq!(end_success(&events), Some(true));
    assert!(events
        .iter()
        .any(|e| matches!(e, ClientEvent::LostTarget { addr: 0x0003 })));

    // 손실된 대상은 실패도 취소도 아닌 별도 상태로 끝난다
    assert_eq!(world.reg.get(0x0003).unwrap().phase, TargetPhase::Lost);
    assert_eq!(world.reg.get(0x0001).unwrap().phase, TargetPhase::Success);
    assert_eq!(world.reg.get(0x0002).unwrap().phase, TargetPhase::Success);
    assert_eq!(std::fs::read(&out1).unwrap(), data);
    assert_eq!(std::fs::read(&out2).unwrap(), data);

    // 진행률은 살아남은 대상만 센다
    assert_eq!(world.cli.progress(&world.reg), 100);
    assert_eq!(world.cli.stats().lost_targets, 1);
}

#[test]
fn dropped_chunks_recovered_by_retransmission() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(100);
    // 처음 두 번의 청크 전송이 링크에서 사라진다
    let mut world = World::new(&[0x0001], &[0x0001], 2);

    let out = dir.path().join("t1.bin");
    world.srv(0x0001).recv(11, Box::new(FileBlob::create(&out))).unwrap();

    let io = Box::new(meshblob::MemoryBlob::from_bytes(&data[..]));
    world
        .cli
        .send(
            &mut world.reg,
            xfer(11, 100, XferMode::Push),
            io,
            TransferInputs::default(),
            world.now,
        )
        .unwrap();

    let events = world.run_to_end(Duration::from_secs(600));
    assert_eq!(end_success(&events), Some(true));
    assert_eq!(world.drop_chunks.get(), 0);
    assert!(world.cli.stats().chunks_retransmitted > 0);
    assert_eq!(std::fs::read(&out).unwrap(), data);
}

#[test]
fn pull_transfer_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(200);
    // 청크 둘이 사라지고, 수신기의 반복 report가 복구한다
    let mut world = World::new(&[0x0001], &[0x0001], 2);

    let out = dir.path().join("t1.bin");
    world.srv(0x0001).recv(13, Box::new(FileBlob::create(&out))).unwrap();

    let io = Box::new(meshblob::MemoryBlob::from_bytes(&data[..]));
    world
        .cli
        .send(
            &mut world.reg,
            xfer(13, 200, XferMode::Pull),
            io,
            TransferInputs::default(),
            world.now,
        )
        .unwrap();

    let events = world.run_to_end(Duration::from_secs(120));
    assert_eq!(end_success(&events), Some(true));
    assert_eq!(world.drop_chunks.get(), 0);
    assert_eq!(world.srv(0x0001).phase(), XferPhase::Complete);
    assert_eq!(std::fs::read(&out).unwrap(), data);
}

#[test]
fn pull_reports_may_arrive_in_any_order() {
    // 수신기 역할을 직접 스크립트해서 블록을 3, 1, 0, 2 순서로
    // 요청/완료한다. 클라이언트의 진행 집계는 요청 순서와 무관해야
    // 하고 마지막 누락 블록 목록은 비어야 한다
    let data = payload(200);
    let mut world = World::new(&[0x0001], &[], 0);

    let io = Box::new(meshblob::MemoryBlob::from_bytes(&data[..]));
    world
        .cli
        .send(
            &mut world.reg,
            xfer(37, 200, XferMode::Pull),
            io,
            TransferInputs::default(),
            world.now,
        )
        .unwrap();
    world.net.borrow_mut().clear();

    let now = world.now;
    world.cli.handle_message(
        &mut world.reg,
        0x0001,
        Message::XferStatus {
            status: BlobStatus::Success,
            id: 37,
            phase: XferPhase::WaitingForBlock,
            missing_blocks: vec![0, 1, 2, 3],
        },
        now,
    );

    // 200바이트, 블록 64바이트, 청크 32바이트: 블록 0..=2는 청크 둘,
    // 블록 3은 하나
    for block in [3u16, 1, 0, 2] {
        let missing: Vec<u16> = if block == 3 { vec![0] } else { vec![0, 1] };
        world.cli.handle_message(
            &mut world.reg,
            0x0001,
            Message::BlockReport {
                id: 37,
                block_number: block,
                missing_chunks: missing,
            },
            now,
        );
        world.cli.handle_message(
            &mut world.reg,
            0x0001,
            Message::BlockReport {
                id: 37,
                block_number: block,
                missing_chunks: Vec::new(),
            },
            now,
        );
    }

    // 요청된 청크들을 조립하면 이미지 전체가 나와야 한다
    let mut got = vec![0u8; 200];
    for (_, _, msg) in world.net.borrow().iter() {
        if let Message::Chunk {
            block_number,
            offset,
            data,
            ..
        } = msg
        {
            let start = ((*block_number as usize) << 6) + *offset as usize;
            got[start..start + data.len()].copy_from_slice(data);
        }
    }
    assert_eq!(got, data);
    assert_eq!(
        world.reg.get(0x0001).unwrap().blob.missing_blocks.as_deref(),
        Some(&[][..])
    );

    world.cli.handle_message(
        &mut world.reg,
        0x0001,
        Message::XferStatus {
            status: BlobStatus::Success,
            id: 37,
            phase: XferPhase::Complete,
            missing_blocks: Vec::new(),
        },
        now,
    );
    assert!(matches!(
        world.cli.poll_event(),
        Some(ClientEvent::End { success: true })
    ));
}

#[test]
fn group_chunks_reach_every_target() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(100);
    let mut world = World::new(&[0x0001, 0x0002], &[0x0001, 0x0002], 0);

    let out1 = dir.path().join("t1.bin");
    let out2 = dir.path().join("t2.bin");
    world.srv(0x0001).recv(17, Box::new(FileBlob::create(&out1))).unwrap();
    world.srv(0x0002).recv(17, Box::new(FileBlob::create(&out2))).unwrap();

    let inputs = TransferInputs {
        group: Some(GROUP),
        ..Default::default()
    };
    let io = Box::new(meshblob::MemoryBlob::from_bytes(&data[..]));
    world
        .cli
        .send(&mut world.reg, xfer(17, 100, XferMode::Push), io, inputs, world.now)
        .unwrap();

    let events = world.run_to_end(Duration::from_secs(120));
    assert_eq!(end_success(&events), Some(true));
    assert_eq!(std::fs::read(&out1).unwrap(), data);
    assert_eq!(std::fs::read(&out2).unwrap(), data);
}

#[test]
fn caps_query_then_validated_transfer() {
    let data = payload(64);
    let mut world = World::new(&[0x0001], &[0x0001], 0);

    world
        .cli
        .caps_get(&mut world.reg, TransferInputs::default(), world.now)
        .unwrap();
    world.pump();

    let caps = match world.cli.poll_event() {
        Some(ClientEvent::Caps(Some(caps))) => caps,
        other => panic!("예상 밖의 이벤트: {other:?}"),
    };
    assert!(caps.usable());

    // 협상된 한계를 깨는 전송은 로컬에서 거부된다
    let oversized = Xfer {
        size: caps.max_size + 1,
        ..xfer(19, 64, XferMode::Push)
    };
    let io = Box::new(meshblob::MemoryBlob::from_bytes(&data[..]));
    assert!(world
        .cli
        .send(&mut world.reg, oversized, io, TransferInputs::default(), world.now)
        .is_err());

    // 한계 안의 전송은 통과한다
    world.srv(0x0001).recv(19, Box::new(meshblob::MemoryBlob::for_receive())).unwrap();
    let io = Box::new(meshblob::MemoryBlob::from_bytes(&data[..]));
    world
        .cli
        .send(
            &mut world.reg,
            xfer(19, 64, XferMode::Push),
            io,
            TransferInputs::default(),
            world.now,
        )
        .unwrap();
    let events = world.run_to_end(Duration::from_secs(120));
    assert_eq!(end_success(&events), Some(true));
}

#[test]
fn restarting_a_completed_transfer_short_circuits() {
    let data = payload(100);
    let mut world = World::new(&[0x0001], &[0x0001], 0);

    world
        .srv(0x0001)
        .recv(23, Box::new(meshblob::MemoryBlob::for_receive()))
        .unwrap();
    let io = Box::new(meshblob::MemoryBlob::from_bytes(&data[..]));
    world
        .cli
        .send(
            &mut world.reg,
            xfer(23, 100, XferMode::Push),
            io,
            TransferInputs::default(),
            world.now,
        )
        .unwrap();
    let events = world.run_to_end(Duration::from_secs(120));
    assert_eq!(end_success(&events), Some(true));

    // 수신기가 전송을 아직 들고 있으므로 같은 id의 재배포는 청크를
    // 하나도 옮기지 않고 끝난다
    let io = Box::new(meshblob::MemoryBlob::from_bytes(&data[..]));
    world
        .cli
        .send(
            &mut world.reg,
            xfer(23, 100, XferMode::Push),
            io,
            TransferInputs::default(),
            world.now,
        )
        .unwrap();
    let events = world.run_to_end(Duration::from_secs(120));
    assert_eq!(end_success(&events), Some(true));
    assert_eq!(world.cli.stats().chunks_sent, 0);
}

#[test]
fn cancel_tears_down_both_sides() {
    let data = payload(100);
    let mut world = World::new(&[0x0001], &[0x0001], 0);

    world
        .srv(0x0001)
        .recv(29, Box::new(meshblob::MemoryBlob::for_receive()))
        .unwrap();
    let io = Box::new(meshblob::MemoryBlob::from_bytes(&data[..]));
    world
        .cli
        .send(
            &mut world.reg,
            xfer(29, 100, XferMode::Push),
            io,
            TransferInputs::default(),
            world.now,
        )
        .unwrap();

    // 시작 교환은 배달하되 전송이 끝나기 전에 취소한다
    world.cli.cancel(&mut world.reg);
    world.pump();

    assert_eq!(world.reg.get(0x0001).unwrap().phase, TargetPhase::Cancelled);
    assert_eq!(world.srv(0x0001).phase(), XferPhase::Inactive);
    assert!(!world.reg.is_busy());
}

#[test]
fn status_query_reports_receiver_progress() {
    let data = payload(100);
    let mut world = World::new(&[0x0001], &[0x0001], 0);

    world
        .srv(0x0001)
        .recv(31, Box::new(meshblob::MemoryBlob::for_receive()))
        .unwrap();
    let io = Box::new(meshblob::MemoryBlob::from_bytes(&data[..]));
    world
        .cli
        .send(
            &mut world.reg,
            xfer(31, 100, XferMode::Push),
            io,
            TransferInputs::default(),
            world.now,
        )
        .unwrap();
    let events = world.run_to_end(Duration::from_secs(120));
    assert_eq!(end_success(&events), Some(true));

    // 끝난 수신기에 대한 읽기 전용 조회는 Complete를 보고한다
    world
        .cli
        .xfer_progress_get(&mut world.reg, 31, TransferInputs::default(), world.now)
        .unwrap();
    world.pump();

    match world.cli.poll_event() {
        Some(ClientEvent::TargetStatus { addr, phase, missing_blocks }) => {
            assert_eq!(addr, 0x0001);
            assert_eq!(phase, XferPhase::Complete);
            assert!(missing_blocks.is_empty());
        }
        other => panic!("예상 밖의 이벤트: {other:?}"),
    }
}
