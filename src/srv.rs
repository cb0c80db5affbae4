//! BLOB 전송 서버 (수신측)
//!
//! 한 번에 하나의 수신 세션만 처리한다. 애플리케이션이 [`BlobSrv::recv`]로
//! 기대하는 전송 id를 걸어 두면 일치하는 전송 시작을 수락하고, 블록을
//! 청크 단위로 재조립하며 누락분을 보고한다. 손상·무관·중복 청크는
//! 세션에 영향 없이 폐기된다.
//!
//! 클라이언트와 마찬가지로 sans-IO 구조: 수신 메시지는
//! [`BlobSrv::handle_message`]로, 타이머는 [`BlobSrv::poll`]로 공급한다.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::block::{Block, BlockAssembler, Chunk};
use crate::client::Transport;
use crate::config::ProtocolConfig;
use crate::error::{Error, Result};
use crate::io::BlobIo;
use crate::message::{BlobStatus, Capabilities, Message, Xfer, XferMode, XferPhase};
use crate::stats::TransferStats;
use crate::{Addr, XferId};

/// 서버가 올리는 알림
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SrvEvent {
    /// 걸어 둔 id와 일치하는 전송 시작을 수락했다
    XferAccepted { id: XferId, from: Addr },

    /// 블록 하나가 완전히 재조립되어 기록되었다
    BlockComplete { block_number: u16 },

    /// 모든 블록이 도착했다. 검증 대기 상태
    End { id: XferId },

    /// 송신측이 전송을 취소했다
    Cancelled { id: XferId },

    /// 폐기 타임아웃 안에 청크가 오지 않아 부분 상태를 버렸다
    Discarded { id: XferId },
}

#[derive(Debug)]
struct ActiveRecv {
    cli: Addr,
    xfer: Xfer,
    blocks_done: Vec<bool>,
    block: Option<Block>,
    assembler: Option<BlockAssembler>,
    /// 푸시 모드: 현재 블록의 통합 ack 기한
    ack_due: Option<Instant>,
    /// 완료 ack 대기 중인 블록 번호. ack 지연 창 안에서 여러 블록이
    /// 완료되면 최신 블록으로 갱신된다
    pending_ack: Option<u16>,
    /// 풀 모드: 다음 report 재전송 시각
    report_due: Option<Instant>,
    reports_left: u32,
    /// 무활동 기한. 넘기면 부분 상태를 폐기한다
    discard_at: Instant,
}

impl ActiveRecv {
    fn missing_blocks(&self) -> Vec<u16> {
        self.blocks_done
            .iter()
            .enumerate()
            .filter(|(_, done)| !**done)
            .map(|(i, _)| i as u16)
            .collect()
    }

    fn all_done(&self) -> bool {
        self.blocks_done.iter().all(|d| *d)
    }
}

#[derive(Debug)]
enum SrvState {
    Idle,
    /// `recv` 호출됨. 일치하는 전송 시작 대기
    Armed { id: XferId },
    Active(ActiveRecv),
    /// 모든 블록 수신 완료. 애플리케이션 판정 대기
    Verifying { id: XferId, cli: Addr },
}

/// BLOB 전송 수신기
pub struct BlobSrv<T: Transport> {
    transport: T,
    config: ProtocolConfig,
    caps: Capabilities,
    state: SrvState,
    io: Option<Box<dyn BlobIo>>,
    events: VecDeque<SrvEvent>,
    stats: TransferStats,
}

impl<T: Transport> BlobSrv<T> {
    pub fn new(transport: T, config: ProtocolConfig, caps: Capabilities) -> Self {
        Self {
            transport,
            config,
            caps,
            state: SrvState::Idle,
            io: None,
            events: VecDeque::new(),
            stats: TransferStats::new(),
        }
    }

    /// 전송 상태 응답에 실리는 수신기 단계. 모든 블록이 들어온 순간부터
    /// Complete를 보고한다 (완료 ack이 아직 지연 창에 있어도)
    pub fn phase(&self) -> XferPhase {
        match &self.state {
            SrvState::Idle => XferPhase::Inactive,
            SrvState::Armed { .. } => XferPhase::WaitingForStart,
            SrvState::Active(recv) => {
                if recv.all_done() {
                    XferPhase::Complete
                } else if recv.assembler.is_some() {
                    XferPhase::WaitingForChunks
                } else {
                    XferPhase::WaitingForBlock
                }
            }
            SrvState::Verifying { .. } => XferPhase::Complete,
        }
    }

    /// 전송 통계
    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    /// 다음 이벤트 (있으면)
    pub fn poll_event(&mut self) -> Option<SrvEvent> {
        self.events.pop_front()
    }

    /// 수신 블록 수 / 전체 블록 수, 내림. 모든 블록이 들어와야 100
    pub fn progress(&self) -> u8 {
        match &self.state {
            SrvState::Active(recv) => {
                let total = recv.blocks_done.len();
                if total == 0 {
                    return 0;
                }
                let done = recv.blocks_done.iter().filter(|d| **d).count();
                (done * 100 / total) as u8
            }
            SrvState::Verifying { .. } => 100,
            _ => 0,
        }
    }

    /// 주어진 id의 전송을 받을 준비를 하고 청크를 `io`에 기록한다.
    /// 같은 id에는 멱등. 다른 전송이 진행 중이면 [`Error::Busy`]
    pub fn recv(&mut self, id: XferId, io: Box<dyn BlobIo>) -> Result<()> {
        match &self.state {
            SrvState::Idle => {
                self.io = Some(io);
                self.stats = TransferStats::new();
                self.state = SrvState::Armed { id };
                debug!(id, "수신 대기 시작");
                Ok(())
            }
            SrvState::Armed { id: armed } if *armed == id => Ok(()),
            SrvState::Active(recv) if recv.xfer.id == id => Ok(()),
            _ => Err(Error::Busy),
        }
    }

    /// 세션과 부분 상태를 버린다
    pub fn cancel(&mut self) {
        self.state = SrvState::Idle;
        self.io = None;
    }

    /// [`SrvEvent::End`] 이후의 애플리케이션 판정: 수신한 blob이 정상
    pub fn verified(&mut self) -> Result<()> {
        match self.state {
            SrvState::Verifying { id, .. } => {
                info!(id, "blob 검증 완료");
                self.state = SrvState::Idle;
                self.io = None;
                Ok(())
            }
            _ => Err(Error::WrongPhase),
        }
    }

    /// [`SrvEvent::End`] 이후의 애플리케이션 판정: 수신한 blob을 쓸 수
    /// 없다. 데이터는 폐기된다
    pub fn rejected(&mut self) -> Result<()> {
        match self.state {
            SrvState::Verifying { id, .. } => {
                warn!(id, "애플리케이션이 blob 거부");
                self.state = SrvState::Idle;
                self.io = None;
                Ok(())
            }
            _ => Err(Error::WrongPhase),
        }
    }

    /// 호출측이 깨워 줘야 하는 가장 이른 기한
    pub fn next_timeout(&self) -> Option<Instant> {
        match &self.state {
            SrvState::Active(recv) => [recv.ack_due, recv.report_due, Some(recv.discard_at)]
                .into_iter()
                .flatten()
                .min(),
            _ => None,
        }
    }

    fn discard_timeout(&self) -> Duration {
        Duration::from_millis(self.config.sar_rx.discard_timeout_ms() as u64)
    }

    fn ack_delay(&self) -> Duration {
        Duration::from_millis(self.config.sar_rx.ack_delay_ms() as u64)
    }

    fn report_interval(&self) -> Duration {
        Duration::from_millis(self.config.sar_rx.rx_seg_int_ms() as u64)
    }

    // ---- 수신 처리 ------------------------------------------------------

    /// 수신 메시지 하나를 상태 기계에 공급한다
    pub fn handle_message(&mut self, from: Addr, msg: Message, now: Instant) {
        match msg {
            Message::CapsGet => {
                let _ = self.transport.send(from, &Message::CapsStatus(self.caps));
            }
            Message::XferGet { id } => self.on_xfer_get(from, id),
            Message::XferStart(xfer) => self.on_xfer_start(from, xfer, now),
            Message::BlockStart { id, block_number, chunk_size } => {
                self.on_block_start(from, id, block_number, chunk_size, now)
            }
            Message::BlockGet { id, block_number } => self.on_block_get(from, id, block_number),
            Message::Chunk { id, block_number, chunk_number, offset, crc32, data } => {
                self.on_chunk(from, id, block_number, chunk_number, offset, crc32, data, now)
            }
            Message::XferCancel { id } => self.on_cancel(from, id),
            _ => {}
        }
    }

    fn on_xfer_get(&mut self, from: Addr, id: XferId) {
        let (status, phase, missing) = match &self.state {
            SrvState::Active(recv) if recv.xfer.id == id => {
                (BlobStatus::Success, self.phase(), recv.missing_blocks())
            }
            SrvState::Verifying { id: done, .. } if *done == id => {
                (BlobStatus::Success, XferPhase::Complete, Vec::new())
            }
            SrvState::Armed { id: armed } if *armed == id => {
                (BlobStatus::Success, XferPhase::WaitingForStart, Vec::new())
            }
            _ => (BlobStatus::WrongBlobId, XferPhase::Inactive, Vec::new()),
        };
        let _ = self.transport.send(
            from,
            &Message::XferStatus {
                status,
                id,
                phase,
                missing_blocks: missing,
            },
        );
    }

    fn validate_xfer(&self, xfer: &Xfer) -> BlobStatus {
        if xfer.size > self.caps.max_size {
            return BlobStatus::BlobTooLarge;
        }
        if xfer.block_size_log < self.caps.min_block_size_log
            || xfer.block_size_log > self.caps.max_block_size_log
        {
            return BlobStatus::InvalidBlockSize;
        }
        if xfer.chunk_size == 0 || xfer.chunk_size > self.caps.max_chunk_size {
            return BlobStatus::InvalidChunkSize;
        }
        let chunks = crate::block::chunk_count(1u32 << xfer.block_size_log, xfer.chunk_size);
        if chunks > self.caps.max_chunks as u32 {
            return BlobStatus::InvalidChunkSize;
        }
        if !self.caps.modes.supports(xfer.mode) {
            return BlobStatus::UnsupportedMode;
        }
        BlobStatus::Success
    }

    fn on_xfer_start(&mut self, from: Addr, xfer: Xfer, now: Instant) {
        // 이미 진행 중인 세션에 대한 재전송된 시작: 수락 상태를 반복한다
        match &self.state {
            SrvState::Active(recv) if recv.xfer.id == xfer.id => {
                let missing = recv.missing_blocks();
                let phase = self.phase();
                let _ = self.transport.send(
                    from,
                    &Message::XferStatus {
                        status: BlobStatus::Success,
                        id: xfer.id,
                        phase,
                        missing_blocks: missing,
                    },
                );
                return;
            }
            SrvState::Verifying { id, .. } if *id == xfer.id => {
                let _ = self.transport.send(
                    from,
                    &Message::XferStatus {
                        status: BlobStatus::Success,
                        id: xfer.id,
                        phase: XferPhase::Complete,
                        missing_blocks: Vec::new(),
                    },
                );
                return;
            }
            SrvState::Armed { id } if *id == xfer.id => {}
            _ => {
                let _ = self.transport.send(
                    from,
                    &Message::XferStatus {
                        status: BlobStatus::WrongBlobId,
                        id: xfer.id,
                        phase: self.phase(),
                        missing_blocks: Vec::new(),
                    },
                );
                return;
            }
        }

        let status = self.validate_xfer(&xfer);
        if status != BlobStatus::Success {
            warn!(id = xfer.id, ?status, "전송 시작 거부");
            let _ = self.transport.send(
                from,
                &Message::XferStatus {
                    status,
                    id: xfer.id,
                    phase: XferPhase::WaitingForStart,
                    missing_blocks: Vec::new(),
                },
            );
            return;
        }

        if let Some(io) = self.io.as_mut() {
            if let Err(err) = io.open(&xfer) {
                warn!(id = xfer.id, %err, "blob 저장소가 전송 거부");
                let _ = self.transport.send(
                    from,
                    &Message::XferStatus {
                        status: BlobStatus::InternalError,
                        id: xfer.id,
                        phase: XferPhase::WaitingForStart,
                        missing_blocks: Vec::new(),
                    },
                );
                return;
            }
        }

        let block_count = xfer.block_count() as usize;
        let recv = ActiveRecv {
            cli: from,
            xfer,
            blocks_done: vec![false; block_count],
            block: None,
            assembler: None,
            ack_due: None,
            pending_ack: None,
            report_due: None,
            reports_left: 0,
            discard_at: now + self.discard_timeout(),
        };
        let missing = recv.missing_blocks();

        info!(
            id = xfer.id,
            size = xfer.size,
            blocks = block_count,
            mode = ?xfer.mode,
            "전송 수락"
        );
        self.state = SrvState::Active(recv);
        self.stats = TransferStats::new();
        self.events.push_back(SrvEvent::XferAccepted { id: xfer.id, from });
        let _ = self.transport.send(
            from,
            &Message::XferStatus {
                status: BlobStatus::Success,
                id: xfer.id,
                phase: XferPhase::WaitingForBlock,
                missing_blocks: missing,
            },
        );

        if xfer.mode == XferMode::Pull {
            self.pull_next_block(now);
        }
    }

    fn on_block_start(&mut self, from: Addr, id: XferId, block_number: u16, chunk_size: u16, now: Instant) {
        let discard_at = now + self.discard_timeout();
        let SrvState::Active(recv) = &mut self.state else {
            let _ = self.transport.send(
                from,
                &Message::BlockStatus {
                    status: BlobStatus::WrongPhase,
                    block_number,
                    missing_chunks: Vec::new(),
                },
            );
            return;
        };
        if recv.xfer.id != id {
            self.stats.chunks_dropped += 1;
            return;
        }

        let status = if block_number as usize >= recv.blocks_done.len() {
            BlobStatus::InvalidBlockNumber
        } else if chunk_size != recv.xfer.chunk_size {
            BlobStatus::InvalidChunkSize
        } else {
            BlobStatus::Success
        };
        if status != BlobStatus::Success {
            warn!(id, block = block_number, ?status, "블록 시작 거부");
            let _ = self.transport.send(
                from,
                &Message::BlockStatus {
                    status,
                    block_number,
                    missing_chunks: Vec::new(),
                },
            );
            return;
        }

        recv.discard_at = discard_at;

        // 이미 받은 블록은 즉시 ack한다. 아니면 시작 뒤에 청크 스트림이
        // 따라오므로 여기서는 응답하지 않는다. 누락분은 ack 타이머나 상태
        // 요청이 보고한다. 진행 중인 블록에 대한 반복된 시작은 부분
        // 조립 상태를 유지한다
        if recv.blocks_done[block_number as usize] {
            let _ = self.transport.send(
                from,
                &Message::BlockStatus {
                    status: BlobStatus::Success,
                    block_number,
                    missing_chunks: Vec::new(),
                },
            );
            return;
        }

        let same = recv.block.map(|b| b.number) == Some(block_number);
        if !same {
            let block = Block::new(recv.xfer.size, recv.xfer.block_size_log, block_number);
            recv.assembler = Some(BlockAssembler::new(
                block_number,
                block.size,
                recv.xfer.chunk_size,
            ));
            recv.block = Some(block);
            recv.ack_due = None;
            recv.pending_ack = None;
            debug!(id, block = block_number, size = block.size, "블록 시작");
        }
    }

    fn on_block_get(&mut self, from: Addr, id: XferId, block_number: u16) {
        let SrvState::Active(recv) = &mut self.state else { return };
        if recv.xfer.id != id {
            return;
        }

        let (status, missing) = if block_number as usize >= recv.blocks_done.len() {
            (BlobStatus::InvalidBlockNumber, Vec::new())
        } else if recv.blocks_done[block_number as usize] {
            (BlobStatus::Success, Vec::new())
        } else if recv.block.map(|b| b.number) == Some(block_number) {
            match &recv.assembler {
                Some(asm) => (BlobStatus::Success, asm.missing_chunks()),
                None => (BlobStatus::Success, Vec::new()),
            }
        } else {
            // 블록 시작이 유실됐다. 블록을 지금 열고 전부 누락으로 보고한다
            let block = Block::new(recv.xfer.size, recv.xfer.block_size_log, block_number);
            let asm = BlockAssembler::new(block_number, block.size, recv.xfer.chunk_size);
            let missing = asm.missing_chunks();
            recv.block = Some(block);
            recv.assembler = Some(asm);
            recv.ack_due = None;
            recv.pending_ack = None;
            (BlobStatus::Success, missing)
        };
        let _ = self.transport.send(
            from,
            &Message::BlockStatus {
                status,
                block_number,
                missing_chunks: missing,
            },
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn on_chunk(
        &mut self,
        from: Addr,
        id: XferId,
        block_number: u16,
        chunk_number: u16,
        offset: u32,
        crc32: u32,
        data: Vec<u8>,
        now: Instant,
    ) {
        let discard_at = now + self.discard_timeout();
        let ack_delay = self.ack_delay();
        let SrvState::Active(recv) = &mut self.state else {
            self.stats.chunks_dropped += 1;
            return;
        };
        if recv.xfer.id != id || from != recv.cli {
            self.stats.chunks_dropped += 1;
            return;
        }
        if crc32fast::hash(&data) != crc32 {
            warn!(id, block = block_number, chunk = chunk_number, "청크 crc 불일치");
            self.stats.chunks_dropped += 1;
            return;
        }
        let (Some(block), Some(asm)) = (&recv.block, &mut recv.assembler) else {
            self.stats.chunks_dropped += 1;
            return;
        };
        if block.number != block_number {
            self.stats.chunks_dropped += 1;
            return;
        }

        let chunk = Chunk {
            number: chunk_number,
            offset,
            data: data.into(),
        };
        let newly = match asm.insert(&chunk) {
            Ok(newly) => newly,
            Err(err) => {
                warn!(id, chunk = chunk_number, %err, "청크 거부");
                self.stats.chunks_dropped += 1;
                return;
            }
        };
        recv.discard_at = discard_at;
        if !newly {
            return;
        }

        self.stats.chunks_received += 1;
        self.stats.total_bytes += chunk.data.len() as u64;
        if let Some(io) = self.io.as_mut() {
            if io.write_chunk(block, &chunk).is_err() {
                self.stats.chunks_dropped += 1;
                return;
            }
        }

        if asm.is_complete() {
            self.finish_block(now);
        } else if recv.xfer.mode == XferMode::Push && recv.ack_due.is_none() {
            recv.ack_due = Some(now + ack_delay);
        }
    }

    /// 현재 블록을 마감한다. 풀 모드는 커서를 전진시키고, 푸시 모드는
    /// 완료 ack을 ack 지연 뒤로 예약한다
    fn finish_block(&mut self, now: Instant) {
        let ack_delay = self.ack_delay();
        let SrvState::Active(recv) = &mut self.state else { return };
        let (Some(block), Some(_)) = (recv.block, recv.assembler.as_ref()) else {
            return;
        };

        if let Some(io) = self.io.as_mut() {
            if let Err(err) = io.block_end(&block) {
                warn!(block = block.number, %err, "블록 플러시 실패");
            }
        }
        recv.blocks_done[block.number as usize] = true;
        recv.assembler = None;
        recv.report_due = None;
        self.stats.blocks_confirmed += 1;

        let cli = recv.cli;
        let id = recv.xfer.id;
        let pull = recv.xfer.mode == XferMode::Pull;
        let done = recv.all_done();
        debug!(id, block = block.number, "블록 수신 완료");
        self.events.push_back(SrvEvent::BlockComplete {
            block_number: block.number,
        });

        if pull {
            // 빈 report가 블록 완료 통지를 겸한다. 커서가 블록을 하나씩
            // 순서대로 끌어오므로 통합할 완료가 쌓이지 않는다
            let _ = self.transport.send(
                cli,
                &Message::BlockReport {
                    id,
                    block_number: block.number,
                    missing_chunks: Vec::new(),
                },
            );
            if done {
                info!(id, "모든 블록 수신");
                self.state = SrvState::Verifying { id, cli };
                self.events.push_back(SrvEvent::End { id });
                // 풀 송신측은 이 상태를 기다린다
                let _ = self.transport.send(
                    cli,
                    &Message::XferStatus {
                        status: BlobStatus::Success,
                        id,
                        phase: XferPhase::Complete,
                        missing_blocks: Vec::new(),
                    },
                );
            } else {
                self.pull_next_block(now);
            }
        } else {
            // 푸시 모드 완료 ack은 즉시 내보내지 않고 ack 지연 후 poll이
            // 내보낸다. 지연 창 안의 여러 완료는 최신 블록의 ack 하나로
            // 합쳐진다
            recv.pending_ack = Some(block.number);
            if recv.ack_due.is_none() {
                recv.ack_due = Some(now + ack_delay);
            }
        }
    }

    /// 풀 모드: 가장 낮은 미수신 블록을 열고 그 청크 전부를 요청한다
    fn pull_next_block(&mut self, now: Instant) {
        let interval = self.report_interval();
        let reports = self.config.sar_rx.ack_retrans_count();
        let SrvState::Active(recv) = &mut self.state else { return };

        let Some(number) = recv
            .blocks_done
            .iter()
            .position(|done| !*done)
            .map(|i| i as u16)
        else {
            return;
        };

        let block = Block::new(recv.xfer.size, recv.xfer.block_size_log, number);
        let asm = BlockAssembler::new(number, block.size, recv.xfer.chunk_size);
        let missing = asm.missing_chunks();
        recv.block = Some(block);
        recv.assembler = Some(asm);
        recv.report_due = Some(now + interval);
        recv.reports_left = reports;

        debug!(id = recv.xfer.id, block = number, "블록 요청");
        let _ = self.transport.send(
            recv.cli,
            &Message::BlockReport {
                id: recv.xfer.id,
                block_number: number,
                missing_chunks: missing,
            },
        );
    }

    fn on_cancel(&mut self, from: Addr, id: XferId) {
        let known = match &self.state {
            SrvState::Active(recv) => recv.xfer.id == id,
            SrvState::Verifying { id: done, .. } => *done == id,
            SrvState::Armed { id: armed } => *armed == id,
            SrvState::Idle => false,
        };
        let status = if known {
            info!(id, "송신측이 전송 취소");
            self.state = SrvState::Idle;
            self.io = None;
            self.events.push_back(SrvEvent::Cancelled { id });
            BlobStatus::Success
        } else {
            BlobStatus::WrongBlobId
        };
        let _ = self.transport.send(
            from,
            &Message::XferStatus {
                status,
                id,
                phase: XferPhase::Inactive,
                missing_blocks: Vec::new(),
            },
        );
    }

    // ---- 타이머 ----------------------------------------------------------

    /// 만료된 수신측 타이머를 처리한다: 통합 ack, 풀 report 재전송,
    /// 폐기 타임아웃
    pub fn poll(&mut self, now: Instant) {
        let interval = self.report_interval();
        let SrvState::Active(recv) = &mut self.state else { return };

        if recv.discard_at <= now {
            let id = recv.xfer.id;
            warn!(id, "폐기 타임아웃, 부분 전송 상태 폐기");
            self.state = SrvState::Idle;
            self.io = None;
            self.events.push_back(SrvEvent::Discarded { id });
            return;
        }

        if let Some(due) = recv.ack_due {
            if due <= now {
                recv.ack_due = None;
                if let Some(number) = recv.pending_ack.take() {
                    // 지연해 둔 완료 ack. 마지막 블록이었다면 전송 완료
                    // 상태까지 함께 나간다
                    let cli = recv.cli;
                    let id = recv.xfer.id;
                    let done = recv.all_done();
                    let _ = self.transport.send(
                        cli,
                        &Message::BlockStatus {
                            status: BlobStatus::Success,
                            block_number: number,
                            missing_chunks: Vec::new(),
                        },
                    );
                    if done {
                        info!(id, "모든 블록 수신");
                        self.state = SrvState::Verifying { id, cli };
                        self.events.push_back(SrvEvent::End { id });
                        // 풀 송신측은 이 상태를 기다리고, 푸시 송신측은
                        // 자체 상태 조회로도 확인한다
                        let _ = self.transport.send(
                            cli,
                            &Message::XferStatus {
                                status: BlobStatus::Success,
                                id,
                                phase: XferPhase::Complete,
                                missing_blocks: Vec::new(),
                            },
                        );
                        return;
                    }
                } else {
                    let (number, missing) = match (&recv.block, &recv.assembler) {
                        (Some(block), Some(asm)) => (block.number, asm.missing_chunks()),
                        _ => return,
                    };
                    let _ = self.transport.send(
                        recv.cli,
                        &Message::BlockStatus {
                            status: BlobStatus::Success,
                            block_number: number,
                            missing_chunks: missing,
                        },
                    );
                }
            }
        }

        let SrvState::Active(recv) = &mut self.state else { return };
        if let Some(due) = recv.report_due {
            if due <= now {
                if recv.reports_left > 0 {
                    recv.reports_left -= 1;
                    recv.report_due = Some(now + interval);
                    let (number, missing) = match (&recv.block, &recv.assembler) {
                        (Some(block), Some(asm)) => (block.number, asm.missing_chunks()),
                        _ => return,
                    };
                    let id = recv.xfer.id;
                    let cli = recv.cli;
                    self.stats.reports += 1;
                    let _ = self.transport.send(
                        cli,
                        &Message::BlockReport {
                            id,
                            block_number: number,
                            missing_chunks: missing,
                        },
                    );
                } else {
                    // report 재전송 소진. 세션의 운명은 폐기 타임아웃이
                    // 결정한다
                    recv.report_due = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryBlob;

    #[derive(Default)]
    struct VecTransport {
        sent: Vec<(Addr, Message)>,
    }

    impl Transport for VecTransport {
        fn send(&mut self, dst: Addr, msg: &Message) -> Result<()> {
            self.sent.push((dst, msg.clone()));
            Ok(())
        }
    }

    const CLI: Addr = 0x0001;

    fn srv() -> BlobSrv<VecTransport> {
        BlobSrv::new(
            VecTransport::default(),
            ProtocolConfig::default(),
            Capabilities::default(),
        )
    }

    fn xfer(size: u32) -> Xfer {
        Xfer {
            id: 42,
            size,
            block_size_log: 6,
            chunk_size: 32,
            mode: XferMode::Push,
        }
    }

    fn push_chunk(srv: &mut BlobSrv<VecTransport>, data: &[u8], number: u16, now: Instant) {
        let chunk = Chunk {
            number,
            offset: number as u32 * 32,
            data: bytes::Bytes::copy_from_slice(data),
        };
        srv.handle_message(CLI, Message::chunk(42, 0, &chunk), now);
    }

    fn ack_delay_ms() -> u64 {
        ProtocolConfig::default().sar_rx.ack_delay_ms() as u64
    }

    #[test]
    fn caps_get_answered() {
        let mut srv = srv();
        srv.handle_message(CLI, Message::CapsGet, Instant::now());
        assert!(matches!(
            srv.transport.sent.as_slice(),
            [(CLI, Message::CapsStatus(_))]
        ));
    }

    #[test]
    fn start_without_recv_rejected() {
        let mut srv = srv();
        srv.handle_message(CLI, Message::XferStart(xfer(64)), Instant::now());
        match &srv.transport.sent[..] {
            [(CLI, Message::XferStatus { status, .. })] => {
                assert_eq!(*status, BlobStatus::WrongBlobId);
            }
            other => panic!("예상 밖의 트래픽: {other:?}"),
        }
    }

    #[test]
    fn oversized_transfer_rejected() {
        let mut srv = srv();
        srv.recv(42, Box::new(MemoryBlob::for_receive())).unwrap();
        let too_big = Xfer {
            size: Capabilities::default().max_size + 1,
            ..xfer(0)
        };
        srv.handle_message(CLI, Message::XferStart(too_big), Instant::now());
        match &srv.transport.sent[..] {
            [(CLI, Message::XferStatus { status, .. })] => {
                assert_eq!(*status, BlobStatus::BlobTooLarge);
            }
            other => panic!("예상 밖의 트래픽: {other:?}"),
        }
        assert_eq!(srv.phase(), XferPhase::WaitingForStart);
    }

    #[test]
    fn push_block_reassembled_and_acked() {
        let mut srv = srv();
        let now = Instant::now();
        srv.recv(42, Box::new(MemoryBlob::for_receive())).unwrap();
        srv.handle_message(CLI, Message::XferStart(xfer(64)), now);
        assert_eq!(
            srv.poll_event(),
            Some(SrvEvent::XferAccepted { id: 42, from: CLI })
        );

        srv.handle_message(
            CLI,
            Message::BlockStart {
                id: 42,
                block_number: 0,
                chunk_size: 32,
            },
            now,
        );
        push_chunk(&mut srv, &[0xAA; 32], 0, now);
        push_chunk(&mut srv, &[0xBB; 32], 1, now);

        assert_eq!(srv.poll_event(), Some(SrvEvent::BlockComplete { block_number: 0 }));
        assert_eq!(srv.phase(), XferPhase::Complete);
        assert_eq!(srv.progress(), 100);

        // 완료 ack은 ack 지연이 지난 뒤 poll에서 나간다
        srv.poll(now + Duration::from_millis(ack_delay_ms() + 1));
        assert_eq!(srv.poll_event(), Some(SrvEvent::End { id: 42 }));

        // 블록 완료 ack과 전송 완료 상태
        assert!(srv.transport.sent.iter().any(|(_, m)| matches!(
            m,
            Message::BlockStatus { missing_chunks, .. } if missing_chunks.is_empty()
        )));
        assert!(srv.transport.sent.iter().any(|(_, m)| matches!(
            m,
            Message::XferStatus { phase: XferPhase::Complete, .. }
        )));

        srv.verified().unwrap();
        assert_eq!(srv.phase(), XferPhase::Inactive);
    }

    #[test]
    fn completion_ack_coalesced_after_ack_delay() {
        let mut srv = srv();
        let now = Instant::now();
        srv.recv(42, Box::new(MemoryBlob::for_receive())).unwrap();
        srv.handle_message(CLI, Message::XferStart(xfer(64)), now);
        srv.handle_message(
            CLI,
            Message::BlockStart {
                id: 42,
                block_number: 0,
                chunk_size: 32,
            },
            now,
        );
        push_chunk(&mut srv, &[0xAA; 32], 0, now);
        push_chunk(&mut srv, &[0xBB; 32], 1, now);

        // 마지막 청크 직후에는 ack이 나가지 않는다
        assert!(!srv
            .transport
            .sent
            .iter()
            .any(|(_, m)| matches!(m, Message::BlockStatus { .. })));

        srv.poll(now + Duration::from_millis(ack_delay_ms() - 1));
        assert!(!srv
            .transport
            .sent
            .iter()
            .any(|(_, m)| matches!(m, Message::BlockStatus { .. })));

        srv.poll(now + Duration::from_millis(ack_delay_ms() + 1));
        let acks: Vec<_> = srv
            .transport
            .sent
            .iter()
            .filter(|(_, m)| matches!(m, Message::BlockStatus { .. }))
            .collect();
        assert_eq!(acks.len(), 1);
        assert!(matches!(
            &acks[0].1,
            Message::BlockStatus { block_number: 0, missing_chunks, .. }
                if missing_chunks.is_empty()
        ));
    }

    #[test]
    fn corrupt_chunk_dropped_without_side_effects() {
        let mut srv = srv();
        let now = Instant::now();
        srv.recv(42, Box::new(MemoryBlob::for_receive())).unwrap();
        srv.handle_message(CLI, Message::XferStart(xfer(64)), now);
        srv.handle_message(
            CLI,
            Message::BlockStart {
                id: 42,
                block_number: 0,
                chunk_size: 32,
            },
            now,
        );

        srv.handle_message(
            CLI,
            Message::Chunk {
                id: 42,
                block_number: 0,
                chunk_number: 0,
                offset: 0,
                crc32: 0xDEAD_BEEF,
                data: vec![0xAA; 32],
            },
            now,
        );
        assert_eq!(srv.stats().chunks_dropped, 1);
        assert_eq!(srv.stats().chunks_received, 0);

        // 무관한 전송 id
        let chunk = Chunk {
            number: 0,
            offset: 0,
            data: bytes::Bytes::from(vec![0xAA; 32]),
        };
        srv.handle_message(CLI, Message::chunk(7, 0, &chunk), now);
        assert_eq!(srv.stats().chunks_dropped, 2);
    }

    #[test]
    fn duplicate_chunk_counted_once() {
        let mut srv = srv();
        let now = Instant::now();
        srv.recv(42, Box::new(MemoryBlob::for_receive())).unwrap();
        srv.handle_message(CLI, Message::XferStart(xfer(64)), now);
        srv.handle_message(
            CLI,
            Message::BlockStart {
                id: 42,
                block_number: 0,
                chunk_size: 32,
            },
            now,
        );

        push_chunk(&mut srv, &[0xAA; 32], 0, now);
        push_chunk(&mut srv, &[0xAA; 32], 0, now);
        assert_eq!(srv.stats().chunks_received, 1);
        assert_eq!(srv.stats().total_bytes, 32);
    }

    #[test]
    fn discard_timeout_drops_partial_state() {
        let mut srv = srv();
        let now = Instant::now();
        srv.recv(42, Box::new(MemoryBlob::for_receive())).unwrap();
        srv.handle_message(CLI, Message::XferStart(xfer(64)), now);
        srv.handle_message(
            CLI,
            Message::BlockStart {
                id: 42,
                block_number: 0,
                chunk_size: 32,
            },
            now,
        );
        push_chunk(&mut srv, &[0xAA; 32], 0, now);
        while srv.poll_event().is_some() {}

        let later = now + Duration::from_millis(
            ProtocolConfig::default().sar_rx.discard_timeout_ms() as u64 + 1,
        );
        srv.poll(later);
        assert_eq!(srv.poll_event(), Some(SrvEvent::Discarded { id: 42 }));
        assert_eq!(srv.phase(), XferPhase::Inactive);
    }

    #[test]
    fn pull_receiver_drives_block_requests() {
        let mut srv = srv();
        let now = Instant::now();
        srv.recv(42, Box::new(MemoryBlob::for_receive())).unwrap();

        let pull = Xfer {
            mode: XferMode::Pull,
            ..xfer(64)
        };
        srv.handle_message(CLI, Message::XferStart(pull), now);

        // 수락 상태 다음에 블록 0의 청크 전부를 요구하는 report
        let report = srv
            .transport
            .sent
            .iter()
            .find_map(|(_, m)| match m {
                Message::BlockReport { block_number, missing_chunks, .. } => {
                    Some((*block_number, missing_chunks.clone()))
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(report.0, 0);
        assert_eq!(report.1, vec![0, 1]);

        push_chunk(&mut srv, &[0x11; 32], 0, now);
        push_chunk(&mut srv, &[0x22; 32], 1, now);

        // 블록을 닫는 빈 report, 이어서 전송 완료 상태
        assert!(srv.transport.sent.iter().any(|(_, m)| matches!(
            m,
            Message::BlockReport { missing_chunks, .. } if missing_chunks.is_empty()
        )));
        assert!(srv.transport.sent.iter().any(|(_, m)| matches!(
            m,
            Message::XferStatus { phase: XferPhase::Complete, .. }
        )));
    }

    #[test]
    fn cancel_known_id_acknowledged() {
        let mut srv = srv();
        let now = Instant::now();
        srv.recv(42, Box::new(MemoryBlob::for_receive())).unwrap();
        srv.handle_message(CLI, Message::XferStart(xfer(64)), now);
        while srv.poll_event().is_some() {}

        srv.handle_message(CLI, Message::XferCancel { id: 42 }, now);
        assert_eq!(srv.poll_event(), Some(SrvEvent::Cancelled { id: 42 }));
        assert_eq!(srv.phase(), XferPhase::Inactive);

        srv.handle_message(CLI, Message::XferCancel { id: 99 }, now);
        match srv.transport.sent.last().unwrap() {
            (_, Message::XferStatus { status, .. }) => {
                assert_eq!(*status, BlobStatus::WrongBlobId);
            }
            other => panic!("예상 밖의 트래픽: {other:?}"),
        }
    }
}
