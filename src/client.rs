//! BLOB 전송 클라이언트 (코디네이터)
//!
//! 모든 대상에 걸친 BLOB 전송 하나를 이끈다: 수신 능력 협상, 푸시/풀
//! 블록 루프, 대상별 재시도, 진행률 집계, 취소. sans-IO 구조로 수신
//! 메시지는 [`BlobClient::handle_message`], 시간은 [`BlobClient::poll`]로
//! 공급하고 [`ClientEvent`]를 꺼낸다. 송신 메시지는 [`Transport`]를
//! 거친다.
//!
//! 응답이 끊긴 대상은 SAR 송신 예산만큼 재시도한 뒤 손실로 표시해
//! 제외하고, 전송은 남은 대상으로 계속된다. 부분 성공도 정식 완료
//! 결과다.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::block::{self, Block};
use crate::config::{ProtocolConfig, TransferInputs};
use crate::error::{Error, Result};
use crate::io::BlobIo;
use crate::message::{BlobStatus, Capabilities, Message, ModeSupport, Xfer, XferMode, XferPhase};
use crate::stats::TransferStats;
use crate::target::{Target, TargetPhase, TargetRegistry};
use crate::{Addr, XferId};

/// 송신 메시지 싱크. 전송은 전송 계층 MTU에 묶인다. 실패한 send는
/// 프로토콜 에러가 아니라 유실된 패킷으로 취급한다
pub trait Transport {
    fn send(&mut self, dst: Addr, msg: &Message) -> Result<()>;
}

/// 클라이언트가 올리는 알림
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// 수신 능력 조회 결과. 사용 가능한 대상이 없으면 `None`
    Caps(Option<Capabilities>),

    /// 대상이 재시도 예산을 소진했거나 종단 에러를 보고했다
    LostTarget { addr: Addr },

    /// 읽기 전용 진행 조회의 대상별 상태
    TargetStatus {
        addr: Addr,
        phase: XferPhase,
        missing_blocks: Vec<u16>,
    },

    /// 전송 종료. `success`는 대상 하나 이상이 완료했다는 뜻
    End { success: bool },
}

/// 정책 계층을 위한 대략적인 클라이언트 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    Idle,
    CapsGet,
    Transfer,
    ProgressGet,
    Suspended,
    Complete,
    Cancelled,
    Failed,
}

#[derive(Debug)]
enum State {
    Idle,
    /// 수신 능력 응답 집계 중
    CapsGet { acc: Option<Capabilities> },
    /// 전송 시작 송신, 대상별 상태 대기
    Starting,
    /// 푸시 모드: `block`의 청크가 비행 중, 블록 상태 대기
    SendBlock { block: Block },
    /// 풀 모드: 부분 블록 report에 응답 중
    Pull,
    /// 마지막 블록 완료, 대상별 최종 전송 상태 대기
    FinalStatus,
    /// 읽기 전용 상태 라운드
    ProgressGet { id: XferId },
    Complete,
    Cancelled,
    Failed,
}

/// BLOB 전송 코디네이터
pub struct BlobClient<T: Transport> {
    transport: T,
    config: ProtocolConfig,
    inputs: TransferInputs,
    caps: Option<Capabilities>,
    state: State,
    xfer: Option<Xfer>,
    io: Option<Box<dyn BlobIo>>,
    suspended: bool,
    events: VecDeque<ClientEvent>,
    stats: TransferStats,
}

impl<T: Transport> BlobClient<T> {
    pub fn new(transport: T, config: ProtocolConfig) -> Self {
        Self {
            transport,
            config,
            inputs: TransferInputs::default(),
            caps: None,
            state: State::Idle,
            xfer: None,
            io: None,
            suspended: false,
            events: VecDeque::new(),
            stats: TransferStats::new(),
        }
    }

    /// 정책 계층을 위한 대략적인 단계
    pub fn phase(&self) -> ClientPhase {
        if self.suspended {
            return ClientPhase::Suspended;
        }
        match self.state {
            State::Idle => ClientPhase::Idle,
            State::CapsGet { .. } => ClientPhase::CapsGet,
            State::Starting | State::SendBlock { .. } | State::Pull | State::FinalStatus => {
                ClientPhase::Transfer
            }
            State::ProgressGet { .. } => ClientPhase::ProgressGet,
            State::Complete => ClientPhase::Complete,
            State::Cancelled => ClientPhase::Cancelled,
            State::Failed => ClientPhase::Failed,
        }
    }

    /// 마지막 조회에서 집계된 수신 능력
    pub fn caps(&self) -> Option<Capabilities> {
        self.caps
    }

    /// 전송 통계
    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    /// 다음 이벤트 (있으면)
    pub fn poll_event(&mut self) -> Option<ClientEvent> {
        self.events.pop_front()
    }

    /// 호출측이 깨워 줘야 하는 가장 이른 기한
    pub fn next_timeout(&self, registry: &TargetRegistry) -> Option<Instant> {
        if self.suspended {
            return None;
        }
        registry
            .iter()
            .filter(|t| !matches!(t.phase, TargetPhase::Lost | TargetPhase::Fail | TargetPhase::Cancelled))
            .filter_map(|t| t.blob.deadline)
            .min()
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.config.sar_tx.retrans_timeout_ms(self.inputs.ttl) as u64)
    }

    fn retry_budget(&self) -> u32 {
        self.config.sar_tx.retrans_count()
    }

    fn busy(&self) -> bool {
        !matches!(
            self.state,
            State::Idle | State::Complete | State::Cancelled | State::Failed
        )
    }

    // ---- 작업 -----------------------------------------------------------

    /// 모든 대상에 수신 능력을 조회하고 교집합으로 집계한다.
    /// [`ClientEvent::Caps`]로 끝난다
    pub fn caps_get(
        &mut self,
        registry: &mut TargetRegistry,
        inputs: TransferInputs,
        now: Instant,
    ) -> Result<()> {
        if self.busy() {
            return Err(Error::Busy);
        }
        if registry.is_empty() {
            return Err(Error::NoTargets);
        }

        self.inputs = inputs;
        registry.reset_for_new_attempt();
        let timeout = self.request_timeout();
        for target in registry.iter_mut() {
            target.phase = TargetPhase::Active;
            target.blob.awaiting_rsp = true;
            target.blob.attempts = 1;
            target.blob.deadline = Some(now + timeout);
            let _ = self.transport.send(target.addr, &Message::CapsGet);
        }

        debug!(targets = registry.len(), "수신 능력 조회 시작");
        self.state = State::CapsGet { acc: None };
        Ok(())
    }

    /// 전송을 시작한다. `xfer`를 집계된 수신 능력과 대조해 검증하고,
    /// 레지스트리를 초기화한 뒤 완료·취소·전 대상 손실까지 블록 루프를
    /// 돌린다
    pub fn send(
        &mut self,
        registry: &mut TargetRegistry,
        xfer: Xfer,
        mut io: Box<dyn BlobIo>,
        inputs: TransferInputs,
        now: Instant,
    ) -> Result<()> {
        if self.busy() {
            return Err(Error::Busy);
        }
        if registry.is_empty() {
            return Err(Error::NoTargets);
        }
        if let Some(caps) = &self.caps {
            self.validate(&xfer, caps)?;
        }

        io.open(&xfer)?;
        self.inputs = inputs;
        self.xfer = Some(xfer);
        self.io = Some(io);
        self.stats = TransferStats::new();

        registry.reset_for_new_attempt();
        registry.set_active(true);
        let timeout = self.request_timeout();
        for target in registry.iter_mut() {
            target.phase = TargetPhase::Active;
            target.blob.awaiting_rsp = true;
            target.blob.attempts = 1;
            target.blob.deadline = Some(now + timeout);
            let _ = self.transport.send(target.addr, &Message::XferStart(xfer));
        }

        info!(
            id = xfer.id,
            size = xfer.size,
            blocks = xfer.block_count(),
            mode = ?xfer.mode,
            targets = registry.len(),
            "전송 시작"
        );
        self.state = State::Starting;
        Ok(())
    }

    fn validate(&self, xfer: &Xfer, caps: &Capabilities) -> Result<()> {
        if xfer.size > caps.max_size {
            return Err(Error::InvalidSize {
                size: xfer.size,
                max: caps.max_size,
            });
        }
        if xfer.block_size_log < caps.min_block_size_log
            || xfer.block_size_log > caps.max_block_size_log
        {
            return Err(Error::InvalidBlockSize {
                block_size_log: xfer.block_size_log,
                min: caps.min_block_size_log,
                max: caps.max_block_size_log,
            });
        }
        if xfer.chunk_size > caps.max_chunk_size {
            return Err(Error::InvalidChunkSize {
                chunk_size: xfer.chunk_size,
                max: caps.max_chunk_size,
            });
        }
        let chunks = block::chunk_count(1 << xfer.block_size_log, xfer.chunk_size);
        if chunks > caps.max_chunks as u32 {
            return Err(Error::InvalidChunkSize {
                chunk_size: xfer.chunk_size,
                max: caps.max_chunk_size,
            });
        }
        if !caps.modes.supports(xfer.mode) {
            return Err(Error::UnsupportedMode);
        }
        Ok(())
    }

    /// 모든 대상에 전송 취소를 보낸다. 로컬에서는 항상 성공. 실패한
    /// send는 취소 에러가 아니라 손실 대상으로 드러난다
    pub fn cancel(&mut self, registry: &mut TargetRegistry) {
        let id = self.xfer.map(|x| x.id).unwrap_or_default();
        for target in registry.iter_mut() {
            if target.is_active() {
                let _ = self.transport.send(target.addr, &Message::XferCancel { id });
                target.phase = TargetPhase::Cancelled;
                target.blob.awaiting_rsp = false;
                target.blob.deadline = None;
            }
        }
        registry.set_active(false);
        self.suspended = false;
        self.io = None;
        if self.busy() {
            info!(id, "전송 취소");
            self.state = State::Cancelled;
        }
    }

    /// 대상 하나에만 전송을 취소한다. 나머지 대상으로 전송은 계속된다
    pub fn cancel_target(&mut self, registry: &mut TargetRegistry, addr: Addr, now: Instant) {
        let id = self.xfer.map(|x| x.id).unwrap_or_default();
        if let Some(target) = registry.get_mut(addr) {
            let _ = self.transport.send(addr, &Message::XferCancel { id });
            target.phase = TargetPhase::Cancelled;
            target.blob.awaiting_rsp = false;
            target.blob.deadline = None;
        }
        self.advance(registry, now);
    }

    /// 대상별 진행 상태를 버리지 않고 재시도 루프를 멈춘다. 와이어
    /// 트래픽 없음. 일시정지가 길어지면 대상은 자체 폐기 타이머로
    /// 타임아웃된다
    pub fn suspend(&mut self) {
        if self.busy() {
            self.suspended = true;
            debug!("전송 일시정지");
        }
    }

    /// 일시정지된 전송을 재개하고 재시도 횟수를 소모하지 않은 채
    /// 미결 요청을 다시 보낸다
    pub fn resume(&mut self, registry: &mut TargetRegistry, now: Instant) {
        if !self.suspended {
            return;
        }
        self.suspended = false;
        debug!("전송 재개");
        self.resend_pending(registry, now);
    }

    /// 집계 진행률: 활성 대상 전체의 확인된 블록 수 / (블록 수 × 활성
    /// 대상 수), 내림
    pub fn progress(&self, registry: &TargetRegistry) -> u8 {
        let Some(xfer) = &self.xfer else { return 0 };
        let blocks = xfer.block_count() as u64;

        let mut confirmed = 0u64;
        let mut counted = 0u64;
        for target in registry.iter() {
            match target.phase {
                TargetPhase::Success | TargetPhase::Applying | TargetPhase::Applied => {
                    confirmed += blocks;
                    counted += 1;
                }
                TargetPhase::Active => {
                    confirmed += match &target.blob.missing_blocks {
                        Some(missing) => blocks - missing.len() as u64,
                        None => target.blob.blocks_confirmed as u64,
                    };
                    counted += 1;
                }
                _ => {}
            }
        }

        if blocks == 0 || counted == 0 {
            return 0;
        }
        (confirmed * 100 / (blocks * counted)) as u8
    }

    /// 읽기 전용 상태 조회: 전송 상태를 건드리지 않고 모든 대상에
    /// 단계와 누락 블록 목록을 묻는다. 코디네이터 재시작 후 진행 중인
    /// 전송에 다시 붙을 때 쓴다
    pub fn xfer_progress_get(
        &mut self,
        registry: &mut TargetRegistry,
        id: XferId,
        inputs: TransferInputs,
        now: Instant,
    ) -> Result<()> {
        if self.busy() {
            return Err(Error::Busy);
        }
        if registry.is_empty() {
            return Err(Error::NoTargets);
        }

        self.inputs = inputs;
        let timeout = self.request_timeout();
        for target in registry.iter_mut() {
            target.phase = TargetPhase::Active;
            target.blob.awaiting_rsp = true;
            target.blob.attempts = 1;
            target.blob.deadline = Some(now + timeout);
            let _ = self.transport.send(target.addr, &Message::XferGet { id });
        }
        self.state = State::ProgressGet { id };
        Ok(())
    }

    // ---- 수신 처리 ------------------------------------------------------

    /// 수신 메시지 하나를 상태 기계에 공급한다
    pub fn handle_message(
        &mut self,
        registry: &mut TargetRegistry,
        from: Addr,
        msg: Message,
        now: Instant,
    ) {
        match (&mut self.state, msg) {
            (State::CapsGet { acc }, Message::CapsStatus(caps)) => {
                let Some(target) = registry.get_mut(from) else { return };
                if !target.blob.awaiting_rsp {
                    return;
                }
                target.blob.awaiting_rsp = false;
                target.blob.deadline = None;

                if caps.modes == ModeSupport::None
                    || caps.min_block_size_log > caps.max_block_size_log
                {
                    warn!(addr = from, "대상이 어떤 전송에도 참여 불가");
                    Self::mark_lost(&mut self.events, &mut self.stats, target);
                } else {
                    *acc = Some(match acc {
                        Some(agg) => agg.intersect(&caps),
                        None => caps,
                    });
                }
                self.advance(registry, now);
            }

            (State::Starting, Message::XferStatus { status, missing_blocks, .. }) => {
                let Some(target) = registry.get_mut(from) else { return };
                if !target.blob.awaiting_rsp {
                    return;
                }
                target.blob.awaiting_rsp = false;
                target.blob.deadline = None;
                target.blob_status = Some(status);
                self.stats.reports += 1;

                if status == BlobStatus::Success {
                    target.blob.missing_blocks = Some(missing_blocks);
                } else {
                    warn!(addr = from, ?status, "대상이 전송 시작 거부");
                    target.phase = TargetPhase::Fail;
                    self.events.push_back(ClientEvent::LostTarget { addr: from });
                }
                self.advance(registry, now);
            }

            // 블록 ack은 응답으로도, 수신측 통합 ack 타이머와 블록 완료
            // 시점의 비요청 송신으로도 도착한다
            (State::SendBlock { block }, Message::BlockStatus { status, block_number, missing_chunks }) => {
                let number = block.number;
                let Some(target) = registry.get_mut(from) else { return };
                if !target.is_active() || block_number != number {
                    return;
                }
                target.blob.awaiting_rsp = false;
                target.blob.deadline = None;
                target.blob_status = Some(status);
                self.stats.reports += 1;

                if status != BlobStatus::Success {
                    warn!(addr = from, ?status, block = block_number, "블록 거부됨");
                    target.phase = TargetPhase::Fail;
                    self.events.push_back(ClientEvent::LostTarget { addr: from });
                } else if missing_chunks.is_empty() {
                    if !target.blob.block_acked {
                        target.blob.block_acked = true;
                        target.blob.blocks_confirmed += 1;
                        if let Some(missing) = &mut target.blob.missing_blocks {
                            missing.retain(|&b| b != block_number);
                        }
                    }
                } else {
                    // 줄어드는 누락 목록은 진전이므로 재시도 예산을
                    // 다시 채운다
                    if target.blob.missing_chunks.is_empty()
                        || missing_chunks.len() < target.blob.missing_chunks.len()
                    {
                        target.blob.attempts = 0;
                    }
                    target.blob.missing_chunks = missing_chunks;
                }
                self.advance(registry, now);
            }

            (State::Pull, Message::BlockReport { id, block_number, missing_chunks }) => {
                if self.xfer.map(|x| x.id) != Some(id) {
                    return;
                }
                self.serve_pull_report(registry, from, block_number, missing_chunks, now);
            }

            // 풀 모드 수신기는 완료를 비요청으로 알린다. 푸시 모드의
            // 최종 상태 라운드도 XferGet에 같은 형태로 답한다
            (State::Pull | State::FinalStatus, Message::XferStatus { status, phase, missing_blocks, .. }) => {
                let Some(target) = registry.get_mut(from) else { return };
                if !target.is_active() {
                    return;
                }
                target.blob.awaiting_rsp = false;
                target.blob.deadline = None;
                target.blob_status = Some(status);
                self.stats.reports += 1;

                if status == BlobStatus::Success && phase == XferPhase::Complete {
                    info!(addr = from, "대상이 전송 완료");
                    target.phase = TargetPhase::Success;
                    target.blob.missing_blocks = Some(Vec::new());
                } else if status != BlobStatus::Success {
                    warn!(addr = from, ?status, "대상이 실패 보고");
                    target.phase = TargetPhase::Fail;
                    self.events.push_back(ClientEvent::LostTarget { addr: from });
                } else {
                    target.blob.missing_blocks = Some(missing_blocks);
                }
                self.advance(registry, now);
            }

            (State::ProgressGet { id }, Message::XferStatus { status: _, id: rsp_id, phase, missing_blocks }) => {
                if rsp_id != *id {
                    return;
                }
                let Some(target) = registry.get_mut(from) else { return };
                if !target.blob.awaiting_rsp {
                    return;
                }
                target.blob.awaiting_rsp = false;
                target.blob.deadline = None;
                target.blob.missing_blocks = Some(missing_blocks.clone());
                self.events.push_back(ClientEvent::TargetStatus {
                    addr: from,
                    phase,
                    missing_blocks,
                });
                self.advance(registry, now);
            }

            _ => {}
        }
    }

    // ---- 타이머 ----------------------------------------------------------

    /// 만료된 대상별 기한을 처리한다: SAR 예산 안에서는 재전송, 넘어서면
    /// 대상 손실 표시
    pub fn poll(&mut self, registry: &mut TargetRegistry, now: Instant) {
        if self.suspended || !self.busy() {
            return;
        }

        let budget = self.retry_budget();
        let timeout = self.request_timeout();
        let mut expired: Vec<Addr> = Vec::new();
        for target in registry.iter() {
            if target.is_active() {
                if let Some(deadline) = target.blob.deadline {
                    if deadline <= now {
                        expired.push(target.addr);
                    }
                }
            }
        }

        for addr in expired {
            let pull = matches!(self.state, State::Pull);
            let Some(target) = registry.get_mut(addr) else { continue };

            // 풀 모드의 대기는 timeout_base로 한 번만 잰다. 한 번도
            // 요청하지 않는 대상은 재시도 없이 손실이다
            if pull || target.blob.attempts >= budget {
                warn!(addr, attempts = target.blob.attempts, "재시도 예산 소진");
                Self::mark_lost(&mut self.events, &mut self.stats, target);
                continue;
            }

            target.blob.attempts += 1;
            target.blob.deadline = Some(now + timeout);
            self.stats.chunks_retransmitted += self.resend_to(registry, addr);
        }

        self.advance(registry, now);
    }

    fn mark_lost(
        events: &mut VecDeque<ClientEvent>,
        stats: &mut TransferStats,
        target: &mut Target,
    ) {
        target.phase = TargetPhase::Lost;
        target.blob.awaiting_rsp = false;
        target.blob.deadline = None;
        stats.lost_targets += 1;
        events.push_back(ClientEvent::LostTarget { addr: target.addr });
    }

    /// `addr`로 미결 요청을 다시 보낸다. 함께 재전송한 청크 수를
    /// 돌려준다
    fn resend_to(&mut self, registry: &TargetRegistry, addr: Addr) -> u64 {
        let Some(target) = registry.get(addr) else { return 0 };
        match &self.state {
            State::CapsGet { .. } => {
                let _ = self.transport.send(addr, &Message::CapsGet);
                0
            }
            State::Starting => {
                if let Some(xfer) = self.xfer {
                    let _ = self.transport.send(addr, &Message::XferStart(xfer));
                }
                0
            }
            State::SendBlock { block } => {
                let block = *block;
                let Some(xfer) = self.xfer else { return 0 };
                // 대상이 누락으로 보고한 청크를 다시 보내고 재질의한다.
                // 아직 보고가 없으면 상태 요청만 반복한다
                let missing = target.blob.missing_chunks.clone();
                let mut resent = 0;
                for number in missing {
                    if let Some(io) = self.io.as_deref() {
                        if let Ok(chunk) = io.read_chunk(&block, number, xfer.chunk_size) {
                            let _ = self
                                .transport
                                .send(addr, &Message::chunk(xfer.id, block.number, &chunk));
                            resent += 1;
                        }
                    }
                }
                let _ = self.transport.send(
                    addr,
                    &Message::BlockGet {
                        id: xfer.id,
                        block_number: block.number,
                    },
                );
                resent
            }
            State::FinalStatus => {
                if let Some(xfer) = self.xfer {
                    let _ = self.transport.send(addr, &Message::XferGet { id: xfer.id });
                }
                0
            }
            State::ProgressGet { id } => {
                let id = *id;
                let _ = self.transport.send(addr, &Message::XferGet { id });
                0
            }
            _ => 0,
        }
    }

    fn resend_pending(&mut self, registry: &mut TargetRegistry, now: Instant) {
        let timeout = match self.state {
            State::Pull => self.inputs.client_timeout(),
            _ => self.request_timeout(),
        };
        let pending: Vec<Addr> = registry
            .iter()
            .filter(|t| t.is_active() && t.blob.awaiting_rsp)
            .map(|t| t.addr)
            .collect();
        for addr in pending {
            self.resend_to(registry, addr);
            if let Some(target) = registry.get_mut(addr) {
                target.blob.deadline = Some(now + timeout);
            }
        }
        // 풀 모드 대상은 미결 요청 없이 기한만 가진다. 그 대기도 같이
        // 미뤄 준다
        if matches!(self.state, State::Pull) {
            for target in registry.iter_mut() {
                if target.is_active() {
                    target.blob.deadline = Some(now + self.inputs.client_timeout());
                }
            }
        }
    }

    // ---- 상태 전진 -------------------------------------------------------

    /// 현재 상태가 기다리던 것을 다 모았는지 확인하고 기계를 앞으로
    /// 움직인다
    fn advance(&mut self, registry: &mut TargetRegistry, now: Instant) {
        if registry.iter().any(|t| t.is_active() && t.blob.awaiting_rsp) {
            return;
        }

        match std::mem::replace(&mut self.state, State::Idle) {
            State::CapsGet { acc } => {
                let caps = acc.filter(|c| c.usable() && registry.active_count() > 0);
                if caps.is_some() {
                    self.caps = caps;
                }
                info!(usable = caps.is_some(), "수신 능력 조회 완료");
                self.events.push_back(ClientEvent::Caps(caps));
                self.state = State::Idle;
            }

            State::Starting => {
                if registry.active_count() == 0 {
                    self.finish(registry, false);
                    return;
                }
                match self.xfer.map(|x| x.mode) {
                    Some(XferMode::Push) => self.next_block(registry, now),
                    Some(XferMode::Pull) => self.enter_pull(registry, now),
                    None => self.state = State::Idle,
                }
            }

            State::SendBlock { block } => {
                if registry.active_count() == 0 {
                    self.finish(registry, false);
                    return;
                }
                let all_acked = registry
                    .iter()
                    .filter(|t| t.is_active())
                    .all(|t| t.blob.block_acked);
                if all_acked {
                    self.stats.blocks_confirmed += 1;
                    debug!(block = block.number, "모든 활성 대상이 블록 확인");
                    self.next_block(registry, now);
                } else {
                    // 아직 청크가 빠진 대상이 있다. 그 누락 목록에 대한
                    // 재전송 라운드를 시작한다
                    self.state = State::SendBlock { block };
                    self.retransmit_round(registry, now);
                }
            }

            State::Pull => {
                if registry.active_count() == 0 {
                    let success = registry.iter().any(|t| t.phase == TargetPhase::Success);
                    self.finish(registry, success);
                    return;
                }
                self.state = State::Pull;
            }

            State::FinalStatus => {
                let success = registry.iter().any(|t| t.phase == TargetPhase::Success);
                self.finish(registry, success);
            }

            State::ProgressGet { .. } => {
                self.state = State::Idle;
            }

            other => self.state = other,
        }
    }

    fn finish(&mut self, registry: &mut TargetRegistry, success: bool) {
        registry.set_active(false);
        self.io = None;
        self.state = if success { State::Complete } else { State::Failed };
        info!(success, "전송 종료: {}", self.stats.summary());
        self.events.push_back(ClientEvent::End { success });
    }

    /// 활성 대상 중 누군가 아직 못 받은 가장 낮은 블록을 골라 보낸다.
    /// 남은 블록이 없으면 최종 상태 라운드로 들어간다
    fn next_block(&mut self, registry: &mut TargetRegistry, now: Instant) {
        let Some(xfer) = self.xfer else {
            self.state = State::Idle;
            return;
        };

        let block_count = xfer.block_count() as u16;
        let mut next: Option<u16> = None;
        for target in registry.iter() {
            if !target.is_active() {
                continue;
            }
            let wanted = match &target.blob.missing_blocks {
                Some(missing) => missing.iter().copied().min(),
                None => Some(target.blob.blocks_confirmed as u16),
            };
            if let Some(b) = wanted {
                if b < block_count {
                    next = Some(next.map_or(b, |n: u16| n.min(b)));
                }
            }
        }

        match next {
            Some(number) => {
                let block = Block::new(xfer.size, xfer.block_size_log, number);
                self.state = State::SendBlock { block };
                self.start_block(registry, block, now);
            }
            None => {
                self.state = State::FinalStatus;
                let timeout = self.request_timeout();
                for target in registry.iter_mut() {
                    if target.is_active() {
                        target.blob.awaiting_rsp = true;
                        target.blob.attempts = 1;
                        target.blob.deadline = Some(now + timeout);
                        let _ = self
                            .transport
                            .send(target.addr, &Message::XferGet { id: xfer.id });
                    }
                }
            }
        }
    }

    /// 블록 시작과 그 블록의 청크 전부를 아직 못 받은 대상에 보낸다
    fn start_block(&mut self, registry: &mut TargetRegistry, block: Block, now: Instant) {
        let Some(xfer) = self.xfer else { return };
        let timeout = self.request_timeout();

        let mut receivers: Vec<Addr> = Vec::new();
        for target in registry.iter_mut() {
            if !target.is_active() {
                continue;
            }
            let misses = match &target.blob.missing_blocks {
                Some(missing) => missing.contains(&block.number),
                None => true,
            };
            target.blob.block_acked = !misses;
            target.blob.missing_chunks.clear();
            if !misses {
                continue;
            }
            target.blob.awaiting_rsp = true;
            target.blob.attempts = 1;
            target.blob.deadline = Some(now + timeout);
            receivers.push(target.addr);
            let _ = self.transport.send(
                target.addr,
                &Message::BlockStart {
                    id: xfer.id,
                    block_number: block.number,
                    chunk_size: xfer.chunk_size,
                },
            );
        }

        if receivers.is_empty() {
            // 모두 이미 가진 블록 (재개된 전송)
            self.advance(registry, now);
            return;
        }

        debug!(block = block.number, size = block.size, to = receivers.len(), "블록 송신");
        let count = block::chunk_count(block.size, xfer.chunk_size) as u16;
        for number in 0..count {
            let Some(io) = self.io.as_deref() else { break };
            let Ok(chunk) = io.read_chunk(&block, number, xfer.chunk_size) else {
                continue;
            };
            let msg = Message::chunk(xfer.id, block.number, &chunk);
            self.stats.total_bytes += chunk.data.len() as u64;
            if let Some(group) = self.inputs.group {
                self.stats.chunks_sent += 1;
                let _ = self.transport.send(group, &msg);
            } else {
                for &addr in &receivers {
                    self.stats.chunks_sent += 1;
                    let _ = self.transport.send(addr, &msg);
                }
            }
        }
    }

    /// 현재 블록을 아직 ack하지 않은 대상에 누락 보고된 청크를 다시
    /// 보내고 블록 상태를 재질의한다
    fn retransmit_round(&mut self, registry: &mut TargetRegistry, now: Instant) {
        let timeout = self.request_timeout();
        let budget = self.retry_budget();
        let mut pending: Vec<Addr> = Vec::new();
        for target in registry.iter_mut() {
            if target.is_active() && !target.blob.block_acked {
                if target.blob.attempts >= budget {
                    Self::mark_lost(&mut self.events, &mut self.stats, target);
                    continue;
                }
                target.blob.attempts += 1;
                target.blob.awaiting_rsp = true;
                target.blob.deadline = Some(now + timeout);
                pending.push(target.addr);
            }
        }
        for addr in pending {
            self.stats.chunks_retransmitted += self.resend_to(registry, addr);
        }
        if registry.active_count() == 0 {
            self.finish(registry, false);
        }
    }

    fn enter_pull(&mut self, registry: &mut TargetRegistry, now: Instant) {
        let deadline = now + self.inputs.client_timeout();
        for target in registry.iter_mut() {
            if target.is_active() {
                target.blob.awaiting_rsp = false;
                target.blob.deadline = Some(deadline);
            }
        }
        debug!("풀 모드 진입");
        self.state = State::Pull;
    }

    /// 풀 모드 부분 블록 report 처리: 요청된 청크를 보내고 대상의
    /// 대기를 갱신한다
    fn serve_pull_report(
        &mut self,
        registry: &mut TargetRegistry,
        from: Addr,
        block_number: u16,
        missing_chunks: Vec<u16>,
        now: Instant,
    ) {
        let Some(xfer) = self.xfer else { return };
        let deadline = now + self.inputs.client_timeout();
        {
            let Some(target) = registry.get_mut(from) else { return };
            if !target.is_active() {
                return;
            }
            self.stats.reports += 1;
            target.blob.deadline = Some(deadline);
            if target.blob.pull_block != Some(block_number) {
                if target.blob.pull_block.is_some() {
                    target.blob.blocks_confirmed += 1;
                }
                target.blob.pull_block = Some(block_number);
            }
            if let Some(missing) = &mut target.blob.missing_blocks {
                if missing_chunks.is_empty() {
                    missing.retain(|&b| b != block_number);
                }
            }
        }

        let block = Block::new(xfer.size, xfer.block_size_log, block_number);
        for number in missing_chunks {
            let Some(io) = self.io.as_deref() else { break };
            let Ok(chunk) = io.read_chunk(&block, number, xfer.chunk_size) else {
                continue;
            };
            self.stats.chunks_sent += 1;
            self.stats.total_bytes += chunk.data.len() as u64;
            let _ = self
                .transport
                .send(from, &Message::chunk(xfer.id, block_number, &chunk));
        }
    }
}
