//! 펌웨어 배포 오케스트레이터
//!
//! BLOB 클라이언트 위에 앉아 대상 레지스트리와 업로드된 펌웨어 슬롯
//! 테이블을 소유하고, 한 번에 하나의 배포를 돌리며 수명 주기 단계를
//! 추적한다. 배포가 활성인 동안 수신자 관리는 잠겨서 돌고 있는 전송
//! 아래에서 대상 집합이 바뀔 수 없다.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::Bytes;
use tracing::{info, warn};

use crate::client::{BlobClient, ClientEvent, Transport};
use crate::config::{ProtocolConfig, TransferInputs};
use crate::error::{Error, Result};
use crate::io::MemoryBlob;
use crate::message::{Capabilities, Message, Xfer, XferMode};
use crate::target::{TargetPhase, TargetRegistry};
use crate::{Addr, XferId, DEFAULT_BLOCK_SIZE_LOG, DEFAULT_CHUNK_SIZE};

/// 배포기가 동시에 보관하는 펌웨어 슬롯 수
pub const MAX_SLOTS: usize = 8;

/// 배포 작업의 상태 코드
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfdStatus {
    Success,
    InsufficientResources,
    WrongPhase,
    InternalError,
    FwNotFound,
    NotFound,
    ReceiversListEmpty,
    BusyWithDistribution,
    BusyWithUpload,
    InvalidApplyIdx,
}

/// 배포 수명 주기 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DfdPhase {
    #[default]
    Idle,
    TransferActive,
    TransferSuspended,
    /// 대상 하나 이상에서 전송 완료, 적용은 아직 요청 전
    Completed,
    ApplyingUpdate,
    Cancelled,
    Failed,
}

/// 업로드된 펌웨어 이미지 하나
#[derive(Debug, Clone)]
pub struct Slot {
    /// 펌웨어 식별자. 배포기에게는 불투명
    pub fwid: Vec<u8>,

    /// 이미지와 함께 대상에 전달되는 벤더 메타데이터
    pub metadata: Vec<u8>,

    /// 이미지 바이트
    pub data: Bytes,
}

impl Slot {
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }
}

/// 업로드된 펌웨어 이미지의 유한 테이블
#[derive(Debug, Default)]
pub struct SlotRegistry {
    slots: Vec<Option<Slot>>,
}

impl SlotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 이미지를 저장하고 슬롯 인덱스를 돌려준다
    pub fn add(&mut self, fwid: Vec<u8>, data: Bytes, metadata: Vec<u8>) -> Result<usize> {
        let slot = Slot { fwid, metadata, data };
        if let Some(idx) = self.slots.iter().position(|s| s.is_none()) {
            self.slots[idx] = Some(slot);
            return Ok(idx);
        }
        if self.slots.len() >= MAX_SLOTS {
            return Err(Error::ResourceExhausted { capacity: MAX_SLOTS });
        }
        self.slots.push(Some(slot));
        Ok(self.slots.len() - 1)
    }

    pub fn get(&self, idx: usize) -> Option<&Slot> {
        self.slots.get(idx).and_then(|s| s.as_ref())
    }

    /// 이미지 하나를 지운다. 인덱스는 재사용 가능한 채로 남는다
    pub fn del(&mut self, idx: usize) -> Result<()> {
        match self.slots.get_mut(idx) {
            Some(slot) if slot.is_some() => {
                *slot = None;
                Ok(())
            }
            _ => Err(Error::NotFound),
        }
    }

    pub fn del_all(&mut self) {
        self.slots.clear();
    }

    /// 차 있는 슬롯 수
    pub fn count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

/// 배포 한 번의 파라미터
#[derive(Debug, Clone, Copy)]
pub struct DistributionParams {
    /// 배포할 이미지가 담긴 슬롯
    pub slot_idx: usize,

    /// 푸시 또는 풀 전달
    pub mode: XferMode,

    /// 전송이 끝나는 즉시 대상에 이미지 적용
    pub apply_on_success: bool,

    /// 전송 입력 (그룹 주소, ttl, 타임아웃 베이스)
    pub inputs: TransferInputs,
}

/// 펌웨어 배포 서버
pub struct DfdSrv<T: Transport> {
    client: BlobClient<T>,
    registry: TargetRegistry,
    slots: SlotRegistry,
    phase: DfdPhase,
    params: Option<DistributionParams>,
    events: VecDeque<ClientEvent>,
}

impl<T: Transport> DfdSrv<T> {
    pub fn new(transport: T, config: ProtocolConfig) -> Self {
        Self {
            client: BlobClient::new(transport, config),
            registry: TargetRegistry::new(),
            slots: SlotRegistry::new(),
            phase: DfdPhase::Idle,
            params: None,
            events: VecDeque::new(),
        }
    }

    pub fn phase(&self) -> DfdPhase {
        self.phase
    }

    pub fn targets(&self) -> &TargetRegistry {
        &self.registry
    }

    pub fn slots(&self) -> &SlotRegistry {
        &self.slots
    }

    pub fn slots_mut(&mut self) -> &mut SlotRegistry {
        // 배포 중의 슬롯 업로드는 `slot_add`가 거부한다. 직접 접근은
        // 삭제와 점검용
        &mut self.slots
    }

    /// 마지막 조회에서 집계된 수신 능력
    pub fn caps(&self) -> Option<Capabilities> {
        self.client.caps()
    }

    fn distributing(&self) -> bool {
        matches!(
            self.phase,
            DfdPhase::TransferActive | DfdPhase::TransferSuspended | DfdPhase::ApplyingUpdate
        )
    }

    // ---- 수신자 관리 ----------------------------------------------------

    /// 수신자를 추가한다. 이미 있는 주소의 재추가는 부작용 없이
    /// 성공한다. 배포 중에는 수신자 목록이 잠긴다
    pub fn receivers_add(&mut self, addr: Addr, img_idx: u8) -> DfdStatus {
        if self.distributing() {
            return DfdStatus::BusyWithDistribution;
        }
        match self.registry.add(addr, img_idx) {
            Ok(()) => DfdStatus::Success,
            Err(Error::Duplicate { .. }) => DfdStatus::Success,
            Err(Error::ResourceExhausted { .. }) => DfdStatus::InsufficientResources,
            Err(_) => DfdStatus::InternalError,
        }
    }

    /// 수신자 목록을 비운다
    pub fn receivers_delete_all(&mut self) -> DfdStatus {
        if self.distributing() {
            return DfdStatus::BusyWithDistribution;
        }
        match self.registry.remove_all() {
            Ok(()) => DfdStatus::Success,
            Err(_) => DfdStatus::BusyWithDistribution,
        }
    }

    // ---- 슬롯 관리 ------------------------------------------------------

    /// 펌웨어 이미지를 빈 슬롯에 업로드한다
    pub fn slot_add(&mut self, fwid: Vec<u8>, data: Bytes, metadata: Vec<u8>) -> Result<usize> {
        if self.distributing() {
            return Err(Error::Busy);
        }
        self.slots.add(fwid, data, metadata)
    }

    /// 업로드된 이미지 하나를 지운다
    pub fn slot_del(&mut self, idx: usize) -> DfdStatus {
        if self.distributing() {
            return DfdStatus::BusyWithDistribution;
        }
        match self.slots.del(idx) {
            Ok(()) => DfdStatus::Success,
            Err(_) => DfdStatus::NotFound,
        }
    }

    // ---- 배포 수명 주기 --------------------------------------------------

    /// 모든 수신자에 수신 능력을 조회한다
    pub fn caps_get(&mut self, inputs: TransferInputs, now: Instant) -> Result<()> {
        self.client.caps_get(&mut self.registry, inputs, now)
    }

    /// `params.slot_idx`의 이미지를 현재 수신자 목록으로 배포하기
    /// 시작한다
    pub fn start(&mut self, params: DistributionParams, now: Instant) -> DfdStatus {
        if self.distributing() {
            return DfdStatus::BusyWithDistribution;
        }
        let Some(slot) = self.slots.get(params.slot_idx) else {
            return DfdStatus::FwNotFound;
        };
        if self.registry.is_empty() {
            return DfdStatus::ReceiversListEmpty;
        }

        let size = slot.size();
        let xfer = Xfer {
            id: transfer_id(&slot.fwid, size),
            size,
            block_size_log: self
                .client
                .caps()
                .map(|c| c.max_block_size_log)
                .unwrap_or(DEFAULT_BLOCK_SIZE_LOG),
            chunk_size: self
                .client
                .caps()
                .map(|c| c.max_chunk_size)
                .unwrap_or(DEFAULT_CHUNK_SIZE),
            mode: params.mode,
        };
        let io = Box::new(MemoryBlob::from_bytes(&slot.data[..]));

        match self.client.send(&mut self.registry, xfer, io, params.inputs, now) {
            Ok(()) => {
                info!(slot = params.slot_idx, id = xfer.id, "배포 시작");
                self.params = Some(params);
                self.phase = DfdPhase::TransferActive;
                DfdStatus::Success
            }
            Err(Error::Busy) => DfdStatus::BusyWithDistribution,
            Err(err) => {
                warn!(%err, "배포 시작 실패");
                DfdStatus::InternalError
            }
        }
    }

    /// 돌고 있는 배포를 일시정지한다
    pub fn suspend(&mut self) -> DfdStatus {
        if self.phase != DfdPhase::TransferActive {
            return DfdStatus::WrongPhase;
        }
        self.client.suspend();
        self.phase = DfdPhase::TransferSuspended;
        DfdStatus::Success
    }

    /// 일시정지된 배포를 재개한다
    pub fn resume(&mut self, now: Instant) -> DfdStatus {
        if self.phase != DfdPhase::TransferSuspended {
            return DfdStatus::WrongPhase;
        }
        self.client.resume(&mut self.registry, now);
        self.phase = DfdPhase::TransferActive;
        DfdStatus::Success
    }

    /// 모든 수신자를 향해 배포를 취소한다
    pub fn cancel(&mut self) -> DfdStatus {
        self.client.cancel(&mut self.registry);
        self.phase = DfdPhase::Cancelled;
        DfdStatus::Success
    }

    /// 전송을 완료한 모든 수신자에 배포된 이미지를 적용한다. 전송이
    /// 완료된 뒤에만 유효하다
    pub fn apply(&mut self) -> DfdStatus {
        if self.phase != DfdPhase::Completed {
            return DfdStatus::WrongPhase;
        }

        self.phase = DfdPhase::ApplyingUpdate;
        let mut applied = 0;
        for target in self.registry.iter_mut() {
            if target.phase == TargetPhase::Success {
                target.phase = TargetPhase::Applied;
                applied += 1;
            }
        }
        info!(applied, "완료된 수신자에 이미지 적용");
        self.phase = DfdPhase::Completed;
        DfdStatus::Success
    }

    /// 집계 전송 진행률, 0에서 100
    pub fn progress(&self) -> u8 {
        self.client.progress(&self.registry)
    }

    /// 전송 통계
    pub fn stats(&self) -> &crate::stats::TransferStats {
        self.client.stats()
    }

    // ---- 이벤트 루프 배관 ------------------------------------------------

    /// 수신 메시지 하나를 BLOB 클라이언트에 통과시킨다
    pub fn handle_message(&mut self, from: Addr, msg: Message, now: Instant) {
        self.client
            .handle_message(&mut self.registry, from, msg, now);
        self.process();
    }

    /// 만료된 타이머를 처리한다
    pub fn poll(&mut self, now: Instant) {
        self.client.poll(&mut self.registry, now);
        self.process();
    }

    /// 호출측이 깨워 줘야 하는 가장 이른 기한
    pub fn next_timeout(&self) -> Option<Instant> {
        self.client.next_timeout(&self.registry)
    }

    /// 다음 이벤트 (있으면)
    pub fn poll_event(&mut self) -> Option<ClientEvent> {
        self.events.pop_front()
    }

    /// 클라이언트 이벤트를 꺼내며 배포 단계를 전진시킨다
    fn process(&mut self) {
        while let Some(event) = self.client.poll_event() {
            if let ClientEvent::End { success } = event {
                self.phase = if success {
                    DfdPhase::Completed
                } else {
                    DfdPhase::Failed
                };
                let auto_apply = self.params.map(|p| p.apply_on_success).unwrap_or(false);
                self.events.push_back(event);
                if success && auto_apply {
                    self.apply();
                }
                continue;
            }
            self.events.push_back(event);
        }
    }
}

/// 이미지 정체성에서 유도한 전송 id. 같은 이미지를 다시 배포하면
/// 충돌 대신 재개가 된다
fn transfer_id(fwid: &[u8], size: u32) -> XferId {
    (crc32fast::hash(fwid) as u64) << 32 | size as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;

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

    fn dfd() -> DfdSrv<VecTransport> {
        DfdSrv::new(VecTransport::default(), ProtocolConfig::default())
    }

    fn params(slot_idx: usize) -> DistributionParams {
        DistributionParams {
            slot_idx,
            mode: XferMode::Push,
            apply_on_success: false,
            inputs: TransferInputs::default(),
        }
    }

    fn loaded_dfd() -> (DfdSrv<VecTransport>, usize) {
        let mut dfd = dfd();
        let idx = dfd
            .slot_add(vec![1, 2, 3], Bytes::from(vec![0xAB; 100]), vec![])
            .unwrap();
        dfd.receivers_add(0x0001, 0);
        dfd.receivers_add(0x0002, 0);
        (dfd, idx)
    }

    #[test]
    fn duplicate_receiver_is_a_no_op() {
        let mut dfd = dfd();
        assert_eq!(dfd.receivers_add(0x0001, 0), DfdStatus::Success);
        assert_eq!(dfd.receivers_add(0x0001, 1), DfdStatus::Success);
        assert_eq!(dfd.targets().len(), 1);
        assert_eq!(dfd.targets().get(0x0001).unwrap().img_idx, 0);
    }

    #[test]
    fn receiver_list_locked_while_distributing() {
        let (mut dfd, idx) = loaded_dfd();
        assert_eq!(dfd.start(params(idx), Instant::now()), DfdStatus::Success);
        assert_eq!(dfd.phase(), DfdPhase::TransferActive);

        assert_eq!(
            dfd.receivers_add(0x0003, 0),
            DfdStatus::BusyWithDistribution
        );
        assert_eq!(dfd.targets().len(), 2);
        assert_eq!(
            dfd.receivers_delete_all(),
            DfdStatus::BusyWithDistribution
        );
        assert_eq!(dfd.targets().len(), 2);
        assert_eq!(dfd.slot_del(idx), DfdStatus::BusyWithDistribution);
    }

    #[test]
    fn start_requires_slot_and_receivers() {
        let mut dfd = dfd();
        dfd.receivers_add(0x0001, 0);
        assert_eq!(dfd.start(params(0), Instant::now()), DfdStatus::FwNotFound);

        let mut dfd2 = dfd2_with_slot();
        assert_eq!(
            dfd2.start(params(0), Instant::now()),
            DfdStatus::ReceiversListEmpty
        );
    }

    fn dfd2_with_slot() -> DfdSrv<VecTransport> {
        let mut dfd = dfd();
        dfd.slot_add(vec![9], Bytes::from_static(&[0u8; 16]), vec![])
            .unwrap();
        dfd
    }

    #[test]
    fn apply_needs_completed_transfer() {
        let (mut dfd, idx) = loaded_dfd();
        assert_eq!(dfd.apply(), DfdStatus::WrongPhase);

        dfd.start(params(idx), Instant::now());
        assert_eq!(dfd.apply(), DfdStatus::WrongPhase);
    }

    #[test]
    fn same_image_reuses_the_transfer_id() {
        assert_eq!(transfer_id(&[1, 2, 3], 100), transfer_id(&[1, 2, 3], 100));
        assert_ne!(transfer_id(&[1, 2, 3], 100), transfer_id(&[1, 2, 4], 100));
        assert_ne!(transfer_id(&[1, 2, 3], 100), transfer_id(&[1, 2, 3], 101));
    }

    #[test]
    fn slot_registry_bounded_and_reusable() {
        let mut slots = SlotRegistry::new();
        for i in 0..MAX_SLOTS {
            slots.add(vec![i as u8], Bytes::from_static(&[0]), vec![]).unwrap();
        }
        assert!(matches!(
            slots.add(vec![0xFF], Bytes::from_static(&[0]), vec![]),
            Err(Error::ResourceExhausted { .. })
        ));

        slots.del(3).unwrap();
        assert_eq!(slots.count(), MAX_SLOTS - 1);
        let idx = slots.add(vec![0xFF], Bytes::from_static(&[0]), vec![]).unwrap();
        assert_eq!(idx, 3);
        assert!(slots.del(3).is_ok());
        assert!(slots.del(3).is_err());
    }

    #[test]
    fn cancel_ends_the_distribution() {
        let (mut dfd, idx) = loaded_dfd();
        dfd.start(params(idx), Instant::now());
        assert_eq!(dfd.cancel(), DfdStatus::Success);
        assert_eq!(dfd.phase(), DfdPhase::Cancelled);
        // 수신자 목록 잠금 해제 확인
        assert_eq!(dfd.receivers_add(0x0003, 0), DfdStatus::Success);
    }
}
