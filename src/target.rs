//! 전송 대상
//!
//! 레지스트리는 한 배포에 참여하는 노드들과 그 독립적인 프로토콜
//! 하위 상태를 소유한다. 고정 용량 arena다: 대상은 주소로 찾고, 추가
//! 시 생성되며, 매 전송 시도 시작 때 초기화되고, 집합을 비울 때만
//! 소멸된다.

use std::time::Instant;

use crate::error::{Error, Result};
use crate::message::BlobStatus;
use crate::{Addr, MAX_TARGETS};

/// 대상별 배포 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetPhase {
    /// 활성 전송에 참여하지 않음
    #[default]
    Idle,
    /// 전송 진행 중
    Active,
    /// 이 대상에서 전송 성공
    Success,
    /// 대상이 종단 에러 보고
    Fail,
    /// 이 대상을 향한 전송 취소됨
    Cancelled,
    /// 재시도 예산 안에 응답 없음
    Lost,
    /// 적용 송신, 확인 대기
    Applying,
    /// 펌웨어 적용 완료
    Applied,
}

/// 대상 하나의 BLOB 계층 하위 상태. 매 전송 시도 시작 때 0으로
/// 돌아간다
#[derive(Debug, Clone, Default)]
pub struct TargetBlobState {
    /// 이 대상이 수신 확인한 블록 수
    pub blocks_confirmed: u32,

    /// 현재 블록이 ack됐는지
    pub block_acked: bool,

    /// 현재 블록에서 대상이 누락 보고한 청크들
    pub missing_chunks: Vec<u16>,

    /// 마지막 보고 기준으로 대상이 아직 필요로 하는 블록들. 대상이
    /// 전송 시작(또는 상태 조회)에 답하기 전까지 `None`
    pub missing_blocks: Option<Vec<u16>>,

    /// 풀 모드 커서: 대상이 지금 요청 중인 블록
    pub pull_block: Option<u16>,

    /// 미결 요청에 쓴 시도 횟수
    pub attempts: u32,

    /// 이 대상으로의 요청이 응답 대기 중인지
    pub awaiting_rsp: bool,

    /// 미결 요청 또는 풀 대기의 기한
    pub deadline: Option<Instant>,
}

/// 배포에 참여하는 노드 하나
#[derive(Debug, Clone)]
pub struct Target {
    /// 유니캐스트 주소
    pub addr: Addr,

    /// 전송 성공 후 적용할 이미지 인덱스
    pub img_idx: u8,

    /// 배포 단계
    pub phase: TargetPhase,

    /// BLOB 계층 하위 상태
    pub blob: TargetBlobState,

    /// 대상이 마지막으로 보고한 BLOB 상태 코드
    pub blob_status: Option<BlobStatus>,
}

impl Target {
    fn new(addr: Addr, img_idx: u8) -> Self {
        Self {
            addr,
            img_idx,
            phase: TargetPhase::Idle,
            blob: TargetBlobState::default(),
            blob_status: None,
        }
    }

    /// 대상이 아직 돌고 있는 전송에 참여 중인지
    pub fn is_active(&self) -> bool {
        matches!(self.phase, TargetPhase::Active)
    }
}

/// 전송 대상의 고정 용량 테이블
#[derive(Debug, Default)]
pub struct TargetRegistry {
    targets: Vec<Target>,
    active: bool,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 대상을 추가한다. 이미 있는 주소면 [`Error::Duplicate`], 테이블이
    /// 가득 찼으면 [`Error::ResourceExhausted`]
    pub fn add(&mut self, addr: Addr, img_idx: u8) -> Result<()> {
        if self.targets.iter().any(|t| t.addr == addr) {
            return Err(Error::Duplicate { addr });
        }
        if self.targets.len() >= MAX_TARGETS {
            return Err(Error::ResourceExhausted {
                capacity: MAX_TARGETS,
            });
        }

        self.targets.push(Target::new(addr, img_idx));
        Ok(())
    }

    /// 테이블을 비운다. 이 레지스트리 위에서 전송이 돌고 있으면
    /// [`Error::Busy`]
    pub fn remove_all(&mut self) -> Result<()> {
        if self.active {
            return Err(Error::Busy);
        }
        self.targets.clear();
        Ok(())
    }

    /// 주소와 이미지 인덱스는 유지한 채 모든 대상의 BLOB 하위 상태를
    /// 0으로 만든다. 재개를 포함한 매 전송 시도 시작 때 불린다
    pub fn reset_for_new_attempt(&mut self) {
        for target in &mut self.targets {
            target.phase = TargetPhase::Idle;
            target.blob = TargetBlobState::default();
            target.blob_status = None;
        }
    }

    /// 이 레지스트리 위의 전송 시작/종료 표시
    pub(crate) fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    /// 이 레지스트리 위에서 전송이 돌고 있는지
    pub fn is_busy(&self) -> bool {
        self.active
    }

    pub fn get(&self, addr: Addr) -> Option<&Target> {
        self.targets.iter().find(|t| t.addr == addr)
    }

    pub fn get_mut(&mut self, addr: Addr) -> Option<&mut Target> {
        self.targets.iter_mut().find(|t| t.addr == addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Target> {
        self.targets.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Target> {
        self.targets.iter_mut()
    }

    /// 인덱스 `first`부터 최대 `count`개의 대상 슬라이스
    pub fn iter_range(&self, first: usize, count: usize) -> &[Target] {
        let first = first.min(self.targets.len());
        let end = first.saturating_add(count).min(self.targets.len());
        &self.targets[first..end]
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// 돌고 있는 전송에 아직 참여 중인 대상 수
    pub fn active_count(&self) -> usize {
        self.targets.iter().filter(|t| t.is_active()).count()
    }
}
