//! 프로토콜 메시지
//!
//! 전송 id로 묶이는 요청/응답 쌍. 모든 패킷은 고정 헤더(매직, 버전,
//! 타입, 페이로드 길이)로 시작하고 페이로드는 bincode다. 청크에는
//! CRC32가 붙어 손상된 페이로드는 재조립 버퍼에 닿기 전에 버려진다.

use serde::{Deserialize, Serialize};

use crate::{XferId, MAGIC_NUMBER, PROTOCOL_VERSION};

/// 메시지 타입 판별값
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// 수신 능력 요청
    CapsGet = 1,

    /// 수신 능력 응답
    CapsStatus = 2,

    /// 전송 상태 요청
    XferGet = 3,

    /// 전송 시작 요청
    XferStart = 4,

    /// 전송 상태 응답
    XferStatus = 5,

    /// 블록 시작 요청
    BlockStart = 6,

    /// 현재 블록 상태 요청
    BlockGet = 7,

    /// 블록 상태 응답
    BlockStatus = 8,

    /// 풀 모드 부분 블록 report
    BlockReport = 9,

    /// 데이터 청크
    Chunk = 10,

    /// 전송 취소
    XferCancel = 11,
}

/// 고정 패킷 헤더
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHeader {
    /// 매직 넘버
    pub magic: u32,

    /// 프로토콜 버전
    pub version: u8,

    /// 메시지 타입
    pub msg_type: MessageType,

    /// 페이로드 길이 (헤더 제외)
    pub payload_len: u32,
}

impl MessageHeader {
    pub fn new(msg_type: MessageType, payload_len: u32) -> Self {
        Self {
            magic: MAGIC_NUMBER,
            version: PROTOCOL_VERSION,
            msg_type,
            payload_len,
        }
    }
}

/// 전송 모드: 송신측 주도(푸시) 또는 수신측 주도(풀) 청크 전달
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum XferMode {
    Push,
    Pull,
}

/// 수신 능력에 실리는 모드 지원 표시
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModeSupport {
    None,
    Push,
    Pull,
    All,
}

impl ModeSupport {
    /// 이 표시가 `mode`를 포함하는지
    pub fn supports(self, mode: XferMode) -> bool {
        matches!(
            (self, mode),
            (ModeSupport::All, _) | (ModeSupport::Push, XferMode::Push) | (ModeSupport::Pull, XferMode::Pull)
        )
    }

    /// 양쪽 모두 지원하는 모드
    pub fn intersect(self, other: ModeSupport) -> ModeSupport {
        use ModeSupport::*;
        match (self, other) {
            (All, x) | (x, All) => x,
            (Push, Push) => Push,
            (Pull, Pull) => Pull,
            _ => None,
        }
    }
}

/// 대상 하나가 광고하는 수신 능력, 또는 여러 대상의 집계
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// 수신 가능한 최대 BLOB 크기 (바이트)
    pub max_size: u32,

    /// 지원하는 최소 블록 크기 로그
    pub min_block_size_log: u8,

    /// 지원하는 최대 블록 크기 로그
    pub max_block_size_log: u8,

    /// 블록당 허용하는 최대 청크 수
    pub max_chunks: u16,

    /// 최대 청크 페이로드 (바이트)
    pub max_chunk_size: u16,

    /// 전송 계층 MTU (바이트)
    pub mtu_size: u16,

    /// 지원하는 전송 모드
    pub modes: ModeSupport,
}

impl Capabilities {
    /// 양쪽 모두 쓸 수 있는 한계의 집계: 최대값들의 min, 최소값들의
    /// max, 공통 모드
    pub fn intersect(&self, other: &Capabilities) -> Capabilities {
        Capabilities {
            max_size: self.max_size.min(other.max_size),
            min_block_size_log: self.min_block_size_log.max(other.min_block_size_log),
            max_block_size_log: self.max_block_size_log.min(other.max_block_size_log),
            max_chunks: self.max_chunks.min(other.max_chunks),
            max_chunk_size: self.max_chunk_size.min(other.max_chunk_size),
            mtu_size: self.mtu_size.min(other.mtu_size),
            modes: self.modes.intersect(other.modes),
        }
    }

    /// 집계로 여전히 전송이 가능한지
    pub fn usable(&self) -> bool {
        self.modes != ModeSupport::None && self.min_block_size_log <= self.max_block_size_log
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            max_size: 512 * 1024,
            min_block_size_log: 6,
            max_block_size_log: 12,
            max_chunks: 256,
            max_chunk_size: crate::DEFAULT_CHUNK_SIZE,
            mtu_size: 1200,
            modes: ModeSupport::All,
        }
    }
}

/// BLOB 전송 기술자. id와 함께 크기·블록 파라미터가 내용의 정체성을
/// 이룬다: 같은 튜플은 언제나 같은 분할을 재현한다
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Xfer {
    /// 전송 id. 애플리케이션이 정하며 재개 시 재사용한다
    pub id: XferId,

    /// BLOB 전체 크기 (바이트)
    pub size: u32,

    /// 블록 크기 = 2^block_size_log
    pub block_size_log: u8,

    /// 청크 크기 (바이트)
    pub chunk_size: u16,

    /// 푸시 또는 풀
    pub mode: XferMode,
}

impl Xfer {
    /// 전송의 블록 수
    pub fn block_count(&self) -> u32 {
        crate::block::block_count(self.size, self.block_size_log)
    }
}

/// 전송/블록 응답에 실리는 상태 코드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobStatus {
    Success,
    InvalidBlockNumber,
    InvalidBlockSize,
    InvalidChunkSize,
    WrongPhase,
    InvalidParameter,
    WrongBlobId,
    BlobTooLarge,
    UnsupportedMode,
    InternalError,
    InfoUnavailable,
}

/// 전송 상태 응답에 실리는 수신기 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum XferPhase {
    Inactive,
    WaitingForStart,
    WaitingForBlock,
    WaitingForChunks,
    Complete,
}

/// 통합 프로토콜 메시지
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// 수신 능력 요청
    CapsGet,

    /// 수신 능력 응답
    CapsStatus(Capabilities),

    /// 전송 상태 요청
    XferGet { id: XferId },

    /// 전송 시작 요청
    XferStart(Xfer),

    /// 전송 상태 응답. `missing_blocks`는 아직 다 받지 못한 블록 목록
    XferStatus {
        status: BlobStatus,
        id: XferId,
        phase: XferPhase,
        missing_blocks: Vec<u16>,
    },

    /// 블록 시작 요청
    BlockStart {
        id: XferId,
        block_number: u16,
        chunk_size: u16,
    },

    /// 블록 상태 요청
    BlockGet { id: XferId, block_number: u16 },

    /// 블록 상태 응답. `missing_chunks`가 비어 있으면 블록 ack
    BlockStatus {
        status: BlobStatus,
        block_number: u16,
        missing_chunks: Vec<u16>,
    },

    /// 풀 모드 부분 블록 report: 수신측이 아직 원하는 청크를 나열한다.
    /// 빈 목록은 블록 완료 통지
    BlockReport {
        id: XferId,
        block_number: u16,
        missing_chunks: Vec<u16>,
    },

    /// 데이터 청크
    Chunk {
        id: XferId,
        block_number: u16,
        chunk_number: u16,
        offset: u32,
        crc32: u32,
        data: Vec<u8>,
    },

    /// 전송 취소. 수신측이 id를 알고 있으면 마지막 `XferStatus`로
    /// 응답한다
    XferCancel { id: XferId },
}

impl Message {
    /// 메시지 타입 판별값
    pub fn msg_type(&self) -> MessageType {
        match self {
            Message::CapsGet => MessageType::CapsGet,
            Message::CapsStatus(_) => MessageType::CapsStatus,
            Message::XferGet { .. } => MessageType::XferGet,
            Message::XferStart(_) => MessageType::XferStart,
            Message::XferStatus { .. } => MessageType::XferStatus,
            Message::BlockStart { .. } => MessageType::BlockStart,
            Message::BlockGet { .. } => MessageType::BlockGet,
            Message::BlockStatus { .. } => MessageType::BlockStatus,
            Message::BlockReport { .. } => MessageType::BlockReport,
            Message::Chunk { .. } => MessageType::Chunk,
            Message::XferCancel { .. } => MessageType::XferCancel,
        }
    }

    /// 페이로드 CRC를 붙인 청크 메시지를 만든다
    pub fn chunk(id: XferId, block_number: u16, chunk: &crate::block::Chunk) -> Self {
        Message::Chunk {
            id,
            block_number,
            chunk_number: chunk.number,
            offset: chunk.offset,
            crc32: crc32fast::hash(&chunk.data),
            data: chunk.data.to_vec(),
        }
    }

    /// 헤더 + 페이로드 직렬화
    pub fn to_bytes(&self) -> Vec<u8> {
        let payload = bincode::serialize(self).unwrap_or_default();
        let header = MessageHeader::new(self.msg_type(), payload.len() as u32);
        let header_bytes = bincode::serialize(&header).unwrap_or_default();

        let mut buf = Vec::with_capacity(header_bytes.len() + payload.len());
        buf.extend_from_slice(&header_bytes);
        buf.extend_from_slice(&payload);
        buf
    }

    /// 패킷 파싱. 우리 매직과 버전이 아니면 `None`. 손실 있는 전송
    /// 계층에서 쓰레기는 이벤트가 아니다
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let header: MessageHeader = bincode::deserialize(bytes).ok()?;
        if header.magic != MAGIC_NUMBER || header.version != PROTOCOL_VERSION {
            return None;
        }

        // bincode 헤더는 가변 길이라 재직렬화로 길이를 구한다
        let header_size = bincode::serialized_size(&header).ok()? as usize;
        if bytes.len() < header_size {
            return None;
        }

        let msg: Message = bincode::deserialize(&bytes[header_size..]).ok()?;
        if msg.msg_type() != header.msg_type {
            return None;
        }
        Some(msg)
    }
}
