//! 에러 타입

use thiserror::Error;

use crate::Addr;

/// meshblob 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("레코드가 너무 짧음: {expected}바이트 필요, {got}바이트 수신")]
    Decode { expected: usize, got: usize },

    #[error("필드 {field} 범위 초과: {value} > {max}")]
    FieldOverflow {
        field: &'static str,
        value: u8,
        max: u8,
    },

    #[error("중복된 대상 주소 0x{addr:04X}")]
    Duplicate { addr: Addr },

    #[error("대상 테이블 가득 참: 용량 {capacity}")]
    ResourceExhausted { capacity: usize },

    #[error("진행 중인 전송으로 바쁨")]
    Busy,

    #[error("전송 크기 {size}가 수신 능력 한계 {max} 초과")]
    InvalidSize { size: u32, max: u32 },

    #[error("블록 크기 로그 {block_size_log}가 수신 능력 범위 {min}..={max} 밖")]
    InvalidBlockSize {
        block_size_log: u8,
        min: u8,
        max: u8,
    },

    #[error("청크 크기 {chunk_size}가 수신 능력 한계 {max} 초과")]
    InvalidChunkSize { chunk_size: u16, max: u16 },

    #[error("청크 쓰기 범위 초과: 오프셋 {offset} + 길이 {len} > 블록 크기 {block_size}")]
    OutOfRange {
        offset: u32,
        len: u32,
        block_size: u32,
    },

    #[error("청크 {chunk}의 불일치 재기록")]
    Inconsistent { chunk: u16 },

    #[error("대상 집합이 지원하지 않는 전송 모드")]
    UnsupportedMode,

    #[error("현재 단계에서 유효하지 않은 작업")]
    WrongPhase,

    #[error("찾을 수 없음")]
    NotFound,

    #[error("사용 가능한 대상 없음")]
    NoTargets,

    #[error("모든 대상에서 전송 실패")]
    TransferFailed,
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
