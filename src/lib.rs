//! # meshblob
//!
//! 제약이 크고 손실이 있는 멀티홉 메시 위의 신뢰성 있는 대용량 객체
//! 배포. BLOB(예: 펌웨어 이미지)을 2의 거듭제곱 블록과 MTU 이하의
//! 청크로 쪼개 대상 노드 집합에 푸시 또는 풀로 전달하고, 발신자는
//! 대상별 진행률·누락 데이터·실패를 독립적으로 추적한다.
//!
//! ## 핵심 구성
//! - **SAR 타이밍**: 압축 인코딩된 분할 재조립 파라미터. 모든 구성
//!   요소가 쓰는 재시도/ack 타이밍이 여기서 유도된다
//! - **블록 조립**: 청크가 재전송의 원자 단위. write-once 비트맵으로
//!   퍼즐식 재조립
//! - **BLOB 클라이언트**: 최대 32개 대상으로 전송 하나를 이끈다.
//!   푸시/풀 모드, 대상별 재시도 예산, 부분 성공
//! - **BLOB 서버**: 노드별 수신기. 누락 청크를 요청하고 완료를
//!   보고한다
//! - **배포기**: BLOB 클라이언트 위의 펌웨어 슬롯 정책 계층
//!   (수신자 목록, 전송 후 적용/검증)
//!
//! 프로토콜 상태 기계는 동기·이벤트 구동이다: 호출측이 수신 메시지와
//! 시계를 공급하고 이벤트를 꺼내며, 송신 메시지는 [`client::Transport`]
//! 를 거친다. 동봉된 바이너리가 UDP 위에서 이들을 구동한다.

pub mod block;
pub mod client;
pub mod config;
pub mod dfd;
pub mod error;
pub mod io;
pub mod message;
pub mod sar;
pub mod srv;
pub mod stats;
pub mod target;

pub use block::{Block, BlockAssembler, Chunk};
pub use client::{BlobClient, ClientEvent, Transport};
pub use config::TransferInputs;
pub use dfd::{DfdPhase, DfdSrv, DfdStatus, SlotRegistry};
pub use error::{Error, Result};
pub use io::{BlobIo, FileBlob, MemoryBlob};
pub use message::{BlobStatus, Capabilities, Message, ModeSupport, Xfer, XferMode, XferPhase};
pub use sar::{SarRx, SarTx};
pub use srv::{BlobSrv, SrvEvent};
pub use stats::TransferStats;
pub use target::{Target, TargetPhase, TargetRegistry};

/// 메시 엘리먼트 주소
pub type Addr = u16;

/// BLOB 전송 id (불투명, 애플리케이션이 정하고 재개 시 재사용)
pub type XferId = u64;

/// 프로토콜 버전
pub const PROTOCOL_VERSION: u8 = 1;

/// meshblob 패킷을 식별하는 매직 넘버
pub const MAGIC_NUMBER: u32 = 0x4D42_4C42; // "MBLB"

/// 기본 청크 크기 (분할된 메시 SDU에 들어가는 크기)
pub const DEFAULT_CHUNK_SIZE: u16 = 256;

/// 기본 블록 크기 로그 (2^12 = 4 KiB 블록)
pub const DEFAULT_BLOCK_SIZE_LOG: u8 = 12;

/// 한 배포의 최대 대상 수
pub const MAX_TARGETS: usize = 32;
