//! 전송 입력과 프로토콜 설정

use std::time::Duration;

use crate::sar::{SarRx, SarTx};
use crate::Addr;

/// BLOB 클라이언트에 넘기는 전송별 입력
#[derive(Debug, Clone, Copy)]
pub struct TransferInputs {
    /// 설정 시 청크를 멀티캐스트할 그룹 주소. 제어 메시지는
    /// 유니캐스트로 남는다
    pub group: Option<Addr>,

    /// 액세스 계층에서 쓰는 애플리케이션 키 인덱스
    pub app_key_idx: u16,

    /// 송신 메시지의 ttl
    pub ttl: u8,

    /// 풀 모드와 상태 대기의 타임아웃 베이스 배율
    pub timeout_base: u16,
}

impl Default for TransferInputs {
    fn default() -> Self {
        Self {
            group: None,
            app_key_idx: 0,
            ttl: 7,
            timeout_base: 1,
        }
    }
}

impl TransferInputs {
    /// 풀 요청 또는 상태 응답의 클라이언트측 대기
    ///
    /// 타임아웃 베이스 단계당 10초 + 홉당 100밀리초.
    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(10_000 * (self.timeout_base as u64 + 2) + 100 * self.ttl as u64)
    }
}

/// 노드 하나의 프로토콜 설정: 협상된 SAR 파라미터 + 로컬 정책
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtocolConfig {
    /// 송신측 SAR 파라미터
    pub sar_tx: SarTx,

    /// 수신측 SAR 파라미터
    pub sar_rx: SarRx,
}

impl ProtocolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 깊고 손실 많은 메시용: 끈질긴 재시도, 긴 폐기 창
    pub fn lossy_mesh() -> Self {
        Self {
            sar_tx: SarTx {
                seg_int_step: 9,
                unicast_retrans_count: 7,
                unicast_retrans_without_prog_count: 4,
                unicast_retrans_int_step: 9,
                unicast_retrans_int_inc: 3,
                multicast_retrans_count: 4,
                multicast_retrans_int: 9,
            },
            sar_rx: SarRx {
                seg_thresh: 3,
                ack_delay_inc: 2,
                discard_timeout: 5,
                rx_seg_int_step: 9,
                ack_retrans_count: 2,
            },
        }
    }

    /// 빠르고 안정적인 링크용: 짧은 간격, 적은 재시도
    pub fn fast_lan() -> Self {
        Self {
            sar_tx: SarTx {
                seg_int_step: 0,
                unicast_retrans_count: 1,
                unicast_retrans_without_prog_count: 1,
                unicast_retrans_int_step: 1,
                unicast_retrans_int_inc: 0,
                multicast_retrans_count: 1,
                multicast_retrans_int: 1,
            },
            sar_rx: SarRx {
                seg_thresh: 1,
                ack_delay_inc: 0,
                discard_timeout: 0,
                rx_seg_int_step: 0,
                ack_retrans_count: 0,
            },
        }
    }
}
