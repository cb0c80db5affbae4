//! 전송 통계

use std::time::{Duration, Instant};

/// BLOB 전송 한쪽의 카운터
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 시작 시각
    pub start_time: Instant,

    /// 송신한 청크 (최초 전송)
    pub chunks_sent: u64,

    /// 재전송한 청크
    pub chunks_retransmitted: u64,

    /// 수신·수락한 청크
    pub chunks_received: u64,

    /// 버린 청크: CRC 불일치, 모르는 전송 id, 범위 밖 쓰기
    pub chunks_dropped: u64,

    /// 옮긴 페이로드 바이트
    pub total_bytes: u64,

    /// 모든 활성 대상이 확인한 블록(클라이언트) 또는 완전히 재조립된
    /// 블록(서버)
    pub blocks_confirmed: u64,

    /// 처리한 블록/전송 상태 report
    pub reports: u64,

    /// 손실 판정된 대상
    pub lost_targets: u64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            chunks_sent: 0,
            chunks_retransmitted: 0,
            chunks_received: 0,
            chunks_dropped: 0,
            total_bytes: 0,
            blocks_confirmed: 0,
            reports: 0,
            lost_targets: 0,
        }
    }

    /// 전송 시작 이후 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 페이로드 처리율 (바이트/초)
    pub fn throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.total_bytes as f64 / elapsed
    }

    /// 전체 전송 중 재전송의 비율
    pub fn retransmit_ratio(&self) -> f64 {
        let total = self.chunks_sent + self.chunks_retransmitted;
        if total == 0 {
            return 0.0;
        }
        self.chunks_retransmitted as f64 / total as f64
    }

    /// 한 줄 요약
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Blocks: {} | Bytes: {} | Throughput: {:.2} KB/s | Retransmit: {:.1}% | Dropped: {} | Lost targets: {}",
            self.elapsed().as_secs_f64(),
            self.blocks_confirmed,
            self.total_bytes,
            self.throughput() / 1000.0,
            self.retransmit_ratio() * 100.0,
            self.chunks_dropped,
            self.lost_targets,
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retransmit_ratio_counts_both_kinds() {
        let mut stats = TransferStats::new();
        assert_eq!(stats.retransmit_ratio(), 0.0);

        stats.chunks_sent = 90;
        stats.chunks_retransmitted = 10;
        assert!((stats.retransmit_ratio() - 0.1).abs() < 1e-9);
    }
}
