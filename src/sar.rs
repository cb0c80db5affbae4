//! 분할 재조립(SAR) 타이밍 파라미터
//!
//! 노드별로 협상되는 압축 와이어 레코드. 전송 기계의 모든 재시도/ack
//! 계산이 여기서 타이밍을 유도한다. 패킹은 명시적 시프트와 마스크로
//! 해서 컴파일러의 비트필드 배치와 무관하게 비트 단위로 정확하다.

use crate::error::{Error, Result};

/// 송신 레코드의 와이어 길이
pub const SAR_TX_LEN: usize = 4;

/// 수신 레코드의 와이어 길이
pub const SAR_RX_LEN: usize = 3;

fn check_width(field: &'static str, value: u8, bits: u8) -> Result<()> {
    let max = (1u8 << bits) - 1;
    if value > max {
        return Err(Error::FieldOverflow { field, value, max });
    }
    Ok(())
}

/// SAR 송신측 설정
///
/// 모든 필드는 와이어의 원시값이다. `*_ms` / `*_count` 접근자가 +1
/// 오프셋과 단위 배율을 적용한다. 유도값은 저장하지 않는다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SarTx {
    /// 세그먼트 간격 스텝 (4비트)
    pub seg_int_step: u8,
    /// 유니캐스트 재전송 횟수 (4비트)
    pub unicast_retrans_count: u8,
    /// 진전 없는 유니캐스트 재전송 허용 횟수 (4비트)
    pub unicast_retrans_without_prog_count: u8,
    /// 유니캐스트 재전송 간격 스텝 (4비트)
    pub unicast_retrans_int_step: u8,
    /// 유니캐스트 재전송 간격 증분 (4비트)
    pub unicast_retrans_int_inc: u8,
    /// 멀티캐스트 재전송 횟수 (4비트)
    pub multicast_retrans_count: u8,
    /// 멀티캐스트 재전송 간격 (4비트)
    pub multicast_retrans_int: u8,
}

impl Default for SarTx {
    fn default() -> Self {
        Self {
            seg_int_step: 5,
            unicast_retrans_count: 2,
            unicast_retrans_without_prog_count: 2,
            unicast_retrans_int_step: 7,
            unicast_retrans_int_inc: 1,
            multicast_retrans_count: 2,
            multicast_retrans_int: 9,
        }
    }
}

impl SarTx {
    /// 레코드를 4바이트 와이어 형태로 패킹한다
    ///
    /// 각 바이트는 니블 두 개를 담고 낮은 니블이 먼저다. 비트 폭을
    /// 넘는 필드가 있으면 실패한다.
    pub fn encode(&self) -> Result<[u8; SAR_TX_LEN]> {
        check_width("seg_int_step", self.seg_int_step, 4)?;
        check_width("unicast_retrans_count", self.unicast_retrans_count, 4)?;
        check_width(
            "unicast_retrans_without_prog_count",
            self.unicast_retrans_without_prog_count,
            4,
        )?;
        check_width("unicast_retrans_int_step", self.unicast_retrans_int_step, 4)?;
        check_width("unicast_retrans_int_inc", self.unicast_retrans_int_inc, 4)?;
        check_width("multicast_retrans_count", self.multicast_retrans_count, 4)?;
        check_width("multicast_retrans_int", self.multicast_retrans_int, 4)?;

        Ok([
            (self.seg_int_step & 0x0F) | (self.unicast_retrans_count << 4),
            (self.unicast_retrans_without_prog_count & 0x0F)
                | (self.unicast_retrans_int_step << 4),
            (self.unicast_retrans_int_inc & 0x0F) | (self.multicast_retrans_count << 4),
            self.multicast_retrans_int & 0x0F,
        ])
    }

    /// 4바이트 와이어 레코드를 디코드한다. 뒤에 남는 바이트는 무시한다
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SAR_TX_LEN {
            return Err(Error::Decode {
                expected: SAR_TX_LEN,
                got: bytes.len(),
            });
        }

        Ok(Self {
            seg_int_step: bytes[0] & 0x0F,
            unicast_retrans_count: bytes[0] >> 4,
            unicast_retrans_without_prog_count: bytes[1] & 0x0F,
            unicast_retrans_int_step: bytes[1] >> 4,
            unicast_retrans_int_inc: bytes[2] & 0x0F,
            multicast_retrans_count: bytes[2] >> 4,
            multicast_retrans_int: bytes[3] & 0x0F,
        })
    }

    /// 전송 세그먼트 간격 (밀리초)
    pub fn seg_int_ms(&self) -> u32 {
        (self.seg_int_step as u32 + 1) * 10
    }

    /// 유니캐스트 전송 시도 횟수 (필드는 재시도를 센다)
    pub fn retrans_count(&self) -> u32 {
        self.unicast_retrans_count as u32 + 1
    }

    /// 진전 없이 허용되는 유니캐스트 시도 횟수
    pub fn retrans_without_prog_count(&self) -> u32 {
        self.unicast_retrans_without_prog_count as u32 + 1
    }

    /// 기본 유니캐스트 재전송 간격 (밀리초)
    pub fn retrans_int_step_ms(&self) -> u32 {
        (self.unicast_retrans_int_step as u32 + 1) * 25
    }

    /// 홉당 유니캐스트 재전송 간격 증분 (밀리초)
    pub fn retrans_int_inc_ms(&self) -> u32 {
        (self.unicast_retrans_int_inc as u32 + 1) * 25
    }

    /// `ttl`로 보낸 메시지의 유니캐스트 재전송 타임아웃
    ///
    /// 증분은 첫 홉 이후 홉마다 한 번씩 더해진다.
    pub fn retrans_timeout_ms(&self, ttl: u8) -> u32 {
        let step = self.retrans_int_step_ms();
        if ttl > 0 {
            step + self.retrans_int_inc_ms() * (ttl as u32 - 1)
        } else {
            step
        }
    }

    /// 멀티캐스트 재전송 타임아웃 (밀리초)
    pub fn multicast_retrans_timeout_ms(&self) -> u32 {
        (self.multicast_retrans_int as u32 + 1) * 25
    }
}

/// SAR 수신측 설정
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SarRx {
    /// ack을 지연하기 시작하는 세그먼트 임계값 (5비트)
    pub seg_thresh: u8,
    /// ack 지연 증분 (3비트)
    pub ack_delay_inc: u8,
    /// 폐기 타임아웃 (4비트)
    pub discard_timeout: u8,
    /// 수신 세그먼트 간격 스텝 (4비트)
    pub rx_seg_int_step: u8,
    /// ack 재전송 횟수 (2비트)
    pub ack_retrans_count: u8,
}

impl Default for SarRx {
    fn default() -> Self {
        Self {
            seg_thresh: 3,
            ack_delay_inc: 1,
            discard_timeout: 1,
            rx_seg_int_step: 5,
            ack_retrans_count: 0,
        }
    }
}

impl SarRx {
    /// 레코드를 3바이트 와이어 형태로 패킹한다
    pub fn encode(&self) -> Result<[u8; SAR_RX_LEN]> {
        check_width("seg_thresh", self.seg_thresh, 5)?;
        check_width("ack_delay_inc", self.ack_delay_inc, 3)?;
        check_width("discard_timeout", self.discard_timeout, 4)?;
        check_width("rx_seg_int_step", self.rx_seg_int_step, 4)?;
        check_width("ack_retrans_count", self.ack_retrans_count, 2)?;

        Ok([
            (self.seg_thresh & 0x1F) | (self.ack_delay_inc << 5),
            (self.discard_timeout & 0x0F) | (self.rx_seg_int_step << 4),
            self.ack_retrans_count & 0x03,
        ])
    }

    /// 3바이트 와이어 레코드를 디코드한다. 뒤에 남는 바이트는 무시한다
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SAR_RX_LEN {
            return Err(Error::Decode {
                expected: SAR_RX_LEN,
                got: bytes.len(),
            });
        }

        Ok(Self {
            seg_thresh: bytes[0] & 0x1F,
            ack_delay_inc: bytes[0] >> 5,
            discard_timeout: bytes[1] & 0x0F,
            rx_seg_int_step: bytes[1] >> 4,
            ack_retrans_count: bytes[2] & 0x03,
        })
    }

    /// 수신 세그먼트 간격 단위의 ack 지연
    pub fn ack_delay_segs(&self) -> u32 {
        self.ack_delay_inc as u32 * 2 + 3
    }

    /// ack 지연 (밀리초)
    pub fn ack_delay_ms(&self) -> u32 {
        self.ack_delay_segs() * self.rx_seg_int_ms()
    }

    /// ack 전송 횟수
    pub fn ack_retrans_count(&self) -> u32 {
        self.ack_retrans_count as u32 + 1
    }

    /// 수신 세그먼트 간격 (밀리초)
    pub fn rx_seg_int_ms(&self) -> u32 {
        (self.rx_seg_int_step as u32 + 1) * 10
    }

    /// 미완성 메시지 폐기 타임아웃 (밀리초)
    pub fn discard_timeout_ms(&self) -> u32 {
        (self.discard_timeout as u32 + 1) * 5000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_known_bytes() {
        let tx = SarTx::decode(&[0x12, 0x34, 0x56, 0x07]).unwrap();

        assert_eq!(tx.seg_int_step, 2);
        assert_eq!(tx.unicast_retrans_count, 1);
        assert_eq!(tx.unicast_retrans_without_prog_count, 4);
        assert_eq!(tx.unicast_retrans_int_step, 3);
        assert_eq!(tx.unicast_retrans_int_inc, 6);
        assert_eq!(tx.multicast_retrans_count, 5);
        assert_eq!(tx.multicast_retrans_int, 7);

        assert_eq!(tx.encode().unwrap(), [0x12, 0x34, 0x56, 0x07]);
    }

    #[test]
    fn tx_round_trip() {
        for a in [0u8, 3, 15] {
            for b in [0u8, 7, 15] {
                let tx = SarTx {
                    seg_int_step: a,
                    unicast_retrans_count: b,
                    unicast_retrans_without_prog_count: b,
                    unicast_retrans_int_step: a,
                    unicast_retrans_int_inc: b,
                    multicast_retrans_count: a,
                    multicast_retrans_int: b,
                };
                assert_eq!(SarTx::decode(&tx.encode().unwrap()).unwrap(), tx);
            }
        }
    }

    #[test]
    fn rx_round_trip() {
        for thresh in [0u8, 17, 31] {
            for inc in [0u8, 3, 7] {
                let rx = SarRx {
                    seg_thresh: thresh,
                    ack_delay_inc: inc,
                    discard_timeout: 15,
                    rx_seg_int_step: 8,
                    ack_retrans_count: 3,
                };
                assert_eq!(SarRx::decode(&rx.encode().unwrap()).unwrap(), rx);
            }
        }
    }

    #[test]
    fn short_buffer_rejected() {
        assert!(matches!(
            SarTx::decode(&[0x12, 0x34, 0x56]),
            Err(Error::Decode { expected: 4, got: 3 })
        ));
        assert!(matches!(
            SarRx::decode(&[0x00]),
            Err(Error::Decode { expected: 3, got: 1 })
        ));
    }

    #[test]
    fn overflow_rejected() {
        let tx = SarTx {
            seg_int_step: 16,
            ..Default::default()
        };
        assert!(matches!(tx.encode(), Err(Error::FieldOverflow { .. })));

        let rx = SarRx {
            ack_retrans_count: 4,
            ..Default::default()
        };
        assert!(matches!(rx.encode(), Err(Error::FieldOverflow { .. })));
    }

    #[test]
    fn derived_timings() {
        let tx = SarTx::decode(&[0x12, 0x34, 0x56, 0x07]).unwrap();
        assert_eq!(tx.seg_int_ms(), 30);
        assert_eq!(tx.retrans_count(), 2);
        assert_eq!(tx.retrans_int_step_ms(), 100);
        assert_eq!(tx.retrans_int_inc_ms(), 175);
        // ttl 0은 기본 간격으로 되돌아간다
        assert_eq!(tx.retrans_timeout_ms(0), 100);
        assert_eq!(tx.retrans_timeout_ms(1), 100);
        assert_eq!(tx.retrans_timeout_ms(3), 100 + 175 * 2);
        assert_eq!(tx.multicast_retrans_timeout_ms(), 200);

        let rx = SarRx::default();
        assert_eq!(rx.ack_delay_segs(), 5);
        assert_eq!(rx.rx_seg_int_ms(), 60);
        assert_eq!(rx.ack_delay_ms(), 300);
        assert_eq!(rx.discard_timeout_ms(), 10_000);
        assert_eq!(rx.ack_retrans_count(), 1);
    }
}
