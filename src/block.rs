//! 블록과 청크 분할
//!
//! BLOB은 2의 거듭제곱 크기 블록으로 나뉘고(마지막 블록은 짧을 수
//! 있다) 각 블록은 MTU 이하의 청크로 나뉜다. 바이트 구간과 (블록 번호,
//! 청크 번호)의 대응은 결정적이다: 같은 전송 파라미터는 언제나 같은
//! 분할을 재현한다.

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};

/// `total_size` 바이트 BLOB의 블록 수
pub fn block_count(total_size: u32, block_size_log: u8) -> u32 {
    let block_size = 1u64 << block_size_log;
    (((total_size as u64) + block_size - 1) / block_size) as u32
}

/// 블록 `number`의 크기. 마지막 블록만 나머지를 담으며, 빈 BLOB이
/// 아닌 한 0이 되지 않는다
pub fn block_size(total_size: u32, block_size_log: u8, number: u32) -> u32 {
    let start = (number as u64) << block_size_log;
    let full = 1u64 << block_size_log;
    ((total_size as u64).saturating_sub(start)).min(full) as u32
}

/// `block_size` 바이트 블록의 청크 수
pub fn chunk_count(block_size: u32, chunk_size: u16) -> u32 {
    (block_size + chunk_size as u32 - 1) / chunk_size as u32
}

/// BLOB의 블록 하나
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    /// BLOB 안에서의 블록 번호
    pub number: u16,
    /// BLOB 안에서의 블록 바이트 오프셋
    pub offset: u32,
    /// 블록 크기 (바이트)
    pub size: u32,
}

impl Block {
    /// BLOB의 블록 `number`를 기술한다
    pub fn new(total_size: u32, block_size_log: u8, number: u16) -> Self {
        Self {
            number,
            offset: (number as u32) << block_size_log,
            size: block_size(total_size, block_size_log, number as u32),
        }
    }
}

/// 블록의 청크 하나. 청크가 재전송의 원자 단위다
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 블록 안에서의 청크 번호
    pub number: u16,
    /// 블록 안에서의 바이트 오프셋
    pub offset: u32,
    /// 페이로드
    pub data: Bytes,
}

/// 데이터가 `data`인 블록의 청크 `number`, 끝을 넘으면 `None`
pub fn chunk_at(block: &Block, chunk_size: u16, data: &[u8], number: u16) -> Option<Chunk> {
    let offset = number as u32 * chunk_size as u32;
    if offset >= block.size {
        return None;
    }
    let end = (offset + chunk_size as u32).min(block.size) as usize;
    Some(Chunk {
        number,
        offset,
        data: Bytes::copy_from_slice(&data[offset as usize..end]),
    })
}

/// 블록의 지연·재시작 가능 청크 시퀀스. 부분 재전송은 다시
/// 순회하거나 [`chunk_at`]을 쓴다
pub fn chunks<'a>(
    block: &'a Block,
    chunk_size: u16,
    data: &'a [u8],
) -> impl Iterator<Item = Chunk> + 'a {
    let count = chunk_count(block.size, chunk_size) as u16;
    (0..count).filter_map(move |number| chunk_at(block, chunk_size, data, number))
}

/// 블록 하나의 재조립 버퍼
///
/// 청크 쓰기는 경계 검사를 거치고 청크 단위 write-once 비트맵으로
/// 추적되므로, 잘못되거나 중복된 청크가 이미 받은 데이터를 훼손할 수
/// 없다.
#[derive(Debug)]
pub struct BlockAssembler {
    number: u16,
    buf: BytesMut,
    chunk_size: u16,
    received: Vec<bool>,
    received_count: u32,
}

impl BlockAssembler {
    /// `block_size` 바이트 블록을 위한 빈 조립기
    pub fn new(number: u16, block_size: u32, chunk_size: u16) -> Self {
        let total = chunk_count(block_size, chunk_size) as usize;
        let mut buf = BytesMut::with_capacity(block_size as usize);
        buf.resize(block_size as usize, 0);

        Self {
            number,
            buf,
            chunk_size,
            received: vec![false; total],
            received_count: 0,
        }
    }

    /// 이 조립기가 모으는 블록 번호
    pub fn number(&self) -> u16 {
        self.number
    }

    /// 블록의 전체 청크 수
    pub fn total_chunks(&self) -> u32 {
        self.received.len() as u32
    }

    /// 지금까지 받은 청크 수
    pub fn received_count(&self) -> u32 {
        self.received_count
    }

    fn expected_len(&self, number: u16) -> u32 {
        let offset = number as u32 * self.chunk_size as u32;
        (self.chunk_size as u32).min(self.buf.len() as u32 - offset)
    }

    /// 청크를 버퍼에 기록한다. 블록이 다 찼는지를 돌려준다.
    ///
    /// 이미 받은 청크를 같은 크기로 다시 넣으면 no-op. 같은 청크 번호에
    /// 다른 크기면 [`Error::Inconsistent`]. 블록 경계 밖이면
    /// [`Error::OutOfRange`].
    pub fn insert(&mut self, chunk: &Chunk) -> Result<bool> {
        let len = chunk.data.len() as u32;

        if chunk.number as usize >= self.received.len()
            || chunk.offset != chunk.number as u32 * self.chunk_size as u32
            || chunk.offset + len > self.buf.len() as u32
        {
            return Err(Error::OutOfRange {
                offset: chunk.offset,
                len,
                block_size: self.buf.len() as u32,
            });
        }

        if len != self.expected_len(chunk.number) {
            return Err(Error::Inconsistent {
                chunk: chunk.number,
            });
        }

        if !self.received[chunk.number as usize] {
            let start = chunk.offset as usize;
            self.buf[start..start + chunk.data.len()].copy_from_slice(&chunk.data);
            self.received[chunk.number as usize] = true;
            self.received_count += 1;
        }

        Ok(self.is_complete())
    }

    /// 모든 청크를 받았는지
    pub fn is_complete(&self) -> bool {
        self.received_count as usize == self.received.len()
    }

    /// 아직 받지 못한 청크 번호들
    pub fn missing_chunks(&self) -> Vec<u16> {
        self.received
            .iter()
            .enumerate()
            .filter(|(_, &got)| !got)
            .map(|(number, _)| number as u16)
            .collect()
    }

    /// 조립기를 소비하고 블록 데이터를 돌려준다
    pub fn into_data(self) -> Bytes {
        self.buf.freeze()
    }
}
