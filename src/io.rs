//! BLOB 바이트 소스/싱크 추상화
//!
//! 전송 기계는 저장소를 직접 만지지 않는다: 클라이언트는 [`BlobIo`]로
//! 청크를 읽고 서버는 그것으로 청크를 쓴다. 펌웨어 슬롯, 파일,
//! 인메모리 버퍼를 서로 바꿔 쓸 수 있다.

use bytes::{Bytes, BytesMut};

use crate::block::{chunk_at, Block, Chunk};
use crate::error::{Error, Result};
use crate::message::Xfer;

/// BLOB 바이트에 대한 청크 단위 접근
pub trait BlobIo: Send {
    /// 이 io를 쓰는 전송이 시작할 때 한 번 불린다
    fn open(&mut self, _xfer: &Xfer) -> Result<()> {
        Ok(())
    }

    /// `block`의 청크 `number`를 읽는다 (송신측)
    fn read_chunk(&self, block: &Block, number: u16, chunk_size: u16) -> Result<Chunk>;

    /// 수신한 `block`의 청크 하나를 쓴다 (수신측)
    fn write_chunk(&mut self, block: &Block, chunk: &Chunk) -> Result<()>;

    /// `block`의 모든 청크가 쓰였을 때 불린다
    fn block_end(&mut self, _block: &Block) -> Result<()> {
        Ok(())
    }
}

/// 메모리 기반 BLOB. 전송 양쪽에서 쓸 수 있다
#[derive(Debug, Default)]
pub struct MemoryBlob {
    data: BytesMut,
}

impl MemoryBlob {
    /// 기존 바이트 위의 읽기측 blob
    pub fn from_bytes(data: impl Into<BytesMut>) -> Self {
        Self { data: data.into() }
    }

    /// 들어오는 전송에 맞춰 크기가 잡히는 쓰기측 blob
    pub fn for_receive() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// blob 내용 스냅샷
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data)
    }
}

impl BlobIo for MemoryBlob {
    fn open(&mut self, xfer: &Xfer) -> Result<()> {
        if self.data.is_empty() {
            self.data.resize(xfer.size as usize, 0);
        }
        Ok(())
    }

    fn read_chunk(&self, block: &Block, number: u16, chunk_size: u16) -> Result<Chunk> {
        let start = block.offset as usize;
        let end = start + block.size as usize;
        if end > self.data.len() {
            return Err(Error::OutOfRange {
                offset: block.offset,
                len: block.size,
                block_size: self.data.len() as u32,
            });
        }

        chunk_at(block, chunk_size, &self.data[start..end], number).ok_or(Error::OutOfRange {
            offset: number as u32 * chunk_size as u32,
            len: chunk_size as u32,
            block_size: block.size,
        })
    }

    fn write_chunk(&mut self, block: &Block, chunk: &Chunk) -> Result<()> {
        let start = (block.offset + chunk.offset) as usize;
        let end = start + chunk.data.len();
        if chunk.offset + chunk.data.len() as u32 > block.size || end > self.data.len() {
            return Err(Error::OutOfRange {
                offset: chunk.offset,
                len: chunk.data.len() as u32,
                block_size: block.size,
            });
        }

        self.data[start..end].copy_from_slice(&chunk.data);
        Ok(())
    }
}

/// 파일 기반 BLOB. `load`와 `flush` 사이에는 이미지 전체를 메모리에
/// 들고 있다. 펌웨어 이미지는 호스트 메모리에 비해 작다
#[derive(Debug)]
pub struct FileBlob {
    path: std::path::PathBuf,
    inner: MemoryBlob,
}

impl FileBlob {
    /// 기존 파일에서 읽어 들인 읽기측 blob
    pub fn load(path: impl Into<std::path::PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = std::fs::read(&path)?;
        Ok(Self {
            path,
            inner: MemoryBlob::from_bytes(&data[..]),
        })
    }

    /// `path`로 플러시될 쓰기측 blob
    pub fn create(path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            path: path.into(),
            inner: MemoryBlob::for_receive(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// 버퍼 내용을 디스크에 쓴다
    pub fn flush(&self) -> Result<()> {
        std::fs::write(&self.path, &self.inner.to_bytes())?;
        Ok(())
    }
}

impl BlobIo for FileBlob {
    fn open(&mut self, xfer: &Xfer) -> Result<()> {
        self.inner.open(xfer)
    }

    fn read_chunk(&self, block: &Block, number: u16, chunk_size: u16) -> Result<Chunk> {
        self.inner.read_chunk(block, number, chunk_size)
    }

    fn write_chunk(&mut self, block: &Block, chunk: &Chunk) -> Result<()> {
        self.inner.write_chunk(block, chunk)
    }

    fn block_end(&mut self, _block: &Block) -> Result<()> {
        self.flush()
    }
}
