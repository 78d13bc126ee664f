use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;
use tidewire_buffer::{BufferError, RefCnt, ReferenceCounted};

/// `FileRegion` 描述文件中的一段待发送字节，供传输层以零拷贝方式写出。
///
/// # 契约说明（What）
/// - 区段为 `[position, position + count)`，`transferred` 记录已写出的字节数；
/// - 计数归零时关闭文件，此后 `transfer_to` 返回错误；
/// - 与缓冲相同，交给下游而不 `retain` 即视为转移所有权。
pub struct FileRegion {
    refcnt: RefCnt,
    file: Mutex<Option<File>>,
    position: u64,
    count: u64,
    transferred: AtomicU64,
}

impl FileRegion {
    pub fn new(file: File, position: u64, count: u64) -> Self {
        Self {
            refcnt: RefCnt::new(),
            file: Mutex::new(Some(file)),
            position,
            count,
            transferred: AtomicU64::new(0),
        }
    }

    /// 打开文件并截取区段。
    pub fn open(path: impl AsRef<Path>, position: u64, count: u64) -> io::Result<Self> {
        Ok(Self::new(File::open(path)?, position, count))
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Acquire)
    }

    /// 从区段内偏移 `offset` 起，把剩余字节写入 `target`，返回本次写出的字节数。
    pub fn transfer_to<W: Write + ?Sized>(&self, target: &mut W, offset: u64) -> io::Result<u64> {
        if offset > self.count {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("offset {offset} exceeds region count {}", self.count),
            ));
        }
        let guard = self.file.lock();
        let mut file = guard
            .as_ref()
            .ok_or_else(|| io::Error::other(BufferError::IllegalReferenceCount { count: 0, delta: 0 }))?;
        file.seek(SeekFrom::Start(self.position + offset))?;
        let written = io::copy(&mut file.take(self.count - offset), target)?;
        self.transferred.fetch_add(written, Ordering::AcqRel);
        Ok(written)
    }
}

impl ReferenceCounted for FileRegion {
    fn ref_cnt(&self) -> usize {
        self.refcnt.get()
    }

    fn retain_n(&self, increment: usize) -> tidewire_buffer::Result<()> {
        self.refcnt.retain(increment).map(|_| ())
    }

    fn release_n(&self, decrement: usize) -> tidewire_buffer::Result<bool> {
        let deallocated = self.refcnt.release(decrement)?;
        if deallocated {
            drop(self.file.lock().take());
        }
        Ok(deallocated)
    }

    fn touch(&self, _hint: Option<&str>) {}
}

impl fmt::Debug for FileRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileRegion")
            .field("position", &self.position)
            .field("count", &self.count)
            .field("transferred", &self.transferred())
            .field("ref_cnt", &self.ref_cnt())
            .finish()
    }
}
