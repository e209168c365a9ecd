//! 消息帧环形缓冲区句柄
//!
//! `RingBuffer` 是本地句柄：control context 和 process context 各持有一个，
//! 通过 `Shared<RingBufferShared>` 共享同一个 `ByteRing`。
//! 一端只写、一端只读（SPSC）。

pub mod ring_buffer;

use std::fmt;

use crate::error::{Error, Result};
use crate::shared::Shared;

pub use ring_buffer::{ByteRing, NoSpace, HEADER_LEN};

/// 一帧消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: i32,
    pub payload: Vec<u8>,
}

/// 环形缓冲区的共享部分
pub struct RingBufferShared {
    ring: ByteRing,
}

impl Drop for RingBufferShared {
    fn drop(&mut self) {
        crate::verbose!("releasing ringbuffer ({} bytes)", self.ring.capacity());
    }
}

/// 环形缓冲区本地句柄
pub struct RingBuffer {
    shared: Shared<RingBufferShared>,
    in_process_context: bool,
}

impl RingBuffer {
    /// 创建环形缓冲区
    ///
    /// `size` 向上取整到 2 的幂；`pinned` 为 true 时尝试 mlock（失败只告警）。
    pub fn new(size: i64, pinned: bool) -> Result<Self> {
        if size <= 0 {
            return Err(Error::argument(1, "ringbuffer size must be positive"));
        }
        let size = usize::try_from(size).map_err(|_| Error::Allocation)?;
        let ring = ByteRing::with_min_capacity(size).map_err(|_| Error::Allocation)?;
        if pinned {
            ring.lock_memory();
        }
        crate::verbose!("created ringbuffer ({} bytes)", ring.capacity());

        Ok(Self {
            shared: Shared::create(RingBufferShared { ring }),
            in_process_context: false,
        })
    }

    /// 为 process context 生成视图（引用计数 +1）
    pub(crate) fn process_view(&self) -> Self {
        Self {
            shared: self.shared.retain(),
            in_process_context: true,
        }
    }

    #[inline]
    fn ring(&self) -> &ByteRing {
        &self.shared.ring
    }

    /// 写入一帧；全有或全无
    #[inline]
    pub fn write(&self, tag: i32, payload: &[u8]) -> std::result::Result<(), NoSpace> {
        self.ring().write_frame(tag, payload)
    }

    /// 读出一帧并消费
    pub fn read(&self) -> Option<Frame> {
        self.read_frame(true)
    }

    /// 读出一帧但不消费
    pub fn peek(&self) -> Option<Frame> {
        self.read_frame(false)
    }

    pub fn read_frame(&self, advance: bool) -> Option<Frame> {
        let mut payload = Vec::new();
        let tag = self.ring().read_frame_into(&mut payload, advance)?;
        Some(Frame { tag, payload })
    }

    /// 读出一帧到调用方提供的缓冲区（消费）
    ///
    /// 实时线程上使用：`out` 容量足够时不分配。
    #[inline]
    pub fn read_into(&self, out: &mut Vec<u8>) -> Option<i32> {
        self.ring().read_frame_into(out, true)
    }

    #[inline]
    pub fn read_space(&self) -> usize {
        self.ring().read_space()
    }

    #[inline]
    pub fn write_space(&self) -> usize {
        self.ring().write_space()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.ring().capacity()
    }

    pub fn is_pinned(&self) -> bool {
        self.ring().is_memory_locked()
    }

    pub fn in_process_context(&self) -> bool {
        self.in_process_context
    }

    pub fn ref_count(&self) -> i32 {
        self.shared.ref_count()
    }

    pub fn same_as(&self, other: &RingBuffer) -> bool {
        Shared::ptr_eq(&self.shared, &other.shared)
    }
}

impl fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("ptr", &self.shared.as_ptr())
            .field("capacity", &self.capacity())
            .field("in_process_context", &self.in_process_context)
            .finish()
    }
}
