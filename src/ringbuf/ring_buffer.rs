//! Lock-free Single-Producer Single-Consumer 字节环形缓冲区 + 消息帧
//!
//! 设计目标：
//! - 零锁：生产者和消费者完全无锁操作
//! - 零分配：存储在创建时一次性分配
//! - 缓存友好：读写游标各自独占 cache line，避免 false sharing
//! - 内存锁定：可选 mlock 防止实时线程上的 page fault
//!
//! 帧格式（无填充、无校验）：
//!
//! ```text
//! +-----------+-------------+------------------+
//! | tag: i32  | length: u32 | payload (length) |
//! +-----------+-------------+------------------+
//! ```
//!
//! 写入是全有或全无：空间不足时直接失败，不写任何字节；
//! 写游标在全部字节写完之后才发布。读取方要么看到完整的一帧，要么什么也看不到。

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// 帧头长度（字节）
pub const HEADER_LEN: usize = 8;

/// 写入失败：剩余空间不足
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no space (needed {needed} bytes, {available} available)")]
pub struct NoSpace {
    pub needed: usize,
    pub available: usize,
}

/// 分配失败
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cannot allocate {0} bytes")]
pub struct AllocError(pub usize);

/// SPSC 无锁字节环
///
/// 游标单调递增（wrapping），物理下标 = 游标 & mask。
/// 容量为 2 的幂，全部容量都可写入。
pub struct ByteRing {
    storage: Box<[UnsafeCell<u8>]>,
    capacity: usize,
    mask: usize,

    write_pos: CachePadded<AtomicUsize>,
    read_pos: CachePadded<AtomicUsize>,

    // 是否已锁定内存
    memory_locked: AtomicBool,
}

unsafe impl Send for ByteRing {}
unsafe impl Sync for ByteRing {}

impl ByteRing {
    /// 创建至少 `min_capacity` 字节的环（向上取整到 2 的幂）
    ///
    /// 内存不足时返回 `AllocError`，不会 abort。
    pub fn with_min_capacity(min_capacity: usize) -> Result<Self, AllocError> {
        let capacity = min_capacity
            .max(1)
            .checked_next_power_of_two()
            .ok_or(AllocError(min_capacity))?;

        let mut storage: Vec<UnsafeCell<u8>> = Vec::new();
        storage
            .try_reserve_exact(capacity)
            .map_err(|_| AllocError(capacity))?;
        storage.resize_with(capacity, || UnsafeCell::new(0));

        Ok(Self {
            storage: storage.into_boxed_slice(),
            capacity,
            mask: capacity - 1,
            write_pos: CachePadded::new(AtomicUsize::new(0)),
            read_pos: CachePadded::new(AtomicUsize::new(0)),
            memory_locked: AtomicBool::new(false),
        })
    }

    /// 锁定缓冲区内存，防止被换页
    ///
    /// 在实时音频场景下，page fault 会导致严重的时序抖动。
    /// 返回是否成功锁定
    pub fn lock_memory(&self) -> bool {
        if self.memory_locked.load(Ordering::Acquire) {
            return true; // 已经锁定
        }

        let ptr = self.storage.as_ptr() as *const libc::c_void;
        let result = unsafe { libc::mlock(ptr, self.capacity) };

        if result == 0 {
            self.memory_locked.store(true, Ordering::Release);
            log::debug!("Ring buffer memory locked: {} bytes", self.capacity);
            true
        } else {
            log::warn!(
                "Failed to lock ring buffer memory ({})",
                std::io::Error::last_os_error()
            );
            false
        }
    }

    /// 解锁缓冲区内存
    pub fn unlock_memory(&self) {
        if !self.memory_locked.load(Ordering::Acquire) {
            return;
        }

        let ptr = self.storage.as_ptr() as *const libc::c_void;
        unsafe {
            libc::munlock(ptr, self.capacity);
        }

        self.memory_locked.store(false, Ordering::Release);
        log::debug!("Ring buffer memory unlocked");
    }

    /// 检查内存是否已锁定
    pub fn is_memory_locked(&self) -> bool {
        self.memory_locked.load(Ordering::Acquire)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 当前可读字节数
    #[inline]
    pub fn read_space(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    /// 当前可写字节数
    #[inline]
    pub fn write_space(&self) -> usize {
        self.capacity - self.read_space()
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        // UnsafeCell<u8> 与 u8 布局相同
        self.storage.as_ptr() as *mut u8
    }

    /// 从逻辑位置 `pos` 开始写入，处理物理边界回绕（最多两段）
    ///
    /// 调用方保证 [pos, pos + data.len()) 属于生产者独占区域。
    #[inline]
    unsafe fn copy_in(&self, pos: usize, data: &[u8]) {
        let start = pos & self.mask;
        let first = data.len().min(self.capacity - start);
        std::ptr::copy_nonoverlapping(data.as_ptr(), self.base().add(start), first);
        if first < data.len() {
            std::ptr::copy_nonoverlapping(
                data.as_ptr().add(first),
                self.base(),
                data.len() - first,
            );
        }
    }

    /// 从逻辑位置 `pos` 开始读出，处理物理边界回绕（最多两段）
    ///
    /// 调用方保证 [pos, pos + out.len()) 属于消费者独占区域。
    #[inline]
    unsafe fn copy_out(&self, pos: usize, out: &mut [u8]) {
        let start = pos & self.mask;
        let first = out.len().min(self.capacity - start);
        std::ptr::copy_nonoverlapping(self.base().add(start), out.as_mut_ptr(), first);
        if first < out.len() {
            std::ptr::copy_nonoverlapping(
                self.base(),
                out.as_mut_ptr().add(first),
                out.len() - first,
            );
        }
    }

    /// 写入一帧（生产者调用）
    ///
    /// 全有或全无；此函数是 wait-free 的，绝不阻塞、绝不分配
    pub fn write_frame(&self, tag: i32, payload: &[u8]) -> Result<(), NoSpace> {
        let write = self.write_pos.load(Ordering::Relaxed);
        let read = self.read_pos.load(Ordering::Acquire);

        let used = write.wrapping_sub(read);
        debug_assert!(used <= self.capacity, "ring buffer invariant violated: used > capacity");
        let available = self.capacity - used;

        let needed = HEADER_LEN.saturating_add(payload.len());
        let length = match u32::try_from(payload.len()) {
            Ok(len) if needed <= available => len,
            _ => return Err(NoSpace { needed, available }),
        };

        let mut header = [0u8; HEADER_LEN];
        header[..4].copy_from_slice(&tag.to_ne_bytes());
        header[4..].copy_from_slice(&length.to_ne_bytes());

        unsafe {
            self.copy_in(write, &header);
            self.copy_in(write.wrapping_add(HEADER_LEN), payload);
        }

        // 全部字节就位后才发布
        self.write_pos
            .store(write.wrapping_add(needed), Ordering::Release);
        Ok(())
    }

    /// 窥视帧头（消费者调用），不消费
    ///
    /// 帧头本身可能跨越物理边界。
    #[inline]
    pub fn peek_header(&self) -> Option<(i32, u32)> {
        let read = self.read_pos.load(Ordering::Relaxed);
        let write = self.write_pos.load(Ordering::Acquire);
        if write.wrapping_sub(read) < HEADER_LEN {
            return None;
        }

        let mut header = [0u8; HEADER_LEN];
        unsafe { self.copy_out(read, &mut header) };

        let tag = i32::from_ne_bytes([header[0], header[1], header[2], header[3]]);
        let length = u32::from_ne_bytes([header[4], header[5], header[6], header[7]]);
        Some((tag, length))
    }

    /// 读出一帧到 `out`（消费者调用）
    ///
    /// 帧不完整（头或 payload 未全部到达）时返回 `None`，不消费任何字节。
    /// `advance` 为 true 时恰好消费 header + length 字节。
    /// `out` 容量足够时不分配。
    pub fn read_frame_into(&self, out: &mut Vec<u8>, advance: bool) -> Option<i32> {
        let (tag, length) = self.peek_header()?;
        let length = length as usize;

        let read = self.read_pos.load(Ordering::Relaxed);
        let write = self.write_pos.load(Ordering::Acquire);
        let frame_len = HEADER_LEN + length;
        if write.wrapping_sub(read) < frame_len {
            return None;
        }

        out.clear();
        out.resize(length, 0);
        unsafe { self.copy_out(read.wrapping_add(HEADER_LEN), out) };

        if advance {
            self.read_pos
                .store(read.wrapping_add(frame_len), Ordering::Release);
        }
        Some(tag)
    }
}

impl Drop for ByteRing {
    fn drop(&mut self) {
        self.unlock_memory();
    }
}
