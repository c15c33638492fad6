//! Ordered MMIO stores for doorbell registers.
//!
//! After [`ring_sq_doorbell`] returns, the register store is visible to the
//! PCIe link and no earlier user store can pass it. The 32-bit fallback
//! spinlock is the only process-wide mutable state in the engine.

/// Send doorbell record slot (`dbrec[1]`); slot 0 belongs to the receive
/// queue.
pub const SND_DBR: usize = 1;
/// Receive doorbell record slot.
pub const RCV_DBR: usize = 0;

/// Offset of the CQ arm doorbell register within a UAR page.
pub const UAR_CQ_DOORBELL: usize = 0x20;

#[cfg(target_pointer_width = "32")]
mod fallback {
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Orders the two 32-bit halves of a doorbell store process-wide so the
    /// chipset cannot interleave stores from different threads.
    static MMIO64_LOCK: AtomicBool = AtomicBool::new(false);

    pub(super) fn lock() {
        while MMIO64_LOCK
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    pub(super) fn unlock() {
        MMIO64_LOCK.store(false, Ordering::Release);
    }
}

/// Store the first 8 bytes of `ctrl` (already in device byte order) to a
/// doorbell register.
///
/// Uses a single 64-bit store where the host has one. On 32-bit hosts it
/// falls back to two 32-bit stores in ascending-address order, high dword
/// first, under a process-wide spinlock.
///
/// # Safety
/// `reg` must be a mapped, naturally-aligned register address and `ctrl`
/// must point to at least 8 readable bytes.
#[inline]
pub unsafe fn mmio_write64_be(reg: *mut u8, ctrl: *const u8) {
    #[cfg(target_pointer_width = "64")]
    {
        std::ptr::write_volatile(reg as *mut u64, std::ptr::read(ctrl as *const u64));
    }
    #[cfg(target_pointer_width = "32")]
    {
        let hi = std::ptr::read(ctrl as *const u32);
        let lo = std::ptr::read(ctrl.add(4) as *const u32);
        fallback::lock();
        std::ptr::write_volatile(reg as *mut u32, hi);
        std::ptr::write_volatile(reg.add(4) as *mut u32, lo);
        fallback::unlock();
    }
}

/// Copy a WQE into a BlueFlame sub-buffer in 64-byte blocks, wrapping at
/// the queue end.
///
/// # Safety
/// `bf_reg` must point at a BlueFlame sub-buffer with room for `bytecnt`
/// (rounded up to 64) bytes; `ctrl` must lie inside
/// `[queue_start, queue_end)`.
pub unsafe fn bf_copy(
    bf_reg: *mut u8,
    ctrl: *const u8,
    mut bytecnt: usize,
    queue_start: *const u8,
    queue_end: *const u8,
) {
    let mut dst = bf_reg as *mut u64;
    let mut src = ctrl as *const u64;
    while bytecnt > 0 {
        for _ in 0..8 {
            std::ptr::write_volatile(dst, std::ptr::read(src));
            dst = dst.add(1);
            src = src.add(1);
        }
        bytecnt = bytecnt.saturating_sub(64);
        if (src as *const u8) >= queue_end {
            src = queue_start as *const u64;
        }
    }
}

/// BlueFlame copy window for a doorbell that inlines the full WQE.
#[derive(Debug, Clone, Copy)]
pub struct BfWindow {
    /// Bytes to copy (the full WQE size, unpadded).
    pub bytecnt: usize,
    /// Start of the send-queue ring, for wrapping.
    pub queue_start: *const u8,
    /// One past the end of the send-queue ring.
    pub queue_end: *const u8,
}

/// Publish new send-queue WQEs to the device.
///
/// 1. release-order fence so prior WQE stores precede the record update,
/// 2. store `big_endian(new_pi & 0xFFFF)` to the send doorbell record,
/// 3. store-store barrier,
/// 4. optionally inline the WQE into the BlueFlame sub-buffer, then store
///    the first 8 bytes of the control segment to the register,
/// 5. flush the write-combining buffer.
///
/// # Safety
/// `dbrec` must point at the queue's doorbell record pair, `reg` at the
/// UAR doorbell register for the chosen BlueFlame sub-buffer, and `ctrl`
/// at the control segment of the last posted WQE.
pub unsafe fn ring_sq_doorbell(
    dbrec: *mut u32,
    new_pi: u16,
    reg: *mut u8,
    ctrl: *const u8,
    bf: Option<BfWindow>,
) {
    udma_to_device_barrier!();
    std::ptr::write_volatile(dbrec.add(SND_DBR), (new_pi as u32).to_be());
    mmio_flush_writes!();
    if let Some(w) = bf {
        bf_copy(reg, ctrl, w.bytecnt, w.queue_start, w.queue_end);
    }
    mmio_write64_be(reg, ctrl);
    mmio_flush_writes!();
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Basic-block-aligned scratch buffer standing in for queue memory and
    /// the register page.
    #[repr(C, align(64))]
    struct Block<const N: usize>([u8; N]);

    impl<const N: usize> Block<N> {
        fn zeroed() -> Self {
            Block([0u8; N])
        }
    }

    #[test]
    fn doorbell_record_is_big_endian_pi() {
        let mut dbrec = [0u32; 2];
        let ctrl = Block::<64>::zeroed();
        let mut reg = Block::<8>::zeroed();
        unsafe {
            ring_sq_doorbell(
                dbrec.as_mut_ptr(),
                0x1234,
                reg.0.as_mut_ptr(),
                ctrl.0.as_ptr(),
                None,
            );
        }
        assert_eq!(u32::from_be(dbrec[SND_DBR]), 0x1234);
        assert_eq!(dbrec[RCV_DBR], 0);
    }

    #[test]
    fn register_store_copies_ctrl_head() {
        let mut dbrec = [0u32; 2];
        let mut ctrl = Block::<64>::zeroed();
        ctrl.0[..8].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let mut reg = Block::<8>::zeroed();
        unsafe {
            ring_sq_doorbell(
                dbrec.as_mut_ptr(),
                1,
                reg.0.as_mut_ptr(),
                ctrl.0.as_ptr(),
                None,
            );
        }
        assert_eq!(&reg.0, &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn bf_copy_wraps_at_queue_end() {
        // 128-byte ring; a 128-byte WQE starting at the last block wraps.
        let mut ring = Block::<128>::zeroed();
        for (i, b) in ring.0.iter_mut().enumerate() {
            *b = i as u8;
        }
        let mut bf = Block::<128>::zeroed();
        unsafe {
            bf_copy(
                bf.0.as_mut_ptr(),
                ring.0.as_ptr().add(64),
                128,
                ring.0.as_ptr(),
                ring.0.as_ptr().add(128),
            );
        }
        assert_eq!(&bf.0[..64], &ring.0[64..]);
        assert_eq!(&bf.0[64..], &ring.0[..64]);
    }
}
