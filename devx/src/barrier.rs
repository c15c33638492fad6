//! Memory barrier macros for MMIO doorbell sequences.
//!
//! The doorbell path needs three orderings: user stores before the doorbell
//! record update, the record update before the register store, and the
//! write-combining buffer committed after the register store.

/// Flush the write-combining buffer.
///
/// On x86_64 this is `sfence`; on AArch64 `dsb st`. Other architectures get
/// a sequentially-consistent release fence, which is stronger than required.
macro_rules! mmio_flush_writes {
    () => {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            std::arch::x86_64::_mm_sfence();
        }
        #[cfg(target_arch = "x86")]
        unsafe {
            std::arch::x86::_mm_sfence();
        }
        #[cfg(target_arch = "aarch64")]
        unsafe {
            std::arch::asm!("dsb st", options(nostack, preserves_flags));
        }
        #[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")))]
        {
            std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
        }
    };
}

/// Store-store barrier between the doorbell record update and the register
/// store.
///
/// On x86 a compiler barrier suffices (TSO orders stores); ARM needs an
/// explicit `dmb oshst`.
macro_rules! udma_to_device_barrier {
    () => {
        #[cfg(target_arch = "aarch64")]
        unsafe {
            std::arch::asm!("dmb oshst", options(nostack, preserves_flags));
        }
        #[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
        {
            std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::Release);
        }
        #[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")))]
        {
            std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
        }
    };
}

/// Load barrier issued after the CQE owner bit confirms validity, so the
/// remaining CQE reads observe what the device wrote.
macro_rules! udma_from_device_barrier {
    () => {
        #[cfg(target_arch = "aarch64")]
        unsafe {
            std::arch::asm!("dmb oshld", options(nostack, preserves_flags));
        }
        #[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
        {
            std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::Acquire);
        }
        #[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")))]
        {
            std::sync::atomic::fence(std::sync::atomic::Ordering::Acquire);
        }
    };
}
