//! Send-queue state and the post path.
//!
//! The queue owns wrapping producer/consumer indices counted in basic
//! blocks, the BlueFlame sub-buffer toggle, and a per-slot table that maps
//! a completed WQE index back to the blocks it consumed.

use crate::error::{DevxError, Result};
use crate::mmio::{self, BfWindow};
use crate::wqe::{self, SendDescriptor, WQEBB_SIZE};

/// BlueFlame sub-buffer size; posts alternate between the two halves.
const BF_SIZE: u32 = 256;

pub(crate) struct SendQueue {
    /// Send-queue ring base (inside the work-queue umem, past the receive
    /// region).
    buf: *mut u8,
    /// Ring capacity in basic blocks; power of two.
    wqe_cnt: u16,
    /// Doorbell record pair.
    dbrec: *mut u32,
    /// UAR doorbell/BlueFlame register.
    reg: *mut u8,
    /// Current BlueFlame sub-buffer offset; flips every post.
    bf_offset: u32,
    /// Inline the full WQE into the BlueFlame buffer on each post.
    use_bf: bool,
    /// Producer index in basic blocks (wrapping).
    pi: u16,
    /// Consumer index in basic blocks (wrapping).
    ci: u16,
    /// `table[idx] = pi after the WQE posted at idx`, kept only for
    /// signaled WQEs so a completion can release the blocks it covered.
    table: Box<[Option<u16>]>,
}

// The ring and doorbell pointers reference memory owned by the queue pair;
// cross-thread use is serialized by the owner.
unsafe impl Send for SendQueue {}

impl SendQueue {
    pub(crate) fn new(
        buf: *mut u8,
        wqe_cnt: u16,
        dbrec: *mut u32,
        reg: *mut u8,
        use_bf: bool,
    ) -> Self {
        debug_assert!(wqe_cnt.is_power_of_two());
        Self {
            buf,
            wqe_cnt,
            dbrec,
            reg,
            bf_offset: 0,
            use_bf,
            pi: 0,
            ci: 0,
            table: (0..wqe_cnt).map(|_| None).collect(),
        }
    }

    #[inline]
    pub(crate) fn pi(&self) -> u16 {
        self.pi
    }

    #[inline]
    pub(crate) fn ci(&self) -> u16 {
        self.ci
    }

    /// Free basic blocks.
    #[inline]
    pub(crate) fn available(&self) -> u16 {
        self.wqe_cnt - self.pi.wrapping_sub(self.ci)
    }

    /// Basic blocks from the producer index to the ring end.
    #[inline]
    fn slots_to_end(&self) -> u16 {
        self.wqe_cnt - (self.pi & (self.wqe_cnt - 1))
    }

    #[inline]
    fn wqe_ptr(&self, idx: u16) -> *mut u8 {
        let off = ((idx & (self.wqe_cnt - 1)) as usize) * WQEBB_SIZE;
        unsafe { self.buf.add(off) }
    }

    /// Post one WQE and ring the doorbell. Returns the WQE index, which
    /// reappears as the completion's `wqe_counter`.
    pub(crate) fn post(&mut self, desc: &SendDescriptor, qpn: u32) -> Result<u16> {
        let size = wqe::wqe_size(desc)?;
        let num_bb = wqe::calc_wqebb_cnt(size);

        // A multi-block WQE must not wrap mid-descriptor; pad with a NOP to
        // the ring end first.
        let fill = if num_bb > self.slots_to_end() {
            self.slots_to_end()
        } else {
            0
        };
        if self.available() < num_bb + fill {
            return Err(DevxError::Backpressure);
        }
        if fill > 0 {
            let idx = self.pi;
            unsafe {
                wqe::write_nop_wqe(self.wqe_ptr(idx), idx, qpn, fill);
            }
            self.pi = self.pi.wrapping_add(fill);
        }

        let wqe_idx = self.pi;
        let region = unsafe {
            std::slice::from_raw_parts_mut(self.wqe_ptr(wqe_idx), num_bb as usize * WQEBB_SIZE)
        };
        region.fill(0);
        wqe::write_send_wqe(region, desc, qpn, wqe_idx)?;

        let new_pi = self.pi.wrapping_add(num_bb);
        let ctrl = self.wqe_ptr(wqe_idx) as *const u8;
        let bf = if self.use_bf {
            Some(BfWindow {
                bytecnt: size,
                queue_start: self.buf as *const u8,
                queue_end: unsafe { self.buf.add(self.wqe_cnt as usize * WQEBB_SIZE) }
                    as *const u8,
            })
        } else {
            None
        };
        unsafe {
            mmio::ring_sq_doorbell(
                self.dbrec,
                new_pi,
                self.reg.add(self.bf_offset as usize),
                ctrl,
                bf,
            );
        }
        self.bf_offset ^= BF_SIZE;

        self.table[(wqe_idx & (self.wqe_cnt - 1)) as usize] = Some(new_pi);
        self.pi = new_pi;
        Ok(wqe_idx)
    }

    /// Release the blocks covered by the WQE whose completion carried
    /// `wqe_counter`.
    pub(crate) fn complete(&mut self, wqe_counter: u16) {
        let slot = (wqe_counter & (self.wqe_cnt - 1)) as usize;
        if let Some(new_ci) = self.table[slot].take() {
            self.ci = new_ci;
        }
    }
}
