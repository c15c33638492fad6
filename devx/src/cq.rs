//! Completion queue: CQE ring, owner-bit polling, error decode, arming.

use std::sync::Arc;

use crate::device::DevxDevice;
use crate::error::{DevxError, Result};
use crate::mmio::UAR_CQ_DOORBELL;
use crate::prm;
use crate::resource::{DevxObj, Uar, Umem};

/// CQE size in bytes.
pub const CQE_SIZE: usize = 64;

/// Opcode marking a slot the hardware has not written yet.
const CQE_OPCODE_INVALID: u8 = 0xF;

/// Arm command: report the next completion.
const CQ_DB_REQ_NOT: u32 = 0;
/// Arm command: report only solicited completions.
const CQ_DB_REQ_NOT_SOL: u32 = 1 << 24;

/// CQE opcodes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqeOpcode {
    /// Requester (send-side) completion.
    Req = 0x00,
    /// Responder: RDMA write with immediate landed.
    RespRdmaWriteImm = 0x01,
    /// Responder: send landed.
    RespSend = 0x02,
    /// Responder: send with immediate landed.
    RespSendImm = 0x03,
    /// Requester error.
    ReqErr = 0x0D,
    /// Responder error.
    RespErr = 0x0E,
}

impl CqeOpcode {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(Self::Req),
            0x01 => Some(Self::RespRdmaWriteImm),
            0x02 => Some(Self::RespSend),
            0x03 => Some(Self::RespSendImm),
            0x0D => Some(Self::ReqErr),
            0x0E => Some(Self::RespErr),
            _ => None,
        }
    }

    /// Whether this opcode reports a failed work request.
    pub fn is_error(self) -> bool {
        matches!(self, Self::ReqErr | Self::RespErr)
    }
}

/// A decoded successful completion.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub opcode: CqeOpcode,
    /// Index of the completed WQE, for releasing send-queue blocks.
    pub wqe_counter: u16,
    /// Queue pair the completion belongs to.
    pub qpn: u32,
    pub byte_count: u32,
    /// Immediate data for *_WITH_IMM responder completions.
    pub immediate: u32,
    pub timestamp: u64,
}

/// Completion queue configuration.
#[derive(Debug, Clone, Copy)]
pub struct CqConfig {
    /// log2 of the ring size in entries.
    pub log_cq_size: u8,
}

impl Default for CqConfig {
    fn default() -> Self {
        Self { log_cq_size: 9 }
    }
}

/// A completion queue bound to an event queue, polled by owner bit.
pub struct CompletionQueue {
    // Destroy the hardware object before releasing its memory.
    _obj: DevxObj,
    cqn: u32,
    uar: Uar,
    buf: Umem,
    db: Umem,
    log_size: u8,
    /// Consumer index; wraps unbounded.
    ci: u64,
    /// Arm sequence number, mod 4.
    arm_sn: u8,
}

// Ring and doorbell pointers reference umems owned by this struct.
unsafe impl Send for CompletionQueue {}

impl CompletionQueue {
    /// Allocate the ring, seed the owner bits, and issue CREATE_CQ.
    pub fn create(dev: &Arc<dyn DevxDevice>, config: &CqConfig) -> Result<Self> {
        let caps = dev.caps();
        let log_size = if config.log_cq_size == 0 || config.log_cq_size > caps.log_max_cq_sz {
            9
        } else {
            config.log_cq_size
        };
        let cqe_cnt: usize = 1 << log_size;

        let uar = Uar::alloc(dev)?;
        let db = Umem::register(dev, 64)?;
        let buf = Umem::register(dev, cqe_cnt * CQE_SIZE)?;

        // Seed every slot invalid, with the owner bit the hardware will
        // flip on its first lap.
        for i in 0..cqe_cnt {
            let op_own = (CQE_OPCODE_INVALID << 4) | (((i >> log_size) & 1) as u8);
            unsafe {
                std::ptr::write_volatile(buf.addr().add(i * CQE_SIZE + 63), op_own);
            }
        }

        let eqn = dev.query_eqn(0)?;

        let mut cmd_in = vec![0u8; prm::CREATE_CQ_IN_SIZE];
        let mut cmd_out = vec![0u8; prm::CREATE_CQ_OUT_SIZE];

        prm::prm_set(
            &mut cmd_in,
            prm::CREATE_CQ_IN_OPCODE.0,
            prm::CREATE_CQ_IN_OPCODE.1,
            prm::CMD_OP_CREATE_CQ,
        );
        let c = prm::CREATE_CQ_IN_CQC_OFF;
        prm::prm_set(&mut cmd_in, c + prm::CQC_C_EQN.0, prm::CQC_C_EQN.1, eqn);
        prm::prm_set(
            &mut cmd_in,
            c + prm::CQC_UAR_PAGE.0,
            prm::CQC_UAR_PAGE.1,
            uar.page_id(),
        );
        prm::prm_set(
            &mut cmd_in,
            c + prm::CQC_LOG_CQ_SIZE.0,
            prm::CQC_LOG_CQ_SIZE.1,
            log_size as u32,
        );
        // cqe_sz = 0 selects 64-byte entries.
        prm::prm_set(&mut cmd_in, c + prm::CQC_CQE_SZ.0, prm::CQC_CQE_SZ.1, 0);
        prm::prm_set(
            &mut cmd_in,
            c + prm::CQC_LOG_PAGE_SIZE.0,
            prm::CQC_LOG_PAGE_SIZE.1,
            caps.log_page_size as u32,
        );
        prm::prm_set(
            &mut cmd_in,
            c + prm::CQC_DBR_UMEM_VALID.0,
            prm::CQC_DBR_UMEM_VALID.1,
            1,
        );
        prm::prm_set(
            &mut cmd_in,
            c + prm::CQC_DBR_UMEM_ID.0,
            prm::CQC_DBR_UMEM_ID.1,
            db.umem_id(),
        );
        prm::prm_set(
            &mut cmd_in,
            prm::CREATE_CQ_IN_CQ_UMEM_VALID.0,
            prm::CREATE_CQ_IN_CQ_UMEM_VALID.1,
            1,
        );
        prm::prm_set(
            &mut cmd_in,
            prm::CREATE_CQ_IN_CQ_UMEM_ID.0,
            prm::CREATE_CQ_IN_CQ_UMEM_ID.1,
            buf.umem_id(),
        );

        let obj = dev
            .obj_create(&cmd_in, &mut cmd_out)
            .map_err(|_| prm::command_error(&cmd_out, "CREATE_CQ"))?;
        let cqn = prm::prm_get(&cmd_out, prm::CREATE_CQ_OUT_CQN.0, prm::CREATE_CQ_OUT_CQN.1);

        log::debug!("created completion queue cqn={} entries={}", cqn, cqe_cnt);

        Ok(Self {
            _obj: DevxObj::new(obj, dev.clone()),
            cqn,
            uar,
            buf,
            db,
            log_size,
            ci: 0,
            arm_sn: 0,
        })
    }

    pub fn cqn(&self) -> u32 {
        self.cqn
    }

    /// Consumer index (total completions reaped).
    pub fn consumer_index(&self) -> u64 {
        self.ci
    }

    /// Ring size in entries.
    pub fn entries(&self) -> usize {
        1 << self.log_size
    }

    #[inline]
    fn cqe_ptr(&self, slot: usize) -> *const u8 {
        unsafe { self.buf.addr().add(slot * CQE_SIZE) as *const u8 }
    }

    /// Acknowledge reaped completions to the hardware.
    fn update_dbrec(&self) {
        unsafe {
            std::ptr::write_volatile(
                self.db.addr() as *mut u32,
                ((self.ci & 0x00FF_FFFF) as u32).to_be(),
            );
        }
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }

    /// Poll one entry without blocking.
    ///
    /// Returns `Ok(None)` when the ring has nothing new. An error CQE
    /// consumes its slot and advances the consumer index before being
    /// reported, so the queue stays usable.
    pub fn poll_once(&mut self) -> Result<Option<Completion>> {
        let mask = (1usize << self.log_size) - 1;
        let slot = (self.ci as usize) & mask;
        let expected_owner = ((self.ci >> self.log_size) & 1) as u8;
        let ptr = self.cqe_ptr(slot);

        let op_own = unsafe { std::ptr::read_volatile(ptr.add(63)) };
        let opcode_raw = op_own >> 4;
        if (op_own & 1) != expected_owner || opcode_raw == CQE_OPCODE_INVALID {
            return Ok(None);
        }

        udma_from_device_barrier!();

        let wqe_counter =
            u16::from_be(unsafe { std::ptr::read_volatile(ptr.add(60) as *const u16) });
        let qpn = u32::from_be(unsafe { std::ptr::read_volatile(ptr.add(56) as *const u32) })
            & 0x00FF_FFFF;

        let opcode = CqeOpcode::from_u8(opcode_raw).unwrap_or(CqeOpcode::ReqErr);
        if opcode.is_error() {
            let vendor_syndrome = unsafe { std::ptr::read_volatile(ptr.add(54)) };
            let syndrome = unsafe { std::ptr::read_volatile(ptr.add(55)) };
            self.ci += 1;
            self.update_dbrec();
            log::warn!(
                "error cqe on qpn={:#x}: opcode={:#x} syndrome={:#x} vendor={:#x} wqe={}",
                qpn,
                opcode_raw,
                syndrome,
                vendor_syndrome,
                wqe_counter
            );
            return Err(DevxError::HardwareCompletion {
                syndrome,
                vendor_syndrome,
                wqe_counter,
            });
        }

        let byte_count =
            u32::from_be(unsafe { std::ptr::read_volatile(ptr.add(44) as *const u32) });
        let immediate =
            u32::from_be(unsafe { std::ptr::read_volatile(ptr.add(36) as *const u32) });
        let timestamp =
            u64::from_be(unsafe { std::ptr::read_volatile(ptr.add(48) as *const u64) });

        self.ci += 1;
        self.update_dbrec();

        Ok(Some(Completion {
            opcode,
            wqe_counter,
            qpn,
            byte_count,
            immediate,
            timestamp,
        }))
    }

    /// Arm the queue for an event on the next (optionally solicited-only)
    /// completion.
    pub fn arm(&mut self, solicited_only: bool) -> Result<()> {
        self.arm_sn = (self.arm_sn + 1) & 3;
        let sn = self.arm_sn as u32;
        let cmd = if solicited_only {
            CQ_DB_REQ_NOT_SOL
        } else {
            CQ_DB_REQ_NOT
        };
        let ci = (self.ci & 0x00FF_FFFF) as u32;
        let db_word = (sn << 28) | cmd | ci;

        unsafe {
            // Arm word is the second doorbell-record entry.
            std::ptr::write_volatile((self.db.addr() as *mut u32).add(1), db_word.to_be());
        }
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
        unsafe {
            let reg = self.uar.base_addr().add(UAR_CQ_DOORBELL) as *mut u64;
            let doorbell = ((db_word as u64) << 32) | self.cqn as u64;
            std::ptr::write_volatile(reg, doorbell.to_be());
        }
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}
