//! PRM command helpers.
//!
//! Hardware resources are created and modified through fixed-layout command
//! buffers encoded as big-endian 32-bit dword arrays with bitfield packing.
//! The `(bit offset, bit size)` constants below are the only way to address
//! a field, so an unknown path cannot be written.

use crate::error::{DevxError, Result};

// ============================================================================
// Bitfield helpers
// ============================================================================

/// Set a field (1-32 bits) in a command buffer.
///
/// Layout: big-endian 32-bit dword array. Within each dword, bit 0 is the
/// MSB. `bit_off` is the absolute bit offset from the start of the structure.
#[inline]
pub fn prm_set(buf: &mut [u8], bit_off: usize, bit_sz: usize, value: u32) {
    debug_assert!(bit_sz > 0 && bit_sz <= 32);
    debug_assert!(
        bit_off / 8 + 4 <= buf.len(),
        "prm_set out of bounds: off={:#x} sz={}",
        bit_off,
        bit_sz
    );
    let dw_idx = bit_off / 32;
    let dw_bit_off = 32 - bit_sz - (bit_off & 0x1f);
    let mask = if bit_sz == 32 {
        u32::MAX
    } else {
        (1u32 << bit_sz) - 1
    };
    let ptr = buf.as_mut_ptr() as *mut u32;
    unsafe {
        let old = u32::from_be(ptr.add(dw_idx).read_unaligned());
        let new = (old & !(mask << dw_bit_off)) | ((value & mask) << dw_bit_off);
        ptr.add(dw_idx).write_unaligned(new.to_be());
    }
}

/// Set a 64-bit field in a command buffer.
#[inline]
pub fn prm_set64(buf: &mut [u8], bit_off: usize, value: u64) {
    prm_set(buf, bit_off, 32, (value >> 32) as u32);
    prm_set(buf, bit_off + 32, 32, value as u32);
}

/// Get a field (1-32 bits) from a command buffer.
#[inline]
pub fn prm_get(buf: &[u8], bit_off: usize, bit_sz: usize) -> u32 {
    debug_assert!(bit_sz > 0 && bit_sz <= 32);
    let dw_idx = bit_off / 32;
    let dw_bit_off = 32 - bit_sz - (bit_off & 0x1f);
    let mask = if bit_sz == 32 {
        u32::MAX
    } else {
        (1u32 << bit_sz) - 1
    };
    let ptr = buf.as_ptr() as *const u32;
    unsafe { (u32::from_be(ptr.add(dw_idx).read_unaligned()) >> dw_bit_off) & mask }
}

/// Get a 64-bit field from a command buffer.
#[inline]
pub fn prm_get64(buf: &[u8], bit_off: usize) -> u64 {
    ((prm_get(buf, bit_off, 32) as u64) << 32) | prm_get(buf, bit_off + 32, 32) as u64
}

/// Check a command result; on failure decode the status and syndrome from
/// the output buffer and keep them for diagnostics.
pub(crate) fn check_result(ret: i32, out: &[u8], cmd: &'static str) -> Result<()> {
    if ret != 0 {
        return Err(command_error(out, cmd));
    }
    Ok(())
}

/// Build a [`DevxError::Device`] from a failed command's output buffer.
pub(crate) fn command_error(out: &[u8], cmd: &'static str) -> DevxError {
    let (status, syndrome) = if out.len() >= 8 {
        (
            prm_get(out, CMD_STATUS.0, CMD_STATUS.1),
            prm_get(out, CMD_SYNDROME.0, CMD_SYNDROME.1),
        )
    } else {
        (0, 0)
    };
    DevxError::Device {
        cmd,
        status,
        syndrome,
    }
}

// ============================================================================
// Command opcodes
// ============================================================================

pub const CMD_OP_QUERY_HCA_CAP: u32 = 0x100;
pub const CMD_OP_CREATE_MKEY: u32 = 0x200;
pub const CMD_OP_CREATE_CQ: u32 = 0x400;
pub const CMD_OP_DESTROY_CQ: u32 = 0x401;
pub const CMD_OP_CREATE_QP: u32 = 0x500;
pub const CMD_OP_DESTROY_QP: u32 = 0x501;
pub const CMD_OP_RST2INIT_QP: u32 = 0x502;
pub const CMD_OP_INIT2RTR_QP: u32 = 0x503;
pub const CMD_OP_RTR2RTS_QP: u32 = 0x504;
pub const CMD_OP_2ERR_QP: u32 = 0x507;
pub const CMD_OP_QUERY_QP: u32 = 0x50B;

/// Common output header: status and syndrome.
pub const CMD_STATUS: (usize, usize) = (0x00, 8);
pub const CMD_SYNDROME: (usize, usize) = (0x20, 0x20);

// ============================================================================
// create_qp_in / create_qp_out layout
// ============================================================================

pub const CREATE_QP_IN_OPCODE: (usize, usize) = (0x00, 0x10);
pub const CREATE_QP_IN_QPC_OFF: usize = 0xC0;
pub const CREATE_QP_IN_WQ_UMEM_ID: (usize, usize) = (0x840, 0x20);
pub const CREATE_QP_IN_WQ_UMEM_VALID: (usize, usize) = (0x860, 1);
pub const CREATE_QP_IN_PAS_OFF: usize = 0x880;
/// Size of create_qp_in without PAS entries (in bytes).
pub const CREATE_QP_IN_SIZE: usize = CREATE_QP_IN_PAS_OFF / 8;

pub const CREATE_QP_OUT_QPN: (usize, usize) = (0x48, 0x18);
pub const CREATE_QP_OUT_SIZE: usize = 0x80 / 8;

// ============================================================================
// modify_qp_in / modify_qp_out layout
// (shared by RST2INIT, INIT2RTR, RTR2RTS, 2ERR)
// ============================================================================

pub const MODIFY_QP_IN_OPCODE: (usize, usize) = (0x00, 0x10);
pub const MODIFY_QP_IN_QPN: (usize, usize) = (0x48, 0x18);
#[allow(dead_code)]
pub const MODIFY_QP_IN_OPT_PARAM_MASK: (usize, usize) = (0x80, 0x20);
pub const MODIFY_QP_IN_ECE: (usize, usize) = (0xA0, 0x20);
pub const MODIFY_QP_IN_QPC_OFF: usize = 0xC0;
pub const MODIFY_QP_IN_SIZE: usize = 0x880 / 8;

pub const MODIFY_QP_OUT_SIZE: usize = 0x80 / 8;

// ============================================================================
// query_qp_in / query_qp_out layout
// ============================================================================

pub const QUERY_QP_IN_OPCODE: (usize, usize) = (0x00, 0x10);
pub const QUERY_QP_IN_QPN: (usize, usize) = (0x48, 0x18);
pub const QUERY_QP_IN_SIZE: usize = 0x80 / 8;

pub const QUERY_QP_OUT_QPC_OFF: usize = 0xC0;
pub const QUERY_QP_OUT_SIZE: usize = 0x880 / 8;

// ============================================================================
// destroy_qp_in layout
// ============================================================================

pub const DESTROY_QP_IN_OPCODE: (usize, usize) = (0x00, 0x10);
pub const DESTROY_QP_IN_QPN: (usize, usize) = (0x48, 0x18);
pub const DESTROY_QP_IN_SIZE: usize = 0x80 / 8;

pub const DESTROY_QP_OUT_SIZE: usize = 0x80 / 8;

// ============================================================================
// QPC field offsets (relative to QPC start within the command buffer)
//
// Firmware offsets. The ADS in the firmware PRM is 0x160 bits, larger than
// the kernel header's 0x100 bits, so every field after the secondary ADS is
// shifted by +0xC0 compared to kernel offsets.
// ============================================================================

pub const QPC_STATE: (usize, usize) = (0x00, 4);
pub const QPC_ST: (usize, usize) = (0x08, 8);
pub const QPC_PM_STATE: (usize, usize) = (0x13, 2);
pub const QPC_PD: (usize, usize) = (0x28, 0x18);
pub const QPC_MTU: (usize, usize) = (0x40, 3);
pub const QPC_LOG_MSG_MAX: (usize, usize) = (0x43, 5);
pub const QPC_LOG_RQ_SIZE: (usize, usize) = (0x49, 4);
pub const QPC_LOG_RQ_STRIDE: (usize, usize) = (0x4D, 3);
pub const QPC_NO_SQ: (usize, usize) = (0x50, 1);
pub const QPC_LOG_SQ_SIZE: (usize, usize) = (0x51, 4);
pub const QPC_UAR_PAGE: (usize, usize) = (0x68, 0x18);
pub const QPC_LOG_PAGE_SIZE: (usize, usize) = (0xA3, 5);
pub const QPC_REMOTE_QPN: (usize, usize) = (0xA8, 0x18);

// Primary / secondary address path. The firmware ADS is 0x160 bits.
pub const QPC_PRI_ADS: usize = 0xC0;
#[allow(dead_code)]
pub const QPC_SEC_ADS: usize = 0xC0 + 0x160;

// Post-ADS fields (firmware offsets = kernel offsets + 0xC0).
pub const QPC_LOG_SRA_MAX: (usize, usize) = (0x388, 3);
pub const QPC_RETRY_COUNT: (usize, usize) = (0x38D, 3);
pub const QPC_RNR_RETRY: (usize, usize) = (0x390, 3);
pub const QPC_LOG_ACK_REQ_FREQ: (usize, usize) = (0x3A4, 4);
pub const QPC_NEXT_SEND_PSN: (usize, usize) = (0x3C8, 0x18);
pub const QPC_CQN_SND: (usize, usize) = (0x3E8, 0x18);
pub const QPC_LOG_RRA_MAX: (usize, usize) = (0x488, 3);
pub const QPC_ATOMIC_MODE: (usize, usize) = (0x48C, 4);
pub const QPC_RRE: (usize, usize) = (0x490, 1);
pub const QPC_RWE: (usize, usize) = (0x491, 1);
pub const QPC_RAE: (usize, usize) = (0x492, 1);
pub const QPC_PAGE_OFFSET: (usize, usize) = (0x494, 6);
pub const QPC_MIN_RNR_NAK: (usize, usize) = (0x4A3, 5);
pub const QPC_NEXT_RCV_PSN: (usize, usize) = (0x4A8, 0x18);
pub const QPC_CQN_RCV: (usize, usize) = (0x4E8, 0x18);
pub const QPC_DBR_ADDR: usize = 0x500;
pub const QPC_DBR_UMEM_VALID: (usize, usize) = (0x683, 1);
pub const QPC_DBR_UMEM_ID: (usize, usize) = (0x720, 0x20);

/// QP service types.
pub const QP_ST_RC: u32 = 0x00;

/// pm_state value for a migrated (non-APM) QP.
pub const QP_PM_STATE_MIGRATED: u32 = 3;

// ============================================================================
// ADS (address path) field offsets, relative to the ADS start
// ============================================================================

pub const ADS_PKEY_INDEX: (usize, usize) = (0x10, 0x10);
pub const ADS_GRH: (usize, usize) = (0x28, 1);
pub const ADS_MLID: (usize, usize) = (0x29, 7);
pub const ADS_RLID: (usize, usize) = (0x30, 0x10);
pub const ADS_ACK_TIMEOUT: (usize, usize) = (0x40, 5);
pub const ADS_SRC_ADDR_INDEX: (usize, usize) = (0x48, 8);
pub const ADS_STAT_RATE: (usize, usize) = (0x54, 4);
pub const ADS_HOP_LIMIT: (usize, usize) = (0x58, 8);
pub const ADS_TCLASS: (usize, usize) = (0x64, 8);
pub const ADS_FLOW_LABEL: (usize, usize) = (0x6C, 0x14);
/// 128-bit remote GID / IP field.
pub const ADS_RGID_RIP: usize = 0x80;
pub const ADS_DSCP: (usize, usize) = (0x10A, 6);
/// On Ethernet ports this field carries the egress priority.
pub const ADS_SL_ETH_PRIO: (usize, usize) = (0x124, 4);
pub const ADS_VHCA_PORT_NUM: (usize, usize) = (0x128, 8);
pub const ADS_RMAC_47_32: (usize, usize) = (0x130, 0x10);
pub const ADS_RMAC_31_0: (usize, usize) = (0x140, 0x20);

// ============================================================================
// create_cq_in / create_cq_out layout
// ============================================================================

pub const CREATE_CQ_IN_OPCODE: (usize, usize) = (0x00, 0x10);
pub const CREATE_CQ_IN_CQC_OFF: usize = 0x80;
pub const CREATE_CQ_IN_CQ_UMEM_ID: (usize, usize) = (0x2C0, 0x20);
pub const CREATE_CQ_IN_CQ_UMEM_VALID: (usize, usize) = (0x2E0, 1);
pub const CREATE_CQ_IN_PAS_OFF: usize = 0x880;
/// Size of create_cq_in without PAS entries (in bytes).
pub const CREATE_CQ_IN_SIZE: usize = CREATE_CQ_IN_PAS_OFF / 8;

pub const CREATE_CQ_OUT_CQN: (usize, usize) = (0x48, 0x18);
pub const CREATE_CQ_OUT_SIZE: usize = 0x80 / 8;

pub const DESTROY_CQ_IN_OPCODE: (usize, usize) = (0x00, 0x10);
pub const DESTROY_CQ_IN_CQN: (usize, usize) = (0x48, 0x18);
pub const DESTROY_CQ_IN_SIZE: usize = 0x80 / 8;

// ============================================================================
// CQC field offsets (relative to CQC start)
// ============================================================================

pub const CQC_DBR_UMEM_VALID: (usize, usize) = (0x06, 1);
pub const CQC_CQE_SZ: (usize, usize) = (0x08, 3);
pub const CQC_DBR_UMEM_ID: (usize, usize) = (0x20, 0x20);
pub const CQC_LOG_CQ_SIZE: (usize, usize) = (0x63, 5);
pub const CQC_UAR_PAGE: (usize, usize) = (0x68, 0x18);
pub const CQC_C_EQN: (usize, usize) = (0xA0, 0x20);
pub const CQC_LOG_PAGE_SIZE: (usize, usize) = (0xC3, 5);
pub const CQC_DBR_ADDR: usize = 0x1C0;

// ============================================================================
// create_mkey_in / create_mkey_out layout
// ============================================================================

pub const CREATE_MKEY_IN_OPCODE: (usize, usize) = (0x00, 0x10);
pub const CREATE_MKEY_IN_UMEM_VALID: (usize, usize) = (0x61, 1);
pub const CREATE_MKEY_IN_MKC_OFF: usize = 0x80;
pub const CREATE_MKEY_IN_TRANSLATIONS_OCTWORD_ACTUAL_SIZE: (usize, usize) = (0x300, 0x20);
pub const CREATE_MKEY_IN_UMEM_ID: (usize, usize) = (0x320, 0x20);
pub const CREATE_MKEY_IN_UMEM_OFFSET: usize = 0x340;
pub const CREATE_MKEY_IN_SIZE: usize = 0x800 / 8;

pub const CREATE_MKEY_OUT_MKEY_INDEX: (usize, usize) = (0x48, 0x18);
pub const CREATE_MKEY_OUT_SIZE: usize = 0x80 / 8;

// ============================================================================
// MKC (memory key context) field offsets, relative to the MKC start
// ============================================================================

pub const MKC_ATOMIC: (usize, usize) = (0x11, 1);
pub const MKC_RW: (usize, usize) = (0x12, 1);
pub const MKC_RR: (usize, usize) = (0x13, 1);
pub const MKC_LW: (usize, usize) = (0x14, 1);
pub const MKC_LR: (usize, usize) = (0x15, 1);
pub const MKC_ACCESS_MODE_1_0: (usize, usize) = (0x16, 2);
pub const MKC_QPN: (usize, usize) = (0x20, 0x18);
pub const MKC_MKEY_7_0: (usize, usize) = (0x38, 8);
pub const MKC_PD: (usize, usize) = (0x68, 0x18);
pub const MKC_START_ADDR: usize = 0x80;
pub const MKC_LEN: usize = 0xC0;
pub const MKC_TRANSLATIONS_OCTWORD_SIZE: (usize, usize) = (0x1A0, 0x20);
pub const MKC_LOG_PAGE_SIZE: (usize, usize) = (0x1DB, 5);

/// MTT-backed access mode.
pub const MKC_ACCESS_MODE_MTT: u32 = 1;

// ============================================================================
// Unit tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_roundtrip_aligned() {
        let mut buf = [0u8; 16];
        prm_set(&mut buf, 0x00, 0x10, 0x500);
        assert_eq!(prm_get(&buf, 0x00, 0x10), 0x500);
        // Opcode lands in the upper half of the first big-endian dword.
        assert_eq!(&buf[0..4], &[0x05, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn set_get_roundtrip_unaligned() {
        let mut buf = [0u8; 16];
        prm_set(&mut buf, 0x13, 2, 3);
        assert_eq!(prm_get(&buf, 0x13, 2), 3);
        // Neighbouring fields are untouched.
        assert_eq!(prm_get(&buf, 0x08, 8), 0);
        prm_set(&mut buf, 0x08, 8, 0xAB);
        assert_eq!(prm_get(&buf, 0x13, 2), 3);
        assert_eq!(prm_get(&buf, 0x08, 8), 0xAB);
    }

    #[test]
    fn set_get_64() {
        let mut buf = [0u8; 24];
        prm_set64(&mut buf, 0x40, 0xDEAD_BEEF_CAFE_F00D);
        assert_eq!(prm_get64(&buf, 0x40), 0xDEAD_BEEF_CAFE_F00D);
        assert_eq!(&buf[8..16], &[0xDE, 0xAD, 0xBE, 0xEF, 0xCA, 0xFE, 0xF0, 0x0D]);
    }

    #[test]
    fn full_dword() {
        let mut buf = [0u8; 8];
        prm_set(&mut buf, 0x20, 0x20, u32::MAX);
        assert_eq!(prm_get(&buf, 0x20, 0x20), u32::MAX);
    }

    #[test]
    fn overwrite_preserves_siblings() {
        let mut buf = [0u8; 8];
        prm_set(&mut buf, 0x28, 0x18, 0xAAAAAA);
        prm_set(&mut buf, 0x20, 8, 0x55);
        assert_eq!(prm_get(&buf, 0x28, 0x18), 0xAAAAAA);
        assert_eq!(prm_get(&buf, 0x20, 8), 0x55);
    }
}
