//! Work-queue element formatting.
//!
//! A send WQE is a control segment, an optional remote-address segment for
//! RDMA operations, and a data segment (pointer or inline), padded to the
//! 64-byte basic-block boundary. All multi-byte fields are big-endian.

use bitflags::bitflags;

use crate::error::{DevxError, Result};

/// Basic-block size; WQEs occupy whole basic blocks.
pub const WQEBB_SIZE: usize = 64;
/// Control segment size.
pub const CTRL_SEG_SIZE: usize = 16;
/// Remote-address segment size.
pub const RDMA_SEG_SIZE: usize = 16;
/// Data (scatter/gather) segment size.
pub const DATA_SEG_SIZE: usize = 16;
/// Inline data header size.
pub const INLINE_HEADER_SIZE: usize = 4;
/// Largest WQE the doorbell path accepts (the BlueFlame window).
pub const MAX_WQE_SIZE: usize = 256;

/// Send opcodes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WqeOpcode {
    Nop = 0x00,
    RdmaWrite = 0x08,
    RdmaWriteImm = 0x09,
    Send = 0x0A,
    SendImm = 0x0B,
    RdmaRead = 0x10,
}

impl WqeOpcode {
    /// Whether the opcode carries a remote-address segment.
    pub fn needs_remote(self) -> bool {
        matches!(self, Self::RdmaWrite | Self::RdmaWriteImm | Self::RdmaRead)
    }

    /// Whether the opcode carries immediate data in the control segment.
    pub fn has_imm(self) -> bool {
        matches!(self, Self::RdmaWriteImm | Self::SendImm)
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(Self::Nop),
            0x08 => Some(Self::RdmaWrite),
            0x09 => Some(Self::RdmaWriteImm),
            0x0A => Some(Self::Send),
            0x0B => Some(Self::SendImm),
            0x10 => Some(Self::RdmaRead),
            _ => None,
        }
    }
}

bitflags! {
    /// Posting flags.
    ///
    /// `SIGNALED`, `FENCE` and `SOLICITED` map directly onto the control
    /// segment's `fm_ce_se` byte. `INLINE` is interpreted by the writer:
    /// the payload is copied into the WQE behind an inline header instead
    /// of being referenced through a data pointer segment.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SendFlags: u8 {
        /// Request a completion entry.
        const SIGNALED = 0x08;
        /// Wait for previous WQEs before executing this one.
        const FENCE = 0x40;
        /// Mark the message solicited.
        const SOLICITED = 0x02;
        /// Copy the payload into the WQE.
        const INLINE = 0x80;
    }
}

impl SendFlags {
    /// The bits that belong in the control segment.
    pub(crate) fn fm_ce_se(self) -> u8 {
        (self & !SendFlags::INLINE).bits()
    }
}

/// One send work request, described independently of queue state.
#[derive(Debug, Clone, Copy)]
pub struct SendDescriptor {
    pub opcode: WqeOpcode,
    /// Local buffer virtual address.
    pub addr: u64,
    /// Payload length in bytes.
    pub length: u32,
    /// Local memory key.
    pub lkey: u32,
    /// `(remote address, rkey)`; required for RDMA opcodes.
    pub remote: Option<(u64, u32)>,
    /// Immediate value, used by the *_WITH_IMM opcodes.
    pub imm: u32,
    pub flags: SendFlags,
}

// ============================================================================
// Segment writers
// ============================================================================

/// Write a control segment.
///
/// `opmod_idx_opcode = (opmod << 24) | ((idx & 0xFFFF) << 8) | opcode`,
/// `qpn_ds = (qpn << 8) | ds`; the signature byte stays zero.
///
/// # Safety
/// `ptr` must point to at least 16 writable bytes.
#[inline]
pub unsafe fn write_ctrl_seg(
    ptr: *mut u8,
    wqe_idx: u16,
    opcode: u8,
    opmod: u8,
    qpn: u32,
    ds: u8,
    fm_ce_se: u8,
    imm: u32,
) {
    let opmod_idx_opcode = ((opmod as u32) << 24) | ((wqe_idx as u32) << 8) | (opcode as u32);
    let qpn_ds = (qpn << 8) | (ds as u32);
    let ptr32 = ptr as *mut u32;
    std::ptr::write_volatile(ptr32, opmod_idx_opcode.to_be());
    std::ptr::write_volatile(ptr32.add(1), qpn_ds.to_be());
    std::ptr::write_volatile(ptr32.add(2), (fm_ce_se as u32).to_be());
    std::ptr::write_volatile(ptr32.add(3), imm.to_be());
}

/// Write a remote-address segment.
///
/// # Safety
/// `ptr` must point to at least 16 writable bytes.
#[inline]
pub unsafe fn write_rdma_seg(ptr: *mut u8, raddr: u64, rkey: u32) {
    std::ptr::write_volatile(ptr as *mut u64, raddr.to_be());
    std::ptr::write_volatile(ptr.add(8) as *mut u32, rkey.to_be());
    std::ptr::write_volatile(ptr.add(12) as *mut u32, 0);
}

/// Write a data pointer segment.
///
/// # Safety
/// `ptr` must point to at least 16 writable bytes.
#[inline]
pub unsafe fn write_data_seg(ptr: *mut u8, byte_count: u32, lkey: u32, addr: u64) {
    let ptr32 = ptr as *mut u32;
    std::ptr::write_volatile(ptr32, byte_count.to_be());
    std::ptr::write_volatile(ptr32.add(1), lkey.to_be());
    std::ptr::write_volatile(ptr.add(8) as *mut u64, addr.to_be());
}

/// Write an inline header followed by the payload.
///
/// Returns the 16-byte-padded size of header plus payload.
///
/// # Safety
/// `ptr` must point to at least `inline_padded_size(data.len())` writable
/// bytes.
#[inline]
pub unsafe fn write_inline(ptr: *mut u8, data: &[u8]) -> usize {
    let header = 0x8000_0000u32 | data.len() as u32;
    std::ptr::write_volatile(ptr as *mut u32, header.to_be());
    std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(INLINE_HEADER_SIZE), data.len());
    inline_padded_size(data.len())
}

/// 16-byte-padded footprint of an inline header plus `len` payload bytes.
#[inline]
pub fn inline_padded_size(len: usize) -> usize {
    (INLINE_HEADER_SIZE + len + 15) & !15
}

/// Number of basic blocks a WQE of `wqe_size` bytes consumes.
#[inline]
pub fn calc_wqebb_cnt(wqe_size: usize) -> u16 {
    wqe_size.div_ceil(WQEBB_SIZE) as u16
}

/// Unpadded byte size of the WQE a descriptor produces.
pub fn wqe_size(desc: &SendDescriptor) -> Result<usize> {
    if desc.opcode.needs_remote() && desc.remote.is_none() {
        return Err(DevxError::InvalidArgument(
            "RDMA opcode requires a remote address",
        ));
    }
    let mut size = CTRL_SEG_SIZE;
    if desc.opcode.needs_remote() {
        size += RDMA_SEG_SIZE;
    }
    if desc.flags.contains(SendFlags::INLINE) {
        size += inline_padded_size(desc.length as usize);
    } else {
        size += DATA_SEG_SIZE;
    }
    if size > MAX_WQE_SIZE {
        return Err(DevxError::InvalidArgument("inline payload too large"));
    }
    Ok(size)
}

/// Format one send WQE into `region` and return the number of basic blocks
/// consumed.
///
/// The region is written only where segments land; bytes beyond the WQE are
/// left untouched. Fails with `InvalidArgument` before any write if the
/// region is too small or the descriptor is inconsistent.
pub fn write_send_wqe(
    region: &mut [u8],
    desc: &SendDescriptor,
    qpn: u32,
    wqe_idx: u16,
) -> Result<u16> {
    let size = wqe_size(desc)?;
    if region.len() < size {
        return Err(DevxError::InvalidArgument("wqe region too small"));
    }
    if (region.as_ptr() as usize) % CTRL_SEG_SIZE != 0 {
        return Err(DevxError::InvalidArgument("control segment not aligned"));
    }

    let inline = desc.flags.contains(SendFlags::INLINE);
    let ds = ((size - CTRL_SEG_SIZE) / 16 + 1) as u8;
    let imm = if desc.opcode.has_imm() { desc.imm } else { 0 };

    unsafe {
        let base = region.as_mut_ptr();
        write_ctrl_seg(
            base,
            wqe_idx,
            desc.opcode as u8,
            0,
            qpn,
            ds,
            desc.flags.fm_ce_se(),
            imm,
        );
        let mut seg = base.add(CTRL_SEG_SIZE);
        if let Some((raddr, rkey)) = desc.remote {
            if desc.opcode.needs_remote() {
                write_rdma_seg(seg, raddr, rkey);
                seg = seg.add(RDMA_SEG_SIZE);
            }
        }
        if inline {
            let payload =
                std::slice::from_raw_parts(desc.addr as *const u8, desc.length as usize);
            write_inline(seg, payload);
        } else {
            write_data_seg(seg, desc.length, desc.lkey, desc.addr);
        }
    }

    Ok(calc_wqebb_cnt(size))
}

/// Write a NOP WQE spanning `wqebb_cnt` basic blocks, used to pad the ring
/// so a multi-block WQE never wraps mid-descriptor.
///
/// # Safety
/// `ptr` must point to `wqebb_cnt * 64` writable bytes.
pub(crate) unsafe fn write_nop_wqe(ptr: *mut u8, wqe_idx: u16, qpn: u32, wqebb_cnt: u16) {
    let ds = (wqebb_cnt as u8) * 4;
    write_ctrl_seg(ptr, wqe_idx, WqeOpcode::Nop as u8, 0, qpn, ds, 0, 0);
}

// ============================================================================
// Unit tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Basic-block-aligned scratch region, as the send queue provides.
    #[repr(C, align(64))]
    struct Region([u8; 64]);

    impl Region {
        fn new() -> Self {
            Region([0u8; 64])
        }
    }

    fn send_desc(length: u32) -> SendDescriptor {
        SendDescriptor {
            opcode: WqeOpcode::Send,
            addr: 0x1000,
            length,
            lkey: 0x42,
            remote: None,
            imm: 0,
            flags: SendFlags::SIGNALED,
        }
    }

    #[test]
    fn send_fits_one_basic_block() {
        let mut region = Region::new();
        let bb = write_send_wqe(&mut region.0, &send_desc(0), 0xABCDE, 0).unwrap();
        assert_eq!(bb, 1);
    }

    #[test]
    fn ctrl_seg_encoding() {
        let mut region = Region::new();
        let desc = send_desc(16);
        write_send_wqe(&mut region.0, &desc, 0xABCDE, 0x0102).unwrap();

        let dw0 = u32::from_be_bytes(region.0[0..4].try_into().unwrap());
        assert_eq!(dw0, (0x0102u32 << 8) | WqeOpcode::Send as u32);

        // SEND: ctrl + data = 2 descriptor segments.
        let dw1 = u32::from_be_bytes(region.0[4..8].try_into().unwrap());
        assert_eq!(dw1, (0xABCDE << 8) | 2);

        // fm_ce_se lives in the last byte of the third dword.
        assert_eq!(region.0[11], 0x08);
    }

    #[test]
    fn write_carries_remote_segment() {
        let mut region = Region::new();
        let desc = SendDescriptor {
            opcode: WqeOpcode::RdmaWrite,
            addr: 0x1000,
            length: 18,
            lkey: 0x42,
            remote: Some((0xDEAD_BEEF_0000, 0x77)),
            imm: 0,
            flags: SendFlags::SIGNALED,
        };
        let bb = write_send_wqe(&mut region.0, &desc, 1, 0).unwrap();
        assert_eq!(bb, 1);

        // ds = ctrl + raddr + data.
        let dw1 = u32::from_be_bytes(region.0[4..8].try_into().unwrap());
        assert_eq!(dw1 & 0xFF, 3);

        let raddr = u64::from_be_bytes(region.0[16..24].try_into().unwrap());
        assert_eq!(raddr, 0xDEAD_BEEF_0000);
        let rkey = u32::from_be_bytes(region.0[24..28].try_into().unwrap());
        assert_eq!(rkey, 0x77);

        let byte_count = u32::from_be_bytes(region.0[32..36].try_into().unwrap());
        assert_eq!(byte_count, 18);
        let lkey = u32::from_be_bytes(region.0[36..40].try_into().unwrap());
        assert_eq!(lkey, 0x42);
        let addr = u64::from_be_bytes(region.0[40..48].try_into().unwrap());
        assert_eq!(addr, 0x1000);
    }

    #[test]
    fn immediate_only_for_imm_opcodes() {
        let mut region = Region::new();
        let mut desc = send_desc(4);
        desc.imm = 0x11223344;
        write_send_wqe(&mut region.0, &desc, 1, 0).unwrap();
        assert_eq!(&region.0[12..16], &[0, 0, 0, 0]);

        desc.opcode = WqeOpcode::SendImm;
        write_send_wqe(&mut region.0, &desc, 1, 0).unwrap();
        assert_eq!(&region.0[12..16], &[0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn rdma_without_remote_is_rejected() {
        let mut region = Region::new();
        let desc = SendDescriptor {
            opcode: WqeOpcode::RdmaRead,
            addr: 0,
            length: 8,
            lkey: 0,
            remote: None,
            imm: 0,
            flags: SendFlags::empty(),
        };
        assert!(matches!(
            write_send_wqe(&mut region.0, &desc, 1, 0),
            Err(DevxError::InvalidArgument(_))
        ));
        // No write happened.
        assert_eq!(region.0, [0u8; 64]);
    }

    #[test]
    fn short_region_is_rejected_without_writes() {
        let mut region = Region::new();
        let desc = send_desc(0);
        assert!(matches!(
            write_send_wqe(&mut region.0[..16], &desc, 1, 0),
            Err(DevxError::InvalidArgument(_))
        ));
        assert_eq!(region.0, [0u8; 64]);
    }

    #[test]
    fn inline_payload_is_copied() {
        let payload = *b"hello inline data!";
        let mut region = Region::new();
        let desc = SendDescriptor {
            opcode: WqeOpcode::Send,
            addr: payload.as_ptr() as u64,
            length: payload.len() as u32,
            lkey: 0,
            remote: None,
            imm: 0,
            flags: SendFlags::SIGNALED | SendFlags::INLINE,
        };
        let bb = write_send_wqe(&mut region.0, &desc, 1, 0).unwrap();
        assert_eq!(bb, 1);

        let header = u32::from_be_bytes(region.0[16..20].try_into().unwrap());
        assert_eq!(header, 0x8000_0000 | payload.len() as u32);
        assert_eq!(&region.0[20..20 + payload.len()], &payload);
    }

    #[test]
    fn wqebb_counts() {
        assert_eq!(calc_wqebb_cnt(1), 1);
        assert_eq!(calc_wqebb_cnt(64), 1);
        assert_eq!(calc_wqebb_cnt(65), 2);
        assert_eq!(calc_wqebb_cnt(128), 2);
        assert_eq!(calc_wqebb_cnt(129), 3);
    }

    #[test]
    fn inline_padding() {
        assert_eq!(inline_padded_size(0), 16);
        assert_eq!(inline_padded_size(12), 16);
        assert_eq!(inline_padded_size(13), 32);
        assert_eq!(inline_padded_size(28), 32);
    }
}
