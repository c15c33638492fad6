//! A software device for exercising the engine without hardware.
//!
//! [`SoftDevice`] implements the [`DevxDevice`] seam: it decodes the same
//! command buffers the engine encodes, tracks objects and registered
//! memory, and on [`SoftDevice::process`] consumes doorbells exactly like
//! the hardware would — parsing posted WQEs out of the send-queue umem,
//! moving bytes for WRITE/READ, validating remote keys, and writing CQEs
//! with correct owner bits into the CQ ring.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::device::{DeviceCaps, DevxDevice, ObjId, PortInfo, UarInfo, UmemInfo};
use crate::error::{DevxError, Result};
use crate::prm;
use crate::types::{Gid, LinkLayer, Mtu};

/// Remote access error syndrome reported for bad rkeys.
const SYNDROME_REMOTE_ACCESS: u8 = 0x13;
/// Syndrome reported for commands issued in the wrong state.
const SYNDROME_BAD_STATE: u32 = 0x69EFE;
/// Syndrome reported for malformed commands.
const SYNDROME_BAD_COMMAND: u32 = 0x22;

/// Offset of the doorbell register inside a UAR page.
const UAR_DB_OFFSET: usize = 0x800;

struct PageAlloc {
    addr: usize,
    layout: Layout,
}

impl PageAlloc {
    fn new(size: usize) -> Option<Self> {
        let size = size.max(64);
        let layout = Layout::from_size_align(size, 4096).ok()?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return None;
        }
        Some(Self {
            addr: ptr as usize,
            layout,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct SoftQp {
    qpn: u32,
    /// Hardware state encoding: 0 RESET, 1 INIT, 2 RTR, 3 RTS, 6 ERR.
    state: u8,
    wq_umem: u32,
    dbr_umem: u32,
    cqn_snd: u32,
    log_sq_size: u8,
    log_rq_size: u8,
    log_rq_stride: u8,
    /// Producer index the device has consumed up to.
    seen_pi: u16,
}

#[derive(Debug, Clone, Copy)]
struct SoftCq {
    cqn: u32,
    umem: u32,
    dbr_umem: u32,
    log_size: u8,
    /// Entries the device has written.
    pi: u64,
}

#[derive(Debug, Clone, Copy)]
enum SoftObj {
    Qp(SoftQp),
    Cq(SoftCq),
    Mkey { key: u32 },
}

#[derive(Default)]
struct SoftState {
    next_obj: u64,
    next_umem: u32,
    next_uar: u32,
    next_pdn: u32,
    next_qpn: u32,
    next_cqn: u32,
    next_mkey_index: u32,
    umems: HashMap<u32, PageAlloc>,
    uars: HashMap<u32, PageAlloc>,
    objs: HashMap<u64, SoftObj>,
    /// rkey -> (start address, length).
    mkeys: HashMap<u32, (u64, u64)>,
    /// One-shot error injection: the next executed WQE completes with this
    /// syndrome instead of running.
    inject_syndrome: Option<u8>,
}

/// Software RDMA device.
pub struct SoftDevice {
    caps: DeviceCaps,
    ports: Vec<PortInfo>,
    state: Mutex<SoftState>,
}

unsafe impl Send for SoftDevice {}
unsafe impl Sync for SoftDevice {}

impl SoftDevice {
    /// An InfiniBand-flavoured device with one active port.
    pub fn new_ib() -> std::sync::Arc<Self> {
        Self::with_port(PortInfo {
            link_layer: LinkLayer::InfiniBand,
            active_mtu: Mtu::Mtu4096,
            lid: 7,
            gid: Gid::from_raw([
                0xFE, 0x80, 0, 0, 0, 0, 0, 0, 0x02, 0x11, 0x22, 0xFF, 0xFE, 0x33, 0x44, 0x55,
            ]),
        })
    }

    /// An Ethernet (RoCE v2) flavoured device with one active port.
    pub fn new_roce() -> std::sync::Arc<Self> {
        Self::with_port(PortInfo {
            link_layer: LinkLayer::Ethernet,
            active_mtu: Mtu::Mtu1024,
            lid: 0,
            gid: Gid::from_ipv4(std::net::Ipv4Addr::new(127, 0, 0, 1)),
        })
    }

    fn with_port(port: PortInfo) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            caps: DeviceCaps {
                log_max_msg: 30,
                log_max_qp_sz: 15,
                log_max_cq_sz: 16,
                max_qp_wr: 16384,
                max_sge: 16,
                log_rra_max: 4,
                log_page_size: 12,
                num_ports: 1,
            },
            ports: vec![port],
            state: Mutex::new(SoftState {
                next_qpn: 0x4A,
                next_cqn: 0x80,
                next_mkey_index: 0x10,
                ..Default::default()
            }),
        })
    }

    /// Fail the next executed WQE with the given completion syndrome.
    pub fn inject_completion_error(&self, syndrome: u8) {
        self.state.lock().unwrap().inject_syndrome = Some(syndrome);
    }

    /// Consume pending doorbells on every RTS queue pair, executing WQEs
    /// and writing CQEs. Returns the number of completions written.
    ///
    /// Stops filling a CQ when it has no acknowledged room, exactly like
    /// the hardware respecting the consumer doorbell record; call again
    /// after polling.
    pub fn process(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        let qp_ids: Vec<u64> = state
            .objs
            .iter()
            .filter_map(|(id, o)| match o {
                SoftObj::Qp(q) if q.state == 3 => Some(*id),
                _ => None,
            })
            .collect();

        let mut written = 0;
        for id in qp_ids {
            written += Self::process_qp(&mut state, id);
        }
        written
    }

    fn process_qp(state: &mut SoftState, id: u64) -> usize {
        let mut qp = match state.objs.get(&id) {
            Some(SoftObj::Qp(q)) => *q,
            _ => return 0,
        };

        let Some(dbr) = state.umems.get(&qp.dbr_umem) else {
            return 0;
        };
        let target_pi = unsafe {
            u32::from_be(std::ptr::read_volatile((dbr.addr as *const u32).add(1))) as u16
        };
        let Some(wq) = state.umems.get(&qp.wq_umem) else {
            return 0;
        };

        // Receive region first, send ring after it, basic-block aligned.
        let rq_bytes = if qp.log_rq_size == 0 {
            0
        } else {
            (1usize << qp.log_rq_size) * (16usize << qp.log_rq_stride)
        };
        let sq_base = wq.addr + ((rq_bytes + 63) & !63);
        let sq_cnt = 1u16 << qp.log_sq_size;

        let cq_id = state.objs.iter().find_map(|(cid, o)| match o {
            SoftObj::Cq(c) if c.cqn == qp.cqn_snd => Some(*cid),
            _ => None,
        });
        let Some(cq_id) = cq_id else { return 0 };
        let mut cq = match state.objs.get(&cq_id) {
            Some(SoftObj::Cq(c)) => *c,
            _ => return 0,
        };
        let (cq_buf, cq_dbr) = {
            let buf = match state.umems.get(&cq.umem) {
                Some(a) => a.addr,
                None => return 0,
            };
            let dbr = match state.umems.get(&cq.dbr_umem) {
                Some(a) => a.addr,
                None => return 0,
            };
            (buf, dbr)
        };

        let mut written = 0;
        while qp.seen_pi != target_pi {
            let slot = qp.seen_pi & (sq_cnt - 1);
            let wqe = (sq_base + slot as usize * 64) as *const u8;

            let dw0 = unsafe { u32::from_be(std::ptr::read_volatile(wqe as *const u32)) };
            let opcode = (dw0 & 0xFF) as u8;
            let wqe_idx = ((dw0 >> 8) & 0xFFFF) as u16;
            let dw1 =
                unsafe { u32::from_be(std::ptr::read_volatile((wqe as *const u32).add(1))) };
            let ds = (dw1 & 0xFF) as usize;
            let fm_ce_se = unsafe { std::ptr::read_volatile(wqe.add(11)) };
            let imm =
                unsafe { u32::from_be(std::ptr::read_volatile((wqe as *const u32).add(3))) };
            let num_bb = ((ds * 16 + 63) / 64).max(1) as u16;

            if opcode == 0x00 {
                // NOP padding: consumes blocks, completes nothing.
                qp.seen_pi = qp.seen_pi.wrapping_add(num_bb);
                continue;
            }

            // Decode optional remote-address segment plus the data segment.
            let mut seg = unsafe { wqe.add(16) };
            let needs_remote = matches!(opcode, 0x08 | 0x09 | 0x10);
            let mut raddr = 0u64;
            let mut rkey = 0u32;
            if needs_remote {
                raddr = unsafe { u64::from_be(std::ptr::read_volatile(seg as *const u64)) };
                rkey = unsafe {
                    u32::from_be(std::ptr::read_volatile(seg.add(8) as *const u32))
                };
                seg = unsafe { seg.add(16) };
            }
            let data_dw0 =
                unsafe { u32::from_be(std::ptr::read_volatile(seg as *const u32)) };
            let (length, local_ptr) = if data_dw0 & 0x8000_0000 != 0 {
                // Inline payload sits behind the 4-byte header.
                ((data_dw0 & 0x7FFF_FFFF) as usize, unsafe {
                    seg.add(4) as *const u8
                })
            } else {
                let addr = unsafe {
                    u64::from_be(std::ptr::read_volatile(seg.add(8) as *const u64))
                };
                (data_dw0 as usize, addr as *const u8)
            };

            let signaled = fm_ce_se & 0x08 != 0;

            // Stall when the CQ has no acknowledged room, like hardware
            // honouring the consumer doorbell record.
            let cqe_cnt = 1u64 << cq.log_size;
            let sw_ci = unsafe {
                u32::from_be(std::ptr::read_volatile(cq_dbr as *const u32)) as u64
            };
            let used = cq.pi.wrapping_sub(sw_ci) & 0x00FF_FFFF;
            if used >= cqe_cnt {
                break;
            }

            // Execute.
            let mut syndrome = state.inject_syndrome.take();
            if syndrome.is_none() && needs_remote {
                let ok = state
                    .mkeys
                    .get(&rkey)
                    .map(|(start, len)| {
                        raddr >= *start && raddr + length as u64 <= start + len
                    })
                    .unwrap_or(false);
                if !ok {
                    syndrome = Some(SYNDROME_REMOTE_ACCESS);
                }
            }
            if syndrome.is_none() {
                match opcode {
                    0x08 | 0x09 => unsafe {
                        std::ptr::copy_nonoverlapping(local_ptr, raddr as *mut u8, length);
                    },
                    0x10 => unsafe {
                        std::ptr::copy_nonoverlapping(
                            raddr as *const u8,
                            local_ptr as *mut u8,
                            length,
                        );
                    },
                    // SEND lands in the peer's receive queue, which this
                    // device does not model; the send side still completes.
                    0x0A | 0x0B => {}
                    _ => syndrome = Some(SYNDROME_REMOTE_ACCESS),
                }
            }

            if signaled || syndrome.is_some() {
                let cqe_slot = (cq.pi & (cqe_cnt - 1)) as usize;
                let owner = ((cq.pi >> cq.log_size) & 1) as u8;
                let cqe = (cq_buf + cqe_slot * 64) as *mut u8;
                let cqe_imm = if matches!(opcode, 0x09 | 0x0B) { imm } else { 0 };
                unsafe {
                    std::ptr::write_bytes(cqe, 0, 64);
                    std::ptr::write_volatile(cqe.add(36) as *mut u32, cqe_imm.to_be());
                    std::ptr::write_volatile(
                        cqe.add(44) as *mut u32,
                        (length as u32).to_be(),
                    );
                    std::ptr::write_volatile(cqe.add(48) as *mut u64, (cq.pi + 1).to_be());
                    std::ptr::write_volatile(cqe.add(56) as *mut u32, qp.qpn.to_be());
                    std::ptr::write_volatile(cqe.add(60) as *mut u16, wqe_idx.to_be());
                    let cqe_opcode = if let Some(syn) = syndrome {
                        std::ptr::write_volatile(cqe.add(54), 0);
                        std::ptr::write_volatile(cqe.add(55), syn);
                        0x0Du8
                    } else {
                        0x00u8
                    };
                    std::ptr::write_volatile(cqe.add(63), (cqe_opcode << 4) | owner);
                }
                cq.pi += 1;
                written += 1;
            }

            qp.seen_pi = qp.seen_pi.wrapping_add(num_bb);
        }

        if let Some(SoftObj::Qp(q)) = state.objs.get_mut(&id) {
            q.seen_pi = qp.seen_pi;
        }
        if let Some(SoftObj::Cq(c)) = state.objs.get_mut(&cq_id) {
            c.pi = cq.pi;
        }
        written
    }
}

impl Drop for SoftDevice {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap();
        for (_, a) in state.umems.drain() {
            unsafe { dealloc(a.addr as *mut u8, a.layout) };
        }
        for (_, a) in state.uars.drain() {
            unsafe { dealloc(a.addr as *mut u8, a.layout) };
        }
    }
}

fn fail(out: &mut [u8], syndrome: u32) -> i32 {
    prm::prm_set(out, prm::CMD_STATUS.0, prm::CMD_STATUS.1, 0x2);
    prm::prm_set(out, prm::CMD_SYNDROME.0, prm::CMD_SYNDROME.1, syndrome);
    -1
}

impl DevxDevice for SoftDevice {
    fn caps(&self) -> DeviceCaps {
        self.caps
    }

    fn port_info(&self, port: u8) -> Result<PortInfo> {
        self.ports
            .get(port.wrapping_sub(1) as usize)
            .copied()
            .ok_or(DevxError::InvalidArgument("no such port"))
    }

    fn alloc_pd(&self) -> Result<u32> {
        let mut state = self.state.lock().unwrap();
        state.next_pdn += 1;
        Ok(state.next_pdn)
    }

    fn dealloc_pd(&self, _pdn: u32) {}

    fn alloc_uar(&self) -> Result<UarInfo> {
        let mut state = self.state.lock().unwrap();
        let page =
            PageAlloc::new(4096).ok_or(DevxError::ResourceExhaustion("uar page"))?;
        state.next_uar += 1;
        let page_id = state.next_uar;
        let info = UarInfo {
            page_id,
            base_addr: page.addr as *mut u8,
            reg_addr: (page.addr + UAR_DB_OFFSET) as *mut u8,
        };
        state.uars.insert(page_id, page);
        Ok(info)
    }

    fn free_uar(&self, page_id: u32) {
        let mut state = self.state.lock().unwrap();
        if let Some(a) = state.uars.remove(&page_id) {
            unsafe { dealloc(a.addr as *mut u8, a.layout) };
        }
    }

    fn register_umem(&self, len: usize) -> Result<UmemInfo> {
        let mut state = self.state.lock().unwrap();
        let alloc = PageAlloc::new(len).ok_or(DevxError::ResourceExhaustion("umem"))?;
        state.next_umem += 1;
        let umem_id = state.next_umem;
        let info = UmemInfo {
            umem_id,
            addr: alloc.addr as *mut u8,
            len: len.max(64),
        };
        state.umems.insert(umem_id, alloc);
        Ok(info)
    }

    fn unregister_umem(&self, umem_id: u32) {
        let mut state = self.state.lock().unwrap();
        if let Some(a) = state.umems.remove(&umem_id) {
            unsafe { dealloc(a.addr as *mut u8, a.layout) };
        }
    }

    fn query_eqn(&self, _vector: u32) -> Result<u32> {
        Ok(0)
    }

    fn obj_create(&self, cmd_in: &[u8], cmd_out: &mut [u8]) -> std::result::Result<ObjId, i32> {
        let mut state = self.state.lock().unwrap();
        let opcode = prm::prm_get(cmd_in, 0x00, 0x10);
        match opcode {
            prm::CMD_OP_CREATE_QP => {
                let q = prm::CREATE_QP_IN_QPC_OFF;
                let wq_umem = prm::prm_get(
                    cmd_in,
                    prm::CREATE_QP_IN_WQ_UMEM_ID.0,
                    prm::CREATE_QP_IN_WQ_UMEM_ID.1,
                );
                let dbr_umem =
                    prm::prm_get(cmd_in, q + prm::QPC_DBR_UMEM_ID.0, prm::QPC_DBR_UMEM_ID.1);
                if !state.umems.contains_key(&wq_umem) || !state.umems.contains_key(&dbr_umem) {
                    return Err(fail(cmd_out, SYNDROME_BAD_COMMAND));
                }
                state.next_qpn += 1;
                let qpn = state.next_qpn;
                let qp = SoftQp {
                    qpn,
                    state: 0,
                    wq_umem,
                    dbr_umem,
                    cqn_snd: prm::prm_get(cmd_in, q + prm::QPC_CQN_SND.0, prm::QPC_CQN_SND.1),
                    log_sq_size: prm::prm_get(
                        cmd_in,
                        q + prm::QPC_LOG_SQ_SIZE.0,
                        prm::QPC_LOG_SQ_SIZE.1,
                    ) as u8,
                    log_rq_size: prm::prm_get(
                        cmd_in,
                        q + prm::QPC_LOG_RQ_SIZE.0,
                        prm::QPC_LOG_RQ_SIZE.1,
                    ) as u8,
                    log_rq_stride: prm::prm_get(
                        cmd_in,
                        q + prm::QPC_LOG_RQ_STRIDE.0,
                        prm::QPC_LOG_RQ_STRIDE.1,
                    ) as u8,
                    seen_pi: 0,
                };
                state.next_obj += 1;
                let id = state.next_obj;
                state.objs.insert(id, SoftObj::Qp(qp));
                prm::prm_set(
                    cmd_out,
                    prm::CREATE_QP_OUT_QPN.0,
                    prm::CREATE_QP_OUT_QPN.1,
                    qpn,
                );
                Ok(ObjId(id))
            }
            prm::CMD_OP_CREATE_CQ => {
                let c = prm::CREATE_CQ_IN_CQC_OFF;
                let umem = prm::prm_get(
                    cmd_in,
                    prm::CREATE_CQ_IN_CQ_UMEM_ID.0,
                    prm::CREATE_CQ_IN_CQ_UMEM_ID.1,
                );
                let dbr_umem =
                    prm::prm_get(cmd_in, c + prm::CQC_DBR_UMEM_ID.0, prm::CQC_DBR_UMEM_ID.1);
                if !state.umems.contains_key(&umem) || !state.umems.contains_key(&dbr_umem) {
                    return Err(fail(cmd_out, SYNDROME_BAD_COMMAND));
                }
                state.next_cqn += 1;
                let cqn = state.next_cqn;
                let cq = SoftCq {
                    cqn,
                    umem,
                    dbr_umem,
                    log_size: prm::prm_get(
                        cmd_in,
                        c + prm::CQC_LOG_CQ_SIZE.0,
                        prm::CQC_LOG_CQ_SIZE.1,
                    ) as u8,
                    pi: 0,
                };
                state.next_obj += 1;
                let id = state.next_obj;
                state.objs.insert(id, SoftObj::Cq(cq));
                prm::prm_set(
                    cmd_out,
                    prm::CREATE_CQ_OUT_CQN.0,
                    prm::CREATE_CQ_OUT_CQN.1,
                    cqn,
                );
                Ok(ObjId(id))
            }
            prm::CMD_OP_CREATE_MKEY => {
                let m = prm::CREATE_MKEY_IN_MKC_OFF;
                let start = prm::prm_get64(cmd_in, m + prm::MKC_START_ADDR);
                let len = prm::prm_get64(cmd_in, m + prm::MKC_LEN);
                let variant =
                    prm::prm_get(cmd_in, m + prm::MKC_MKEY_7_0.0, prm::MKC_MKEY_7_0.1);
                state.next_mkey_index += 1;
                let index = state.next_mkey_index;
                let key = (index << 8) | variant;
                state.mkeys.insert(key, (start, len));
                state.next_obj += 1;
                let id = state.next_obj;
                state.objs.insert(id, SoftObj::Mkey { key });
                prm::prm_set(
                    cmd_out,
                    prm::CREATE_MKEY_OUT_MKEY_INDEX.0,
                    prm::CREATE_MKEY_OUT_MKEY_INDEX.1,
                    index,
                );
                Ok(ObjId(id))
            }
            _ => Err(fail(cmd_out, SYNDROME_BAD_COMMAND)),
        }
    }

    fn obj_modify(&self, obj: ObjId, cmd_in: &[u8], cmd_out: &mut [u8]) -> i32 {
        let mut state = self.state.lock().unwrap();
        let opcode = prm::prm_get(cmd_in, 0x00, 0x10);
        let Some(SoftObj::Qp(qp)) = state.objs.get_mut(&obj.0) else {
            return fail(cmd_out, SYNDROME_BAD_COMMAND);
        };
        let (required, next) = match opcode {
            prm::CMD_OP_RST2INIT_QP => (0, 1),
            prm::CMD_OP_INIT2RTR_QP => (1, 2),
            prm::CMD_OP_RTR2RTS_QP => (2, 3),
            prm::CMD_OP_2ERR_QP => (qp.state, 6),
            _ => return fail(cmd_out, SYNDROME_BAD_COMMAND),
        };
        if qp.state != required {
            return fail(cmd_out, SYNDROME_BAD_STATE);
        }
        qp.state = next;
        0
    }

    fn obj_query(&self, obj: ObjId, cmd_in: &[u8], cmd_out: &mut [u8]) -> i32 {
        let state = self.state.lock().unwrap();
        let opcode = prm::prm_get(cmd_in, 0x00, 0x10);
        match (opcode, state.objs.get(&obj.0)) {
            (prm::CMD_OP_QUERY_QP, Some(SoftObj::Qp(qp))) => {
                prm::prm_set(
                    cmd_out,
                    prm::QUERY_QP_OUT_QPC_OFF + prm::QPC_STATE.0,
                    prm::QPC_STATE.1,
                    qp.state as u32,
                );
                0
            }
            _ => fail(cmd_out, SYNDROME_BAD_COMMAND),
        }
    }

    fn obj_destroy(&self, obj: ObjId) {
        let mut state = self.state.lock().unwrap();
        if let Some(SoftObj::Mkey { key }) = state.objs.remove(&obj.0) {
            state.mkeys.remove(&key);
        }
    }
}
