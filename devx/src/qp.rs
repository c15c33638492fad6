//! Queue-pair creation, the state machine, and typed post helpers.
//!
//! A queue pair is created in RESET by a raw CREATE_QP command and walks
//! RESET → INIT → RTR → RTS through vendor modify commands. Every
//! transition checks the current state first and decodes the command
//! syndrome after; a failed command leaves the state untouched. ERR is
//! absorbing: only destroy leaves it.

use std::sync::Arc;

use crate::cq::CompletionQueue;
use crate::device::DevxDevice;
use crate::error::{DevxError, Result};
use crate::mmio;
use crate::prm;
use crate::resource::{DevxObj, Pd, Uar, Umem};
use crate::sq::SendQueue;
use crate::types::{vendor_av, AhAttr, ConnectionParams, LinkLayer};
use crate::wqe::{SendDescriptor, SendFlags, WqeOpcode, WQEBB_SIZE};

/// Queue-pair lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpState {
    Reset,
    Init,
    Rtr,
    Rts,
    Error,
}

/// Hardware state values as reported by QUERY_QP.
pub fn hw_state_name(state: u8) -> &'static str {
    match state {
        0 => "RESET",
        1 => "INIT",
        2 => "RTR",
        3 => "RTS",
        4 => "SQD",
        5 => "SQE",
        6 => "ERR",
        _ => "UNKNOWN",
    }
}

/// Queue-pair sizing and behavior.
#[derive(Debug, Clone, Copy)]
pub struct QpConfig {
    /// Send-queue depth in basic blocks; rounded up to a power of two.
    pub max_send_wr: u32,
    /// Receive-queue depth; rounded up to a power of two.
    pub max_recv_wr: u32,
    /// Receive stride exponent: stride = 16 << log_rq_stride.
    pub log_rq_stride: u8,
    /// Maximum outstanding RDMA reads/atomics as responder.
    pub max_rd_atomic: u8,
    /// Inline full WQEs into the BlueFlame buffer on every post.
    pub use_blueflame: bool,
}

impl Default for QpConfig {
    fn default() -> Self {
        Self {
            max_send_wr: 256,
            max_recv_wr: 256,
            log_rq_stride: 2,
            max_rd_atomic: 4,
            use_blueflame: false,
        }
    }
}

/// Work-queue buffer layout: the receive region sits at offset zero, the
/// send ring after it, aligned to a basic block.
struct QpLayout {
    log_sq_size: u32,
    log_rq_size: u32,
    sq_buf_offset: usize,
    total_size: usize,
}

impl QpConfig {
    fn layout(&self) -> QpLayout {
        let log_sq_size = if self.max_send_wr == 0 {
            0
        } else {
            (self.max_send_wr as usize)
                .next_power_of_two()
                .trailing_zeros()
        };
        let sq_bytes = (1usize << log_sq_size) * WQEBB_SIZE;

        // A present receive queue always has log size >= 1, so zero means
        // "no receive queue" everywhere the value travels.
        let log_rq_size = if self.max_recv_wr == 0 {
            0
        } else {
            (self.max_recv_wr as usize)
                .next_power_of_two()
                .trailing_zeros()
                .max(1)
        };
        let rq_stride = 16usize << self.log_rq_stride;
        let rq_bytes = if self.max_recv_wr == 0 {
            0
        } else {
            (1usize << log_rq_size) * rq_stride
        };

        let sq_buf_offset = (rq_bytes + WQEBB_SIZE - 1) & !(WQEBB_SIZE - 1);
        QpLayout {
            log_sq_size,
            log_rq_size,
            sq_buf_offset,
            total_size: sq_buf_offset + sq_bytes,
        }
    }
}

fn ilog2_ceil(v: u32) -> u32 {
    if v <= 1 {
        0
    } else {
        v.next_power_of_two().trailing_zeros()
    }
}

/// A reliable-connected queue pair.
pub struct QueuePair {
    // Field order is drop order: the hardware object goes first, then the
    // send-queue state, then the memory it pointed into.
    obj: DevxObj,
    sq: SendQueue,
    _wq_umem: Umem,
    _db_umem: Umem,
    _uar: Uar,
    _pd: Pd,
    dev: Arc<dyn DevxDevice>,
    qpn: u32,
    state: QpState,
    /// Path to the peer; set by the RTR transition, cleared on ERR.
    remote_ah: Option<AhAttr>,
    db_addr: *const u32,
}

unsafe impl Send for QueuePair {}

impl QueuePair {
    /// Issue CREATE_QP and wire up the send-queue state. The new queue
    /// pair is in RESET.
    pub fn create(
        dev: &Arc<dyn DevxDevice>,
        pd: &Pd,
        cq: &CompletionQueue,
        config: &QpConfig,
    ) -> Result<Self> {
        let caps = dev.caps();
        let layout = config.layout();

        let uar = Uar::alloc(dev)?;
        let wq_umem = Umem::register(dev, layout.total_size.max(WQEBB_SIZE))?;
        let db_umem = Umem::register(dev, 64)?;

        let mut cmd_in = vec![0u8; prm::CREATE_QP_IN_SIZE];
        let mut cmd_out = vec![0u8; prm::CREATE_QP_OUT_SIZE];

        prm::prm_set(
            &mut cmd_in,
            prm::CREATE_QP_IN_OPCODE.0,
            prm::CREATE_QP_IN_OPCODE.1,
            prm::CMD_OP_CREATE_QP,
        );

        let q = prm::CREATE_QP_IN_QPC_OFF;
        prm::prm_set(&mut cmd_in, q + prm::QPC_ST.0, prm::QPC_ST.1, prm::QP_ST_RC);
        prm::prm_set(
            &mut cmd_in,
            q + prm::QPC_PM_STATE.0,
            prm::QPC_PM_STATE.1,
            prm::QP_PM_STATE_MIGRATED,
        );
        prm::prm_set(&mut cmd_in, q + prm::QPC_PD.0, prm::QPC_PD.1, pd.pdn());
        prm::prm_set(
            &mut cmd_in,
            q + prm::QPC_CQN_SND.0,
            prm::QPC_CQN_SND.1,
            cq.cqn(),
        );
        prm::prm_set(
            &mut cmd_in,
            q + prm::QPC_CQN_RCV.0,
            prm::QPC_CQN_RCV.1,
            cq.cqn(),
        );
        prm::prm_set(
            &mut cmd_in,
            q + prm::QPC_LOG_SQ_SIZE.0,
            prm::QPC_LOG_SQ_SIZE.1,
            layout.log_sq_size,
        );
        prm::prm_set(
            &mut cmd_in,
            q + prm::QPC_LOG_RQ_SIZE.0,
            prm::QPC_LOG_RQ_SIZE.1,
            layout.log_rq_size,
        );
        prm::prm_set(
            &mut cmd_in,
            q + prm::QPC_LOG_RQ_STRIDE.0,
            prm::QPC_LOG_RQ_STRIDE.1,
            config.log_rq_stride as u32,
        );
        prm::prm_set(&mut cmd_in, q + prm::QPC_NO_SQ.0, prm::QPC_NO_SQ.1, 0);
        prm::prm_set(
            &mut cmd_in,
            q + prm::QPC_UAR_PAGE.0,
            prm::QPC_UAR_PAGE.1,
            uar.page_id(),
        );
        prm::prm_set(
            &mut cmd_in,
            q + prm::QPC_DBR_UMEM_ID.0,
            prm::QPC_DBR_UMEM_ID.1,
            db_umem.umem_id(),
        );
        prm::prm_set(
            &mut cmd_in,
            q + prm::QPC_DBR_UMEM_VALID.0,
            prm::QPC_DBR_UMEM_VALID.1,
            1,
        );
        prm::prm_set64(&mut cmd_in, q + prm::QPC_DBR_ADDR, 0);
        prm::prm_set(
            &mut cmd_in,
            q + prm::QPC_LOG_MSG_MAX.0,
            prm::QPC_LOG_MSG_MAX.1,
            caps.log_max_msg as u32,
        );
        prm::prm_set(
            &mut cmd_in,
            q + prm::QPC_LOG_PAGE_SIZE.0,
            prm::QPC_LOG_PAGE_SIZE.1,
            caps.log_page_size as u32,
        );
        prm::prm_set(
            &mut cmd_in,
            q + prm::QPC_PAGE_OFFSET.0,
            prm::QPC_PAGE_OFFSET.1,
            0,
        );
        prm::prm_set(
            &mut cmd_in,
            q + prm::QPC_LOG_RRA_MAX.0,
            prm::QPC_LOG_RRA_MAX.1,
            ilog2_ceil(config.max_rd_atomic as u32),
        );
        prm::prm_set(
            &mut cmd_in,
            prm::CREATE_QP_IN_WQ_UMEM_ID.0,
            prm::CREATE_QP_IN_WQ_UMEM_ID.1,
            wq_umem.umem_id(),
        );
        prm::prm_set(
            &mut cmd_in,
            prm::CREATE_QP_IN_WQ_UMEM_VALID.0,
            prm::CREATE_QP_IN_WQ_UMEM_VALID.1,
            1,
        );

        let obj = dev
            .obj_create(&cmd_in, &mut cmd_out)
            .map_err(|_| prm::command_error(&cmd_out, "CREATE_QP"))?;
        let qpn = prm::prm_get(&cmd_out, prm::CREATE_QP_OUT_QPN.0, prm::CREATE_QP_OUT_QPN.1);

        log::info!("created queue pair qpn={:#x}", qpn);

        let sq_buf = unsafe { wq_umem.addr().add(layout.sq_buf_offset) };
        let sq = SendQueue::new(
            sq_buf,
            1u16 << layout.log_sq_size,
            db_umem.addr() as *mut u32,
            uar.reg_addr(),
            config.use_blueflame,
        );
        let db_addr = db_umem.addr() as *const u32;

        Ok(Self {
            obj: DevxObj::new(obj, dev.clone()),
            sq,
            _wq_umem: wq_umem,
            _db_umem: db_umem,
            _uar: uar,
            _pd: pd.clone(),
            dev: dev.clone(),
            qpn,
            state: QpState::Reset,
            remote_ah: None,
            db_addr,
        })
    }

    pub fn qpn(&self) -> u32 {
        self.qpn
    }

    pub fn state(&self) -> QpState {
        self.state
    }

    /// Cached path to the peer; populated once the queue pair reaches RTR.
    pub fn remote_ah(&self) -> Option<&AhAttr> {
        self.remote_ah.as_ref()
    }

    /// Current producer index of the send queue, in basic blocks.
    pub fn sq_pi(&self) -> u16 {
        self.sq.pi()
    }

    /// Current consumer index of the send queue, in basic blocks.
    pub fn sq_ci(&self) -> u16 {
        self.sq.ci()
    }

    /// Free send-queue basic blocks.
    pub fn sq_available(&self) -> u16 {
        self.sq.available()
    }

    /// Raw value of the send doorbell-record word, for diagnostics.
    pub fn sq_doorbell_value(&self) -> u16 {
        let raw = unsafe { std::ptr::read_volatile(self.db_addr.add(mmio::SND_DBR)) };
        u32::from_be(raw) as u16
    }

    fn check_state(&self, op: &'static str, required: QpState) -> Result<()> {
        if self.state != required {
            return Err(DevxError::InvalidState {
                op,
                required,
                actual: self.state,
            });
        }
        Ok(())
    }

    /// RESET → INIT: enable remote access and pin the physical port.
    pub fn reset_to_init(&mut self, params: &ConnectionParams) -> Result<()> {
        self.check_state("reset_to_init", QpState::Reset)?;

        let port = self.dev.port_info(params.port_num)?;

        let mut cmd_in = vec![0u8; prm::MODIFY_QP_IN_SIZE];
        let mut cmd_out = vec![0u8; prm::MODIFY_QP_OUT_SIZE];

        prm::prm_set(
            &mut cmd_in,
            prm::MODIFY_QP_IN_OPCODE.0,
            prm::MODIFY_QP_IN_OPCODE.1,
            prm::CMD_OP_RST2INIT_QP,
        );
        prm::prm_set(
            &mut cmd_in,
            prm::MODIFY_QP_IN_QPN.0,
            prm::MODIFY_QP_IN_QPN.1,
            self.qpn,
        );

        let q = prm::MODIFY_QP_IN_QPC_OFF;
        let ads = q + prm::QPC_PRI_ADS;
        prm::prm_set(
            &mut cmd_in,
            q + prm::QPC_PM_STATE.0,
            prm::QPC_PM_STATE.1,
            prm::QP_PM_STATE_MIGRATED,
        );
        prm::prm_set(&mut cmd_in, q + prm::QPC_RAE.0, prm::QPC_RAE.1, 1);
        prm::prm_set(&mut cmd_in, q + prm::QPC_RWE.0, prm::QPC_RWE.1, 1);
        prm::prm_set(&mut cmd_in, q + prm::QPC_RRE.0, prm::QPC_RRE.1, 1);
        prm::prm_set(
            &mut cmd_in,
            q + prm::QPC_ATOMIC_MODE.0,
            prm::QPC_ATOMIC_MODE.1,
            1,
        );
        if port.link_layer != LinkLayer::Ethernet {
            prm::prm_set(
                &mut cmd_in,
                ads + prm::ADS_PKEY_INDEX.0,
                prm::ADS_PKEY_INDEX.1,
                0,
            );
        }
        prm::prm_set(
            &mut cmd_in,
            ads + prm::ADS_VHCA_PORT_NUM.0,
            prm::ADS_VHCA_PORT_NUM.1,
            params.port_num as u32,
        );

        let ret = self.obj.modify(&cmd_in, &mut cmd_out);
        prm::check_result(ret, &cmd_out, "RST2INIT_QP")?;

        log::debug!("qpn={:#x} RESET -> INIT", self.qpn);
        self.state = QpState::Init;
        Ok(())
    }

    /// INIT → RTR: program the path to the peer.
    pub fn init_to_rtr(&mut self, params: &ConnectionParams) -> Result<()> {
        self.check_state("init_to_rtr", QpState::Init)?;

        let port = self.dev.port_info(params.port_num)?;
        let ah = &params.ah;
        let av = vendor_av(ah);

        let mut cmd_in = vec![0u8; prm::MODIFY_QP_IN_SIZE];
        let mut cmd_out = vec![0u8; prm::MODIFY_QP_OUT_SIZE];

        prm::prm_set(
            &mut cmd_in,
            prm::MODIFY_QP_IN_OPCODE.0,
            prm::MODIFY_QP_IN_OPCODE.1,
            prm::CMD_OP_INIT2RTR_QP,
        );
        prm::prm_set(
            &mut cmd_in,
            prm::MODIFY_QP_IN_QPN.0,
            prm::MODIFY_QP_IN_QPN.1,
            self.qpn,
        );
        prm::prm_set(
            &mut cmd_in,
            prm::MODIFY_QP_IN_ECE.0,
            prm::MODIFY_QP_IN_ECE.1,
            params.ece as u32,
        );

        let q = prm::MODIFY_QP_IN_QPC_OFF;
        let ads = q + prm::QPC_PRI_ADS;
        prm::prm_set(
            &mut cmd_in,
            q + prm::QPC_MTU.0,
            prm::QPC_MTU.1,
            params.mtu as u32,
        );
        prm::prm_set(
            &mut cmd_in,
            q + prm::QPC_REMOTE_QPN.0,
            prm::QPC_REMOTE_QPN.1,
            params.remote_qpn,
        );
        prm::prm_set(
            &mut cmd_in,
            q + prm::QPC_LOG_MSG_MAX.0,
            prm::QPC_LOG_MSG_MAX.1,
            self.dev.caps().log_max_msg as u32,
        );
        prm::prm_set(
            &mut cmd_in,
            ads + prm::ADS_VHCA_PORT_NUM.0,
            prm::ADS_VHCA_PORT_NUM.1,
            ah.port_num as u32,
        );

        if port.link_layer == LinkLayer::Ethernet {
            prm::prm_set(
                &mut cmd_in,
                ads + prm::ADS_RMAC_47_32.0,
                prm::ADS_RMAC_47_32.1,
                u16::from_be_bytes([av.rmac[0], av.rmac[1]]) as u32,
            );
            prm::prm_set(
                &mut cmd_in,
                ads + prm::ADS_RMAC_31_0.0,
                prm::ADS_RMAC_31_0.1,
                u32::from_be_bytes([av.rmac[2], av.rmac[3], av.rmac[4], av.rmac[5]]),
            );
            write_rgid(&mut cmd_in, ads + prm::ADS_RGID_RIP, &av.rgid);
            prm::prm_set(
                &mut cmd_in,
                ads + prm::ADS_HOP_LIMIT.0,
                prm::ADS_HOP_LIMIT.1,
                av.hop_limit as u32,
            );
            prm::prm_set(
                &mut cmd_in,
                ads + prm::ADS_SRC_ADDR_INDEX.0,
                prm::ADS_SRC_ADDR_INDEX.1,
                ah.grh.sgid_index as u32,
            );
            prm::prm_set(
                &mut cmd_in,
                ads + prm::ADS_SL_ETH_PRIO.0,
                prm::ADS_SL_ETH_PRIO.1,
                params.sl as u32,
            );
            prm::prm_set(
                &mut cmd_in,
                ads + prm::ADS_DSCP.0,
                prm::ADS_DSCP.1,
                params.dscp as u32,
            );
        } else {
            prm::prm_set(
                &mut cmd_in,
                ads + prm::ADS_GRH.0,
                prm::ADS_GRH.1,
                ah.is_global as u32,
            );
            prm::prm_set(
                &mut cmd_in,
                ads + prm::ADS_RLID.0,
                prm::ADS_RLID.1,
                ah.dlid as u32,
            );
            prm::prm_set(
                &mut cmd_in,
                ads + prm::ADS_MLID.0,
                prm::ADS_MLID.1,
                (ah.src_path_bits & 0x7F) as u32,
            );
            prm::prm_set(
                &mut cmd_in,
                ads + prm::ADS_SL_ETH_PRIO.0,
                prm::ADS_SL_ETH_PRIO.1,
                params.sl as u32,
            );
            if ah.is_global {
                prm::prm_set(
                    &mut cmd_in,
                    ads + prm::ADS_SRC_ADDR_INDEX.0,
                    prm::ADS_SRC_ADDR_INDEX.1,
                    ah.grh.sgid_index as u32,
                );
                prm::prm_set(
                    &mut cmd_in,
                    ads + prm::ADS_HOP_LIMIT.0,
                    prm::ADS_HOP_LIMIT.1,
                    ah.grh.hop_limit as u32,
                );
                write_rgid(&mut cmd_in, ads + prm::ADS_RGID_RIP, &ah.grh.dgid.raw);
                prm::prm_set(
                    &mut cmd_in,
                    ads + prm::ADS_TCLASS.0,
                    prm::ADS_TCLASS.1,
                    params.traffic_class as u32,
                );
            }
        }

        let ret = self.obj.modify(&cmd_in, &mut cmd_out);
        prm::check_result(ret, &cmd_out, "INIT2RTR_QP")?;

        log::debug!(
            "qpn={:#x} INIT -> RTR, remote_qpn={:#x}",
            self.qpn,
            params.remote_qpn
        );
        self.state = QpState::Rtr;
        self.remote_ah = Some(*ah);
        Ok(())
    }

    /// RTR → RTS: program the requester retry policy.
    pub fn rtr_to_rts(&mut self, params: &ConnectionParams) -> Result<()> {
        self.check_state("rtr_to_rts", QpState::Rtr)?;

        let mut cmd_in = vec![0u8; prm::MODIFY_QP_IN_SIZE];
        let mut cmd_out = vec![0u8; prm::MODIFY_QP_OUT_SIZE];

        prm::prm_set(
            &mut cmd_in,
            prm::MODIFY_QP_IN_OPCODE.0,
            prm::MODIFY_QP_IN_OPCODE.1,
            prm::CMD_OP_RTR2RTS_QP,
        );
        prm::prm_set(
            &mut cmd_in,
            prm::MODIFY_QP_IN_QPN.0,
            prm::MODIFY_QP_IN_QPN.1,
            self.qpn,
        );

        let q = prm::MODIFY_QP_IN_QPC_OFF;
        prm::prm_set(
            &mut cmd_in,
            q + prm::QPC_LOG_ACK_REQ_FREQ.0,
            prm::QPC_LOG_ACK_REQ_FREQ.1,
            0,
        );
        prm::prm_set(
            &mut cmd_in,
            q + prm::QPC_RETRY_COUNT.0,
            prm::QPC_RETRY_COUNT.1,
            params.retry_count as u32,
        );
        prm::prm_set(
            &mut cmd_in,
            q + prm::QPC_RNR_RETRY.0,
            prm::QPC_RNR_RETRY.1,
            params.rnr_retry as u32,
        );
        prm::prm_set(
            &mut cmd_in,
            q + prm::QPC_NEXT_SEND_PSN.0,
            prm::QPC_NEXT_SEND_PSN.1,
            0,
        );
        prm::prm_set(
            &mut cmd_in,
            q + prm::QPC_MIN_RNR_NAK.0,
            prm::QPC_MIN_RNR_NAK.1,
            params.min_rnr_to as u32,
        );

        let ret = self.obj.modify(&cmd_in, &mut cmd_out);
        prm::check_result(ret, &cmd_out, "RTR2RTS_QP")?;

        log::debug!("qpn={:#x} RTR -> RTS", self.qpn);
        self.state = QpState::Rts;
        Ok(())
    }

    /// Move the queue pair to ERR, flushing outstanding work. Valid from
    /// any state; ERR is absorbing.
    pub fn to_error(&mut self) -> Result<()> {
        let mut cmd_in = vec![0u8; prm::MODIFY_QP_IN_SIZE];
        let mut cmd_out = vec![0u8; prm::MODIFY_QP_OUT_SIZE];

        prm::prm_set(
            &mut cmd_in,
            prm::MODIFY_QP_IN_OPCODE.0,
            prm::MODIFY_QP_IN_OPCODE.1,
            prm::CMD_OP_2ERR_QP,
        );
        prm::prm_set(
            &mut cmd_in,
            prm::MODIFY_QP_IN_QPN.0,
            prm::MODIFY_QP_IN_QPN.1,
            self.qpn,
        );

        let ret = self.obj.modify(&cmd_in, &mut cmd_out);
        prm::check_result(ret, &cmd_out, "2ERR_QP")?;

        log::debug!("qpn={:#x} -> ERR", self.qpn);
        self.state = QpState::Error;
        self.remote_ah = None;
        Ok(())
    }

    /// Read the hardware's view of the state via QUERY_QP.
    pub fn query_hw_state(&self) -> Result<u8> {
        let mut cmd_in = vec![0u8; prm::QUERY_QP_IN_SIZE];
        let mut cmd_out = vec![0u8; prm::QUERY_QP_OUT_SIZE];

        prm::prm_set(
            &mut cmd_in,
            prm::QUERY_QP_IN_OPCODE.0,
            prm::QUERY_QP_IN_OPCODE.1,
            prm::CMD_OP_QUERY_QP,
        );
        prm::prm_set(
            &mut cmd_in,
            prm::QUERY_QP_IN_QPN.0,
            prm::QUERY_QP_IN_QPN.1,
            self.qpn,
        );

        let ret = self.obj.query(&cmd_in, &mut cmd_out);
        prm::check_result(ret, &cmd_out, "QUERY_QP")?;

        Ok(prm::prm_get(
            &cmd_out,
            prm::QUERY_QP_OUT_QPC_OFF + prm::QPC_STATE.0,
            prm::QPC_STATE.1,
        ) as u8)
    }

    // ------------------------------------------------------------------
    // Posting
    // ------------------------------------------------------------------

    /// Post one send work request. Requires RTS.
    pub fn post(&mut self, desc: &SendDescriptor) -> Result<u16> {
        if self.state != QpState::Rts {
            return Err(DevxError::InvalidState {
                op: "post",
                required: QpState::Rts,
                actual: self.state,
            });
        }
        self.sq.post(desc, self.qpn)
    }

    pub fn post_send(&mut self, addr: u64, length: u32, lkey: u32, flags: SendFlags) -> Result<u16> {
        self.post(&SendDescriptor {
            opcode: WqeOpcode::Send,
            addr,
            length,
            lkey,
            remote: None,
            imm: 0,
            flags,
        })
    }

    pub fn post_send_imm(
        &mut self,
        addr: u64,
        length: u32,
        lkey: u32,
        imm: u32,
        flags: SendFlags,
    ) -> Result<u16> {
        self.post(&SendDescriptor {
            opcode: WqeOpcode::SendImm,
            addr,
            length,
            lkey,
            remote: None,
            imm,
            flags,
        })
    }

    pub fn post_write(
        &mut self,
        addr: u64,
        length: u32,
        lkey: u32,
        raddr: u64,
        rkey: u32,
        flags: SendFlags,
    ) -> Result<u16> {
        self.post(&SendDescriptor {
            opcode: WqeOpcode::RdmaWrite,
            addr,
            length,
            lkey,
            remote: Some((raddr, rkey)),
            imm: 0,
            flags,
        })
    }

    pub fn post_write_imm(
        &mut self,
        addr: u64,
        length: u32,
        lkey: u32,
        raddr: u64,
        rkey: u32,
        imm: u32,
        flags: SendFlags,
    ) -> Result<u16> {
        self.post(&SendDescriptor {
            opcode: WqeOpcode::RdmaWriteImm,
            addr,
            length,
            lkey,
            remote: Some((raddr, rkey)),
            imm,
            flags,
        })
    }

    pub fn post_read(
        &mut self,
        addr: u64,
        length: u32,
        lkey: u32,
        raddr: u64,
        rkey: u32,
        flags: SendFlags,
    ) -> Result<u16> {
        self.post(&SendDescriptor {
            opcode: WqeOpcode::RdmaRead,
            addr,
            length,
            lkey,
            remote: Some((raddr, rkey)),
            imm: 0,
            flags,
        })
    }

    /// Release send-queue blocks after reaping a completion carrying
    /// `wqe_counter`.
    pub fn complete_send(&mut self, wqe_counter: u16) {
        self.sq.complete(wqe_counter);
    }
}

impl Drop for QueuePair {
    fn drop(&mut self) {
        log::debug!("destroying queue pair qpn={:#x}", self.qpn);
    }
}

fn write_rgid(cmd: &mut [u8], bit_off: usize, gid: &[u8; 16]) {
    for i in 0..4 {
        let v = u32::from_be_bytes([gid[i * 4], gid[i * 4 + 1], gid[i * 4 + 2], gid[i * 4 + 3]]);
        prm::prm_set(cmd, bit_off + i * 32, 32, v);
    }
}
