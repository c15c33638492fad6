//! Memory regions backed by a CREATE_MKEY command.
//!
//! The region allocates its own buffer (registered as a umem) and creates
//! an MTT-backed memory key over it with full local and remote access.

use std::sync::Arc;

use crate::device::DevxDevice;
use crate::error::Result;
use crate::prm;
use crate::resource::{DevxObj, Pd, Umem};

/// Low byte stamped into user-space memory keys.
const MKEY_VARIANT: u32 = 0xEF;

/// A registered memory region visible to the local and remote side.
pub struct MemoryRegion {
    // Destroy the key before unmapping the memory under it.
    _obj: DevxObj,
    umem: Umem,
    lkey: u32,
    rkey: u32,
}

impl MemoryRegion {
    /// Allocate `len` bytes and register them under a new memory key.
    pub fn create(dev: &Arc<dyn DevxDevice>, pd: &Pd, len: usize) -> Result<Self> {
        let umem = Umem::register(dev, len)?;
        let caps = dev.caps();

        let mut cmd_in = vec![0u8; prm::CREATE_MKEY_IN_SIZE];
        let mut cmd_out = vec![0u8; prm::CREATE_MKEY_OUT_SIZE];

        prm::prm_set(
            &mut cmd_in,
            prm::CREATE_MKEY_IN_OPCODE.0,
            prm::CREATE_MKEY_IN_OPCODE.1,
            prm::CMD_OP_CREATE_MKEY,
        );
        prm::prm_set(
            &mut cmd_in,
            prm::CREATE_MKEY_IN_UMEM_VALID.0,
            prm::CREATE_MKEY_IN_UMEM_VALID.1,
            1,
        );
        prm::prm_set(
            &mut cmd_in,
            prm::CREATE_MKEY_IN_UMEM_ID.0,
            prm::CREATE_MKEY_IN_UMEM_ID.1,
            umem.umem_id(),
        );
        prm::prm_set64(&mut cmd_in, prm::CREATE_MKEY_IN_UMEM_OFFSET, 0);
        prm::prm_set(
            &mut cmd_in,
            prm::CREATE_MKEY_IN_TRANSLATIONS_OCTWORD_ACTUAL_SIZE.0,
            prm::CREATE_MKEY_IN_TRANSLATIONS_OCTWORD_ACTUAL_SIZE.1,
            8,
        );

        let m = prm::CREATE_MKEY_IN_MKC_OFF;
        prm::prm_set(
            &mut cmd_in,
            m + prm::MKC_ACCESS_MODE_1_0.0,
            prm::MKC_ACCESS_MODE_1_0.1,
            prm::MKC_ACCESS_MODE_MTT,
        );
        prm::prm_set(&mut cmd_in, m + prm::MKC_ATOMIC.0, prm::MKC_ATOMIC.1, 1);
        prm::prm_set(&mut cmd_in, m + prm::MKC_RW.0, prm::MKC_RW.1, 1);
        prm::prm_set(&mut cmd_in, m + prm::MKC_RR.0, prm::MKC_RR.1, 1);
        prm::prm_set(&mut cmd_in, m + prm::MKC_LW.0, prm::MKC_LW.1, 1);
        prm::prm_set(&mut cmd_in, m + prm::MKC_LR.0, prm::MKC_LR.1, 1);
        prm::prm_set(&mut cmd_in, m + prm::MKC_PD.0, prm::MKC_PD.1, pd.pdn());
        // Not bound to a single QP.
        prm::prm_set(&mut cmd_in, m + prm::MKC_QPN.0, prm::MKC_QPN.1, 0xFF_FFFF);
        prm::prm_set(
            &mut cmd_in,
            m + prm::MKC_MKEY_7_0.0,
            prm::MKC_MKEY_7_0.1,
            MKEY_VARIANT,
        );
        prm::prm_set64(&mut cmd_in, m + prm::MKC_START_ADDR, umem.addr() as u64);
        prm::prm_set64(&mut cmd_in, m + prm::MKC_LEN, umem.len() as u64);
        prm::prm_set(
            &mut cmd_in,
            m + prm::MKC_TRANSLATIONS_OCTWORD_SIZE.0,
            prm::MKC_TRANSLATIONS_OCTWORD_SIZE.1,
            8,
        );
        prm::prm_set(
            &mut cmd_in,
            m + prm::MKC_LOG_PAGE_SIZE.0,
            prm::MKC_LOG_PAGE_SIZE.1,
            caps.log_page_size as u32,
        );

        let obj = dev
            .obj_create(&cmd_in, &mut cmd_out)
            .map_err(|_| prm::command_error(&cmd_out, "CREATE_MKEY"))?;
        let mkey_index = prm::prm_get(
            &cmd_out,
            prm::CREATE_MKEY_OUT_MKEY_INDEX.0,
            prm::CREATE_MKEY_OUT_MKEY_INDEX.1,
        );

        let key = (mkey_index << 8) | MKEY_VARIANT;
        log::debug!(
            "created memory region lkey={:#x} addr={:p} len={}",
            key,
            umem.addr(),
            umem.len()
        );

        Ok(Self {
            _obj: DevxObj::new(obj, dev.clone()),
            umem,
            lkey: key,
            rkey: key,
        })
    }

    pub fn lkey(&self) -> u32 {
        self.lkey
    }

    pub fn rkey(&self) -> u32 {
        self.rkey
    }

    pub fn addr(&self) -> *mut u8 {
        self.umem.addr()
    }

    pub fn len(&self) -> usize {
        self.umem.len()
    }

    pub fn is_empty(&self) -> bool {
        self.umem.len() == 0
    }

    /// Copy `data` into the region at `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.len());
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.addr().add(offset), data.len());
        }
    }

    /// Copy `len` bytes out of the region at `offset`.
    pub fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        assert!(offset + len <= self.len());
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(self.addr().add(offset), out.as_mut_ptr(), len);
        }
        out
    }
}
