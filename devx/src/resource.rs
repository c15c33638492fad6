//! RAII wrappers for device resources.
//!
//! Each wrapper releases its handle through the owning device on drop, so
//! lifetimes nest naturally: objects before umems, umems before the device.

use std::sync::Arc;

use crate::device::{DevxDevice, ObjId, UarInfo, UmemInfo};
use crate::error::Result;

/// Protection domain. Cheap to clone; deallocated when the last clone drops.
#[derive(Clone)]
pub struct Pd(Arc<PdInner>);

struct PdInner {
    pdn: u32,
    dev: Arc<dyn DevxDevice>,
}

impl Pd {
    pub fn alloc(dev: &Arc<dyn DevxDevice>) -> Result<Self> {
        let pdn = dev.alloc_pd()?;
        log::debug!("allocated protection domain pdn={}", pdn);
        Ok(Self(Arc::new(PdInner {
            pdn,
            dev: dev.clone(),
        })))
    }

    /// Firmware PD number, as written into QPC and MKC fields.
    pub fn pdn(&self) -> u32 {
        self.0.pdn
    }
}

impl Drop for PdInner {
    fn drop(&mut self) {
        log::debug!("deallocating protection domain pdn={}", self.pdn);
        self.dev.dealloc_pd(self.pdn);
    }
}

/// Doorbell/BlueFlame register page.
pub struct Uar {
    info: UarInfo,
    dev: Arc<dyn DevxDevice>,
}

// The register page is exclusively owned by this handle.
unsafe impl Send for Uar {}

impl Uar {
    pub fn alloc(dev: &Arc<dyn DevxDevice>) -> Result<Self> {
        let info = dev.alloc_uar()?;
        log::debug!(
            "allocated UAR page_id={} reg_addr={:p}",
            info.page_id,
            info.reg_addr
        );
        Ok(Self {
            info,
            dev: dev.clone(),
        })
    }

    /// Page id for QPC/CQC `uar_page` fields.
    pub fn page_id(&self) -> u32 {
        self.info.page_id
    }

    /// Doorbell/BlueFlame register address for queue-pair doorbells.
    pub fn reg_addr(&self) -> *mut u8 {
        self.info.reg_addr
    }

    /// Base address of the mapped page.
    pub fn base_addr(&self) -> *mut u8 {
        self.info.base_addr
    }
}

impl Drop for Uar {
    fn drop(&mut self) {
        self.dev.free_uar(self.info.page_id);
    }
}

/// Registered user memory. The device allocates the backing buffer; this
/// handle keeps it mapped and accessible.
pub struct Umem {
    info: UmemInfo,
    dev: Arc<dyn DevxDevice>,
}

// The backing buffer is exclusively owned by this handle.
unsafe impl Send for Umem {}

impl Umem {
    pub fn register(dev: &Arc<dyn DevxDevice>, len: usize) -> Result<Self> {
        let info = dev.register_umem(len)?;
        log::debug!("registered umem id={} len={}", info.umem_id, info.len);
        Ok(Self {
            info,
            dev: dev.clone(),
        })
    }

    pub fn umem_id(&self) -> u32 {
        self.info.umem_id
    }

    pub fn addr(&self) -> *mut u8 {
        self.info.addr
    }

    pub fn len(&self) -> usize {
        self.info.len
    }

    pub fn is_empty(&self) -> bool {
        self.info.len == 0
    }
}

impl Drop for Umem {
    fn drop(&mut self) {
        log::debug!("unregistering umem id={}", self.info.umem_id);
        self.dev.unregister_umem(self.info.umem_id);
    }
}

/// A created device object (QP, CQ, MKEY). Destroyed on drop.
pub struct DevxObj {
    id: ObjId,
    dev: Arc<dyn DevxDevice>,
}

impl DevxObj {
    pub(crate) fn new(id: ObjId, dev: Arc<dyn DevxDevice>) -> Self {
        Self { id, dev }
    }

    pub fn id(&self) -> ObjId {
        self.id
    }

    /// Issue a modify command. Returns the raw result code; pair with
    /// [`crate::prm::check_result`].
    pub fn modify(&self, cmd_in: &[u8], cmd_out: &mut [u8]) -> i32 {
        self.dev.obj_modify(self.id, cmd_in, cmd_out)
    }

    /// Issue a query command.
    pub fn query(&self, cmd_in: &[u8], cmd_out: &mut [u8]) -> i32 {
        self.dev.obj_query(self.id, cmd_in, cmd_out)
    }
}

impl Drop for DevxObj {
    fn drop(&mut self) {
        self.dev.obj_destroy(self.id);
    }
}
