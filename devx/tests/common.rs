//! Shared helpers for engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use devx::test_utils::SoftDevice;
use devx::types::{AhAttr, ConnectionParams, Mtu};
use devx::{CompletionQueue, CqConfig, DevxDevice, Pd, QpConfig, QueuePair};

/// Open a software InfiniBand device.
pub fn ib_device() -> (Arc<SoftDevice>, Arc<dyn DevxDevice>) {
    let soft = SoftDevice::new_ib();
    let dev: Arc<dyn DevxDevice> = soft.clone();
    (soft, dev)
}

/// Connection parameters pointing at `remote_qpn` over the loopback LID.
pub fn loopback_params(remote_qpn: u32) -> ConnectionParams {
    ConnectionParams {
        mtu: Mtu::Mtu4096,
        remote_qpn,
        ah: AhAttr {
            dlid: 7,
            port_num: 1,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Drive a queue pair RESET → INIT → RTR → RTS.
pub fn bring_to_rts(qp: &mut QueuePair, remote_qpn: u32) {
    let params = loopback_params(remote_qpn);
    qp.reset_to_init(&params).expect("RESET -> INIT");
    qp.init_to_rtr(&params).expect("INIT -> RTR");
    qp.rtr_to_rts(&params).expect("RTR -> RTS");
}

/// A CQ plus a queue pair already in RTS, connected to itself.
pub fn rts_qp(
    dev: &Arc<dyn DevxDevice>,
    pd: &Pd,
    qp_config: &QpConfig,
    cq_config: &CqConfig,
) -> (CompletionQueue, QueuePair) {
    let cq = CompletionQueue::create(dev, cq_config).expect("create CQ");
    let mut qp = QueuePair::create(dev, pd, &cq, qp_config).expect("create QP");
    let qpn = qp.qpn();
    bring_to_rts(&mut qp, qpn);
    (cq, qp)
}
