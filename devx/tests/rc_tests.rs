//! Reliable-connected queue-pair behavior against the software device:
//! state machine, posting rules, loopback data movement, error CQEs.

mod common;

use devx::test_utils::SoftDevice;
use devx::types::{AhAttr, ConnectionParams, GrhAttr, Mtu, ROCE_V2_UDP_DPORT};
use devx::{
    CompletionQueue, CqConfig, CqeOpcode, DevxDevice, DevxError, MemoryRegion, Pd, QpConfig,
    QpState, QueuePair, SendFlags,
};

use common::{bring_to_rts, ib_device, loopback_params, rts_qp};

#[test]
fn state_machine_walks_to_rts() {
    let (_soft, dev) = ib_device();
    let pd = Pd::alloc(&dev).unwrap();
    let cq = CompletionQueue::create(&dev, &CqConfig::default()).unwrap();
    let mut qp = QueuePair::create(&dev, &pd, &cq, &QpConfig::default()).unwrap();

    assert_eq!(qp.state(), QpState::Reset);
    assert!(qp.remote_ah().is_none());

    let params = loopback_params(qp.qpn());
    qp.reset_to_init(&params).unwrap();
    assert_eq!(qp.state(), QpState::Init);
    assert!(qp.remote_ah().is_none());

    qp.init_to_rtr(&params).unwrap();
    assert_eq!(qp.state(), QpState::Rtr);
    assert_eq!(qp.remote_ah().unwrap().dlid, 7);

    qp.rtr_to_rts(&params).unwrap();
    assert_eq!(qp.state(), QpState::Rts);

    // The hardware agrees.
    assert_eq!(qp.query_hw_state().unwrap(), 3);
}

#[test]
fn transitions_reject_wrong_order() {
    let (_soft, dev) = ib_device();
    let pd = Pd::alloc(&dev).unwrap();
    let cq = CompletionQueue::create(&dev, &CqConfig::default()).unwrap();
    let mut qp = QueuePair::create(&dev, &pd, &cq, &QpConfig::default()).unwrap();
    let params = loopback_params(qp.qpn());

    // RTR straight from RESET is inadmissible.
    assert!(matches!(
        qp.init_to_rtr(&params),
        Err(DevxError::InvalidState { .. })
    ));
    assert_eq!(qp.state(), QpState::Reset);

    qp.reset_to_init(&params).unwrap();
    // INIT twice is inadmissible.
    assert!(matches!(
        qp.reset_to_init(&params),
        Err(DevxError::InvalidState { .. })
    ));
    assert_eq!(qp.state(), QpState::Init);
}

#[test]
fn post_outside_rts_is_rejected() {
    let (_soft, dev) = ib_device();
    let pd = Pd::alloc(&dev).unwrap();
    let cq = CompletionQueue::create(&dev, &CqConfig::default()).unwrap();
    let mut qp = QueuePair::create(&dev, &pd, &cq, &QpConfig::default()).unwrap();
    let params = loopback_params(qp.qpn());
    qp.reset_to_init(&params).unwrap();

    let err = qp
        .post_write(0x1000, 16, 0x42, 0x2000, 0x43, SendFlags::SIGNALED)
        .unwrap_err();
    assert!(matches!(err, DevxError::InvalidState { .. }));

    // Nothing reached the queue or the doorbell record.
    assert_eq!(qp.sq_pi(), 0);
    assert_eq!(qp.sq_doorbell_value(), 0);
}

#[test]
fn loopback_write_moves_bytes() {
    let (soft, dev) = ib_device();
    let pd = Pd::alloc(&dev).unwrap();

    let mut cq1 = CompletionQueue::create(&dev, &CqConfig::default()).unwrap();
    let mut qp1 = QueuePair::create(&dev, &pd, &cq1, &QpConfig::default()).unwrap();
    let cq2 = CompletionQueue::create(&dev, &CqConfig::default()).unwrap();
    let mut qp2 = QueuePair::create(&dev, &pd, &cq2, &QpConfig::default()).unwrap();

    bring_to_rts(&mut qp1, qp2.qpn());
    bring_to_rts(&mut qp2, qp1.qpn());

    let src = MemoryRegion::create(&dev, &pd, 4096).unwrap();
    let dst = MemoryRegion::create(&dev, &pd, 4096).unwrap();

    let payload = b"Hello from test-1\0";
    src.write(0, payload);

    let wr = qp1
        .post_write(
            src.addr() as u64,
            payload.len() as u32,
            src.lkey(),
            dst.addr() as u64,
            dst.rkey(),
            SendFlags::SIGNALED,
        )
        .unwrap();
    assert_eq!(wr, 0);
    assert_eq!(qp1.sq_pi(), 1);
    assert_eq!(qp1.sq_doorbell_value(), 1);

    assert_eq!(soft.process(), 1);

    let completion = cq1.poll_once().unwrap().expect("completion pending");
    assert_eq!(completion.opcode, CqeOpcode::Req);
    assert_eq!(completion.wqe_counter, wr);
    assert!(completion.byte_count >= payload.len() as u32);
    assert_eq!(completion.qpn, qp1.qpn());
    qp1.complete_send(completion.wqe_counter);

    assert_eq!(cq1.consumer_index(), 1);
    assert_eq!(qp1.sq_ci(), 1);
    assert_eq!(dst.read(0, payload.len()), payload);

    // Nothing further pending.
    assert!(cq1.poll_once().unwrap().is_none());
}

#[test]
fn read_pulls_remote_bytes() {
    let (soft, dev) = ib_device();
    let pd = Pd::alloc(&dev).unwrap();
    let (mut cq, mut qp) = rts_qp(&dev, &pd, &QpConfig::default(), &CqConfig::default());

    let local = MemoryRegion::create(&dev, &pd, 4096).unwrap();
    let remote = MemoryRegion::create(&dev, &pd, 4096).unwrap();
    remote.write(0, b"remote contents");

    qp.post_read(
        local.addr() as u64,
        15,
        local.lkey(),
        remote.addr() as u64,
        remote.rkey(),
        SendFlags::SIGNALED,
    )
    .unwrap();
    soft.process();

    let completion = cq.poll_once().unwrap().expect("completion pending");
    qp.complete_send(completion.wqe_counter);
    assert_eq!(local.read(0, 15), b"remote contents");
}

#[test]
fn capacity_exhaustion_and_recovery() {
    let (soft, dev) = ib_device();
    let pd = Pd::alloc(&dev).unwrap();
    let qp_config = QpConfig {
        max_send_wr: 4,
        ..Default::default()
    };
    let (mut cq, mut qp) = rts_qp(&dev, &pd, &qp_config, &CqConfig::default());

    let buf = MemoryRegion::create(&dev, &pd, 4096).unwrap();
    for i in 0..4u16 {
        let wr = qp
            .post_send(buf.addr() as u64, 8, buf.lkey(), SendFlags::SIGNALED)
            .unwrap();
        assert_eq!(wr, i);
    }

    // One more basic block than the queue holds.
    assert!(matches!(
        qp.post_send(buf.addr() as u64, 8, buf.lkey(), SendFlags::SIGNALED),
        Err(DevxError::Backpressure)
    ));

    soft.process();
    let completion = cq.poll_once().unwrap().expect("completion pending");
    qp.complete_send(completion.wqe_counter);

    // Reaping one completion frees its block.
    qp.post_send(buf.addr() as u64, 8, buf.lkey(), SendFlags::SIGNALED)
        .unwrap();
    assert_eq!(qp.sq_pi(), 5);
}

#[test]
fn one_free_block_takes_single_but_not_double() {
    let (_soft, dev) = ib_device();
    let pd = Pd::alloc(&dev).unwrap();
    let qp_config = QpConfig {
        max_send_wr: 4,
        ..Default::default()
    };
    let (_cq, mut qp) = rts_qp(&dev, &pd, &qp_config, &CqConfig::default());

    let buf = MemoryRegion::create(&dev, &pd, 4096).unwrap();
    for _ in 0..3 {
        qp.post_send(buf.addr() as u64, 8, buf.lkey(), SendFlags::SIGNALED)
            .unwrap();
    }
    assert_eq!(qp.sq_available(), 1);

    // A two-block inline WQE must bounce while one block remains.
    let payload = [0x5Au8; 60];
    assert!(matches!(
        qp.post_send(
            payload.as_ptr() as u64,
            payload.len() as u32,
            0,
            SendFlags::SIGNALED | SendFlags::INLINE,
        ),
        Err(DevxError::Backpressure)
    ));

    // A single block still fits.
    qp.post_send(buf.addr() as u64, 8, buf.lkey(), SendFlags::SIGNALED)
        .unwrap();
    assert_eq!(qp.sq_pi(), 4);
}

#[test]
fn bad_rkey_surfaces_completion_error() {
    let (soft, dev) = ib_device();
    let pd = Pd::alloc(&dev).unwrap();
    let (mut cq, mut qp) = rts_qp(&dev, &pd, &QpConfig::default(), &CqConfig::default());

    let src = MemoryRegion::create(&dev, &pd, 4096).unwrap();
    let wr = qp
        .post_write(
            src.addr() as u64,
            16,
            src.lkey(),
            0xDEAD_0000,
            0x9999, // never registered
            SendFlags::SIGNALED,
        )
        .unwrap();
    soft.process();

    match cq.poll_once() {
        Err(DevxError::HardwareCompletion {
            syndrome,
            wqe_counter,
            ..
        }) => {
            assert_eq!(syndrome, 0x13);
            assert_eq!(wqe_counter, wr);
            qp.complete_send(wqe_counter);
        }
        other => panic!("expected completion error, got {:?}", other),
    }

    // The slot was consumed and the queue stays usable.
    assert_eq!(cq.consumer_index(), 1);
    assert!(cq.poll_once().unwrap().is_none());

    let dst = MemoryRegion::create(&dev, &pd, 4096).unwrap();
    qp.post_write(
        src.addr() as u64,
        16,
        src.lkey(),
        dst.addr() as u64,
        dst.rkey(),
        SendFlags::SIGNALED,
    )
    .unwrap();
    soft.process();
    assert!(cq.poll_once().unwrap().is_some());
}

#[test]
fn injected_error_carries_syndrome() {
    let (soft, dev) = ib_device();
    let pd = Pd::alloc(&dev).unwrap();
    let (mut cq, mut qp) = rts_qp(&dev, &pd, &QpConfig::default(), &CqConfig::default());

    let buf = MemoryRegion::create(&dev, &pd, 4096).unwrap();
    soft.inject_completion_error(0x21);
    qp.post_send(buf.addr() as u64, 8, buf.lkey(), SendFlags::SIGNALED)
        .unwrap();
    soft.process();

    assert!(matches!(
        cq.poll_once(),
        Err(DevxError::HardwareCompletion { syndrome: 0x21, .. })
    ));
}

#[test]
fn roce_path_programs_ethernet_address() {
    let soft = SoftDevice::new_roce();
    let dev: std::sync::Arc<dyn DevxDevice> = soft.clone();
    let pd = Pd::alloc(&dev).unwrap();
    let cq = CompletionQueue::create(&dev, &CqConfig::default()).unwrap();
    let mut qp = QueuePair::create(&dev, &pd, &cq, &QpConfig::default()).unwrap();

    let params = ConnectionParams {
        mtu: Mtu::Mtu1024,
        remote_qpn: qp.qpn(),
        ah: AhAttr {
            is_global: true,
            dlid: ROCE_V2_UDP_DPORT,
            port_num: 1,
            grh: GrhAttr {
                dgid: devx::Gid::from_ipv4(std::net::Ipv4Addr::new(127, 0, 0, 1)),
                ..Default::default()
            },
            ..Default::default()
        },
        ..Default::default()
    };

    qp.reset_to_init(&params).unwrap();
    qp.init_to_rtr(&params).unwrap();
    qp.rtr_to_rts(&params).unwrap();
    assert_eq!(qp.state(), QpState::Rts);
    assert!(qp.remote_ah().unwrap().is_global);
}

#[test]
fn error_state_is_absorbing() {
    let (_soft, dev) = ib_device();
    let pd = Pd::alloc(&dev).unwrap();
    let (_cq, mut qp) = rts_qp(&dev, &pd, &QpConfig::default(), &CqConfig::default());

    qp.to_error().unwrap();
    assert_eq!(qp.state(), QpState::Error);
    assert_eq!(qp.query_hw_state().unwrap(), 6);

    assert!(matches!(
        qp.post_send(0x1000, 8, 0x42, SendFlags::SIGNALED),
        Err(DevxError::InvalidState { .. })
    ));
    assert!(matches!(
        qp.reset_to_init(&loopback_params(1)),
        Err(DevxError::InvalidState { .. })
    ));
}
