//! Fixed-layout wire codec for the parameter exchange.
//!
//! One record travels in each direction right after the TCP connection is
//! made, followed by each side's `(raddr, rkey)` pair. All multi-byte
//! integers are network byte order; both peers must be at the same version.
//!
//! ```text
//! offset  size  field
//!  0      1     mtu (QPC encoding, 1..=5)
//!  1      1     ece (0/1)
//!  2      1     port_num
//!  3      1     retry_count
//!  4      1     rnr_retry
//!  5      1     min_rnr_to
//!  6      1     sl
//!  7      1     dscp
//!  8      1     traffic_class
//!  9      4     sender's qpn (24-bit, u32)
//! 13      1     ah.is_global (0/1)
//! 14      2     ah.dlid
//! 16      1     ah.sl
//! 17      1     ah.src_path_bits
//! 18      1     ah.static_rate
//! 19      1     ah.port_num
//! 20     16     ah.grh.dgid
//! 36      4     ah.grh.flow_label (low 20 bits)
//! 40      1     ah.grh.sgid_index
//! 41      1     ah.grh.hop_limit
//! 42      1     ah.grh.traffic_class
//! ```

use devx::types::{AhAttr, ConnectionParams, Gid, GrhAttr, Mtu};

use crate::error::{ConnectorError, Result};

/// Size of the parameter record.
pub const RECORD_LEN: usize = 43;
/// Size of the `(raddr, rkey)` trailer each side sends after the record.
pub const MEMORY_LEN: usize = 12;

/// Serialize a parameter record. `params.remote_qpn` carries the sender's
/// own queue-pair number; on the receiving side it lands as the remote one.
pub fn encode_params(params: &ConnectionParams) -> [u8; RECORD_LEN] {
    let mut buf = [0u8; RECORD_LEN];
    buf[0] = params.mtu as u8;
    buf[1] = params.ece as u8;
    buf[2] = params.port_num;
    buf[3] = params.retry_count;
    buf[4] = params.rnr_retry;
    buf[5] = params.min_rnr_to;
    buf[6] = params.sl;
    buf[7] = params.dscp;
    buf[8] = params.traffic_class;
    buf[9..13].copy_from_slice(&(params.remote_qpn & 0x00FF_FFFF).to_be_bytes());

    let ah = &params.ah;
    buf[13] = ah.is_global as u8;
    buf[14..16].copy_from_slice(&ah.dlid.to_be_bytes());
    buf[16] = ah.sl;
    buf[17] = ah.src_path_bits;
    buf[18] = ah.static_rate;
    buf[19] = ah.port_num;
    buf[20..36].copy_from_slice(&ah.grh.dgid.raw);
    buf[36..40].copy_from_slice(&(ah.grh.flow_label & 0x000F_FFFF).to_be_bytes());
    buf[40] = ah.grh.sgid_index;
    buf[41] = ah.grh.hop_limit;
    buf[42] = ah.grh.traffic_class;
    buf
}

/// Parse and validate a parameter record.
pub fn decode_params(buf: &[u8]) -> Result<ConnectionParams> {
    if buf.len() != RECORD_LEN {
        return Err(ConnectorError::ProtocolMismatch(format!(
            "parameter record is {} bytes, expected {}",
            buf.len(),
            RECORD_LEN
        )));
    }
    let mtu = Mtu::from_value(buf[0]).ok_or_else(|| {
        ConnectorError::ProtocolMismatch(format!("bad mtu encoding {:#x}", buf[0]))
    })?;
    if buf[1] > 1 || buf[13] > 1 {
        return Err(ConnectorError::ProtocolMismatch(
            "boolean field out of range".to_string(),
        ));
    }

    let mut dgid = [0u8; 16];
    dgid.copy_from_slice(&buf[20..36]);

    Ok(ConnectionParams {
        mtu,
        ece: buf[1] != 0,
        port_num: buf[2],
        retry_count: buf[3],
        rnr_retry: buf[4],
        min_rnr_to: buf[5],
        sl: buf[6],
        dscp: buf[7],
        traffic_class: buf[8],
        remote_qpn: u32::from_be_bytes(buf[9..13].try_into().unwrap()) & 0x00FF_FFFF,
        ah: AhAttr {
            is_global: buf[13] != 0,
            dlid: u16::from_be_bytes(buf[14..16].try_into().unwrap()),
            sl: buf[16],
            src_path_bits: buf[17],
            static_rate: buf[18],
            port_num: buf[19],
            grh: GrhAttr {
                dgid: Gid::from_raw(dgid),
                flow_label: u32::from_be_bytes(buf[36..40].try_into().unwrap()) & 0x000F_FFFF,
                sgid_index: buf[40],
                hop_limit: buf[41],
                traffic_class: buf[42],
            },
        },
    })
}

/// Serialize a `(raddr, rkey)` trailer.
pub fn encode_memory(raddr: u64, rkey: u32) -> [u8; MEMORY_LEN] {
    let mut buf = [0u8; MEMORY_LEN];
    buf[..8].copy_from_slice(&raddr.to_be_bytes());
    buf[8..].copy_from_slice(&rkey.to_be_bytes());
    buf
}

/// Parse a `(raddr, rkey)` trailer.
pub fn decode_memory(buf: &[u8]) -> Result<(u64, u32)> {
    if buf.len() != MEMORY_LEN {
        return Err(ConnectorError::ProtocolMismatch(format!(
            "memory trailer is {} bytes, expected {}",
            buf.len(),
            MEMORY_LEN
        )));
    }
    Ok((
        u64::from_be_bytes(buf[..8].try_into().unwrap()),
        u32::from_be_bytes(buf[8..].try_into().unwrap()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_params() -> ConnectionParams {
        ConnectionParams {
            mtu: Mtu::Mtu4096,
            ece: true,
            port_num: 1,
            retry_count: 7,
            rnr_retry: 7,
            min_rnr_to: 12,
            sl: 3,
            dscp: 26,
            traffic_class: 106,
            remote_qpn: 0x4B,
            ah: AhAttr {
                is_global: true,
                dlid: 4791,
                sl: 3,
                src_path_bits: 0,
                static_rate: 0,
                port_num: 1,
                grh: GrhAttr {
                    dgid: Gid::from_ipv4(std::net::Ipv4Addr::new(10, 0, 0, 2)),
                    flow_label: 0xABCDE,
                    sgid_index: 1,
                    hop_limit: 64,
                    traffic_class: 106,
                },
            },
        }
    }

    #[test]
    fn record_roundtrip() {
        let params = sample_params();
        let buf = encode_params(&params);
        let decoded = decode_params(&buf).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn record_is_network_byte_order() {
        let buf = encode_params(&sample_params());
        assert_eq!(buf[0], 5);
        assert_eq!(&buf[9..13], &[0, 0, 0, 0x4B]);
        assert_eq!(&buf[14..16], &4791u16.to_be_bytes());
    }

    #[test]
    fn bad_mtu_is_rejected() {
        let mut buf = encode_params(&sample_params());
        buf[0] = 9;
        assert!(matches!(
            decode_params(&buf),
            Err(ConnectorError::ProtocolMismatch(_))
        ));
    }

    #[test]
    fn truncated_record_is_rejected() {
        let buf = encode_params(&sample_params());
        assert!(matches!(
            decode_params(&buf[..RECORD_LEN - 1]),
            Err(ConnectorError::ProtocolMismatch(_))
        ));
    }

    #[test]
    fn memory_trailer_roundtrip() {
        let buf = encode_memory(0x1122_3344_5566_7788, 0xAABBCCDD);
        assert_eq!(&buf[..8], &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
        let (raddr, rkey) = decode_memory(&buf).unwrap();
        assert_eq!(raddr, 0x1122_3344_5566_7788);
        assert_eq!(rkey, 0xAABBCCDD);
    }
}
