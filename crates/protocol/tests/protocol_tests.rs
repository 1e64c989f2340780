//! Integration tests for the modem wire formats

use protocol::{
    CRC_SENTINEL, DeviceLayout, FRAME_HEADER_LEN, MAX_FRAME_SIZE, PortKind, PortSpec,
    SerialStateNotification, SetupPacket, UartState, decode_config_data, declared_length,
    device_table, fix_crc_trailer,
};
use proptest::prelude::*;

mod mux_table {
    use super::*;

    #[test]
    fn test_every_mux_port_round_trips_through_wire_index() {
        for bit in 0..8u8 {
            let mask = 1u8 << bit;
            match PortKind::from_mux_bit(mask) {
                Some(port) => {
                    let setup = SetupPacket::mux_read(port, 1024);
                    assert_eq!(setup.index, bit as u16);
                }
                None => assert!(bit >= 5, "bit {} should be mapped", bit),
            }
        }
    }
}

mod crc_quirk {
    use super::*;

    #[test]
    fn test_residual_five_strips_sentinel() {
        // max_packet_size * k + 5 becomes max_packet_size * k + 1
        let mps = 512;
        for k in 0..4 {
            let len = mps * k + 5;
            let mut buf = vec![0x11u8; len];
            buf[len - 4..].copy_from_slice(&CRC_SENTINEL);
            assert_eq!(fix_crc_trailer(&buf, len, mps), mps * k + 1);
        }
    }

    proptest! {
        #[test]
        fn prop_length_only_shrinks_by_four(len in 0usize..4096, mps in prop::sample::select(vec![64usize, 512])) {
            let mut buf = vec![0u8; len];
            if len >= 4 {
                buf[len - 4..].copy_from_slice(&CRC_SENTINEL);
            }
            let fixed = fix_crc_trailer(&buf, len, mps);
            let rest = len % mps;
            if len >= 4 && (rest == 5 || rest == 6) {
                prop_assert_eq!(fixed, len - 4);
            } else {
                prop_assert_eq!(fixed, len);
            }
        }
    }
}

mod frames {
    use super::*;

    proptest! {
        #[test]
        fn prop_declared_length_window(total in 0u16..=u16::MAX) {
            let mut header = [0u8; FRAME_HEADER_LEN];
            header[2..4].copy_from_slice(&total.to_be_bytes());
            let result = declared_length(&header);
            let total = total as usize;
            if (FRAME_HEADER_LEN..=MAX_FRAME_SIZE).contains(&total) {
                prop_assert_eq!(result.unwrap(), total);
            } else {
                prop_assert!(result.is_err());
            }
        }
    }
}

mod notifications {
    use super::*;

    #[test]
    fn test_modem_notification_for_interface() {
        let n = SerialStateNotification {
            interface: 2,
            state: UartState(UartState::RX_CARRIER | UartState::TX_CARRIER),
        };
        let decoded = SerialStateNotification::decode(&n.encode(), 2).unwrap();
        assert!(decoded.state.dcd());
        assert!(decoded.state.dsr());
        assert!(!decoded.state.ring());
    }

    proptest! {
        #[test]
        fn prop_garbage_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..16), intf in 0u8..4) {
            let _ = SerialStateNotification::decode(&bytes, intf);
        }
    }
}

mod layouts {
    use super::*;

    #[test]
    fn test_every_built_in_device_resolves_interface_zero() {
        for dev in device_table::SUPPORTED_DEVICES {
            match dev.layout {
                DeviceLayout::Query => assert!(dev.layout.port_spec(0).is_none()),
                _ => {
                    let spec = dev.layout.port_spec(0).unwrap();
                    assert!(spec.is_mux());
                    assert_eq!(spec.port, PortKind::Network);
                }
            }
        }
    }

    #[test]
    fn test_queried_layout() {
        let mut data = [0u8; 17];
        data[..4].copy_from_slice(&[0x7, 0x1, 0x8, 0x6]);
        let specs: Vec<Option<PortSpec>> =
            (0..5).map(|i| decode_config_data(&data, i).unwrap()).collect();
        assert_eq!(specs[0].unwrap().port, PortKind::Network);
        assert_eq!(specs[1].unwrap().port, PortKind::Diag);
        assert_eq!(specs[2].unwrap().port, PortKind::Modem);
        assert_eq!(specs[3].unwrap().port, PortKind::Control);
        assert!(specs[4].is_none());
        assert!(specs.iter().flatten().all(|s| !s.is_mux() && !s.crc_quirk));
    }
}
