//! Protocol-aware UDP probe payloads
//!
//! Silent UDP services only answer well-formed requests, so a port-specific
//! payload turns many `open|filtered` results into `open`.

use std::collections::HashMap;

const GENERIC_PAYLOAD: &[u8] = b"Hello\n";

#[derive(Debug, Clone)]
pub struct UdpPayloads {
    payloads: HashMap<u16, Vec<u8>>,
}

impl UdpPayloads {
    pub fn new() -> Self {
        let mut payloads = HashMap::new();

        // DNS: standard query for example.com A
        payloads.insert(53, vec![
            0x12, 0x34, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x07, 0x65, 0x78, 0x61, 0x6d, 0x70, 0x6c, 0x65, 0x03, 0x63, 0x6f, 0x6d,
            0x00, 0x00, 0x01, 0x00, 0x01,
        ]);

        // NTP: client mode, version 4
        let mut ntp = vec![0u8; 48];
        ntp[0] = 0x23;
        payloads.insert(123, ntp);

        // NetBIOS: node status request for "*"
        let mut netbios = vec![
            0x80, 0xf0, 0x00, 0x10, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x20,
        ];
        netbios.extend_from_slice(b"CKAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA");
        netbios.extend_from_slice(&[0x00, 0x00, 0x21, 0x00, 0x01]);
        payloads.insert(137, netbios);

        // SNMP v1 get-request, community "public"
        payloads.insert(161, vec![
            0x30, 0x26, 0x02, 0x01, 0x00, 0x04, 0x06, 0x70, 0x75, 0x62, 0x6c, 0x69, 0x63,
            0xa0, 0x19, 0x02, 0x04, 0x12, 0x34, 0x56, 0x78, 0x02, 0x01, 0x00, 0x02, 0x01,
            0x00, 0x30, 0x0b, 0x30, 0x09, 0x06, 0x05, 0x2b, 0x06, 0x01, 0x02, 0x01, 0x05, 0x00,
        ]);

        // SIP
        payloads.insert(5060, b"OPTIONS sip:nm SIP/2.0\r\nVia: SIP/2.0/UDP nm\r\n\r\n".to_vec());

        Self { payloads }
    }

    /// Payload to send to `port`, falling back to a generic probe
    pub fn payload_for(&self, port: u16) -> &[u8] {
        self.payloads
            .get(&port)
            .map(Vec::as_slice)
            .unwrap_or(GENERIC_PAYLOAD)
    }
}

impl Default for UdpPayloads {
    fn default() -> Self {
        Self::new()
    }
}
