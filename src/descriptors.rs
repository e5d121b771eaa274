//! Minimal configuration-descriptor walking: just enough to answer
//! `get_max_packet_size`, which is the only descriptor query the core
//! itself needs to perform (everything else is handed back to the
//! application as raw bytes from the backend).

const DESC_TYPE_ENDPOINT: u8 = 0x05;

/// Walk a raw configuration descriptor's TLV stream looking for an
/// endpoint descriptor whose `bEndpointAddress` matches `endpoint`,
/// returning its `wMaxPacketSize`.
///
/// Scans every interface and alt-setting in the configuration, not only
/// whichever alt-setting happens to be active — the config descriptor
/// blob doesn't record "active" at all, so this is the only behavior the
/// byte stream supports.
pub fn find_max_packet_size(config: &[u8], endpoint: u8) -> Option<u16> {
    let mut offset = 0usize;
    while offset + 2 <= config.len() {
        let length = config[offset] as usize;
        if length < 2 || offset + length > config.len() {
            break;
        }
        let descriptor_type = config[offset + 1];
        if descriptor_type == DESC_TYPE_ENDPOINT && length >= 7 {
            let address = config[offset + 2];
            if address == endpoint {
                let max_packet_size =
                    u16::from_le_bytes([config[offset + 4], config[offset + 5]]);
                return Some(max_packet_size);
            }
        }
        offset += length;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint_descriptor(address: u8, max_packet_size: u16) -> Vec<u8> {
        let mpz = max_packet_size.to_le_bytes();
        vec![7, DESC_TYPE_ENDPOINT, address, 0x02, mpz[0], mpz[1], 0x00]
    }

    #[test]
    fn finds_matching_endpoint() {
        let mut config = vec![9, 0x02, 0, 0, 1, 1, 0, 0, 0]; // config descriptor header
        config.extend(endpoint_descriptor(0x81, 512));
        config.extend(endpoint_descriptor(0x02, 64));
        assert_eq!(find_max_packet_size(&config, 0x81), Some(512));
        assert_eq!(find_max_packet_size(&config, 0x02), Some(64));
    }

    #[test]
    fn missing_endpoint_returns_none() {
        let config = vec![9, 0x02, 0, 0, 1, 1, 0, 0, 0];
        assert_eq!(find_max_packet_size(&config, 0x81), None);
    }

    #[test]
    fn truncated_descriptor_stops_without_panicking() {
        let config = vec![9, 0x02, 0, 0, 1, 1, 0, 0]; // one byte short
        assert_eq!(find_max_packet_size(&config, 0x81), None);
    }
}
