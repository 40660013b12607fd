/// `GH-` + 16 uppercase hex digits: 19 bytes, fits a 20-column display row.
pub const DEVICE_ID_LEN: usize = 19;

/// Derive the stable device identifier from the factory-fused MAC address.
/// The 6-byte MAC is zero-extended to 64 bits so the textual form has a
/// fixed width regardless of leading zero octets.
pub fn device_id_from_mac(mac: [u8; 6]) -> String {
    let mut value = 0u64;
    for byte in mac {
        value = (value << 8) | u64::from(byte);
    }
    format!("GH-{value:016X}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_has_fixed_length_and_prefix() {
        let id = device_id_from_mac([0xA4, 0xCF, 0x12, 0x45, 0x67, 0x89]);

        assert_eq!(id.len(), DEVICE_ID_LEN);
        assert_eq!(id, "GH-0000A4CF12456789");
    }

    #[test]
    fn id_is_stable_per_mac() {
        let mac = [0x24, 0x6F, 0x28, 0xAA, 0xBB, 0xCC];
        assert_eq!(device_id_from_mac(mac), device_id_from_mac(mac));
    }

    #[test]
    fn all_zero_mac_still_renders_full_width() {
        assert_eq!(device_id_from_mac([0; 6]), "GH-0000000000000000");
    }
}
