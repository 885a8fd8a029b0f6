//! Device identity derived from the radio hardware address.
//!
//! The identity is the uppercase hex encoding of the 6-byte station MAC
//! (e.g. `DEADBEEFCAFE`). It is stable across reboots of the same unit and is
//! used as the BLE advertised name and as the device-identity characteristic.

use std::fmt;

/// Full 6-byte MAC address.
pub type MacAddress = [u8; 6];

/// Locally administered address used on the host when none is configured.
pub const HOST_DEFAULT_MAC: MacAddress = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];

/// Opaque, immutable device identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    /// Derive the identity from a hardware address.
    pub fn from_mac(mac: &MacAddress) -> Self {
        Self(mac.iter().map(|b| format!("{:02X}", b)).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Read the station MAC burned into eFuse.
#[cfg(feature = "esp32")]
pub fn read_mac() -> MacAddress {
    let mut mac: MacAddress = [0u8; 6];
    // SAFETY: the buffer is exactly the 6 bytes esp_read_mac writes.
    let err = unsafe {
        esp_idf_sys::esp_read_mac(
            mac.as_mut_ptr(),
            esp_idf_sys::esp_mac_type_t_ESP_MAC_WIFI_STA,
        )
    };
    if err != esp_idf_sys::ESP_OK {
        log::warn!("esp_read_mac failed ({}), using default address", err);
        return HOST_DEFAULT_MAC;
    }
    mac
}

/// Parse `AA:BB:CC:DD:EE:FF` (or `-` separated, or 12 bare hex digits).
pub fn parse_mac(s: &str) -> Result<MacAddress, ParseMacError> {
    let hex: String = s
        .trim()
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .collect();
    if hex.len() != 12 || !hex.is_ascii() {
        return Err(ParseMacError(s.to_string()));
    }

    let mut mac = [0u8; 6];
    for (i, byte) in mac.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .map_err(|_| ParseMacError(s.to_string()))?;
    }
    Ok(mac)
}

/// A string that is not a MAC address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseMacError(pub String);

impl fmt::Display for ParseMacError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid MAC address: {:?}", self.0)
    }
}

impl std::error::Error for ParseMacError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_uppercase_hex() {
        let id = DeviceIdentity::from_mac(&[0xde, 0xad, 0xbe, 0xef, 0x0a, 0x01]);
        assert_eq!(id.as_str(), "DEADBEEF0A01");
        assert_eq!(id.to_string(), "DEADBEEF0A01");
    }

    #[test]
    fn test_identity_is_deterministic() {
        assert_eq!(
            DeviceIdentity::from_mac(&HOST_DEFAULT_MAC),
            DeviceIdentity::from_mac(&HOST_DEFAULT_MAC)
        );
    }

    #[test]
    fn test_parse_mac_formats() {
        let expected = [0xAA, 0xBB, 0xCC, 0x01, 0x02, 0x03];
        assert_eq!(parse_mac("AA:BB:CC:01:02:03"), Ok(expected));
        assert_eq!(parse_mac("aa-bb-cc-01-02-03"), Ok(expected));
        assert_eq!(parse_mac(" aabbcc010203 "), Ok(expected));
    }

    #[test]
    fn test_parse_mac_rejects_garbage() {
        assert!(parse_mac("").is_err());
        assert!(parse_mac("AA:BB:CC").is_err());
        assert!(parse_mac("GG:BB:CC:01:02:03").is_err());
        assert!(parse_mac("ÄA:BB:CC:01:02:0").is_err());
    }
}
