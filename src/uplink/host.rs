//! Host uplink.
//!
//! On host systems the OS owns the network. This radio only models the
//! association so the reconnection loop runs unchanged during development.

use super::{UplinkError, UplinkRadio};
use crate::credentials::Credentials;
use log::info;
use std::net::IpAddr;

/// Host uplink: associating succeeds as soon as an SSID is given.
#[derive(Debug, Default)]
pub struct HostUplink {
    associated: bool,
    ip_addr: Option<IpAddr>,
}

impl HostUplink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local address of the default route.
    ///
    /// "Connecting" a UDP socket to a public address sends nothing but makes
    /// the OS pick the outbound interface.
    fn detect_local_ip() -> Option<IpAddr> {
        use std::net::UdpSocket;

        let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("8.8.8.8:80").ok()?;
        let local_addr = socket.local_addr().ok()?;
        Some(local_addr.ip())
    }
}

impl UplinkRadio for HostUplink {
    fn begin_connect(&mut self, credentials: &Credentials) -> Result<(), UplinkError> {
        if credentials.is_empty() {
            return Err(UplinkError::InvalidSsid);
        }
        self.ip_addr = Self::detect_local_ip();
        self.associated = true;
        match self.ip_addr {
            Some(ip) => info!("Host uplink ready for {:?}, local IP: {}", credentials.ssid(), ip),
            None => info!("Host uplink ready for {:?}, no local IP", credentials.ssid()),
        }
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), UplinkError> {
        self.associated = false;
        self.ip_addr = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.associated
    }

    fn ip_addr(&self) -> Option<IpAddr> {
        self.ip_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_disassociated() {
        let uplink = HostUplink::new();
        assert!(!uplink.is_connected());
        assert_eq!(uplink.ip_addr(), None);
    }

    #[test]
    fn test_connect_and_disconnect() {
        let mut uplink = HostUplink::new();
        uplink
            .begin_connect(&Credentials::new("HomeNet", "password123"))
            .unwrap();
        assert!(uplink.is_connected());
        // IP detection may fail in air-gapped environments.

        uplink.disconnect().unwrap();
        assert!(!uplink.is_connected());
        assert_eq!(uplink.ip_addr(), None);
    }

    #[test]
    fn test_empty_ssid_rejected() {
        let mut uplink = HostUplink::new();
        let result = uplink.begin_connect(&Credentials::default());
        assert!(matches!(result, Err(UplinkError::InvalidSsid)));
        assert!(!uplink.is_connected());
    }
}
