//! ESP-IDF WiFi station driver.
//!
//! Wraps [`EspWifi`] without the blocking helpers: `begin_connect` only
//! configures the station and issues the connect request, and completion is
//! polled by the reconnection loop.

use super::{UplinkError, UplinkRadio};
use crate::credentials::Credentials;
use esp_idf_hal::modem::Modem;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::nvs::{EspNvsPartition, NvsDefault};
use esp_idf_svc::wifi::{AuthMethod, ClientConfiguration, Configuration, EspWifi};
use esp_idf_sys::{esp_err_t, EspError, ESP_ERR_WIFI_NOT_CONNECT, ESP_ERR_WIFI_NOT_STARTED};
use log::debug;
use std::net::IpAddr;

/// WiFi station radio.
pub struct EspUplink {
    wifi: EspWifi<'static>,
}

impl EspUplink {
    pub fn new(
        modem: Modem,
        sysloop: EspSystemEventLoop,
        nvs: Option<EspNvsPartition<NvsDefault>>,
    ) -> Result<Self, UplinkError> {
        let wifi = EspWifi::new(modem, sysloop, nvs).map_err(esp_error)?;
        Ok(Self { wifi })
    }
}

impl UplinkRadio for EspUplink {
    fn begin_connect(&mut self, credentials: &Credentials) -> Result<(), UplinkError> {
        let auth_method = if credentials.is_open() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        };

        let config = Configuration::Client(ClientConfiguration {
            ssid: credentials
                .ssid()
                .try_into()
                .map_err(|_| UplinkError::InvalidSsid)?,
            password: credentials
                .password()
                .try_into()
                .map_err(|_| UplinkError::InvalidPassword)?,
            auth_method,
            ..Default::default()
        });

        self.wifi.set_configuration(&config).map_err(esp_error)?;
        if !self.wifi.is_started().map_err(esp_error)? {
            self.wifi.start().map_err(esp_error)?;
        }
        self.wifi.connect().map_err(esp_error)?;
        debug!("Connect request issued for {:?}", credentials.ssid());
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), UplinkError> {
        // Issued even while disassociated so a scan in progress is aborted.
        match self.wifi.disconnect() {
            Ok(()) => {
                debug!("WiFi disconnect issued");
                Ok(())
            }
            Err(e) if is_idle(&e) => Ok(()),
            Err(e) => Err(esp_error(e)),
        }
    }

    fn is_connected(&self) -> bool {
        self.wifi.is_connected().unwrap_or(false) && self.wifi.sta_netif().is_up().unwrap_or(false)
    }

    fn ip_addr(&self) -> Option<IpAddr> {
        let info = self.wifi.sta_netif().get_ip_info().ok()?;
        format!("{}", info.ip).parse().ok()
    }
}

/// The station was never started or has nothing to drop.
fn is_idle(e: &EspError) -> bool {
    e.code() == ESP_ERR_WIFI_NOT_STARTED as esp_err_t
        || e.code() == ESP_ERR_WIFI_NOT_CONNECT as esp_err_t
}

fn esp_error(e: EspError) -> UplinkError {
    UplinkError::Radio(format!("{:?}", e))
}
