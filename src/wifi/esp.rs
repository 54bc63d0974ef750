//! ESP-IDF WiFi driver adapter.
//!
//! Driver and DHCP events are delivered on the system event loop task and
//! forwarded into the node event channel as [`RadioEvent`]s, carrying the
//! driver's own payloads. Scans run in the background and their records are
//! read on the scan-done event.

use super::credentials::WirelessCredentials;
use super::radio::{ApRecord, NetworkMode, RadioError, RadioEvent, WifiRadio};
use crate::event::{self, EventSender};
use esp_idf_hal::modem::Modem;
use esp_idf_svc::eventloop::{EspSubscription, EspSystemEventLoop, System};
use esp_idf_svc::netif::IpEvent;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::wifi::{
    AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration, EspWifi, WifiEvent,
};
use esp_idf_sys::{self as sys, EspError};
use log::{debug, info, warn};

/// [`WifiRadio`] over `EspWifi`.
pub struct EspRadio {
    wifi: EspWifi<'static>,
    mode: NetworkMode,
    _wifi_sub: EspSubscription<'static, System>,
    _ip_sub: EspSubscription<'static, System>,
}

fn esp_err(kind: fn(String) -> RadioError) -> impl Fn(EspError) -> RadioError {
    move |e| kind(format!("{:?}", e))
}

/// Drain the driver's scan result list. Only valid after a scan-done event.
fn scan_records() -> Result<Vec<ApRecord>, EspError> {
    let mut count: u16 = 0;
    // SAFETY: the driver writes the number of stored records into `count`.
    sys::esp!(unsafe { sys::esp_wifi_scan_get_ap_num(&mut count) })?;
    let mut raw = vec![sys::wifi_ap_record_t::default(); count as usize];
    // SAFETY: `raw` holds `count` records; the driver updates `count` to the number written.
    sys::esp!(unsafe { sys::esp_wifi_scan_get_ap_records(&mut count, raw.as_mut_ptr()) })?;
    raw.truncate(count as usize);
    Ok(raw
        .iter()
        .map(|ap| {
            let len = ap.ssid.iter().position(|&b| b == 0).unwrap_or(ap.ssid.len());
            ApRecord {
                ssid: ap.ssid[..len].to_vec(),
                rssi: ap.rssi,
            }
        })
        .collect())
}

impl EspRadio {
    pub fn new(
        modem: Modem,
        sysloop: EspSystemEventLoop,
        nvs: Option<EspDefaultNvsPartition>,
        events: EventSender,
    ) -> Result<Self, RadioError> {
        let wifi = EspWifi::new(modem, sysloop.clone(), nvs).map_err(esp_err(RadioError::Init))?;

        let tx = events.clone();
        let wifi_sub = sysloop
            .subscribe::<WifiEvent, _>(move |ev| match ev {
                WifiEvent::StaStarted => event::post(&tx, RadioEvent::StationStart),
                WifiEvent::StaConnected(info) => event::post(
                    &tx,
                    RadioEvent::connected(info.ssid().as_bytes(), &info.bssid()[..]),
                ),
                WifiEvent::StaDisconnected(info) => event::post(
                    &tx,
                    RadioEvent::disconnected(
                        info.rssi(),
                        u16::try_from(info.reason()).unwrap_or(u16::MAX),
                    ),
                ),
                WifiEvent::ScanDone { .. } => match scan_records() {
                    Ok(records) => {
                        info!("Scan found {} access points", records.len());
                        event::post(&tx, RadioEvent::ScanDone(records));
                    }
                    Err(e) => {
                        warn!("Reading scan results failed: {:?}", e);
                        event::post(&tx, RadioEvent::ScanDone(Vec::new()));
                    }
                },
                other => debug!("Unhandled WiFi event: {:?}", other),
            })
            .map_err(esp_err(RadioError::Init))?;

        let tx = events;
        let ip_sub = sysloop
            .subscribe::<IpEvent, _>(move |ev| {
                if let IpEvent::DhcpIpAssigned(assignment) = ev {
                    event::post(&tx, RadioEvent::GotAddress { ip: assignment.ip() });
                }
            })
            .map_err(esp_err(RadioError::Init))?;

        Ok(Self {
            wifi,
            mode: NetworkMode::Station,
            _wifi_sub: wifi_sub,
            _ip_sub: ip_sub,
        })
    }

    fn client_configuration(
        credentials: &WirelessCredentials,
    ) -> Result<ClientConfiguration, RadioError> {
        let ssid = credentials.network_name_lossy();
        let password = String::from_utf8_lossy(credentials.secret()).into_owned();
        Ok(ClientConfiguration {
            ssid: ssid
                .as_str()
                .try_into()
                .map_err(|_| RadioError::InvalidConfig("network name".into()))?,
            password: password
                .as_str()
                .try_into()
                .map_err(|_| RadioError::InvalidConfig("secret".into()))?,
            bssid: credentials.peer_address(),
            auth_method: if credentials.is_open() {
                AuthMethod::None
            } else {
                AuthMethod::WPA2Personal
            },
            ..Default::default()
        })
    }
}

impl WifiRadio for EspRadio {
    fn start(&mut self) -> Result<(), RadioError> {
        self.wifi.start().map_err(esp_err(RadioError::Init))
    }

    fn stop(&mut self) -> Result<(), RadioError> {
        self.wifi.stop().map_err(esp_err(RadioError::Rejected))
    }

    fn set_mode(&mut self, mode: NetworkMode) -> Result<(), RadioError> {
        self.mode = mode;
        let config = match mode {
            NetworkMode::Off => Configuration::None,
            NetworkMode::Station => Configuration::Client(ClientConfiguration::default()),
            NetworkMode::AccessPoint => {
                Configuration::AccessPoint(AccessPointConfiguration::default())
            }
            NetworkMode::StationAccessPoint => Configuration::Mixed(
                ClientConfiguration::default(),
                AccessPointConfiguration::default(),
            ),
        };
        self.wifi
            .set_configuration(&config)
            .map_err(esp_err(RadioError::InvalidConfig))
    }

    fn set_config(&mut self, credentials: &WirelessCredentials) -> Result<(), RadioError> {
        let client = Self::client_configuration(credentials)?;
        let config = match self.mode {
            NetworkMode::StationAccessPoint => {
                Configuration::Mixed(client, AccessPointConfiguration::default())
            }
            _ => Configuration::Client(client),
        };
        self.wifi
            .set_configuration(&config)
            .map_err(esp_err(RadioError::InvalidConfig))
    }

    fn join(&mut self) -> Result<(), RadioError> {
        self.wifi.connect().map_err(esp_err(RadioError::Rejected))
    }

    fn leave(&mut self) -> Result<(), RadioError> {
        self.wifi.disconnect().map_err(esp_err(RadioError::Rejected))
    }

    fn start_scan(&mut self) -> Result<(), RadioError> {
        // Returns at once; results are read when the driver reports scan-done.
        // SAFETY: a null config selects the driver's default all-channel scan.
        sys::esp!(unsafe { sys::esp_wifi_scan_start(std::ptr::null(), false) })
            .map_err(esp_err(RadioError::Rejected))
    }
}
