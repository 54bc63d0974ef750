//! BLE GATT link for provisioning.
//!
//! # GATT Service Structure
//!
//! ```text
//! Service: Provisioning
//! ├── Rx (Write)  - request frames from the peer
//! └── Tx (Notify) - reply frames to the peer
//! ```
//!
//! Frames in both directions are split into [`fragment`](super::fragment)s
//! sized to the negotiated ATT MTU. NimBLE callbacks run on the host task;
//! they only reassemble writes and post [`LinkEvent`]s.

use super::fragment::{Fragment, Fragmenter, Reassembler, DEFAULT_FRAGMENT_SIZE};
use super::session::{LinkError, LinkEvent, ProvisioningLink};
use crate::event::{self, EventSender};
use esp32_nimble::utilities::mutex::Mutex as NimbleMutex;
use esp32_nimble::utilities::BleUuid;
use esp32_nimble::{
    enums::{AuthReq, SecurityIOCap},
    uuid128, BLEAdvertisementData, BLECharacteristic, BLEDevice, NimbleProperties,
};
use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Provisioning service UUID.
const PROVISIONING_SERVICE_UUID: BleUuid = uuid128!("6e400001-b5a3-f393-e0a9-e50e24dcca9e");

/// Peer → node frames.
const RX_CHAR_UUID: BleUuid = uuid128!("6e400002-b5a3-f393-e0a9-e50e24dcca9e");

/// Node → peer frames.
const TX_CHAR_UUID: BleUuid = uuid128!("6e400003-b5a3-f393-e0a9-e50e24dcca9e");

/// ATT notification header (opcode + handle).
const ATT_NOTIFY_OVERHEAD: usize = 3;

/// A partially written frame is dropped after this long.
const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(5);

/// [`ProvisioningLink`] over a NimBLE GATT server.
pub struct BleLink {
    device: &'static BLEDevice,
    tx: Arc<NimbleMutex<BLECharacteristic>>,
    conn_handle: Arc<Mutex<Option<u16>>>,
    fragmenter: Fragmenter,
    name: String,
}

fn ble_err(e: esp32_nimble::BLEError) -> LinkError {
    LinkError::Io(format!("{:?}", e))
}

impl BleLink {
    /// Register the GATT service and wire callbacks into the event channel.
    pub fn new(name: &str, events: EventSender) -> Result<Self, LinkError> {
        let device = BLEDevice::take();
        device
            .security()
            .set_auth(AuthReq::Bond | AuthReq::Sc)
            .set_io_cap(SecurityIOCap::NoInputNoOutput);

        let server = device.get_server();
        let conn_handle = Arc::new(Mutex::new(None));
        let reassembler = Arc::new(Mutex::new(Reassembler::new(REASSEMBLY_TIMEOUT)));

        let handle = Arc::clone(&conn_handle);
        let tx_events = events.clone();
        server.on_connect(move |_server, desc| {
            if let Ok(mut h) = handle.lock() {
                *h = Some(desc.conn_handle());
            }
            event::post(&tx_events, LinkEvent::Linked);
        });

        let handle = Arc::clone(&conn_handle);
        let partial = Arc::clone(&reassembler);
        let tx_events = events.clone();
        server.on_disconnect(move |_desc, reason| {
            info!("BLE peer disconnected: {:?}", reason);
            if let Ok(mut h) = handle.lock() {
                *h = None;
            }
            if let Ok(mut r) = partial.lock() {
                r.clear();
            }
            event::post(&tx_events, LinkEvent::Unlinked);
        });

        let tx_events = events.clone();
        server.on_authentication_complete(move |_desc, result| {
            let event = match result {
                Ok(()) => LinkEvent::SecurityEstablished,
                Err(e) => {
                    warn!("BLE pairing failed: {:?}", e);
                    LinkEvent::SecurityFailed
                }
            };
            event::post(&tx_events, event);
        });

        let service = server.create_service(PROVISIONING_SERVICE_UUID);
        let rx = service
            .lock()
            .create_characteristic(RX_CHAR_UUID, NimbleProperties::WRITE | NimbleProperties::WRITE_ENC);
        let tx_events = events;
        rx.lock().on_write(move |args| {
            let fragment = match Fragment::from_bytes(args.recv_data()) {
                Ok(fragment) => fragment,
                Err(e) => {
                    warn!("Bad fragment from peer: {}", e);
                    return;
                }
            };
            let frame = match reassembler.lock() {
                Ok(mut r) => r.add(fragment),
                Err(_) => None,
            };
            if let Some(frame) = frame {
                event::post(&tx_events, LinkEvent::Frame(frame));
            }
        });
        let tx = service
            .lock()
            .create_characteristic(TX_CHAR_UUID, NimbleProperties::NOTIFY);

        let fragmenter =
            Fragmenter::new(DEFAULT_FRAGMENT_SIZE).map_err(|e| LinkError::Init(e.to_string()))?;

        Ok(Self {
            device,
            tx,
            conn_handle,
            fragmenter,
            name: name.to_string(),
        })
    }

    fn current_peer(&self) -> Option<u16> {
        self.conn_handle.lock().ok().and_then(|h| *h)
    }
}

impl ProvisioningLink for BleLink {
    fn start_advertising(&mut self) -> Result<(), LinkError> {
        let advertising = self.device.get_advertising();
        advertising
            .lock()
            .set_data(
                BLEAdvertisementData::new()
                    .name(&self.name)
                    .add_service_uuid(PROVISIONING_SERVICE_UUID),
            )
            .map_err(|e| LinkError::Init(format!("{:?}", e)))?;
        advertising.lock().start().map_err(ble_err)?;
        info!("BLE advertising as {}", self.name);
        Ok(())
    }

    fn stop_advertising(&mut self) -> Result<(), LinkError> {
        self.device.get_advertising().lock().stop().map_err(ble_err)
    }

    fn begin_security(&mut self) -> Result<(), LinkError> {
        let handle = self.current_peer().ok_or(LinkError::NotLinked)?;
        // SAFETY: `handle` was reported by the NimBLE host for a live connection.
        let rc = unsafe { esp_idf_sys::ble_gap_security_initiate(handle) };
        if rc == 0 {
            Ok(())
        } else {
            Err(LinkError::Io(format!("security initiate rc={}", rc)))
        }
    }

    fn disconnect(&mut self) -> Result<(), LinkError> {
        let handle = self.current_peer().ok_or(LinkError::NotLinked)?;
        self.device
            .get_server()
            .disconnect(handle)
            .map_err(ble_err)
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        let handle = self.current_peer().ok_or(LinkError::NotLinked)?;
        // SAFETY: `handle` was reported by the NimBLE host; 0 means no MTU yet.
        let mtu = unsafe { esp_idf_sys::ble_att_mtu(handle) } as usize;
        let size = mtu
            .saturating_sub(ATT_NOTIFY_OVERHEAD)
            .max(DEFAULT_FRAGMENT_SIZE);
        self.fragmenter
            .set_size(size)
            .map_err(|e| LinkError::Io(e.to_string()))?;

        let fragments = self
            .fragmenter
            .fragment(frame)
            .map_err(|e| LinkError::Io(e.to_string()))?;
        debug!("Sending {} bytes in {} fragments", frame.len(), fragments.len());
        for fragment in fragments {
            self.tx.lock().set_value(&fragment.to_bytes()).notify();
        }
        Ok(())
    }
}
