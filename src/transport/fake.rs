//! Scripted in-memory driver for tests. Requests are recorded and answered
//! synchronously through the callback they were issued with.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::gatt::{
    Characteristic, CharacteristicProperty, Descriptor, Service, CLIENT_CHARACTERISTIC_CONFIG_UUID,
};
use crate::transport::{
    GattCallback, Link, LinkState, Permission, Request, ScanCallback, ScanFilter, ScanId,
    ScanResult, ScanSettings, Transport, TransportError,
};
use crate::util::{uuid_from_u16, CompositeId};
use crate::Address;

pub(crate) const GATT_ERROR: u16 = 133;
pub(crate) const MAX_MTU: u16 = 517;

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub(crate) fn heart_rate_service() -> Uuid {
    uuid_from_u16(0x180d)
}

pub(crate) fn heart_rate_measurement() -> Uuid {
    uuid_from_u16(0x2a37)
}

pub(crate) fn body_sensor_location() -> Uuid {
    uuid_from_u16(0x2a38)
}

pub(crate) fn heart_rate_control_point() -> Uuid {
    uuid_from_u16(0x2a39)
}

pub(crate) fn battery_service() -> Uuid {
    uuid_from_u16(0x180f)
}

pub(crate) fn battery_level() -> Uuid {
    uuid_from_u16(0x2a19)
}

/// A heart rate monitor: notifying measurement, readable sensor location,
/// writable control point, and an indicating battery level.
pub(crate) fn sample_services() -> Vec<Service> {
    let placeholder = CompositeId::new(Uuid::nil(), 0);

    vec![
        Service::new(heart_rate_service(), 1, true)
            .with_characteristic(
                Characteristic::new(
                    heart_rate_measurement(),
                    10,
                    placeholder,
                    CharacteristicProperty::Notify.into(),
                )
                .with_descriptor(CLIENT_CHARACTERISTIC_CONFIG_UUID),
            )
            .with_characteristic(Characteristic::new(
                body_sensor_location(),
                11,
                placeholder,
                CharacteristicProperty::Read.into(),
            ))
            .with_characteristic(Characteristic::new(
                heart_rate_control_point(),
                12,
                placeholder,
                CharacteristicProperty::Write.into(),
            )),
        Service::new(battery_service(), 2, true).with_characteristic(
            Characteristic::new(
                battery_level(),
                20,
                placeholder,
                CharacteristicProperty::Read | CharacteristicProperty::Indicate,
            )
            .with_descriptor(CLIENT_CHARACTERISTIC_CONFIG_UUID),
        ),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LinkCall {
    DiscoverServices,
    ReadCharacteristic(CompositeId),
    WriteCharacteristic(CompositeId, Vec<u8>),
    ReadDescriptor(Uuid),
    WriteDescriptor(Uuid, Vec<u8>),
    SetNotification(CompositeId, bool),
    RequestMtu(u16),
    Disconnect,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    StartScan(ScanId),
    StopScan(ScanId),
    Connect(Address),
    ConnectionState(Address),
    ConnectedDevices,
    DeviceName(Address),
}

type CallLog<T> = Arc<Mutex<Vec<T>>>;

struct FakeState {
    calls: Vec<Call>,
    adapter_enabled: bool,
    location_enabled: bool,
    platform_version: u32,
    missing: Vec<Permission>,
    connect_failures: usize,
    discover_failures: usize,
    hold_connects: bool,
    hold_reads: bool,
    fail_descriptor_writes: bool,
    reject_notifications: bool,
    services: Vec<Service>,
    values: HashMap<CompositeId, Bytes>,
    descriptor_values: HashMap<Uuid, Bytes>,
    names: HashMap<Address, String>,
    connected: HashMap<Address, GattCallback>,
    link_logs: HashMap<Address, CallLog<LinkCall>>,
    scans: HashMap<ScanId, ScanCallback>,
}

#[derive(Clone)]
pub(crate) struct FakeTransport {
    state: Arc<Mutex<FakeState>>,
}

impl FakeTransport {
    /// A powered adapter on a recent platform with every permission granted.
    pub fn new() -> Self {
        FakeTransport {
            state: Arc::new(Mutex::new(FakeState {
                calls: Vec::new(),
                adapter_enabled: true,
                location_enabled: true,
                platform_version: 33,
                missing: Vec::new(),
                connect_failures: 0,
                discover_failures: 0,
                hold_connects: false,
                hold_reads: false,
                fail_descriptor_writes: false,
                reject_notifications: false,
                services: sample_services(),
                values: HashMap::new(),
                descriptor_values: HashMap::new(),
                names: HashMap::new(),
                connected: HashMap::new(),
                link_logs: HashMap::new(),
                scans: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn link_calls(&self, address: Address) -> Vec<LinkCall> {
        match self.lock().link_logs.get(&address) {
            Some(log) => log.lock().unwrap().clone(),
            None => Vec::new(),
        }
    }

    pub fn count_link_calls(&self, address: Address, call: &LinkCall) -> usize {
        self.link_calls(address).iter().filter(|c| *c == call).count()
    }

    pub fn set_adapter_enabled(&self, enabled: bool) {
        self.lock().adapter_enabled = enabled;
    }

    pub fn set_location_enabled(&self, enabled: bool) {
        self.lock().location_enabled = enabled;
    }

    pub fn set_platform_version(&self, version: u32) {
        self.lock().platform_version = version;
    }

    pub fn set_missing_permissions(&self, missing: Vec<Permission>) {
        self.lock().missing = missing;
    }

    /// The next `count` connects end with an error-coded disconnection.
    pub fn fail_connects(&self, count: usize) {
        self.lock().connect_failures = count;
    }

    /// The next `count` service discoveries report a GATT error.
    pub fn fail_discoveries(&self, count: usize) {
        self.lock().discover_failures = count;
    }

    /// Connects are recorded but the link never comes up.
    pub fn hold_connects(&self, hold: bool) {
        self.lock().hold_connects = hold;
    }

    /// Reads are recorded but never answered.
    pub fn hold_reads(&self, hold: bool) {
        self.lock().hold_reads = hold;
    }

    /// Descriptor writes are answered with a GATT error.
    pub fn fail_descriptor_writes(&self, fail: bool) {
        self.lock().fail_descriptor_writes = fail;
    }

    pub fn reject_notifications(&self, reject: bool) {
        self.lock().reject_notifications = reject;
    }

    pub fn set_value(&self, characteristic: CompositeId, value: impl Into<Bytes>) {
        self.lock().values.insert(characteristic, value.into());
    }

    pub fn set_descriptor_value(&self, descriptor: Uuid, value: impl Into<Bytes>) {
        self.lock().descriptor_values.insert(descriptor, value.into());
    }

    pub fn set_name(&self, address: Address, name: &str) {
        self.lock().names.insert(address, name.to_owned());
    }

    /// Marks `address` as connected without any link of ours.
    pub fn set_connected_elsewhere(&self, address: Address, callback: GattCallback) {
        self.lock().connected.insert(address, callback);
    }

    pub fn is_connected(&self, address: Address) -> bool {
        self.lock().connected.contains_key(&address)
    }

    /// The peripheral drops the link.
    pub fn drop_link(&self, address: Address, status: u16) {
        let callback = self.lock().connected.remove(&address);
        if let Some(callback) = callback {
            callback.on_connection_state_changed(status, LinkState::Disconnected);
        }
    }

    pub fn notify(&self, address: Address, characteristic: CompositeId, value: impl Into<Bytes>) {
        let callback = self.lock().connected.get(&address).cloned();
        if let Some(callback) = callback {
            callback.on_characteristic_changed(characteristic, value);
        }
    }

    pub fn active_scans(&self) -> Vec<ScanId> {
        self.lock().scans.keys().copied().collect()
    }

    pub fn scan_result(&self, result: ScanResult) {
        let callbacks: Vec<_> = self.lock().scans.values().cloned().collect();
        for callback in callbacks {
            callback.on_scan_result(result.clone());
        }
    }

    pub fn scan_failed(&self, code: i32) {
        let callbacks: Vec<_> = self.lock().scans.values().cloned().collect();
        for callback in callbacks {
            callback.on_scan_failed(code);
        }
    }
}

impl Transport for FakeTransport {
    fn is_adapter_enabled(&self) -> bool {
        self.lock().adapter_enabled
    }

    fn is_location_enabled(&self) -> bool {
        self.lock().location_enabled
    }

    fn platform_version(&self) -> u32 {
        self.lock().platform_version
    }

    fn missing_permissions(&self, permissions: &[Permission]) -> Vec<Permission> {
        let state = self.lock();
        permissions
            .iter()
            .filter(|p| state.missing.contains(p))
            .copied()
            .collect()
    }

    fn device_name(&self, address: Address) -> Result<Option<String>, TransportError> {
        let mut state = self.lock();
        state.calls.push(Call::DeviceName(address));
        Ok(state.names.get(&address).cloned())
    }

    fn start_scan(
        &self,
        _filters: &[ScanFilter],
        _settings: &ScanSettings,
        callback: ScanCallback,
    ) -> Request {
        let mut state = self.lock();
        state.calls.push(Call::StartScan(callback.id()));
        if !state.adapter_enabled {
            return Err(TransportError::AdapterUnavailable);
        }
        state.scans.insert(callback.id(), callback);
        Ok(())
    }

    fn stop_scan(&self, scan: ScanId) -> Request {
        let mut state = self.lock();
        state.calls.push(Call::StopScan(scan));
        state.scans.remove(&scan);
        Ok(())
    }

    fn connect(
        &self,
        address: Address,
        _auto_connect: bool,
        callback: GattCallback,
    ) -> Result<Box<dyn Link>, TransportError> {
        let (log, fail, hold) = {
            let mut state = self.lock();
            state.calls.push(Call::Connect(address));

            if !state.adapter_enabled {
                return Err(TransportError::AdapterUnavailable);
            }
            if state.missing.contains(&Permission::BluetoothConnect) {
                return Err(TransportError::PermissionDenied {
                    missing: vec![Permission::BluetoothConnect],
                });
            }

            let hold = state.hold_connects;
            let fail = !hold && state.connect_failures > 0;
            if fail {
                state.connect_failures -= 1;
            } else if !hold {
                state.connected.insert(address, callback.clone());
            }

            let log = state.link_logs.entry(address).or_default().clone();
            (log, fail, hold)
        };

        if hold {
            callback.on_connection_state_changed(0, LinkState::Connecting);
        } else if fail {
            callback.on_connection_state_changed(GATT_ERROR, LinkState::Disconnected);
        } else {
            callback.on_connection_state_changed(0, LinkState::Connecting);
            callback.on_connection_state_changed(0, LinkState::Connected);
        }

        Ok(Box::new(FakeLink {
            address,
            calls: log,
            transport: Some(self.clone()),
            callback: Some(callback),
        }))
    }

    fn connection_state(&self, address: Address) -> Result<LinkState, TransportError> {
        let mut state = self.lock();
        state.calls.push(Call::ConnectionState(address));
        Ok(if state.connected.contains_key(&address) {
            LinkState::Connected
        } else {
            LinkState::Disconnected
        })
    }

    fn connected_devices(&self) -> Result<Vec<Address>, TransportError> {
        let mut state = self.lock();
        state.calls.push(Call::ConnectedDevices);
        let mut addresses: Vec<_> = state.connected.keys().copied().collect();
        addresses.sort();
        Ok(addresses)
    }
}

pub(crate) struct FakeLink {
    address: Address,
    calls: CallLog<LinkCall>,
    transport: Option<FakeTransport>,
    callback: Option<GattCallback>,
}

impl FakeLink {
    /// A link that records requests and never answers them.
    pub fn detached(address: Address) -> (Self, CallLog<LinkCall>) {
        let calls = CallLog::default();
        let link = FakeLink {
            address,
            calls: calls.clone(),
            transport: None,
            callback: None,
        };
        (link, calls)
    }

    fn record(&self, call: LinkCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn respond<F>(&self, respond: F)
    where
        F: FnOnce(&FakeTransport, &GattCallback),
    {
        if let (Some(transport), Some(callback)) = (&self.transport, &self.callback) {
            respond(transport, callback);
        }
    }
}

impl Link for FakeLink {
    fn address(&self) -> Address {
        self.address
    }

    fn discover_services(&self) -> Request {
        self.record(LinkCall::DiscoverServices);
        self.respond(|transport, callback| {
            let (fail, services) = {
                let mut state = transport.lock();
                let fail = state.discover_failures > 0;
                if fail {
                    state.discover_failures -= 1;
                }
                (fail, state.services.clone())
            };

            if fail {
                callback.on_services_discovered(GATT_ERROR, Vec::new());
            } else {
                callback.on_services_discovered(0, services);
            }
        });
        Ok(())
    }

    fn read_characteristic(&self, characteristic: &Characteristic) -> Request {
        let id = characteristic.id();
        self.record(LinkCall::ReadCharacteristic(id));
        self.respond(|transport, callback| {
            let (hold, value) = {
                let state = transport.lock();
                (state.hold_reads, state.values.get(&id).cloned().unwrap_or_default())
            };
            if !hold {
                callback.on_characteristic_read(0, id, value);
            }
        });
        Ok(())
    }

    fn write_characteristic(&self, characteristic: &Characteristic, value: &[u8]) -> Request {
        let id = characteristic.id();
        self.record(LinkCall::WriteCharacteristic(id, value.to_vec()));
        self.respond(|_, callback| callback.on_characteristic_write(0, id, value.to_vec()));
        Ok(())
    }

    fn read_descriptor(&self, descriptor: &Descriptor) -> Request {
        let uuid = descriptor.uuid;
        self.record(LinkCall::ReadDescriptor(uuid));
        self.respond(|transport, callback| {
            let value = transport
                .lock()
                .descriptor_values
                .get(&uuid)
                .cloned()
                .unwrap_or_default();
            callback.on_descriptor_read(0, uuid, value);
        });
        Ok(())
    }

    fn write_descriptor(&self, descriptor: &Descriptor, value: &[u8]) -> Request {
        let uuid = descriptor.uuid;
        self.record(LinkCall::WriteDescriptor(uuid, value.to_vec()));
        self.respond(|transport, callback| {
            let status = if transport.lock().fail_descriptor_writes {
                GATT_ERROR
            } else {
                0
            };
            callback.on_descriptor_write(status, uuid, value.to_vec());
        });
        Ok(())
    }

    fn set_characteristic_notification(
        &self,
        characteristic: &Characteristic,
        enable: bool,
    ) -> Request {
        self.record(LinkCall::SetNotification(characteristic.id(), enable));
        match &self.transport {
            Some(transport) if transport.lock().reject_notifications => {
                Err(TransportError::Rejected)
            }
            _ => Ok(()),
        }
    }

    fn request_mtu(&self, mtu: u16) -> Request {
        self.record(LinkCall::RequestMtu(mtu));
        self.respond(|_, callback| callback.on_mtu_changed(0, mtu.min(MAX_MTU)));
        Ok(())
    }

    fn disconnect(&self) -> Request {
        self.record(LinkCall::Disconnect);
        self.respond(|transport, callback| {
            transport.lock().connected.remove(&self.address);
            callback.on_connection_state_changed(0, LinkState::Disconnecting);
            callback.on_connection_state_changed(0, LinkState::Disconnected);
        });
        Ok(())
    }

    fn close(&self) {
        self.record(LinkCall::Close);
        if let Some(transport) = &self.transport {
            transport.lock().connected.remove(&self.address);
        }
    }
}
