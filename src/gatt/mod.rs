//! The attribute model of a connected peripheral: services, their
//! characteristics and the descriptors configuring those.

use enumflags2::{bitflags, BitFlags};
use uuid::Uuid;

use crate::result::{Error, Result};
use crate::util::{uuid_from_u16, CompositeId};

/// Client Characteristic Configuration descriptor.
pub const CLIENT_CHARACTERISTIC_CONFIG_UUID: Uuid = uuid_from_u16(0x2902);

pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// Smallest ATT MTU every link supports.
pub const MIN_MTU: u16 = 23;
/// Bytes of every ATT packet taken up by the opcode and handle.
pub const MTU_ATT_OVERHEAD: u16 = 3;
pub const MIN_MTU_PAYLOAD_LENGTH: u16 = MIN_MTU - MTU_ATT_OVERHEAD;

#[bitflags]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CharacteristicProperty {
    Broadcast = 1 << 0,
    Read = 1 << 1,
    WriteWithoutResponse = 1 << 2,
    Write = 1 << 3,
    Notify = 1 << 4,
    Indicate = 1 << 5,
    AuthenticatedSignedWrites = 1 << 6,
    ExtendedProperties = 1 << 7,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub uuid: Uuid,
    /// The characteristic this descriptor belongs to.
    pub characteristic: CompositeId,
}

impl Descriptor {
    pub fn new(uuid: Uuid, characteristic: CompositeId) -> Self {
        Descriptor {
            uuid,
            characteristic,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub instance: u32,
    pub service: CompositeId,
    pub properties: BitFlags<CharacteristicProperty>,
    pub descriptors: Vec<Descriptor>,
}

impl Characteristic {
    pub fn new(
        uuid: Uuid,
        instance: u32,
        service: CompositeId,
        properties: BitFlags<CharacteristicProperty>,
    ) -> Self {
        Characteristic {
            uuid,
            instance,
            service,
            properties,
            descriptors: Vec::new(),
        }
    }

    /// Adds a descriptor owned by this characteristic.
    pub fn with_descriptor(mut self, uuid: Uuid) -> Self {
        self.descriptors.push(Descriptor::new(uuid, self.id()));
        self
    }

    pub fn id(&self) -> CompositeId {
        CompositeId::new(self.uuid, self.instance)
    }

    pub fn is_readable(&self) -> bool {
        self.properties.contains(CharacteristicProperty::Read)
    }

    pub fn is_writable(&self) -> bool {
        self.properties.intersects(
            CharacteristicProperty::Write | CharacteristicProperty::WriteWithoutResponse,
        )
    }

    pub fn is_notifiable(&self) -> bool {
        self.properties
            .intersects(CharacteristicProperty::Notify | CharacteristicProperty::Indicate)
    }

    pub fn descriptor(&self, uuid: Uuid) -> Result<&Descriptor> {
        self.descriptors
            .iter()
            .find(|d| d.uuid == uuid)
            .ok_or(Error::DescriptorNotFound { uuid })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub uuid: Uuid,
    pub instance: u32,
    pub primary: bool,
    pub characteristics: Vec<Characteristic>,
}

impl Service {
    pub fn new(uuid: Uuid, instance: u32, primary: bool) -> Self {
        Service {
            uuid,
            instance,
            primary,
            characteristics: Vec::new(),
        }
    }

    pub fn id(&self) -> CompositeId {
        CompositeId::new(self.uuid, self.instance)
    }

    /// Adds a characteristic to this service, pointing it back at the service.
    pub fn with_characteristic(mut self, mut characteristic: Characteristic) -> Self {
        characteristic.service = self.id();
        let id = characteristic.id();
        for descriptor in characteristic.descriptors.iter_mut() {
            descriptor.characteristic = id;
        }
        self.characteristics.push(characteristic);
        self
    }

    pub fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic> {
        self.characteristics
            .iter()
            .find(|c| c.uuid == uuid)
            .ok_or(Error::CharacteristicNotFound { uuid })
    }
}

/// Snapshot of a peripheral's attribute table, taken when service discovery
/// last completed. Every lookup fails with a `*NotFound` error rather than
/// returning nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Services {
    services: Vec<Service>,
}

impl Services {
    pub fn new(services: Vec<Service>) -> Self {
        Services { services }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Service> {
        self.services.iter()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn service(&self, uuid: Uuid) -> Result<&Service> {
        self.services
            .iter()
            .find(|s| s.uuid == uuid)
            .ok_or(Error::ServiceNotFound { uuid })
    }

    /// Finds a characteristic in any service.
    pub fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic> {
        self.services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.uuid == uuid)
            .ok_or(Error::CharacteristicNotFound { uuid })
    }

    pub fn characteristic_in(&self, service: Uuid, characteristic: Uuid) -> Result<&Characteristic> {
        self.service(service)?.characteristic(characteristic)
    }

    pub fn descriptor(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> Result<&Descriptor> {
        self.characteristic_in(service, characteristic)?
            .descriptor(descriptor)
    }
}

impl From<Vec<Service>> for Services {
    fn from(services: Vec<Service>) -> Self {
        Services::new(services)
    }
}
