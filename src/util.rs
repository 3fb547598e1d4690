use std::fmt::{Display, Formatter};

use uuid::Uuid;

/// The Bluetooth base UUID, `00000000-0000-1000-8000-00805F9B34FB`. Short
/// (16 and 32 bit) assigned numbers are offsets into it.
pub const BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805F9B34FB;

/// Expands a 16-bit assigned number into its full 128-bit UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    uuid_from_u32(short as u32)
}

/// Expands a 32-bit assigned number into its full 128-bit UUID.
pub const fn uuid_from_u32(short: u32) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | BASE_UUID)
}

/// Identifies one attribute instance. The same UUID may occur more than once
/// in a peripheral's attribute table, so the instance discriminator is part
/// of the key.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct CompositeId {
    pub uuid: Uuid,
    pub instance: u32,
}

impl CompositeId {
    pub const fn new(uuid: Uuid, instance: u32) -> Self {
        CompositeId { uuid, instance }
    }
}

impl Display for CompositeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.uuid, self.instance)
    }
}

/// Identity of a scheduled operation. Only used to tell operations apart in
/// logs and for equality; never matched against transport events.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct OperationId(Uuid);

impl OperationId {
    pub fn new() -> Self {
        OperationId(Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for OperationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // the first group is plenty to tell operations apart in a log
        let simple = self.0.simple().to_string();
        write!(f, "{}", &simple[..8])
    }
}
