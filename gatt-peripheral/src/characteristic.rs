use std::ops::{BitOr, BitOrAssign};

use btuuid::BluetoothUuid;

use crate::central::Central;

/// The maximum length of an attribute value (Core Specification Vol 3, Part F, §3.2.9).
pub const MAX_ATTRIBUTE_VALUE_LEN: usize = 512;

/// Session-wide address of a characteristic: its service's UUID plus its own UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicId {
    pub service: BluetoothUuid,
    pub characteristic: BluetoothUuid,
}

impl CharacteristicId {
    pub fn new(service: BluetoothUuid, characteristic: BluetoothUuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }
}

/// Characteristic properties, as exposed in the characteristic declaration.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicProperties(pub u8);

impl CharacteristicProperties {
    pub const BROADCAST: Self = Self(0x01);
    pub const READ: Self = Self(0x02);
    pub const WRITE_WITHOUT_RESPONSE: Self = Self(0x04);
    pub const WRITE: Self = Self(0x08);
    pub const NOTIFY: Self = Self(0x10);
    pub const INDICATE: Self = Self(0x20);
    pub const AUTHENTICATED_SIGNED_WRITES: Self = Self(0x40);
    pub const EXTENDED_PROPERTIES: Self = Self(0x80);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for CharacteristicProperties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for CharacteristicProperties {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Read and write permissions of a characteristic value.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttributePermissions(pub u8);

impl AttributePermissions {
    pub const READABLE: Self = Self(0x01);
    pub const WRITEABLE: Self = Self(0x02);
    pub const READ_ENCRYPTION_REQUIRED: Self = Self(0x04);
    pub const WRITE_ENCRYPTION_REQUIRED: Self = Self(0x08);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for AttributePermissions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A characteristic of a local service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    uuid: BluetoothUuid,
    properties: CharacteristicProperties,
    permissions: AttributePermissions,
    value: Option<Vec<u8>>,
    max_value_len: usize,
    subscribed_centrals: Vec<Central>,
}

impl Characteristic {
    pub fn new(
        uuid: BluetoothUuid,
        properties: CharacteristicProperties,
        permissions: AttributePermissions,
    ) -> Self {
        Self {
            uuid,
            properties,
            permissions,
            value: None,
            max_value_len: MAX_ATTRIBUTE_VALUE_LEN,
            subscribed_centrals: Vec::new(),
        }
    }

    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Limits the value to `len` bytes. Writes beyond it are rejected.
    pub fn with_max_value_len(mut self, len: usize) -> Self {
        self.max_value_len = len.min(MAX_ATTRIBUTE_VALUE_LEN);
        self
    }

    pub fn uuid(&self) -> BluetoothUuid {
        self.uuid
    }

    pub fn properties(&self) -> CharacteristicProperties {
        self.properties
    }

    pub fn permissions(&self) -> AttributePermissions {
        self.permissions
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    pub fn max_value_len(&self) -> usize {
        self.max_value_len
    }

    /// The centrals currently subscribed to notifications or indications.
    pub fn subscribed_centrals(&self) -> &[Central] {
        &self.subscribed_centrals
    }

    pub fn is_readable(&self) -> bool {
        self.properties.contains(CharacteristicProperties::READ)
            && self.permissions.intersects(
                AttributePermissions::READABLE | AttributePermissions::READ_ENCRYPTION_REQUIRED,
            )
    }

    pub fn is_writable(&self) -> bool {
        self.properties.intersects(
            CharacteristicProperties::WRITE | CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
        ) && self.permissions.intersects(
            AttributePermissions::WRITEABLE | AttributePermissions::WRITE_ENCRYPTION_REQUIRED,
        )
    }

    pub fn can_notify(&self) -> bool {
        self.properties.intersects(
            CharacteristicProperties::NOTIFY | CharacteristicProperties::INDICATE,
        )
    }

    pub(crate) fn set_value(&mut self, value: Vec<u8>) {
        self.value = Some(value);
    }

    pub(crate) fn subscribe(&mut self, central: Central) -> bool {
        if self.subscribed_centrals.contains(&central) {
            false
        } else {
            self.subscribed_centrals.push(central);
            true
        }
    }

    pub(crate) fn unsubscribe(&mut self, central: &Central) -> bool {
        let before = self.subscribed_centrals.len();
        self.subscribed_centrals.retain(|c| c != central);
        self.subscribed_centrals.len() != before
    }

    pub(crate) fn clear_subscriptions(&mut self) {
        self.subscribed_centrals.clear();
    }
}
