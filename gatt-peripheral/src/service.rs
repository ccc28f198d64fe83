use btuuid::BluetoothUuid;

use crate::characteristic::{Characteristic, CharacteristicId};

/// A local GATT service.
///
/// Build it up front, then hand it to
/// [`PeripheralManager::add_service()`](crate::PeripheralManager::add_service). Once published its
/// structure is fixed; only characteristic values change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    uuid: BluetoothUuid,
    is_primary: bool,
    characteristics: Vec<Characteristic>,
    included_services: Vec<BluetoothUuid>,
}

impl Service {
    pub fn new(uuid: BluetoothUuid, is_primary: bool) -> Self {
        Self {
            uuid,
            is_primary,
            characteristics: Vec::new(),
            included_services: Vec::new(),
        }
    }

    pub fn with_characteristic(mut self, characteristic: Characteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }

    /// Includes an already published service by UUID.
    pub fn with_included_service(mut self, uuid: BluetoothUuid) -> Self {
        self.included_services.push(uuid);
        self
    }

    pub fn uuid(&self) -> BluetoothUuid {
        self.uuid
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary
    }

    pub fn characteristics(&self) -> &[Characteristic] {
        &self.characteristics
    }

    pub fn included_services(&self) -> &[BluetoothUuid] {
        &self.included_services
    }

    pub fn characteristic(&self, uuid: BluetoothUuid) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| c.uuid() == uuid)
    }

    /// The session-wide identifier of this service's characteristic `uuid`.
    pub fn characteristic_id(&self, uuid: BluetoothUuid) -> CharacteristicId {
        CharacteristicId::new(self.uuid, uuid)
    }

    pub(crate) fn characteristic_mut(&mut self, uuid: BluetoothUuid) -> Option<&mut Characteristic> {
        self.characteristics.iter_mut().find(|c| c.uuid() == uuid)
    }

    pub(crate) fn characteristics_mut(&mut self) -> impl Iterator<Item = &mut Characteristic> {
        self.characteristics.iter_mut()
    }

    pub(crate) fn has_duplicate_characteristics(&self) -> bool {
        self.characteristics
            .iter()
            .enumerate()
            .any(|(i, c)| self.characteristics[..i].iter().any(|o| o.uuid() == c.uuid()))
    }

    pub(crate) fn includes(&self, uuid: BluetoothUuid) -> bool {
        self.included_services.contains(&uuid)
    }
}
