use btuuid::BluetoothUuid;

/// Data to include in the advertisement started by
/// [`PeripheralManager::start_advertising()`](crate::PeripheralManager::start_advertising).
///
/// Only the local name and the list of service UUIDs may be advertised by a peripheral.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AdvertisementData {
    /// The (possibly shortened) local name of the device (CSS §A.1.2)
    pub local_name: Option<String>,
    /// Advertised GATT service UUIDs (CSS §A.1.1)
    pub service_uuids: Vec<BluetoothUuid>,
}

impl AdvertisementData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_local_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self
    }

    pub fn with_service_uuid(mut self, uuid: BluetoothUuid) -> Self {
        self.service_uuids.push(uuid);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.local_name.is_none() && self.service_uuids.is_empty()
    }
}
