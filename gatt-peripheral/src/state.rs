use crate::advertisement_data::AdvertisementData;
use crate::service::Service;

/// The power state of a [`PeripheralManager`](crate::PeripheralManager).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagerState {
    /// State unknown, update imminent.
    #[default]
    Unknown,
    /// The connection with the system service was momentarily lost, update imminent.
    Resetting,
    /// The platform doesn't support the peripheral/server role.
    Unsupported,
    /// The application is not authorized to use the peripheral/server role.
    Unauthorized,
    /// Bluetooth is currently powered off.
    PoweredOff,
    /// Bluetooth is currently powered on and available to use.
    PoweredOn,
}

impl ManagerState {
    pub fn is_powered_on(self) -> bool {
        self == ManagerState::PoweredOn
    }

    /// Whether entering this state wipes the local database.
    ///
    /// Only `PoweredOn` and `PoweredOff` keep published services.
    pub fn clears_services(self) -> bool {
        !matches!(self, ManagerState::PoweredOn | ManagerState::PoweredOff)
    }
}

/// The desired latency of a connection to a central.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionLatency {
    /// Prioritizes rapid communication over battery life.
    Low,
    /// A balance between communication frequency and battery life.
    #[default]
    Medium,
    /// Prioritizes extending battery life over rapid communication.
    High,
}

/// Whether the application may share data while backgrounded.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthorizationStatus {
    #[default]
    NotDetermined,
    Restricted,
    Denied,
    Authorized,
}

/// State handed back by the system when a manager created with a restore identifier is relaunched.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RestoredState {
    /// Services that were published when the previous session ended.
    pub services: Vec<Service>,
    /// The advertisement that was active when the previous session ended.
    pub advertisement_data: Option<AdvertisementData>,
}
