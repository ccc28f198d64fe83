/// Default capacity of the outbound notification queue.
pub const DEFAULT_NOTIFICATION_QUEUE_CAPACITY: usize = 16;

/// Default notification payload limit for a central: an ATT MTU of 23 minus the 3 byte header.
pub const DEFAULT_MAX_UPDATE_VALUE_LEN: usize = 20;

/// Options for creating a [`PeripheralManager`](crate::PeripheralManager).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralManagerOptions {
    /// How many notifications may wait for the transport before `update_value` reports backpressure.
    pub notification_queue_capacity: usize,
    /// Payload limit used for centrals that did not negotiate a larger MTU.
    pub default_max_update_value_len: usize,
    /// Whether to warn the user when Bluetooth is powered off, through
    /// [`Transport::show_power_alert()`](crate::Transport::show_power_alert).
    pub show_power_alert: bool,
    /// Enables state restoration under this identifier.
    pub restore_id: Option<String>,
}

impl Default for PeripheralManagerOptions {
    fn default() -> Self {
        Self {
            notification_queue_capacity: DEFAULT_NOTIFICATION_QUEUE_CAPACITY,
            default_max_update_value_len: DEFAULT_MAX_UPDATE_VALUE_LEN,
            show_power_alert: false,
            restore_id: None,
        }
    }
}

impl PeripheralManagerOptions {
    pub fn with_notification_queue_capacity(mut self, capacity: usize) -> Self {
        self.notification_queue_capacity = capacity;
        self
    }

    pub fn with_default_max_update_value_len(mut self, len: usize) -> Self {
        self.default_max_update_value_len = len;
        self
    }

    pub fn with_show_power_alert(mut self, show_power_alert: bool) -> Self {
        self.show_power_alert = show_power_alert;
        self
    }

    pub fn with_restore_id(mut self, restore_id: impl Into<String>) -> Self {
        self.restore_id = Some(restore_id.into());
        self
    }
}
