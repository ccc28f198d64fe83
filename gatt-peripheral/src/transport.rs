//! The seams between a [`PeripheralManager`] and the layers below it.
//!
//! Outbound, the manager drives a [`Transport`]: the shared GATT database, the advertiser and
//! the ATT bearer. Inbound, the power/radio layer and the transport report back through a
//! [`Link`].

use std::any::Any;
use std::rc::Weak;

use btuuid::BluetoothUuid;
use uuid::Uuid;

use crate::advertisement_data::AdvertisementData;
use crate::central::Central;
use crate::characteristic::CharacteristicId;
use crate::error::{AttError, Error};
use crate::notify_queue::Notification;
use crate::options::DEFAULT_MAX_UPDATE_VALUE_LEN;
use crate::peripheral_manager::{Inner, PeripheralManager};
use crate::request::{AttRequest, RequestId};
use crate::service::Service;
use crate::state::{AuthorizationStatus, ConnectionLatency, ManagerState, RestoredState};

/// Everything the manager asks of the system below it.
///
/// All methods are called on the manager's own context and must not block. Implementations may
/// report outcomes synchronously through their [`Link`]; those reports are queued and delivered
/// once the current call returns.
#[allow(unused_variables)]
pub trait Transport: Any {
    /// Adds a service to the shared GATT database.
    fn publish_service(&self, service: &Service) {}

    /// Removes a service from the shared GATT database.
    fn unpublish_service(&self, uuid: BluetoothUuid) {}

    /// Removes every service this manager published.
    fn unpublish_all_services(&self) {}

    /// Starts (or restarts with new data) advertising. The outcome must be reported through
    /// [`Link::advertising_started()`].
    fn start_advertising(&self, data: &AdvertisementData) {}

    fn stop_advertising(&self) {}

    /// Best-effort connection latency hint.
    fn set_desired_connection_latency(&self, central: &Central, latency: ConnectionLatency) {}

    /// Sends the answer for a read request or a write batch.
    fn send_response(&self, request: &AttRequest, result: AttError) {}

    /// The outbound queue went from empty to non-empty; call [`Link::drain_notifications()`].
    fn notifications_pending(&self) {}

    /// Bluetooth was powered off and the manager was created with
    /// [`show_power_alert`](crate::PeripheralManagerOptions::show_power_alert) set; ask the
    /// user to turn it back on.
    fn show_power_alert(&self) {}
}

/// A write received from a central, before it becomes part of an [`AttRequest`] batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingWrite {
    pub characteristic: CharacteristicId,
    pub offset: usize,
    pub value: Vec<u8>,
}

impl IncomingWrite {
    pub fn new(characteristic: CharacteristicId, value: impl Into<Vec<u8>>) -> Self {
        Self {
            characteristic,
            offset: 0,
            value: value.into(),
        }
    }

    pub fn at_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// The entry points through which the power/radio layer and the transport drive a
/// [`PeripheralManager`].
///
/// A `Link` does not keep the manager alive. Once the manager is gone every call is a no-op.
/// Each call delivers all queued delegate events before it returns, unless it is made from
/// inside a delegate callback or manager call, in which case delivery happens when that
/// outer call finishes.
#[derive(Clone)]
pub struct Link {
    pub(crate) inner: Weak<Inner>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("attached", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl Link {
    /// The manager this link feeds, if it still exists.
    pub fn manager(&self) -> Option<PeripheralManager> {
        self.inner.upgrade().map(PeripheralManager::from_inner)
    }

    fn with_manager<R: Default>(&self, func: impl FnOnce(&PeripheralManager) -> R) -> R {
        let Some(manager) = self.manager() else {
            tracing::trace!("link used after its peripheral manager was dropped");
            return R::default();
        };
        let ret = func(&manager);
        manager.dispatch_pending();
        ret
    }

    /// Describes a newly connected central that has not negotiated a larger MTU.
    pub fn central(&self, identifier: Uuid) -> Central {
        let max_update_value_len = self
            .manager()
            .map_or(DEFAULT_MAX_UPDATE_VALUE_LEN, |manager| {
                manager.options().default_max_update_value_len
            });
        Central::new(identifier, max_update_value_len)
    }

    /// Reports a power state change.
    pub fn update_state(&self, state: ManagerState) {
        self.with_manager(|manager| manager.handle_state_update(state))
    }

    /// Reports the application's background authorization.
    pub fn set_authorization(&self, status: AuthorizationStatus) {
        self.with_manager(|manager| manager.handle_authorization(status))
    }

    /// Reports the outcome of the last [`Transport::start_advertising()`] call.
    pub fn advertising_started(&self, error: Option<Error>) {
        self.with_manager(|manager| manager.handle_advertising_started(error))
    }

    /// A central enabled notifications or indications on a characteristic.
    pub fn subscribe(&self, central: Central, characteristic: CharacteristicId) {
        self.with_manager(|manager| manager.handle_subscribe(central, characteristic))
    }

    /// A central disabled notifications or indications on a characteristic.
    pub fn unsubscribe(&self, central: &Central, characteristic: CharacteristicId) {
        self.with_manager(|manager| manager.handle_unsubscribe(central, characteristic))
    }

    /// A central disconnected; all of its subscriptions end.
    pub fn disconnect(&self, central: &Central) {
        self.with_manager(|manager| manager.handle_disconnect(central))
    }

    /// A central read a characteristic value.
    ///
    /// Returns the id the answer will carry, or `None` if the request was rejected (and
    /// answered) without involving the delegate.
    pub fn read_request(
        &self,
        central: Central,
        characteristic: CharacteristicId,
        offset: usize,
    ) -> Option<RequestId> {
        self.with_manager(|manager| manager.handle_read_request(central, characteristic, offset))
    }

    /// A central wrote one or more characteristic values as one atomic batch.
    ///
    /// Returns the id the answer will carry, or `None` if the batch was empty or rejected
    /// without involving the delegate.
    pub fn write_requests(
        &self,
        central: Central,
        writes: impl IntoIterator<Item = IncomingWrite>,
    ) -> Option<RequestId> {
        let writes: Vec<_> = writes.into_iter().collect();
        self.with_manager(|manager| manager.handle_write_requests(central, writes))
    }

    /// Takes up to `max` notifications off the outbound queue for transmission.
    pub fn drain_notifications(&self, max: usize) -> Vec<Notification> {
        self.with_manager(|manager| manager.handle_drain(max))
    }

    /// Hands back the state preserved for this manager's restore identifier.
    pub fn restore_state(&self, state: RestoredState) {
        self.with_manager(|manager| manager.handle_restore(state))
    }
}
