use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ops::Deref;

use btuuid::BluetoothUuid;
use futures_channel::{mpsc, oneshot};
use gatt_peripheral::advertisement_data::AdvertisementData;
use gatt_peripheral::{
    AttError, AttRequest, Central, CharacteristicId, Link, ManagerState, PeripheralManager,
    PeripheralManagerOptions, RestoredState, Service, Transport,
};
use serial_executor::Executor;

use crate::error::{ErrorKind, Result};
use crate::util::{BroadcastReceiver, BroadcastSender, Exclusive, broadcast, defer, watch};

/// An asynchronous wrapper around a [`PeripheralManager`].
///
/// Futures returned by this type must be polled on the manager's own context, e.g. with
/// [`Executor::spawn_local()`] for a background manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralManagerAsync {
    inner: PeripheralManager,
}

impl Deref for PeripheralManagerAsync {
    type Target = PeripheralManager;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl PeripheralManagerAsync {
    pub fn background<F, R>(
        label: &str,
        options: PeripheralManagerOptions,
        transport: impl FnOnce(Link, &Executor) -> Box<dyn Transport> + Send,
        func: F,
    ) -> R
    where
        F: FnOnce(Self, &Executor) -> R + Send,
        R: Send,
    {
        PeripheralManager::background(
            label,
            options,
            |_| Box::new(PeripheralManagerAsyncDelegate::new()),
            transport,
            |inner, executor| {
                let manager = Self { inner };
                func(manager, executor)
            },
        )
    }

    /// Creates a manager driven by the calling context.
    pub fn new(
        options: PeripheralManagerOptions,
        transport: impl FnOnce(Link) -> Box<dyn Transport>,
    ) -> Self {
        let inner = PeripheralManager::new(
            options,
            Box::new(PeripheralManagerAsyncDelegate::new()),
            transport,
        );
        Self { inner }
    }

    /// Wraps an existing `PeripheralManager`.
    ///
    /// # Panics
    ///
    /// This will panic if the delegate of the `PeripheralManager` is not the one created by this
    /// crate.
    pub fn from_manager(inner: PeripheralManager) -> Self {
        let delegate: &dyn Any = inner.delegate();
        assert!(delegate.is::<PeripheralManagerAsyncDelegate>());
        Self { inner }
    }

    fn delegate(&self) -> &PeripheralManagerAsyncDelegate {
        let delegate: &dyn Any = self.inner.delegate();
        match delegate.downcast_ref() {
            Some(delegate) => delegate,
            None => unreachable!("PeripheralManagerAsync always installs its own delegate"),
        }
    }

    pub fn state_updates(&self) -> BroadcastReceiver<ManagerState> {
        self.delegate().state_updates()
    }

    /// Waits until the manager is powered on.
    ///
    /// Fails with [`ErrorKind::NotReady`] if the platform reports that the peripheral role is
    /// unsupported or unauthorized.
    pub async fn wait_powered_on(&self) -> Result<()> {
        let mut updates = self.delegate().state_updates();
        let mut state = self.inner.state();
        loop {
            match state {
                ManagerState::PoweredOn => return Ok(()),
                ManagerState::Unsupported | ManagerState::Unauthorized => {
                    return Err(ErrorKind::NotReady.into());
                }
                _ => {
                    state = match updates.recv().await {
                        Ok(state) => state,
                        Err(async_broadcast::RecvError::Overflowed(_)) => self.inner.state(),
                        Err(err) => return Err(err.into()),
                    }
                }
            }
        }
    }

    /// The state handed back by the system when the manager was relaunched, if any.
    pub fn take_restored_state(&self) -> Option<RestoredState> {
        self.delegate().restored_state.take()
    }

    /// Publishes a service and waits for the outcome.
    pub async fn add_service(&self, service: Service) -> Result<()> {
        let receiver = self.delegate().register_add_service(service.uuid());
        let res = self.inner.add_service(service);
        self.inner.dispatch_pending();
        res?;
        receiver.await?
    }

    /// Starts advertising and waits until the advertiser confirms.
    ///
    /// Dropping the future before then stops advertising again.
    pub async fn start_advertising(&self, data: &AdvertisementData) -> Result<()> {
        let receiver = self.delegate().register_advertising();
        self.inner.start_advertising(data);

        let guard = defer(|| {
            if !self.inner.is_advertising() {
                self.inner.stop_advertising();
            }
        });

        self.inner.dispatch_pending();
        let res = receiver.await?;
        guard.defuse();
        res
    }

    pub fn subscriptions(&self) -> BroadcastReceiver<SubscriptionEvent> {
        self.delegate().subscriptions()
    }

    /// Returns the stream of read requests, replacing any previous stream.
    ///
    /// Every received request must be answered with
    /// [`respond_to_request()`](PeripheralManager::respond_to_request). Requests arriving while
    /// no stream is open are answered with [`AttError::REQUEST_NOT_SUPPORTED`].
    pub fn read_requests(&self) -> mpsc::UnboundedReceiver<AttRequest> {
        self.delegate().read_requests.register()
    }

    /// Returns the stream of write batches, replacing any previous stream.
    ///
    /// Each batch must be answered once with
    /// [`respond_to_request()`](PeripheralManager::respond_to_request). Batches arriving while no
    /// stream is open are answered with [`AttError::REQUEST_NOT_SUPPORTED`].
    pub fn write_requests(&self) -> mpsc::UnboundedReceiver<Vec<AttRequest>> {
        self.delegate().write_requests.register()
    }

    /// Sends an updated value to subscribers, waiting for room in the outbound queue as needed.
    ///
    /// Completes without sending anything if the manager leaves the powered on state meanwhile.
    pub async fn update_value(
        &self,
        value: &[u8],
        characteristic: CharacteristicId,
        centrals: Option<&[Central]>,
    ) -> Result<()> {
        loop {
            let mut ready = self.delegate().ready_to_update();
            if self.inner.update_value(value, characteristic, centrals) {
                return Ok(());
            }
            tracing::trace!(?characteristic, "waiting for room in the notification queue");
            self.inner.dispatch_pending();
            match ready.recv().await {
                Ok(()) | Err(async_broadcast::RecvError::Overflowed(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionEvent {
    pub central: Central,
    pub characteristic: CharacteristicId,
    pub subscribed: bool,
}

struct PeripheralManagerAsyncDelegate {
    adding: RefCell<HashMap<BluetoothUuid, oneshot::Sender<Result<()>>>>,
    advertising: Cell<Option<oneshot::Sender<Result<()>>>>,
    restored_state: Cell<Option<RestoredState>>,
    state_updates: BroadcastSender<ManagerState>,
    subscriptions: BroadcastSender<SubscriptionEvent>,
    ready_to_update: BroadcastSender<()>,
    read_requests: Exclusive<AttRequest>,
    write_requests: Exclusive<Vec<AttRequest>>,
}

impl Default for PeripheralManagerAsyncDelegate {
    fn default() -> Self {
        Self::new()
    }
}

impl gatt_peripheral::PeripheralManagerDelegate for PeripheralManagerAsyncDelegate {
    fn did_update_state(&self, manager: PeripheralManager) {
        let state = manager.state();
        if !state.is_powered_on() {
            // The manager drops everything in flight when power goes away.
            self.adding.borrow_mut().clear();
            self.advertising.take();
            // Waiting updates retry and find nobody left to notify.
            let _ = self.ready_to_update.try_broadcast(());
        }
        let _ = self.state_updates.try_broadcast(state);
    }

    fn will_restore_state(&self, _manager: PeripheralManager, state: RestoredState) {
        self.restored_state.set(Some(state));
    }

    fn did_start_advertising(
        &self,
        _manager: PeripheralManager,
        error: Option<gatt_peripheral::Error>,
    ) {
        if let Some(sender) = self.advertising.take() {
            let _ = sender.send(error.map_or(Ok(()), |err| Err(err.into())));
        }
    }

    fn did_add_service(
        &self,
        _manager: PeripheralManager,
        service: Service,
        error: Option<gatt_peripheral::Error>,
    ) {
        if let Some(sender) = self.adding.borrow_mut().remove(&service.uuid()) {
            let _ = sender.send(error.map_or(Ok(()), |err| Err(err.into())));
        }
    }

    fn did_subscribe(
        &self,
        _manager: PeripheralManager,
        central: Central,
        characteristic: CharacteristicId,
    ) {
        let _ = self.subscriptions.try_broadcast(SubscriptionEvent {
            central,
            characteristic,
            subscribed: true,
        });
    }

    fn did_unsubscribe(
        &self,
        _manager: PeripheralManager,
        central: Central,
        characteristic: CharacteristicId,
    ) {
        let _ = self.subscriptions.try_broadcast(SubscriptionEvent {
            central,
            characteristic,
            subscribed: false,
        });
    }

    fn did_receive_read_request(&self, manager: PeripheralManager, request: AttRequest) {
        if let Err(request) = self.read_requests.send(request) {
            tracing::debug!(request = %request.id(), "no reader, rejecting read request");
            let _ = manager.respond_to_request(&request, AttError::REQUEST_NOT_SUPPORTED);
        }
    }

    fn did_receive_write_requests(&self, manager: PeripheralManager, requests: Vec<AttRequest>) {
        if let Err(requests) = self.write_requests.send(requests) {
            if let Some(first) = requests.first() {
                tracing::debug!(request = %first.id(), "no writer, rejecting write requests");
                let _ = manager.respond_to_request(first, AttError::REQUEST_NOT_SUPPORTED);
            }
        }
    }

    fn is_ready_to_update_subscribers(&self, _manager: PeripheralManager) {
        let _ = self.ready_to_update.try_broadcast(());
    }
}

impl PeripheralManagerAsyncDelegate {
    pub fn new() -> Self {
        Self {
            adding: Default::default(),
            advertising: Cell::new(None),
            restored_state: Cell::new(None),
            state_updates: watch(),
            subscriptions: broadcast(16),
            ready_to_update: watch(),
            read_requests: Exclusive::default(),
            write_requests: Exclusive::default(),
        }
    }

    pub fn register_add_service(&self, uuid: BluetoothUuid) -> oneshot::Receiver<Result<()>> {
        let (sender, receiver) = oneshot::channel();
        self.adding.borrow_mut().insert(uuid, sender);
        receiver
    }

    pub fn register_advertising(&self) -> oneshot::Receiver<Result<()>> {
        let (sender, receiver) = oneshot::channel();
        self.advertising.set(Some(sender));
        receiver
    }

    pub fn state_updates(&self) -> BroadcastReceiver<ManagerState> {
        self.state_updates.new_receiver()
    }

    pub fn subscriptions(&self) -> BroadcastReceiver<SubscriptionEvent> {
        self.subscriptions.new_receiver()
    }

    pub fn ready_to_update(&self) -> BroadcastReceiver<()> {
        self.ready_to_update.new_receiver()
    }
}
