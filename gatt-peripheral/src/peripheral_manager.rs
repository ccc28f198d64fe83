//! The peripheral manager, which is the application's interface to the GATT server and
//! broadcaster roles.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::{Rc, Weak};

use btuuid::BluetoothUuid;
use serial_executor::Executor;

use crate::advertisement_data::AdvertisementData;
use crate::central::Central;
use crate::characteristic::{Characteristic, CharacteristicId};
use crate::error::{AttError, Error, ErrorKind, Result};
use crate::notify_queue::{Notification, NotificationQueue};
use crate::options::PeripheralManagerOptions;
use crate::request::{AttRequest, RequestId, RequestKind};
use crate::service::Service;
use crate::state::{AuthorizationStatus, ConnectionLatency, ManagerState, RestoredState};
use crate::transport::{IncomingWrite, Link, Transport};

/// An object that publishes services, advertises, and serves requests from connected centrals.
///
/// `PeripheralManager` is a cheap, `!Send` handle; clones refer to the same session. Delegate
/// events are queued and delivered one at a time, never while another delegate method or a
/// manager method is running. See [`dispatch_pending()`](PeripheralManager::dispatch_pending).
#[derive(Clone)]
pub struct PeripheralManager {
    inner: Rc<Inner>,
}

pub(crate) struct Inner {
    options: PeripheralManagerOptions,
    delegate: Box<dyn PeripheralManagerDelegate>,
    transport: Box<dyn Transport>,
    session: RefCell<Session>,
    events: RefCell<VecDeque<Event>>,
    depth: Cell<usize>,
    executor: Option<Executor>,
    dispatch_scheduled: Cell<bool>,
}

struct Session {
    state: ManagerState,
    authorization: AuthorizationStatus,
    advertising: Advertising,
    services: HashMap<BluetoothUuid, Service>,
    queue: NotificationQueue,
    pending: HashMap<RequestId, Vec<AttRequest>>,
    next_request_id: u64,
    shut_down: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Advertising {
    Stopped,
    Starting(AdvertisementData),
    Active(AdvertisementData),
}

enum Event {
    StateUpdated,
    WillRestoreState(RestoredState),
    DidStartAdvertising(Option<Error>),
    DidAddService(Service, Option<Error>),
    DidSubscribe(Central, CharacteristicId),
    DidUnsubscribe(Central, CharacteristicId),
    ReadRequest(AttRequest),
    WriteRequests(Vec<AttRequest>),
    ReadyToUpdate,
}

struct Depth<'a>(&'a Cell<usize>);

impl<'a> Depth<'a> {
    fn enter(depth: &'a Cell<usize>) -> Self {
        depth.set(depth.get() + 1);
        Depth(depth)
    }
}

impl Drop for Depth<'_> {
    fn drop(&mut self) {
        self.0.set(self.0.get() - 1);
    }
}

impl std::fmt::Debug for PeripheralManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let session = self.inner.session.borrow();
        f.debug_struct("PeripheralManager")
            .field("state", &session.state)
            .field("advertising", &session.advertising)
            .field("services", &session.services.len())
            .finish_non_exhaustive()
    }
}

impl PartialEq for PeripheralManager {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for PeripheralManager {}

impl PeripheralManager {
    /// Creates a new peripheral manager driven by the calling context.
    ///
    /// `transport` receives the [`Link`] through which it reports back. Events raised by direct
    /// calls are delivered by the next `Link` call or by
    /// [`dispatch_pending()`](PeripheralManager::dispatch_pending).
    pub fn new(
        options: PeripheralManagerOptions,
        delegate: Box<dyn PeripheralManagerDelegate>,
        transport: impl FnOnce(Link) -> Box<dyn Transport>,
    ) -> Self {
        Self::init(options, delegate, |link| transport(link), None)
    }

    /// Creates a new peripheral manager on a background serial queue.
    ///
    /// The `delegate` and `transport` are created on this queue, and all delegate methods will
    /// be called on it. Once created, `entry` will be called with the new `PeripheralManager` on
    /// that queue. Queued events are delivered automatically after every work item.
    pub fn background<R: Send>(
        label: &str,
        options: PeripheralManagerOptions,
        delegate: impl FnOnce(&Executor) -> Box<dyn PeripheralManagerDelegate> + Send,
        transport: impl FnOnce(Link, &Executor) -> Box<dyn Transport> + Send,
        entry: impl FnOnce(Self, &Executor) -> R + Send,
    ) -> R {
        Executor::background(label, move |executor| {
            let delegate = delegate(&executor);
            let manager = Self::init(
                options,
                delegate,
                |link| transport(link, &executor),
                Some(executor.clone()),
            );
            entry(manager, &executor)
        })
    }

    fn init(
        options: PeripheralManagerOptions,
        delegate: Box<dyn PeripheralManagerDelegate>,
        transport: impl FnOnce(Link) -> Box<dyn Transport>,
        executor: Option<Executor>,
    ) -> Self {
        let capacity = options.notification_queue_capacity;
        let inner = Rc::new_cyclic(|weak: &Weak<Inner>| Inner {
            transport: transport(Link {
                inner: weak.clone(),
            }),
            options,
            delegate,
            session: RefCell::new(Session {
                state: ManagerState::Unknown,
                authorization: AuthorizationStatus::NotDetermined,
                advertising: Advertising::Stopped,
                services: HashMap::new(),
                queue: NotificationQueue::new(capacity),
                pending: HashMap::new(),
                next_request_id: 1,
                shut_down: false,
            }),
            events: RefCell::new(VecDeque::new()),
            depth: Cell::new(0),
            executor,
            dispatch_scheduled: Cell::new(false),
        });

        tracing::debug!(capacity, "peripheral manager created");
        PeripheralManager { inner }
    }

    pub(crate) fn from_inner(inner: Rc<Inner>) -> Self {
        PeripheralManager { inner }
    }

    /// Returns a reference to the delegate.
    pub fn delegate(&self) -> &dyn PeripheralManagerDelegate {
        &*self.inner.delegate
    }

    /// Returns a reference to the transport.
    pub fn transport(&self) -> &dyn Transport {
        &*self.inner.transport
    }

    /// Returns a new [`Link`] into this manager.
    pub fn link(&self) -> Link {
        Link {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn options(&self) -> &PeripheralManagerOptions {
        &self.inner.options
    }

    /// The executor whose queue this manager lives on, if it was created with
    /// [`background()`](PeripheralManager::background).
    pub fn executor(&self) -> Option<&Executor> {
        self.inner.executor.as_ref()
    }

    /// The current state of the peripheral manager.
    pub fn state(&self) -> ManagerState {
        self.inner.session.borrow().state
    }

    /// The authorization for sharing data while backgrounded, as last reported by the system.
    ///
    /// This never prompts the user.
    pub fn authorization(&self) -> AuthorizationStatus {
        self.inner.session.borrow().authorization
    }

    /// Whether the peripheral is currently advertising data.
    pub fn is_advertising(&self) -> bool {
        matches!(
            self.inner.session.borrow().advertising,
            Advertising::Active(_)
        )
    }

    /// The data being advertised, or about to be.
    pub fn advertisement_data(&self) -> Option<AdvertisementData> {
        match &self.inner.session.borrow().advertising {
            Advertising::Stopped => None,
            Advertising::Starting(data) | Advertising::Active(data) => Some(data.clone()),
        }
    }

    /// A snapshot of the published services.
    pub fn services(&self) -> Vec<Service> {
        self.inner
            .session
            .borrow()
            .services
            .values()
            .cloned()
            .collect()
    }

    pub fn service(&self, uuid: BluetoothUuid) -> Option<Service> {
        self.inner.session.borrow().services.get(&uuid).cloned()
    }

    pub fn characteristic(&self, id: CharacteristicId) -> Option<Characteristic> {
        let session = self.inner.session.borrow();
        session.characteristic(id).cloned()
    }

    /// The characteristics `central` is subscribed to.
    pub fn subscriptions(&self, central: &Central) -> Vec<CharacteristicId> {
        let session = self.inner.session.borrow();
        session
            .services
            .values()
            .flat_map(|service| {
                service
                    .characteristics()
                    .iter()
                    .filter(|c| c.subscribed_centrals().contains(central))
                    .map(|c| service.characteristic_id(c.uuid()))
            })
            .collect()
    }

    /// Number of notifications waiting for the transport.
    pub fn queued_notifications(&self) -> usize {
        self.inner.session.borrow().queue.len()
    }

    /// Number of delivered requests (or write batches) still waiting for an answer.
    pub fn pending_requests(&self) -> usize {
        self.inner.session.borrow().pending.len()
    }

    /// Publishes a service and its characteristics to the local database.
    ///
    /// Included services must be published first. The outcome is also reported to
    /// [`PeripheralManagerDelegate::did_add_service()`].
    pub fn add_service(&self, service: Service) -> Result<()> {
        self.call(|| {
            let result = self.inner.session.borrow_mut().insert_service(&service);
            match result {
                Ok(published) => {
                    tracing::debug!(service = ?published.uuid(), "service published");
                    self.inner.transport.publish_service(&published);
                    self.post(Event::DidAddService(published, None));
                    Ok(())
                }
                Err(error) => {
                    tracing::debug!(service = ?service.uuid(), %error, "service rejected");
                    self.post(Event::DidAddService(service, Some(error.clone())));
                    Err(error)
                }
            }
        })
    }

    /// Removes a published service from the local database.
    ///
    /// Services that include it must be removed first; nothing is removed on error.
    pub fn remove_service(&self, uuid: BluetoothUuid) -> Result<()> {
        self.call(|| {
            let ready = {
                let mut session = self.inner.session.borrow_mut();
                session.ensure_powered_on()?;
                if !session.services.contains_key(&uuid) {
                    return Err(Error::with_message(
                        ErrorKind::InvalidParameters,
                        format!("service {uuid:?} is not published"),
                    ));
                }
                if let Some(dependent) = session.services.values().find(|s| s.includes(uuid)) {
                    return Err(Error::with_message(
                        ErrorKind::Dependency,
                        format!("service {uuid:?} is included by {:?}", dependent.uuid()),
                    ));
                }
                session.services.remove(&uuid);
                session
                    .queue
                    .remove_where(|n| n.characteristic.service == uuid)
            };

            tracing::debug!(service = ?uuid, "service removed");
            self.inner.transport.unpublish_service(uuid);
            if ready {
                self.post(Event::ReadyToUpdate);
            }
            Ok(())
        })
    }

    /// Removes all published services from the local database.
    pub fn remove_all_services(&self) {
        self.call(|| {
            let ready = {
                let mut session = self.inner.session.borrow_mut();
                session.services.clear();
                session.queue.remove_where(|_| true)
            };

            tracing::debug!("all services removed");
            self.inner.transport.unpublish_all_services();
            if ready {
                self.post(Event::ReadyToUpdate);
            }
        })
    }

    /// Replaces the stored value of a published characteristic.
    ///
    /// Subscribers are not notified; use [`update_value()`](PeripheralManager::update_value).
    pub fn set_characteristic_value(
        &self,
        id: CharacteristicId,
        value: impl Into<Vec<u8>>,
    ) -> Result<()> {
        let value = value.into();
        self.call(|| {
            let mut session = self.inner.session.borrow_mut();
            session.ensure_powered_on()?;
            let characteristic = session.characteristic_mut(id).ok_or_else(|| {
                Error::with_message(
                    ErrorKind::InvalidParameters,
                    format!("characteristic {id:?} is not published"),
                )
            })?;
            if value.len() > characteristic.max_value_len() {
                return Err(AttError::INVALID_ATTRIBUTE_VALUE_LENGTH.into());
            }
            characteristic.set_value(value);
            Ok(())
        })
    }

    /// Starts advertising.
    ///
    /// The outcome is reported to [`PeripheralManagerDelegate::did_start_advertising()`]. Calling
    /// this while already advertising restarts advertising with the new data.
    pub fn start_advertising(&self, data: &AdvertisementData) {
        self.call(|| {
            let restart = {
                let mut session = self.inner.session.borrow_mut();
                let powered = session.ensure_powered_on();
                if let Err(error) = powered {
                    drop(session);
                    self.post(Event::DidStartAdvertising(Some(error)));
                    return;
                }
                let restart = session.advertising != Advertising::Stopped;
                session.advertising = Advertising::Starting(data.clone());
                restart
            };

            tracing::debug!(restart, ?data, "starting advertising");
            self.inner.transport.start_advertising(data);
        })
    }

    /// Stops advertising. Does nothing if not advertising.
    pub fn stop_advertising(&self) {
        self.call(|| {
            let was_advertising = {
                let mut session = self.inner.session.borrow_mut();
                std::mem::replace(&mut session.advertising, Advertising::Stopped)
                    != Advertising::Stopped
            };

            if was_advertising {
                tracing::debug!("stopping advertising");
                self.inner.transport.stop_advertising();
            }
        })
    }

    /// Asks for a different latency on the connection to `central`.
    ///
    /// This is only a hint; the latency actually used is negotiated elsewhere.
    pub fn set_desired_connection_latency(&self, latency: ConnectionLatency, central: &Central) {
        self.call(|| {
            if !self.state().is_powered_on() {
                tracing::debug!(?latency, "ignoring latency hint while not powered on");
                return;
            }
            self.inner
                .transport
                .set_desired_connection_latency(central, latency);
        })
    }

    /// Answers a request delivered by
    /// [`did_receive_read_request()`](PeripheralManagerDelegate::did_receive_read_request) or a
    /// batch delivered by
    /// [`did_receive_write_requests()`](PeripheralManagerDelegate::did_receive_write_requests).
    ///
    /// Must be called exactly once per read request and once per write batch (with any request
    /// of the batch). Answering again, or answering an unknown request, fails with
    /// [`ErrorKind::ProtocolViolation`].
    ///
    /// A successful answer to a write batch applies every write. If any write in the batch is
    /// invalid, the whole batch is answered with that write's error instead, none of the writes
    /// is applied, and that error is returned.
    pub fn respond_to_request(&self, request: &AttRequest, result: AttError) -> Result<()> {
        self.call(|| {
            let mut session = self.inner.session.borrow_mut();
            let Some(batch) = session.pending.remove(&request.id()) else {
                tracing::warn!(request = %request.id(), "request answered twice or unknown");
                return Err(Error::with_message(
                    ErrorKind::ProtocolViolation,
                    format!("request {} has no outstanding answer", request.id()),
                ));
            };

            let Some(first) = batch.first() else {
                return Err(ErrorKind::ProtocolViolation.into());
            };
            match first.kind() {
                RequestKind::Read => {
                    drop(session);
                    self.inner.transport.send_response(request, result);
                    Ok(())
                }
                RequestKind::Write => {
                    if !result.is_success() {
                        drop(session);
                        self.inner.transport.send_response(first, result);
                        return Ok(());
                    }

                    match session.validate_writes(&batch) {
                        Ok(values) => {
                            for (id, value) in values {
                                if let Some(characteristic) = session.characteristic_mut(id) {
                                    characteristic.set_value(value);
                                }
                            }
                            drop(session);
                            tracing::debug!(request = %first.id(), writes = batch.len(), "write batch applied");
                            self.inner.transport.send_response(first, AttError::SUCCESS);
                            Ok(())
                        }
                        Err(error) => {
                            drop(session);
                            tracing::debug!(request = %first.id(), %error, "write batch rejected");
                            self.inner.transport.send_response(first, error);
                            Err(error.into())
                        }
                    }
                }
            }
        })
    }

    /// Checks a write batch without applying it, returning the error the whole batch would be
    /// answered with.
    pub fn validate_write_requests(&self, requests: &[AttRequest]) -> Result<()> {
        let session = self.inner.session.borrow();
        session
            .validate_writes(requests)
            .map(|_| ())
            .map_err(Error::from)
    }

    /// Sends an updated characteristic value to subscribed centrals.
    ///
    /// With `centrals == None` every subscriber is updated; otherwise the given centrals that
    /// are actually subscribed are. The value is truncated to each central's
    /// [`max_update_value_len()`](Central::max_update_value_len).
    ///
    /// Returns `false` if the outbound queue cannot take one notification per target. In that
    /// case nothing was queued, and
    /// [`is_ready_to_update_subscribers()`](PeripheralManagerDelegate::is_ready_to_update_subscribers)
    /// will be called once space has become available.
    pub fn update_value(
        &self,
        value: &[u8],
        characteristic: CharacteristicId,
        centrals: Option<&[Central]>,
    ) -> bool {
        self.call(|| {
            let mut session = self.inner.session.borrow_mut();
            if !session.state.is_powered_on() {
                tracing::debug!(?characteristic, "update while not powered on reaches nobody");
                return true;
            }
            let Some(target) = session.characteristic(characteristic) else {
                tracing::warn!(?characteristic, "update for an unpublished characteristic");
                return true;
            };

            let mut seen = HashSet::new();
            let batch: Vec<_> = target
                .subscribed_centrals()
                .iter()
                .filter(|subscriber| centrals.is_none_or(|wanted| wanted.contains(*subscriber)))
                .filter(|subscriber| seen.insert(subscriber.identifier()))
                .map(|subscriber| Notification {
                    central: subscriber.clone(),
                    characteristic,
                    value: value[..value.len().min(subscriber.max_update_value_len())].to_vec(),
                })
                .collect();

            let targets = batch.len();
            let was_empty = session.queue.len() == 0;
            if !session.queue.try_push_all(batch) {
                tracing::debug!(
                    targets,
                    remaining = session.queue.remaining(),
                    "notification queue full"
                );
                return false;
            }

            let now_empty = session.queue.len() == 0;
            drop(session);
            if was_empty && !now_empty {
                self.inner.transport.notifications_pending();
            }
            true
        })
    }

    /// Ends the session: stops advertising, withdraws every service, and drops queued
    /// notifications and unanswered requests. Further calls behave as if not powered on.
    pub fn shutdown(&self) {
        self.call(|| {
            let (was_advertising, abandoned) = {
                let mut session = self.inner.session.borrow_mut();
                if session.shut_down {
                    return;
                }
                session.shut_down = true;
                session.services.clear();
                session.queue.clear();
                let was_advertising = std::mem::replace(&mut session.advertising, Advertising::Stopped)
                    != Advertising::Stopped;
                (was_advertising, session.pending.drain().count())
            };

            if abandoned > 0 {
                tracing::warn!(abandoned, "shutting down with unanswered requests");
            }
            if was_advertising {
                self.inner.transport.stop_advertising();
            }
            self.inner.transport.unpublish_all_services();
            self.inner.events.borrow_mut().clear();
            tracing::debug!("peripheral manager shut down");
        })
    }

    /// Delivers queued delegate events, one at a time, until none are left.
    ///
    /// Does nothing when called from inside a delegate method or a manager call; the events are
    /// delivered once the outermost call returns.
    pub fn dispatch_pending(&self) {
        if self.inner.depth.get() > 0 {
            return;
        }

        let _depth = Depth::enter(&self.inner.depth);
        loop {
            let event = self.inner.events.borrow_mut().pop_front();
            let Some(event) = event else {
                break;
            };
            self.deliver(event);
        }
    }

    fn deliver(&self, event: Event) {
        let delegate = &*self.inner.delegate;
        let manager = self.clone();
        match event {
            Event::StateUpdated => {
                tracing::trace!(state = ?self.state(), "delivering state update");
                delegate.did_update_state(manager)
            }
            Event::WillRestoreState(state) => delegate.will_restore_state(manager, state),
            Event::DidStartAdvertising(error) => delegate.did_start_advertising(manager, error),
            Event::DidAddService(service, error) => {
                delegate.did_add_service(manager, service, error)
            }
            Event::DidSubscribe(central, characteristic) => {
                delegate.did_subscribe(manager, central, characteristic)
            }
            Event::DidUnsubscribe(central, characteristic) => {
                delegate.did_unsubscribe(manager, central, characteristic)
            }
            Event::ReadRequest(request) => delegate.did_receive_read_request(manager, request),
            Event::WriteRequests(requests) => {
                delegate.did_receive_write_requests(manager, requests)
            }
            Event::ReadyToUpdate => delegate.is_ready_to_update_subscribers(manager),
        }
    }

    fn call<R>(&self, func: impl FnOnce() -> R) -> R {
        let ret = {
            let _depth = Depth::enter(&self.inner.depth);
            func()
        };
        self.schedule_dispatch();
        ret
    }

    fn post(&self, event: Event) {
        self.inner.events.borrow_mut().push_back(event);
    }

    /// On a background queue, arranges for queued events to be delivered after the current
    /// work item.
    fn schedule_dispatch(&self) {
        let Some(executor) = &self.inner.executor else {
            return;
        };
        if self.inner.depth.get() > 0
            || self.inner.dispatch_scheduled.get()
            || self.inner.events.borrow().is_empty()
        {
            return;
        }

        self.inner.dispatch_scheduled.set(true);
        let weak = Rc::downgrade(&self.inner);
        executor.exec_local(move || {
            if let Some(inner) = weak.upgrade() {
                inner.dispatch_scheduled.set(false);
                PeripheralManager { inner }.dispatch_pending();
            }
        });
    }

    pub(crate) fn handle_state_update(&self, state: ManagerState) {
        let _depth = Depth::enter(&self.inner.depth);
        let (was_advertising, cleared_services) = {
            let mut session = self.inner.session.borrow_mut();
            if session.shut_down || session.state == state {
                return;
            }

            let previous = std::mem::replace(&mut session.state, state);
            tracing::debug!(?previous, ?state, "state changed");

            let mut was_advertising = false;
            if !state.is_powered_on() {
                was_advertising = std::mem::replace(&mut session.advertising, Advertising::Stopped)
                    != Advertising::Stopped;
                for service in session.services.values_mut() {
                    for characteristic in service.characteristics_mut() {
                        characteristic.clear_subscriptions();
                    }
                }
                // Also disarms readiness: the next session starts clean.
                session.queue.clear();

                let abandoned: Vec<_> = session.pending.drain().map(|(id, _)| id).collect();
                for id in abandoned {
                    tracing::warn!(request = %id, "request abandoned without an answer");
                }
            }

            let cleared_services = state.clears_services() && !session.services.is_empty();
            if cleared_services {
                session.services.clear();
            }
            (was_advertising, cleared_services)
        };

        if was_advertising {
            self.inner.transport.stop_advertising();
        }
        if cleared_services {
            self.inner.transport.unpublish_all_services();
        }
        if state == ManagerState::PoweredOff && self.inner.options.show_power_alert {
            self.inner.transport.show_power_alert();
        }
        self.post(Event::StateUpdated);
    }

    pub(crate) fn handle_authorization(&self, status: AuthorizationStatus) {
        self.inner.session.borrow_mut().authorization = status;
    }

    pub(crate) fn handle_advertising_started(&self, error: Option<Error>) {
        let _depth = Depth::enter(&self.inner.depth);
        {
            let mut session = self.inner.session.borrow_mut();
            if session.shut_down {
                return;
            }
            let advertising = std::mem::replace(&mut session.advertising, Advertising::Stopped);
            session.advertising = match (advertising, &error) {
                (Advertising::Starting(data), None) => Advertising::Active(data),
                (Advertising::Active(data), None) => Advertising::Active(data),
                (Advertising::Starting(_) | Advertising::Active(_), Some(error)) => {
                    tracing::debug!(%error, "advertising failed to start");
                    Advertising::Stopped
                }
                (Advertising::Stopped, _) => Advertising::Stopped,
            };
        }
        self.post(Event::DidStartAdvertising(error));
    }

    pub(crate) fn handle_subscribe(&self, central: Central, id: CharacteristicId) {
        let _depth = Depth::enter(&self.inner.depth);
        let subscribed = {
            let mut session = self.inner.session.borrow_mut();
            if !session.state.is_powered_on() || session.shut_down {
                tracing::warn!(central = %central.identifier(), "subscription while not powered on");
                return;
            }
            match session.characteristic_mut(id) {
                Some(characteristic) if characteristic.can_notify() => {
                    characteristic.subscribe(central.clone())
                }
                Some(_) => {
                    tracing::warn!(characteristic = ?id, "subscription to a characteristic without notify or indicate");
                    false
                }
                None => {
                    tracing::warn!(characteristic = ?id, "subscription to an unpublished characteristic");
                    false
                }
            }
        };

        if subscribed {
            tracing::debug!(central = %central.identifier(), characteristic = ?id, "subscribed");
            self.post(Event::DidSubscribe(central, id));
        }
    }

    pub(crate) fn handle_unsubscribe(&self, central: &Central, id: CharacteristicId) {
        let _depth = Depth::enter(&self.inner.depth);
        let unsubscribed = self
            .inner
            .session
            .borrow_mut()
            .characteristic_mut(id)
            .is_some_and(|characteristic| characteristic.unsubscribe(central));

        if unsubscribed {
            tracing::debug!(central = %central.identifier(), characteristic = ?id, "unsubscribed");
            self.post(Event::DidUnsubscribe(central.clone(), id));
        }
    }

    pub(crate) fn handle_disconnect(&self, central: &Central) {
        for id in self.subscriptions(central) {
            self.handle_unsubscribe(central, id);
        }
    }

    pub(crate) fn handle_read_request(
        &self,
        central: Central,
        id: CharacteristicId,
        offset: usize,
    ) -> Option<RequestId> {
        let _depth = Depth::enter(&self.inner.depth);
        let mut session = self.inner.session.borrow_mut();
        if !session.state.is_powered_on() || session.shut_down {
            tracing::warn!(characteristic = ?id, "read request while not powered on");
            return None;
        }

        let request_id = session.next_request_id();
        let checked = match session.characteristic(id) {
            None => Err(AttError::INVALID_HANDLE),
            Some(characteristic) if !characteristic.is_readable() => {
                Err(AttError::READ_NOT_PERMITTED)
            }
            Some(characteristic) => {
                let value = characteristic.value().unwrap_or_default();
                if offset > value.len() {
                    Err(AttError::INVALID_OFFSET)
                } else {
                    Ok(value[offset..].to_vec())
                }
            }
        };

        match checked {
            Ok(value) => {
                let request =
                    AttRequest::new(request_id, RequestKind::Read, central, id, offset, value);
                session.pending.insert(request_id, vec![request.clone()]);
                drop(session);
                self.post(Event::ReadRequest(request));
                Some(request_id)
            }
            Err(error) => {
                drop(session);
                tracing::debug!(characteristic = ?id, %error, "read request rejected");
                let request =
                    AttRequest::new(request_id, RequestKind::Read, central, id, offset, Vec::new());
                self.inner.transport.send_response(&request, error);
                None
            }
        }
    }

    pub(crate) fn handle_write_requests(
        &self,
        central: Central,
        writes: Vec<IncomingWrite>,
    ) -> Option<RequestId> {
        let _depth = Depth::enter(&self.inner.depth);
        if writes.is_empty() {
            return None;
        }

        let mut session = self.inner.session.borrow_mut();
        if !session.state.is_powered_on() || session.shut_down {
            tracing::warn!(writes = writes.len(), "write requests while not powered on");
            return None;
        }

        let request_id = session.next_request_id();
        let requests: Vec<_> = writes
            .into_iter()
            .map(|write| {
                AttRequest::new(
                    request_id,
                    RequestKind::Write,
                    central.clone(),
                    write.characteristic,
                    write.offset,
                    write.value,
                )
            })
            .collect();
        session.pending.insert(request_id, requests.clone());
        drop(session);

        self.post(Event::WriteRequests(requests));
        Some(request_id)
    }

    pub(crate) fn handle_drain(&self, max: usize) -> Vec<Notification> {
        let _depth = Depth::enter(&self.inner.depth);
        let (drained, ready) = self.inner.session.borrow_mut().queue.drain(max);
        if ready {
            self.post(Event::ReadyToUpdate);
        }
        drained
    }

    pub(crate) fn handle_restore(&self, state: RestoredState) {
        let _depth = Depth::enter(&self.inner.depth);
        if self.inner.options.restore_id.is_none() {
            tracing::warn!("ignoring restored state: no restore identifier configured");
            return;
        }

        let state = {
            let mut session = self.inner.session.borrow_mut();
            if session.shut_down {
                return;
            }
            let mut services = Vec::with_capacity(state.services.len());
            for service in state.services {
                match session.check_service(&service) {
                    Ok(()) => {
                        session.services.insert(service.uuid(), service.clone());
                        services.push(service);
                    }
                    Err(error) => {
                        tracing::warn!(service = ?service.uuid(), %error, "skipping restored service");
                    }
                }
            }
            if let Some(data) = &state.advertisement_data {
                session.advertising = Advertising::Active(data.clone());
            }
            RestoredState {
                services,
                advertisement_data: state.advertisement_data,
            }
        };

        tracing::debug!(services = state.services.len(), "restoring state");
        self.inner
            .events
            .borrow_mut()
            .push_front(Event::WillRestoreState(state));
    }
}

impl Session {
    fn ensure_powered_on(&self) -> Result<()> {
        if self.shut_down {
            return Err(Error::with_message(ErrorKind::NotReady, "session was shut down"));
        }
        if !self.state.is_powered_on() {
            return Err(ErrorKind::NotReady.into());
        }
        Ok(())
    }

    fn next_request_id(&mut self) -> RequestId {
        let id = RequestId(self.next_request_id);
        self.next_request_id += 1;
        id
    }

    fn characteristic(&self, id: CharacteristicId) -> Option<&Characteristic> {
        self.services.get(&id.service)?.characteristic(id.characteristic)
    }

    fn characteristic_mut(&mut self, id: CharacteristicId) -> Option<&mut Characteristic> {
        self.services
            .get_mut(&id.service)?
            .characteristic_mut(id.characteristic)
    }

    fn insert_service(&mut self, service: &Service) -> Result<Service> {
        self.ensure_powered_on()?;
        self.check_service(service)?;

        let mut published = service.clone();
        for characteristic in published.characteristics_mut() {
            characteristic.clear_subscriptions();
        }
        self.services.insert(service.uuid(), published.clone());
        Ok(published)
    }

    /// Checks that `service` can join the published ones.
    fn check_service(&self, service: &Service) -> Result<()> {
        let uuid = service.uuid();
        if self.services.contains_key(&uuid) {
            return Err(Error::with_message(
                ErrorKind::InvalidParameters,
                format!("service {uuid:?} is already published"),
            ));
        }
        if service.has_duplicate_characteristics() {
            return Err(Error::with_message(
                ErrorKind::InvalidParameters,
                format!("service {uuid:?} has duplicate characteristics"),
            ));
        }
        if let Some(missing) = service
            .included_services()
            .iter()
            .find(|included| !self.services.contains_key(included))
        {
            return Err(Error::with_message(
                ErrorKind::Dependency,
                format!("included service {missing:?} is not published"),
            ));
        }
        if let Some(overlong) = service.characteristics().iter().find(|characteristic| {
            characteristic
                .value()
                .is_some_and(|value| value.len() > characteristic.max_value_len())
        }) {
            return Err(Error::with_message(
                ErrorKind::InvalidParameters,
                format!(
                    "characteristic {:?} holds a value longer than its maximum of {} bytes",
                    overlong.uuid(),
                    overlong.max_value_len()
                ),
            ));
        }
        Ok(())
    }

    /// Computes the value every characteristic touched by `requests` would end up with.
    ///
    /// Writes are applied in order, so later writes see the results of earlier ones.
    fn validate_writes(
        &self,
        requests: &[AttRequest],
    ) -> std::result::Result<Vec<(CharacteristicId, Vec<u8>)>, AttError> {
        let mut values: Vec<(CharacteristicId, Vec<u8>)> = Vec::new();
        for request in requests {
            let id = request.characteristic();
            let characteristic = self.characteristic(id).ok_or(AttError::INVALID_HANDLE)?;
            if request.kind() != RequestKind::Write || !characteristic.is_writable() {
                return Err(AttError::WRITE_NOT_PERMITTED);
            }

            let index = match values.iter().position(|(touched, _)| *touched == id) {
                Some(index) => index,
                None => {
                    let current = characteristic.value().unwrap_or_default().to_vec();
                    values.push((id, current));
                    values.len() - 1
                }
            };

            let value = &mut values[index].1;
            if request.offset() > value.len() {
                return Err(AttError::INVALID_OFFSET);
            }
            if request.offset() + request.value().len() > characteristic.max_value_len() {
                return Err(AttError::INVALID_ATTRIBUTE_VALUE_LENGTH);
            }
            value.truncate(request.offset());
            value.extend_from_slice(request.value());
        }
        Ok(values)
    }
}

/// A protocol that provides updates for the state of a [`PeripheralManager`] and the requests of
/// connected centrals.
#[allow(unused_variables)]
pub trait PeripheralManagerDelegate: Any {
    /// This method is called whenever the manager's state changes.
    ///
    /// Commands should only be issued while the state is [`ManagerState::PoweredOn`].
    fn did_update_state(&self, manager: PeripheralManager);

    /// This method is called before any other event when the manager was relaunched with a
    /// restore identifier.
    fn will_restore_state(&self, manager: PeripheralManager, state: RestoredState) {}

    /// This method is called with the result of
    /// [`start_advertising()`](PeripheralManager::start_advertising).
    fn did_start_advertising(&self, manager: PeripheralManager, error: Option<Error>) {}

    /// This method is called with the result of
    /// [`add_service()`](PeripheralManager::add_service).
    fn did_add_service(&self, manager: PeripheralManager, service: Service, error: Option<Error>) {}

    /// This method is called when a central enables notifications or indications.
    fn did_subscribe(
        &self,
        manager: PeripheralManager,
        central: Central,
        characteristic: CharacteristicId,
    ) {
    }

    /// This method is called when a central disables notifications or indications, or
    /// disconnects.
    fn did_unsubscribe(
        &self,
        manager: PeripheralManager,
        central: Central,
        characteristic: CharacteristicId,
    ) {
    }

    /// This method is called when a central reads a characteristic.
    ///
    /// [`respond_to_request()`](PeripheralManager::respond_to_request) must be called exactly
    /// once for every invocation.
    fn did_receive_read_request(&self, manager: PeripheralManager, request: AttRequest) {}

    /// This method is called when a central writes one or more characteristics.
    ///
    /// The requests are an atomic unit: answer them with exactly one call to
    /// [`respond_to_request()`](PeripheralManager::respond_to_request).
    fn did_receive_write_requests(&self, manager: PeripheralManager, requests: Vec<AttRequest>) {}

    /// This method is called after a failed
    /// [`update_value()`](PeripheralManager::update_value), once the outbound queue has room
    /// again.
    fn is_ready_to_update_subscribers(&self, manager: PeripheralManager) {}
}
