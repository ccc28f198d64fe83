use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::mpsc;
use std::time::Duration;

use gatt_peripheral::advertisement_data::AdvertisementData;
use gatt_peripheral::{
    AttError, AttRequest, AttributePermissions, BluetoothUuid, Central, Characteristic,
    CharacteristicId, CharacteristicProperties, ErrorKind, IncomingWrite, Link, ManagerState,
    PeripheralManager, PeripheralManagerDelegate, PeripheralManagerOptions, RequestId,
    RestoredState, Service, Transport,
};
use uuid::Uuid;

const BATTERY: BluetoothUuid = BluetoothUuid::from_u16(0x180f);
const LEVEL: BluetoothUuid = BluetoothUuid::from_u16(0x2a19);
const HID: BluetoothUuid = BluetoothUuid::from_u16(0x1812);
const REPORT: BluetoothUuid = BluetoothUuid::from_u16(0x2a4d);

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Publish(BluetoothUuid),
    Unpublish(BluetoothUuid),
    UnpublishAll,
    StartAdvertising(AdvertisementData),
    StopAdvertising,
    Response(RequestId, AttError, Vec<u8>),
    NotificationsPending,
    PowerAlert,
}

#[derive(Debug, Clone, PartialEq)]
enum Seen {
    State(ManagerState),
    Restore(usize),
    Advertising(Option<ErrorKind>),
    AddService(BluetoothUuid, Option<ErrorKind>),
    Subscribe(Uuid, CharacteristicId),
    Unsubscribe(Uuid, CharacteristicId),
    Read(AttRequest),
    Write(Vec<AttRequest>),
    Ready,
}

struct RecordingTransport {
    calls: Rc<RefCell<Vec<Call>>>,
}

impl Transport for RecordingTransport {
    fn publish_service(&self, service: &Service) {
        self.calls.borrow_mut().push(Call::Publish(service.uuid()));
    }

    fn unpublish_service(&self, uuid: BluetoothUuid) {
        self.calls.borrow_mut().push(Call::Unpublish(uuid));
    }

    fn unpublish_all_services(&self) {
        self.calls.borrow_mut().push(Call::UnpublishAll);
    }

    fn start_advertising(&self, data: &AdvertisementData) {
        self.calls
            .borrow_mut()
            .push(Call::StartAdvertising(data.clone()));
    }

    fn stop_advertising(&self) {
        self.calls.borrow_mut().push(Call::StopAdvertising);
    }

    fn send_response(&self, request: &AttRequest, result: AttError) {
        self.calls.borrow_mut().push(Call::Response(
            request.id(),
            result,
            request.value().to_vec(),
        ));
    }

    fn notifications_pending(&self) {
        self.calls.borrow_mut().push(Call::NotificationsPending);
    }

    fn show_power_alert(&self) {
        self.calls.borrow_mut().push(Call::PowerAlert);
    }
}

#[derive(Default)]
struct RecordingDelegate {
    seen: Rc<RefCell<Vec<Seen>>>,
    in_callback: Cell<bool>,
    reentered: Rc<Cell<bool>>,
    publish_on_power_on: Option<Service>,
}

impl RecordingDelegate {
    fn record(&self, seen: Seen) {
        if self.in_callback.replace(true) {
            self.reentered.set(true);
        }
        self.seen.borrow_mut().push(seen);
    }

    fn leave(&self) {
        self.in_callback.set(false);
    }
}

impl PeripheralManagerDelegate for RecordingDelegate {
    fn did_update_state(&self, manager: PeripheralManager) {
        self.record(Seen::State(manager.state()));
        if manager.state() == ManagerState::PoweredOn {
            if let Some(service) = &self.publish_on_power_on {
                let _ = manager.add_service(service.clone());
            }
        }
        self.leave();
    }

    fn will_restore_state(&self, _manager: PeripheralManager, state: RestoredState) {
        self.record(Seen::Restore(state.services.len()));
        self.leave();
    }

    fn did_start_advertising(
        &self,
        _manager: PeripheralManager,
        error: Option<gatt_peripheral::Error>,
    ) {
        self.record(Seen::Advertising(error.map(|err| err.kind())));
        self.leave();
    }

    fn did_add_service(
        &self,
        _manager: PeripheralManager,
        service: Service,
        error: Option<gatt_peripheral::Error>,
    ) {
        self.record(Seen::AddService(service.uuid(), error.map(|err| err.kind())));
        self.leave();
    }

    fn did_subscribe(&self, _manager: PeripheralManager, central: Central, id: CharacteristicId) {
        self.record(Seen::Subscribe(central.identifier(), id));
        self.leave();
    }

    fn did_unsubscribe(&self, _manager: PeripheralManager, central: Central, id: CharacteristicId) {
        self.record(Seen::Unsubscribe(central.identifier(), id));
        self.leave();
    }

    fn did_receive_read_request(&self, _manager: PeripheralManager, request: AttRequest) {
        self.record(Seen::Read(request));
        self.leave();
    }

    fn did_receive_write_requests(&self, _manager: PeripheralManager, requests: Vec<AttRequest>) {
        self.record(Seen::Write(requests));
        self.leave();
    }

    fn is_ready_to_update_subscribers(&self, _manager: PeripheralManager) {
        self.record(Seen::Ready);
        self.leave();
    }
}

struct Harness {
    manager: PeripheralManager,
    link: Link,
    calls: Rc<RefCell<Vec<Call>>>,
    seen: Rc<RefCell<Vec<Seen>>>,
    reentered: Rc<Cell<bool>>,
}

impl Harness {
    fn new(options: PeripheralManagerOptions) -> Self {
        Self::with_delegate(options, RecordingDelegate::default())
    }

    fn with_delegate(options: PeripheralManagerOptions, delegate: RecordingDelegate) -> Self {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let seen = delegate.seen.clone();
        let reentered = delegate.reentered.clone();
        let transport_calls = calls.clone();
        let manager = PeripheralManager::new(options, Box::new(delegate), move |_link| {
            Box::new(RecordingTransport {
                calls: transport_calls,
            })
        });
        let link = manager.link();
        Harness {
            manager,
            link,
            calls,
            seen,
            reentered,
        }
    }

    fn powered_on() -> Self {
        let harness = Self::new(PeripheralManagerOptions::default());
        harness.link.update_state(ManagerState::PoweredOn);
        harness.take_seen();
        harness
    }

    fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut *self.calls.borrow_mut())
    }

    fn take_seen(&self) -> Vec<Seen> {
        self.manager.dispatch_pending();
        std::mem::take(&mut *self.seen.borrow_mut())
    }

    fn central(&self, n: u128) -> Central {
        self.link.central(Uuid::from_u128(n))
    }
}

fn battery_service() -> Service {
    Service::new(BATTERY, true).with_characteristic(
        Characteristic::new(
            LEVEL,
            CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
            AttributePermissions::READABLE,
        )
        .with_value([0x64, 0x01, 0x02]),
    )
}

fn report_service() -> Service {
    Service::new(HID, true).with_characteristic(
        Characteristic::new(
            REPORT,
            CharacteristicProperties::READ | CharacteristicProperties::WRITE,
            AttributePermissions::READABLE | AttributePermissions::WRITEABLE,
        )
        .with_value([1, 2, 3, 4])
        .with_max_value_len(6),
    )
}

fn level() -> CharacteristicId {
    CharacteristicId::new(BATTERY, LEVEL)
}

fn report() -> CharacteristicId {
    CharacteristicId::new(HID, REPORT)
}

#[test]
fn commands_before_power_on_are_rejected() {
    let harness = Harness::new(PeripheralManagerOptions::default());

    let err = harness.manager.add_service(battery_service()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotReady);

    harness
        .manager
        .start_advertising(&AdvertisementData::new().with_local_name("gatt"));
    assert!(harness.take_calls().is_empty());
    assert_eq!(
        harness.take_seen(),
        vec![
            Seen::AddService(BATTERY, Some(ErrorKind::NotReady)),
            Seen::Advertising(Some(ErrorKind::NotReady)),
        ]
    );
    assert!(!harness.manager.is_advertising());
}

#[test]
fn events_are_not_delivered_inside_callbacks() {
    let delegate = RecordingDelegate {
        publish_on_power_on: Some(battery_service()),
        ..Default::default()
    };
    let harness = Harness::with_delegate(PeripheralManagerOptions::default(), delegate);

    harness.link.update_state(ManagerState::PoweredOn);

    assert_eq!(
        harness.take_seen(),
        vec![
            Seen::State(ManagerState::PoweredOn),
            Seen::AddService(BATTERY, None),
        ]
    );
    assert!(!harness.reentered.get());
    assert_eq!(harness.take_calls(), vec![Call::Publish(BATTERY)]);
}

#[test]
fn included_services_must_be_published_first_and_removed_last() {
    let harness = Harness::powered_on();
    let keyboard = Service::new(HID, true).with_included_service(BATTERY);

    let err = harness.manager.add_service(keyboard.clone()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Dependency);

    harness.manager.add_service(battery_service()).unwrap();
    harness.manager.add_service(keyboard).unwrap();

    let err = harness.manager.remove_service(BATTERY).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Dependency);
    assert!(harness.manager.service(BATTERY).is_some());

    harness.manager.remove_service(HID).unwrap();
    harness.manager.remove_service(BATTERY).unwrap();
    assert!(harness.manager.services().is_empty());

    assert_eq!(
        harness.take_calls(),
        vec![
            Call::Publish(BATTERY),
            Call::Publish(HID),
            Call::Unpublish(HID),
            Call::Unpublish(BATTERY),
        ]
    );
}

#[test]
fn duplicate_and_unknown_services_are_invalid() {
    let harness = Harness::powered_on();
    harness.manager.add_service(battery_service()).unwrap();

    let err = harness.manager.add_service(battery_service()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameters);

    let err = harness.manager.remove_service(HID).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameters);

    let twice = Service::new(HID, true)
        .with_characteristic(Characteristic::new(
            REPORT,
            CharacteristicProperties::READ,
            AttributePermissions::READABLE,
        ))
        .with_characteristic(Characteristic::new(
            REPORT,
            CharacteristicProperties::READ,
            AttributePermissions::READABLE,
        ));
    let err = harness.manager.add_service(twice).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameters);
}

#[test]
fn full_queue_rejects_the_whole_update_and_signals_once() {
    let harness = Harness::new(
        PeripheralManagerOptions::default().with_notification_queue_capacity(2),
    );
    harness.link.update_state(ManagerState::PoweredOn);
    harness.manager.add_service(battery_service()).unwrap();

    let centrals: Vec<_> = (1..=3).map(|n| harness.central(n)).collect();
    for central in &centrals {
        harness.link.subscribe(central.clone(), level());
    }
    harness.take_seen();
    harness.take_calls();

    assert!(!harness.manager.update_value(&[42], level(), None));
    assert_eq!(harness.manager.queued_notifications(), 0);

    assert!(
        harness
            .manager
            .update_value(&[42], level(), Some(&centrals[..2]))
    );
    assert_eq!(harness.manager.queued_notifications(), 2);
    assert_eq!(harness.take_calls(), vec![Call::NotificationsPending]);

    let sent = harness.link.drain_notifications(1);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].value, vec![42]);
    assert_eq!(harness.take_seen(), vec![Seen::Ready]);

    harness.link.drain_notifications(1);
    assert!(harness.take_seen().is_empty());
}

#[test]
fn updates_only_reach_subscribed_centrals() {
    let harness = Harness::powered_on();
    harness.manager.add_service(battery_service()).unwrap();

    let subscribed = harness.central(1);
    let stranger = harness.central(2);
    harness.link.subscribe(subscribed.clone(), level());

    let targets = [subscribed.clone(), stranger, subscribed.clone()];
    assert!(harness.manager.update_value(&[7], level(), Some(&targets)));

    let sent = harness.link.drain_notifications(8);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].central, subscribed);
    assert_eq!(sent[0].characteristic, level());
}

#[test]
fn updates_are_truncated_to_the_central_limit() {
    let harness = Harness::powered_on();
    harness.manager.add_service(battery_service()).unwrap();
    let narrow = Central::new(Uuid::from_u128(1), 2);
    harness.link.subscribe(narrow, level());

    assert!(harness.manager.update_value(&[1, 2, 3, 4], level(), None));
    let sent = harness.link.drain_notifications(1);
    assert_eq!(sent[0].value, vec![1, 2]);
}

#[test]
fn update_without_subscribers_or_power_succeeds_vacuously() {
    let harness = Harness::new(PeripheralManagerOptions::default());
    assert!(harness.manager.update_value(&[1], level(), None));

    harness.link.update_state(ManagerState::PoweredOn);
    harness.manager.add_service(battery_service()).unwrap();
    assert!(harness.manager.update_value(&[1], level(), None));
    assert_eq!(harness.manager.queued_notifications(), 0);
}

#[test]
fn reads_are_checked_before_reaching_the_delegate() {
    let harness = Harness::powered_on();
    harness.manager.add_service(battery_service()).unwrap();
    harness.take_seen();
    harness.take_calls();
    let central = harness.central(1);

    let unknown = CharacteristicId::new(BATTERY, REPORT);
    assert_eq!(harness.link.read_request(central.clone(), unknown, 0), None);
    assert_eq!(harness.link.read_request(central.clone(), level(), 9), None);
    let calls = harness.take_calls();
    assert!(matches!(
        calls.as_slice(),
        [
            Call::Response(_, AttError::INVALID_HANDLE, _),
            Call::Response(_, AttError::INVALID_OFFSET, _),
        ]
    ));

    let id = harness.link.read_request(central, level(), 1).unwrap();
    let seen = harness.take_seen();
    let [Seen::Read(request)] = seen.as_slice() else {
        panic!("expected one read request, got {seen:?}");
    };
    assert_eq!(request.id(), id);
    assert_eq!(request.value(), [0x01, 0x02]);
    assert_eq!(harness.manager.pending_requests(), 1);

    harness
        .manager
        .respond_to_request(request, AttError::SUCCESS)
        .unwrap();
    assert_eq!(
        harness.take_calls(),
        vec![Call::Response(id, AttError::SUCCESS, vec![0x01, 0x02])]
    );
}

#[test]
fn reads_of_write_only_characteristics_are_refused() {
    let harness = Harness::powered_on();
    let secret = Service::new(HID, true).with_characteristic(Characteristic::new(
        REPORT,
        CharacteristicProperties::WRITE,
        AttributePermissions::WRITEABLE,
    ));
    harness.manager.add_service(secret).unwrap();
    harness.take_calls();

    assert_eq!(harness.link.read_request(harness.central(1), report(), 0), None);
    assert!(matches!(
        harness.take_calls().as_slice(),
        [Call::Response(_, AttError::READ_NOT_PERMITTED, _)]
    ));
}

#[test]
fn answering_twice_is_a_protocol_violation() {
    let harness = Harness::powered_on();
    harness.manager.add_service(battery_service()).unwrap();
    harness.take_calls();

    harness.link.read_request(harness.central(1), level(), 0);
    let Some(Seen::Read(request)) = harness.take_seen().pop() else {
        panic!("expected a read request");
    };

    harness
        .manager
        .respond_to_request(&request, AttError::SUCCESS)
        .unwrap();
    let err = harness
        .manager
        .respond_to_request(&request, AttError::SUCCESS)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    assert_eq!(harness.take_calls().len(), 1);
}

#[test]
fn invalid_write_batches_are_rejected_as_a_whole() {
    let harness = Harness::powered_on();
    harness.manager.add_service(report_service()).unwrap();
    harness.take_calls();

    let id = harness
        .link
        .write_requests(
            harness.central(1),
            [
                IncomingWrite::new(report(), [9, 9]),
                IncomingWrite::new(report(), [8, 8, 8]).at_offset(4),
            ],
        )
        .unwrap();
    let Some(Seen::Write(batch)) = harness.take_seen().pop() else {
        panic!("expected a write batch");
    };
    assert_eq!(batch.len(), 2);
    assert!(batch.iter().all(|request| request.id() == id));

    let err = harness
        .manager
        .validate_write_requests(&batch)
        .unwrap_err();
    assert_eq!(
        err.kind(),
        ErrorKind::ATT(AttError::INVALID_OFFSET),
        "the first write shortens the value to 2 bytes"
    );

    let err = harness
        .manager
        .respond_to_request(&batch[1], AttError::SUCCESS)
        .unwrap_err();
    assert_eq!(err.att_error(), AttError::INVALID_OFFSET);
    assert_eq!(
        harness.take_calls(),
        vec![Call::Response(id, AttError::INVALID_OFFSET, vec![9, 9])]
    );
    assert_eq!(
        harness.manager.characteristic(report()).unwrap().value(),
        Some(&[1, 2, 3, 4][..])
    );
}

#[test]
fn overlong_writes_are_rejected_without_side_effects() {
    let harness = Harness::powered_on();
    harness.manager.add_service(report_service()).unwrap();
    harness.take_calls();

    harness.link.write_requests(
        harness.central(1),
        [
            IncomingWrite::new(report(), [5]).at_offset(4),
            IncomingWrite::new(report(), [0; 7]),
        ],
    );
    let Some(Seen::Write(batch)) = harness.take_seen().pop() else {
        panic!("expected a write batch");
    };

    let err = harness
        .manager
        .respond_to_request(&batch[0], AttError::SUCCESS)
        .unwrap_err();
    assert_eq!(
        err.kind(),
        ErrorKind::ATT(AttError::INVALID_ATTRIBUTE_VALUE_LENGTH)
    );
    assert_eq!(harness.take_calls().len(), 1);
    assert_eq!(
        harness.manager.characteristic(report()).unwrap().value(),
        Some(&[1, 2, 3, 4][..])
    );
}

#[test]
fn valid_write_batches_are_applied_in_order() {
    let harness = Harness::powered_on();
    harness.manager.add_service(report_service()).unwrap();
    harness.take_calls();

    let id = harness
        .link
        .write_requests(
            harness.central(1),
            [
                IncomingWrite::new(report(), [7]).at_offset(2),
                IncomingWrite::new(report(), [8, 9]).at_offset(3),
            ],
        )
        .unwrap();
    let Some(Seen::Write(batch)) = harness.take_seen().pop() else {
        panic!("expected a write batch");
    };

    harness
        .manager
        .respond_to_request(&batch[0], AttError::SUCCESS)
        .unwrap();
    assert_eq!(
        harness.take_calls(),
        vec![Call::Response(id, AttError::SUCCESS, vec![7])]
    );
    assert_eq!(
        harness.manager.characteristic(report()).unwrap().value(),
        Some(&[1, 2, 7, 8, 9][..])
    );
    assert_eq!(harness.manager.pending_requests(), 0);
}

#[test]
fn declined_write_batches_are_not_applied() {
    let harness = Harness::powered_on();
    harness.manager.add_service(report_service()).unwrap();
    harness.take_calls();

    harness.link.write_requests(
        harness.central(1),
        [IncomingWrite::new(report(), [0xff])],
    );
    let Some(Seen::Write(batch)) = harness.take_seen().pop() else {
        panic!("expected a write batch");
    };

    harness
        .manager
        .respond_to_request(&batch[0], AttError::INSUFFICIENT_AUTHORIZATION)
        .unwrap();
    assert!(matches!(
        harness.take_calls().as_slice(),
        [Call::Response(_, AttError::INSUFFICIENT_AUTHORIZATION, _)]
    ));
    assert_eq!(
        harness.manager.characteristic(report()).unwrap().value(),
        Some(&[1, 2, 3, 4][..])
    );
}

#[test]
fn leaving_powered_on_resets_the_session() {
    let harness = Harness::new(
        PeripheralManagerOptions::default().with_notification_queue_capacity(1),
    );
    harness.link.update_state(ManagerState::PoweredOn);
    harness.manager.add_service(battery_service()).unwrap();
    harness
        .manager
        .start_advertising(&AdvertisementData::new().with_service_uuid(BATTERY));
    harness.link.advertising_started(None);
    assert!(harness.manager.is_advertising());

    let central = harness.central(1);
    harness.link.subscribe(central.clone(), level());
    harness.link.read_request(central.clone(), level(), 0);
    assert!(harness.manager.update_value(&[1], level(), None));
    assert!(!harness.manager.update_value(&[2], level(), None));
    harness.take_seen();
    harness.take_calls();

    harness.link.update_state(ManagerState::PoweredOff);

    assert!(!harness.manager.is_advertising());
    assert_eq!(harness.manager.queued_notifications(), 0);
    assert_eq!(harness.manager.pending_requests(), 0);
    assert!(harness.manager.subscriptions(&central).is_empty());
    assert!(harness.manager.service(BATTERY).is_some());
    assert_eq!(harness.take_calls(), vec![Call::StopAdvertising]);
    assert_eq!(
        harness.take_seen(),
        vec![Seen::State(ManagerState::PoweredOff)]
    );

    harness.link.update_state(ManagerState::Resetting);
    assert!(harness.manager.services().is_empty());
    assert_eq!(harness.take_calls(), vec![Call::UnpublishAll]);
}

#[test]
fn readiness_does_not_survive_a_power_cycle() {
    let harness = Harness::new(
        PeripheralManagerOptions::default().with_notification_queue_capacity(1),
    );
    harness.link.update_state(ManagerState::PoweredOn);
    harness.manager.add_service(battery_service()).unwrap();
    let first = harness.central(1);
    harness.link.subscribe(first.clone(), level());
    harness.link.subscribe(harness.central(2), level());
    assert!(!harness.manager.update_value(&[1], level(), None));
    assert_eq!(harness.manager.queued_notifications(), 0);

    harness.link.update_state(ManagerState::PoweredOff);
    harness.link.update_state(ManagerState::PoweredOn);
    harness.link.subscribe(first, level());
    harness.take_seen();

    assert!(harness.manager.update_value(&[2], level(), None));
    assert_eq!(harness.link.drain_notifications(8).len(), 1);
    assert!(harness.take_seen().is_empty());
}

#[test]
fn power_alert_is_requested_when_powered_off() {
    let harness = Harness::new(PeripheralManagerOptions::default().with_show_power_alert(true));
    harness.link.update_state(ManagerState::PoweredOn);
    harness.link.update_state(ManagerState::PoweredOff);
    assert_eq!(harness.take_calls(), vec![Call::PowerAlert]);

    let quiet = Harness::new(PeripheralManagerOptions::default());
    quiet.link.update_state(ManagerState::PoweredOff);
    assert!(quiet.take_calls().is_empty());
}

#[test]
fn repeated_state_reports_are_ignored() {
    let harness = Harness::new(PeripheralManagerOptions::default());
    harness.link.update_state(ManagerState::PoweredOn);
    harness.link.update_state(ManagerState::PoweredOn);
    assert_eq!(
        harness.take_seen(),
        vec![Seen::State(ManagerState::PoweredOn)]
    );
}

#[test]
fn advertising_becomes_active_once_confirmed() {
    let harness = Harness::powered_on();
    let data = AdvertisementData::new().with_local_name("gatt");

    harness.manager.start_advertising(&data);
    assert!(!harness.manager.is_advertising());
    assert_eq!(harness.manager.advertisement_data(), Some(data.clone()));
    assert_eq!(harness.take_calls(), vec![Call::StartAdvertising(data)]);

    harness
        .link
        .advertising_started(Some(ErrorKind::Other.into()));
    assert!(!harness.manager.is_advertising());
    assert_eq!(harness.manager.advertisement_data(), None);

    let data = AdvertisementData::new().with_service_uuid(BATTERY);
    harness.manager.start_advertising(&data);
    harness.link.advertising_started(None);
    assert!(harness.manager.is_advertising());
    assert_eq!(
        harness.take_seen(),
        vec![
            Seen::Advertising(Some(ErrorKind::Other)),
            Seen::Advertising(None),
        ]
    );

    harness.manager.stop_advertising();
    harness.manager.stop_advertising();
    assert!(!harness.manager.is_advertising());
    assert_eq!(
        harness.take_calls(),
        vec![Call::StartAdvertising(data), Call::StopAdvertising]
    );
}

#[test]
fn subscriptions_follow_the_central() {
    let harness = Harness::powered_on();
    harness.manager.add_service(battery_service()).unwrap();
    harness.manager.add_service(report_service()).unwrap();
    harness.take_seen();

    let central = harness.central(1);
    harness.link.subscribe(central.clone(), level());
    harness.link.subscribe(central.clone(), level());
    harness.link.subscribe(central.clone(), report());
    assert_eq!(harness.manager.subscriptions(&central), vec![level()]);

    harness.link.disconnect(&central);
    assert!(harness.manager.subscriptions(&central).is_empty());
    assert_eq!(
        harness.take_seen(),
        vec![
            Seen::Subscribe(central.identifier(), level()),
            Seen::Unsubscribe(central.identifier(), level()),
        ]
    );
}

#[test]
fn stored_values_can_be_replaced() {
    let harness = Harness::powered_on();
    harness.manager.add_service(report_service()).unwrap();

    harness
        .manager
        .set_characteristic_value(report(), [4, 5, 6])
        .unwrap();
    assert_eq!(
        harness.manager.characteristic(report()).unwrap().value(),
        Some(&[4, 5, 6][..])
    );

    let err = harness
        .manager
        .set_characteristic_value(report(), [0; 7])
        .unwrap_err();
    assert_eq!(err.att_error(), AttError::INVALID_ATTRIBUTE_VALUE_LENGTH);
}

#[test]
fn restored_state_is_reported_first() {
    let harness = Harness::new(PeripheralManagerOptions::default().with_restore_id("demo"));
    harness.link.update_state(ManagerState::PoweredOn);
    harness.link.restore_state(RestoredState {
        services: vec![battery_service()],
        advertisement_data: Some(AdvertisementData::new().with_local_name("gatt")),
    });

    assert!(harness.manager.is_advertising());
    assert!(harness.manager.service(BATTERY).is_some());
    assert_eq!(
        harness.take_seen(),
        vec![Seen::State(ManagerState::PoweredOn), Seen::Restore(1)]
    );

    let unrestorable = Harness::new(PeripheralManagerOptions::default());
    unrestorable.link.restore_state(RestoredState {
        services: vec![battery_service()],
        advertisement_data: None,
    });
    assert!(unrestorable.manager.services().is_empty());
    assert!(unrestorable.take_seen().is_empty());
}

#[test]
fn restored_services_are_checked_like_new_ones() {
    let harness = Harness::new(PeripheralManagerOptions::default().with_restore_id("demo"));
    harness.link.update_state(ManagerState::PoweredOn);
    harness.manager.add_service(battery_service()).unwrap();
    harness.take_seen();

    let missing_include = Service::new(HID, true)
        .with_included_service(BluetoothUuid::from_u16(0x180a))
        .with_characteristic(Characteristic::new(
            REPORT,
            CharacteristicProperties::READ,
            AttributePermissions::READABLE,
        ));
    harness.link.restore_state(RestoredState {
        services: vec![Service::new(BATTERY, false), missing_include, report_service()],
        advertisement_data: None,
    });

    assert!(harness.manager.service(BATTERY).unwrap().is_primary());
    assert_eq!(harness.manager.service(HID), Some(report_service()));
    assert_eq!(harness.take_seen(), vec![Seen::Restore(1)]);
}

#[test]
fn initial_values_must_fit_their_maximum() {
    let harness = Harness::powered_on();
    harness.take_calls();
    let overlong = Service::new(HID, true).with_characteristic(
        Characteristic::new(
            REPORT,
            CharacteristicProperties::READ | CharacteristicProperties::WRITE,
            AttributePermissions::READABLE | AttributePermissions::WRITEABLE,
        )
        .with_value(vec![7; 10])
        .with_max_value_len(4),
    );

    let err = harness.manager.add_service(overlong).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidParameters);
    assert!(harness.manager.service(HID).is_none());
    assert!(harness.take_calls().is_empty());
    assert_eq!(
        harness.take_seen(),
        vec![Seen::AddService(HID, Some(ErrorKind::InvalidParameters))]
    );
}

#[test]
fn shutdown_withdraws_everything() {
    let harness = Harness::powered_on();
    harness.manager.add_service(battery_service()).unwrap();
    harness.manager.start_advertising(&AdvertisementData::new());
    harness.take_calls();

    harness.manager.shutdown();
    assert_eq!(
        harness.take_calls(),
        vec![Call::StopAdvertising, Call::UnpublishAll]
    );

    let err = harness.manager.add_service(battery_service()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotReady);
    assert_eq!(harness.link.read_request(harness.central(1), level(), 0), None);
}

#[test]
fn link_outlives_the_manager() {
    let harness = Harness::powered_on();
    let link = harness.link.clone();
    drop(harness);

    assert!(link.manager().is_none());
    link.update_state(ManagerState::PoweredOff);
    assert!(link.drain_notifications(4).is_empty());
}

struct ChannelDelegate {
    sender: mpsc::Sender<String>,
}

impl PeripheralManagerDelegate for ChannelDelegate {
    fn did_update_state(&self, manager: PeripheralManager) {
        let _ = self.sender.send(format!("{:?}", manager.state()));
    }

    fn did_add_service(
        &self,
        _manager: PeripheralManager,
        service: Service,
        error: Option<gatt_peripheral::Error>,
    ) {
        let _ = self
            .sender
            .send(format!("{:?} {}", service.uuid(), error.is_none()));
    }
}

#[test]
fn background_managers_dispatch_on_their_queue() {
    let (sender, receiver) = mpsc::channel();
    let handle = PeripheralManager::background(
        "gatt-test",
        PeripheralManagerOptions::default(),
        move |_| Box::new(ChannelDelegate { sender }),
        |_, _| Box::new(RecordingTransport {
            calls: Rc::default(),
        }),
        |manager, executor| {
            manager.link().update_state(ManagerState::PoweredOn);
            executor.handle(manager)
        },
    );
    let timeout = Duration::from_secs(5);
    assert_eq!(receiver.recv_timeout(timeout).unwrap(), "PoweredOn");

    let added = handle.lock(|manager, _| manager.add_service(battery_service()).is_ok());
    assert!(added);
    assert_eq!(
        receiver.recv_timeout(timeout).unwrap(),
        format!("{BATTERY:?} true")
    );
    assert_eq!(handle.lock(|manager, _| manager.services().len()), 1);
}
