//! Serves a battery level characteristic to a simulated central.

use std::any::Any;
use std::cell::RefCell;
use std::error::Error;

use gatt_peripheral::advertisement_data::AdvertisementData;
use gatt_peripheral::{
    AttError, AttRequest, AttributePermissions, BluetoothUuid, Central, Characteristic,
    CharacteristicId, CharacteristicProperties, Link, ManagerState, PeripheralManager,
    PeripheralManagerOptions, Service, Transport,
};
use tracing::info;
use tracing::metadata::LevelFilter;
use uuid::Uuid;

const BATTERY_SERVICE: BluetoothUuid = BluetoothUuid::from_u16(0x180f);
const BATTERY_LEVEL: BluetoothUuid = BluetoothUuid::from_u16(0x2a19);

fn main() -> Result<(), Box<dyn Error>> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let manager = PeripheralManager::new(
        PeripheralManagerOptions::default(),
        Box::new(BatteryDelegate {
            level: RefCell::new(100),
        }),
        |link| Box::new(LoopbackTransport { link }),
    );
    let link = manager.link();

    link.update_state(ManagerState::PoweredOn);

    let central = Central::new(Uuid::from_u128(0x5eed), 20);
    let level = CharacteristicId::new(BATTERY_SERVICE, BATTERY_LEVEL);
    link.subscribe(central.clone(), level);
    link.read_request(central.clone(), level, 0);

    for _ in 0..3 {
        let delegate: &dyn Any = manager.delegate();
        let delegate = delegate
            .downcast_ref::<BatteryDelegate>()
            .ok_or("unexpected delegate type")?;
        let next = {
            let mut current = delegate.level.borrow_mut();
            *current -= 5;
            *current
        };
        manager.update_value(&[next], level, None);
        for notification in link.drain_notifications(4) {
            info!(
                "notify {} -> {:?}",
                notification.central.identifier(),
                notification.value
            );
        }
    }

    link.disconnect(&central);
    manager.shutdown();

    Ok(())
}

struct BatteryDelegate {
    level: RefCell<u8>,
}

impl gatt_peripheral::PeripheralManagerDelegate for BatteryDelegate {
    fn did_update_state(&self, manager: PeripheralManager) {
        if manager.state() != ManagerState::PoweredOn {
            return;
        }

        info!("Bluetooth is now powered on, publishing the battery service");
        let level = Characteristic::new(
            BATTERY_LEVEL,
            CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
            AttributePermissions::READABLE,
        )
        .with_value([*self.level.borrow()]);
        let service = Service::new(BATTERY_SERVICE, true).with_characteristic(level);

        if manager.add_service(service).is_ok() {
            manager.start_advertising(
                &AdvertisementData::new()
                    .with_local_name("battery-demo")
                    .with_service_uuid(BATTERY_SERVICE),
            );
        }
    }

    fn did_start_advertising(
        &self,
        _manager: PeripheralManager,
        error: Option<gatt_peripheral::Error>,
    ) {
        match error {
            None => info!("advertising"),
            Some(err) => info!("advertising failed: {err}"),
        }
    }

    fn did_subscribe(
        &self,
        _manager: PeripheralManager,
        central: Central,
        characteristic: CharacteristicId,
    ) {
        info!("{} subscribed to {characteristic:?}", central.identifier());
    }

    fn did_receive_read_request(&self, manager: PeripheralManager, mut request: AttRequest) {
        let level = *self.level.borrow();
        request.set_value([level]);
        if let Err(err) = manager.respond_to_request(&request, AttError::SUCCESS) {
            info!("failed to answer read: {err}");
        }
    }
}

/// Acknowledges everything immediately and logs what would go over the air.
struct LoopbackTransport {
    link: Link,
}

impl Transport for LoopbackTransport {
    fn publish_service(&self, service: &Service) {
        info!(
            "published {:?} with {} characteristics",
            service.uuid(),
            service.characteristics().len()
        );
    }

    fn start_advertising(&self, _data: &AdvertisementData) {
        self.link.advertising_started(None);
    }

    fn send_response(&self, request: &AttRequest, result: AttError) {
        info!(
            "response {} to {}: {result} {:?}",
            request.id(),
            request.central().identifier(),
            request.value()
        );
    }
}
