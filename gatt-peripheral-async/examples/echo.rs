//! Echoes every write to an "echo" characteristic back to its subscribers.

use std::error::Error;
use std::pin::pin;

use btuuid::BluetoothUuid;
use futures_lite::StreamExt;
use gatt_peripheral_async::advertisement_data::AdvertisementData;
use gatt_peripheral_async::{
    AttError, AttRequest, AttributePermissions, Characteristic, CharacteristicId,
    CharacteristicProperties, IncomingWrite, Link, ManagerState, PeripheralManagerAsync,
    PeripheralManagerOptions, Service, Transport,
};
use tracing::info;
use tracing::metadata::LevelFilter;
use uuid::Uuid;

const ECHO_SERVICE: BluetoothUuid = BluetoothUuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
const ECHO: BluetoothUuid = BluetoothUuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
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

    let task = PeripheralManagerAsync::background(
        "echo",
        PeripheralManagerOptions::default(),
        |link, _| Box::new(SimulatedRadio { link }),
        |manager, executor| {
            let task = async move {
                manager.link().update_state(ManagerState::PoweredOn);
                manager.wait_powered_on().await?;

                let echo = Characteristic::new(
                    ECHO,
                    CharacteristicProperties::WRITE | CharacteristicProperties::NOTIFY,
                    AttributePermissions::WRITEABLE,
                );
                manager
                    .add_service(Service::new(ECHO_SERVICE, true).with_characteristic(echo))
                    .await?;
                manager
                    .start_advertising(&AdvertisementData::new().with_local_name("echo"))
                    .await?;
                info!("advertising");

                let id = CharacteristicId::new(ECHO_SERVICE, ECHO);
                let mut writes = pin!(manager.write_requests());

                // Stand in for a central that subscribes and writes twice.
                let link = manager.link();
                let central = link.central(Uuid::from_u128(1));
                link.subscribe(central.clone(), id);
                for message in ["hello", "world"] {
                    link.write_requests(central.clone(), [IncomingWrite::new(id, message)]);
                }

                for _ in 0..2 {
                    let Some(batch) = writes.next().await else {
                        break;
                    };
                    manager.respond_to_request(&batch[0], AttError::SUCCESS)?;
                    let echoed: Vec<u8> = batch.iter().flat_map(AttRequest::value).copied().collect();
                    manager.update_value(&echoed, id, None).await?;
                    for notification in link.drain_notifications(8) {
                        info!(
                            "echo to {}: {}",
                            notification.central.identifier(),
                            String::from_utf8_lossy(&notification.value)
                        );
                    }
                }

                manager.shutdown();
                Ok::<_, gatt_peripheral_async::error::Error>(())
            };

            executor.spawn_local(task)
        },
    );

    task.await?;
    Ok(())
}

/// Confirms every advertising request.
struct SimulatedRadio {
    link: Link,
}

impl Transport for SimulatedRadio {
    fn start_advertising(&self, _data: &AdvertisementData) {
        self.link.advertising_started(None);
    }
}
