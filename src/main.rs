use btcg2900::domain::models::{ChannelKind, DriverEvent, HciFrame, PacketType, ParentId};
use btcg2900::domain::settings::SettingsService;
use btcg2900::infrastructure::bluetooth::loopback::{LoopbackChip, LoopbackHost};
use btcg2900::infrastructure::bluetooth::Cg2900Driver;
use btcg2900::infrastructure::logging;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// HCI_Reset
const HCI_RESET: [u8; 3] = [0x03, 0x0C, 0x00];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new().unwrap_or_else(|e| {
        eprintln!("Failed to load settings, using defaults: {}", e);
        SettingsService::with_path(std::env::temp_dir().join("btcg2900-settings.json"))
    });

    let _logging_guard = logging::init_logger(&settings_service.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!(
        "Starting CG2900 BT driver on a loopback chip (settings {})",
        settings_service.path().display()
    );

    let settings = settings_service.get().clone();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();

    let monitor = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                DriverEvent::EnableState(parent, state) => {
                    info!("{}: BT core {:?}", parent, state)
                }
                DriverEvent::ResetStarted(parent) => warn!("{}: chip reset", parent),
                other => info!("Driver event: {:?}", other),
            }
        }
    });

    // The driver blocks while waiting for the chip, keep it off the runtime
    let scenario = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let host = LoopbackHost::new();
        let chip = LoopbackChip::new(ParentId(0));
        chip.configure(|c| c.reply_delay = Some(Duration::from_millis(10)));

        let driver = Cg2900Driver::with_events(host.clone(), settings, event_tx);
        for kind in ChannelKind::ALL {
            driver.probe(kind, chip.channel(kind))?;
        }

        let hdev = host
            .device()
            .ok_or_else(|| anyhow::anyhow!("HCI device was not registered"))?;
        hdev.open()?;
        hdev.send(HciFrame::new(PacketType::Command, HCI_RESET.to_vec()))?;
        std::thread::sleep(Duration::from_millis(50));
        info!(
            "Host received {} frame(s), stats {:?}",
            host.received().len(),
            hdev.stats()
        );
        hdev.close()?;

        // Chip restarts behind the driver's back while the device is up
        let hdev = host
            .device()
            .ok_or_else(|| anyhow::anyhow!("HCI device went away"))?;
        hdev.open()?;
        chip.reset();
        if let Some(hdev) = host.device() {
            hdev.open()?;
            hdev.close()?;
        }

        driver.shutdown();
        Ok(())
    });

    match scenario.await? {
        Ok(()) => info!("Loopback run finished"),
        Err(e) => error!("Loopback run failed: {}", e),
    }

    // The sender goes away with the driver
    if tokio::time::timeout(Duration::from_millis(500), monitor)
        .await
        .is_err()
    {
        warn!("Driver events still pending at exit");
    }
    Ok(())
}
