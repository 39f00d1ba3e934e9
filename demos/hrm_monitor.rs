use std::sync::Arc;
use tracing::{error, info};
use velodrive::{BleTransport, Event, EventBus, HrmSession, Result, SampleKind};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    info!("❤️ Velodrive Heart Rate Monitor Example");

    let transport = Arc::new(BleTransport::new().await?);
    let bus = EventBus::new();
    let mut events = bus.subscribe();

    info!("Searching for a heart rate monitor...");
    let hrm = HrmSession::new(transport, bus.clone(), true);
    if let Err(e) = hrm.connect().await {
        error!("❌ Failed to connect: {e}");
        return Err(e);
    }
    info!(
        "✅ Connected to: {}",
        hrm.device_name().await.unwrap_or_default()
    );
    info!("Streaming heart rate; Ctrl-C to quit. Unplug the strap to watch auto-reconnect.");

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(Event::Sample(sample)) if sample.kind == SampleKind::HeartRate => {
                        info!("❤️ {:.0} bpm", sample.value);
                    }
                    Ok(Event::Status { slot, state }) => {
                        info!("[{slot}] status: {state}");
                    }
                    Ok(Event::Disconnected { name, .. }) => {
                        info!("Lost {name}, waiting for it to come back...");
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    hrm.disconnect().await;
    Ok(())
}
