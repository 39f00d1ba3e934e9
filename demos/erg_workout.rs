use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info};
use velodrive::{
    stats, BleTransport, EventBus, Interval, IntervalNode, LiveSample, MemorySnapshotStore,
    Result, TrainerSession, Workout, WorkoutSession,
};

fn sweet_spot_workout() -> Workout {
    Workout {
        id: "sweet-spot-1".into(),
        name: "Sweet Spot Intervals".into(),
        duration_seconds: 1500,
        intervals: vec![
            IntervalNode::Leaf(Interval {
                kind: "warmup".into(),
                duration: 300,
                power: None,
                power_start: Some(0.45),
                power_end: Some(0.70),
            }),
            IntervalNode::Repeat {
                kind: "repeat".into(),
                repeat: 3,
                intervals: vec![
                    IntervalNode::Leaf(Interval {
                        kind: "work".into(),
                        duration: 240,
                        power: Some(0.88),
                        power_start: None,
                        power_end: None,
                    }),
                    IntervalNode::Leaf(Interval {
                        kind: "rest".into(),
                        duration: 60,
                        power: Some(0.50),
                        power_start: None,
                        power_end: None,
                    }),
                ],
            },
            IntervalNode::Leaf(Interval {
                kind: "cooldown".into(),
                duration: 300,
                power: None,
                power_start: Some(0.70),
                power_end: Some(0.45),
            }),
        ],
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let ftp = 250.0;
    let workout = sweet_spot_workout();

    info!("🚴 Velodrive ERG Workout Example");
    info!("Workout: {} ({} s at FTP {} W)", workout.name, workout.duration_seconds, ftp);

    let transport = Arc::new(BleTransport::new().await?);
    let bus = EventBus::new();

    info!("Searching for a smart trainer...");
    let trainer = TrainerSession::new(transport, bus.clone());
    if let Err(e) = trainer.connect().await {
        error!("❌ Failed to connect to trainer: {e}");
        return Err(e);
    }
    info!(
        "✅ Connected to: {}",
        trainer.device_name().await.unwrap_or_default()
    );

    // Give the FTMS handshake a moment to resolve
    sleep(Duration::from_secs(2)).await;
    let control = trainer.control_state();
    if !control.has_control {
        info!("Trainer did not grant control; riding in passive mode");
    }

    let session = WorkoutSession::new(Arc::new(MemorySnapshotStore::new()));
    session.start(workout.clone(), ftp);

    let mut last_target = 0.0;
    while !session.is_workout_complete() {
        sleep(Duration::from_secs(1)).await;

        let elapsed = session.elapsed_seconds();
        if let Some(target) = stats::target_power_at(elapsed, &workout, ftp) {
            if (target - last_target).abs() >= 1.0 {
                info!("⚡ {} -> target {} W", session.formatted_elapsed(), target);
                #[allow(clippy::cast_possible_truncation)]
                trainer.set_target_power(target as i32).await;
                last_target = target;
            }
        }

        session.record_data_point(LiveSample {
            power: *trainer.power().borrow(),
            heart_rate: 0,
            cadence: *trainer.cadence().borrow(),
            speed: *trainer.speed().borrow(),
        });
    }

    session.stop();
    let summary = stats::session_stats(&session.data_points());
    info!("🏁 Workout complete");
    info!("  Average power: {:.0} W", summary.avg_power);
    info!("  Max power:     {} W", summary.max_power);
    info!("  Energy:        {} kcal", summary.energy_kcal);
    info!("  Distance:      {:.2} km", session.distance_m() / 1000.0);

    trainer.disconnect().await;
    Ok(())
}
