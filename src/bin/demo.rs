//! Mover Link Demo
//!
//! Walks through the mover_link features:
//! - Station recipe encoding and process types (no connection required)
//! - Control-word masks and the fallback budget split
//! - Connecting to a controller, typed commands, status reads and a recipe apply
//!
//! Usage: cargo run --features cli --bin demo [host] [port] [unit]
//! Example: RUST_LOG=mover_link=debug cargo run --features cli --bin demo 127.0.0.1 502 1

use std::time::Duration;

use tokio::time::sleep;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mover_link::bitfield::bit_masks;
use mover_link::recipe::{default_stations, stations_for};
use mover_link::{
    ControlBit, FallbackBudget, JogDirection, LinkConfig, LinkEvent, MoverLink, ProcessType,
    StationRecipe,
};

fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging()?;
    println!("🚀 {}", mover_link::info());
    println!("=============================\n");

    // =========================================================================
    // Part 1: Station recipes (no connection required)
    // =========================================================================
    println!("📦 Part 1: Station Recipes");
    println!("--------------------------");

    for process in ProcessType::ALL {
        println!(
            "  {:<10} stations {:?} - {}",
            process.name(),
            stations_for(process),
            process.description()
        );
    }

    let stations = default_stations();
    let first = &stations[0];
    let block = first.encode();
    println!("\n  Station 1 block: {:04X?}", block);
    let decoded = StationRecipe::decode(&block)?;
    println!(
        "  -> decoded: station {} segment {} next {} ferry {:?}",
        decoded.station_no, decoded.segment_no, decoded.next_station_id, decoded.ferry_position
    );

    // =========================================================================
    // Part 2: Control word
    // =========================================================================
    println!("\n🎛️  Part 2: Control Word Masks");
    println!("------------------------------");

    for bit in [ControlBit::Enable, ControlBit::JogLeft, ControlBit::Heartbeat] {
        let (and_set, or_set) = bit_masks(bit.position(), true);
        let (and_clear, or_clear) = bit_masks(bit.position(), false);
        println!(
            "  {:<22} set: and={:04X} or={:04X}  clear: and={:04X} or={:04X}",
            bit.to_string(),
            and_set,
            or_set,
            and_clear,
            or_clear
        );
    }

    let budget = FallbackBudget::split(Duration::from_millis(2800), 0.4);
    println!(
        "\n  2800 ms budget: masked {:?}, fallback read {:?}, fallback write {:?}",
        budget.masked, budget.fallback_read, budget.fallback_write
    );

    // =========================================================================
    // Part 3: Controller (requires a Modbus TCP server)
    // =========================================================================
    println!("\n🔌 Part 3: Controller Operations");
    println!("--------------------------------");

    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let port = args
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap_or(mover_link::DEFAULT_TCP_PORT);
    let unit = args.next().and_then(|u| u.parse().ok()).unwrap_or(1);

    let link = MoverLink::new(LinkConfig::default().with_axis_count(4))?;
    let mut events = link.subscribe();

    println!("  Connecting to {}:{} (unit {})...", host, port, unit);
    if let Err(e) = link.try_connect(&host, port, unit).await {
        println!("  ⚠️  Connection failed: {}", e);
        println!("  (This is expected if no controller is running)");
        println!("\n🎉 Demo completed! (controller operations skipped)");
        return Ok(());
    }
    println!("  ✅ {}", link.connection_info());

    println!("\n  ✏️  Commands:");
    match link.set_enable(true).await {
        Ok(()) => println!("    Enable set"),
        Err(e) => println!("    Enable error: {}", e),
    }
    match link.jog(JogDirection::Right).await {
        Ok(()) => println!("    Jog right"),
        Err(e) => println!("    Jog error: {}", e),
    }
    sleep(Duration::from_millis(200)).await;
    if let Err(e) = link.jog(JogDirection::Stop).await {
        println!("    Jog stop error: {}", e);
    }
    match link.read_control_word().await {
        Ok(word) => println!("    Control word: 0x{:04X}", word),
        Err(e) => println!("    Control word error: {}", e),
    }

    println!("\n  📖 Status:");
    match link.read_all_status().await {
        Ok(movers) => {
            for mover in movers {
                println!(
                    "    Mover {}: {:<14} pos {:>9.3} mm  vel {:>8.3} mm/s {}",
                    mover.id,
                    mover.state.to_string(),
                    mover.position,
                    mover.velocity,
                    mover.error_message
                );
            }
        }
        Err(e) => println!("    Status error: {}", e),
    }
    match link.read_system_status().await {
        Ok(system) => println!(
            "    System: ready={} estop={} movers={} {}",
            system.ready,
            system.emergency_stop,
            system.mover_count,
            system.error_message()
        ),
        Err(e) => println!("    System status error: {}", e),
    }

    println!("\n  🧾 Recipes:");
    link.save_complete_recipe("demo", "factory defaults").await?;
    match link.apply_complete_recipe("demo").await {
        Ok(()) => println!("    Applied 'demo' ({} stations)", stations.len()),
        Err(e) => println!("    Apply error: {}", e),
    }

    let stats = link.transport_stats();
    let ops = link.operation_stats();
    let heartbeat = link.heartbeat();
    println!("\n  📊 Statistics:");
    println!("    Requests: {}, Responses: {}", stats.requests_sent, stats.responses_received);
    println!("    Timeouts: {}, Late replies: {}", stats.timeouts, stats.late_replies);
    println!("    Operations ok: {}, failed: {}", ops.succeeded, ops.failed);
    println!("    Heartbeat ticks: {}, skipped: {}", heartbeat.ticks, heartbeat.skipped);

    link.disconnect().await;
    link.shutdown().await;

    let mut failures = 0;
    while let Ok(event) = events.try_recv() {
        if let LinkEvent::OperationFailed { operation, detail } = event {
            failures += 1;
            println!("    ⚠️  {}: {}", operation, detail);
        }
    }
    println!("\n🎉 Demo completed! ({} failed operations)", failures);
    Ok(())
}
