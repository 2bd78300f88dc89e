//! Example demonstrating the configuration file and its manager
//!
//! Run with: cargo run --package roomcast-core --example config_demo

use roomcast_core::domain::config::{ConfigManager, RoomcastConfig};
use roomcast_core::domain::protocol::RoomId;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("roomcast_core=debug,info")
        .init();

    println!("=== Roomcast Configuration Demo ===\n");

    let dir = tempfile::tempdir()?;
    let manager = ConfigManager::new(dir.path().to_path_buf());

    // 1. First load writes the factory default
    println!("1. Loading from an empty directory...");
    let mut config = manager.load().await;
    println!(
        "   Created {} (room {}, server {})",
        manager.config_path().display(),
        config.room.id,
        config.server.address
    );

    // 2. Customize the room and save
    println!("\n2. Customizing the room...");
    config.room.id = RoomId(4242);
    config.room.description = "Friday night set".to_string();
    config.room.owner = true;
    config
        .room
        .options
        .insert("sampling_rate".to_string(), toml::Value::Integer(48000));
    config.validate()?;
    manager.save(&config).await?;
    println!("   Saved. Request options sent on create/join:");
    for (key, value) in config.room.with_record(true).request_options() {
        println!("   - {key} = {value}");
    }

    // 3. Reload
    println!("\n3. Reloading...");
    let reloaded = RoomcastConfig::load_from_file(manager.config_path()).await?;
    println!(
        "   Room {} '{}', graph at {} Hz with {} channels",
        reloaded.room.id,
        reloaded.room.description,
        reloaded.app.stream_config().sample_rate.hz(),
        reloaded.app.stream_config().channels.count()
    );

    // 4. A corrupt file falls back to the default and is kept aside
    println!("\n4. Corrupting the file...");
    tokio::fs::write(manager.config_path(), "room = [not toml").await?;
    let fallback = manager.load().await;
    println!(
        "   Fell back to room {}; backup kept: {}",
        fallback.room.id,
        manager.config_path().with_extension("toml.corrupt").exists()
    );

    println!("\n=== Demo Complete ===");
    Ok(())
}
