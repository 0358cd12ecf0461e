//! Key sniffer for authoring key maps
//!
//! Prints the raw key codes of one event device together with the MIDI the
//! matching key map would produce, and lists the keyboards the monitor would
//! pick up.

use anyhow::{Context, Result};
use colored::*;
use std::path::Path;
use std::time::Instant;
use tracing::info;

use crate::config::KeyMapStore;
use crate::engine::TranslationEngine;
use crate::input::reader::open_event_stream;
use crate::input::{DeviceIdentity, DeviceInfo, KeyEventReader, ProcRegistry, RawKeyEvent};
use crate::midi::{format_hex, MidiMessage};

/// Print key events of `event_path` until Ctrl+C or the device goes away
pub async fn run_cli_sniffer(
    event_path: &Path,
    registry: &ProcRegistry,
    keymaps: &KeyMapStore,
) -> Result<()> {
    println!("{}", "=== Key Sniffer ===".bold().cyan());
    println!("Press Ctrl+C to exit\n");

    // The listing tells which key map applies; unknown devices get the default
    let device = registry
        .list_all_devices()
        .await
        .ok()
        .and_then(|devices| devices.into_iter().find(|d| d.event_path == event_path));
    let (name, identity) = match &device {
        Some(device) => (device.name.clone(), device.identity),
        None => (event_path.display().to_string(), DeviceIdentity::default()),
    };

    let (config, matched) = keymaps.resolve(&name);
    let mut engine = TranslationEngine::new(name.clone(), &config);
    println!(
        "Device: {} [{}]  key map: {}",
        name.bright_white(),
        identity,
        if matched { config.identification.real_name.green() } else { "default".yellow() }
    );

    let stream = open_event_stream(event_path)
        .with_context(|| format!("Failed to open {}", event_path.display()))?;
    let mut reader = KeyEventReader::new(stream, identity);

    println!(
        "{}",
        "Format: [timestamp] CODE STATE | HEX => PARSED".dimmed()
    );
    println!("{}\n", "─".repeat(80).dimmed());

    let start = Instant::now();
    let mut out = Vec::new();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            result = reader.next_event() => {
                let event = match result {
                    Ok(event) => event,
                    Err(e) => {
                        info!("Event stream ended: {}", e);
                        break;
                    }
                };
                out.clear();
                engine.handle(&event, &mut out);
                print_event(start.elapsed().as_millis(), &event, &out);
            }
        }
    }

    println!("\n{}", "Sniffer stopped".yellow());
    Ok(())
}

fn print_event(timestamp_ms: u128, event: &RawKeyEvent, messages: &[MidiMessage]) {
    let timestamp = format!("{:08}", timestamp_ms);
    let state = if event.released { "up  ".bright_red() } else { "down".bright_green() };
    let code = format!("0x{:02x} ({:3})", event.code, event.code);

    if messages.is_empty() {
        let unbound = "unbound".bright_black();
        println!("[{}ms] {} {} | {}", timestamp.dimmed(), code.white(), state, unbound);
        return;
    }
    for message in messages {
        let hex = format_hex(message.encode().as_slice());
        let hex_colored = match message {
            MidiMessage::NoteOn { .. } => hex.bright_green(),
            MidiMessage::NoteOff { .. } => hex.bright_red(),
            MidiMessage::ControlChange { .. } => hex.bright_yellow(),
            MidiMessage::ProgramChange { .. } => hex.bright_cyan(),
        };
        println!(
            "[{}ms] {} {} | {} => {}",
            timestamp.dimmed(),
            code.white(),
            state,
            hex_colored,
            message.to_string().bright_blue()
        );
    }
}

/// List detected input devices and the key map each keyboard would use
pub fn list_devices_formatted(devices: &[DeviceInfo], keymaps: &KeyMapStore) {
    println!("\n{}", "=== Input Devices ===".bold().cyan());

    if devices.is_empty() {
        println!("  {}", "No input devices found".dimmed());
    }

    for device in devices {
        let marker = if device.is_keyboard() {
            "[KEYBOARD]".green()
        } else {
            "[OTHER]   ".dimmed()
        };
        println!(
            "  {} {} [{}] {}",
            marker,
            device.name.bright_white(),
            device.identity,
            device.event_path.display()
        );
        if device.is_keyboard() {
            match keymaps.find_config(&device.name) {
                Some(config) => {
                    let port = config.port_name(&device.name);
                    println!("      key map: {}  port: {}", "matched".green(), port)
                }
                None => println!("      key map: {}", "default".yellow()),
            }
        }
    }

    println!();
}
