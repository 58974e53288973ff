//! Sensor bridge demo
//!
//! Run with: cargo run --example sensor_bridge [BIND_ADDR] [--mqtt HOST TOPIC] [--log PATH] [--csv PATH]
//!
//! Examples:
//!   cargo run --example sensor_bridge                               # 127.0.0.1:8765
//!   cargo run --example sensor_bridge 0.0.0.0:9000
//!   cargo run --example sensor_bridge --mqtt localhost sensors/demo # also relay via MQTT
//!
//! Every second two simulated sensors and one manual setpoint are read.
//! Readings are broadcast to every WebSocket client of the bridge, batched in
//! a bounded buffer, and flushed to JSON-lines and CSV logs once the buffer
//! fills.
//!
//! Watch the stream with any WebSocket client, e.g.:
//!   websocat ws://127.0.0.1:8765

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use iotkit_rs::client::MqttConfig;
use iotkit_rs::sink::MemorySink;
use iotkit_rs::{
    BoundedBuffer, Bridge, CsvSink, JsonLinesSink, ManualSensor, MultiSink, RandomSensor, Record,
    SensorCollection, ServerConfig,
};

struct Args {
    bind_addr: SocketAddr,
    mqtt: Option<(String, String)>,
    log_path: PathBuf,
    csv_path: PathBuf,
}

fn print_usage() {
    eprintln!("Usage: sensor_bridge [BIND_ADDR] [--mqtt HOST TOPIC] [--log PATH] [--csv PATH]");
    eprintln!();
    eprintln!("  BIND_ADDR        WebSocket listen address (default 127.0.0.1:8765)");
    eprintln!("  --mqtt HOST TOPIC  also publish client records to an MQTT broker");
    eprintln!("  --log PATH       JSON-lines output file (default sensor_log.jsonl)");
    eprintln!("  --csv PATH       CSV output file (default sensor_log.csv)");
}

fn parse_args() -> Result<Args, String> {
    let mut args = std::env::args().skip(1);
    let mut parsed = Args {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], iotkit_rs::server::config::DEFAULT_PORT)),
        mqtt: None,
        log_path: PathBuf::from("sensor_log.jsonl"),
        csv_path: PathBuf::from("sensor_log.csv"),
    };

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--mqtt" => {
                let host = args.next().ok_or("--mqtt needs HOST and TOPIC")?;
                let topic = args.next().ok_or("--mqtt needs HOST and TOPIC")?;
                parsed.mqtt = Some((host, topic));
            }
            "--log" => {
                parsed.log_path = args.next().ok_or("--log needs a PATH")?.into();
            }
            "--csv" => {
                parsed.csv_path = args.next().ok_or("--csv needs a PATH")?.into();
            }
            other => {
                parsed.bind_addr = other
                    .parse()
                    .map_err(|_| format!("Invalid address: {}", other))?;
            }
        }
    }

    Ok(parsed)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = std::env::args().collect::<Vec<_>>();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("iotkit_rs=info".parse()?)
                .add_directive("sensor_bridge=debug".parse()?),
        )
        .init();

    let bridge = Bridge::new(ServerConfig::with_addr(args.bind_addr));
    let addr = bridge.start().await?;
    println!("Bridge {} listening on ws://{}", bridge.id(), addr);

    if let Some((host, topic)) = &args.mqtt {
        if let Err(e) = bridge.add_publisher("mqtt", MqttConfig::new(host, topic)).await {
            eprintln!("MQTT publisher not connected: {}", e);
        }
    }

    let setpoint = ManualSensor::new("setpoint", 5.0, 30.0)?;
    setpoint.set_value(21.0)?;

    let mut sensors = SensorCollection::new();
    sensors.add(RandomSensor::new("temperature", -10.0, 40.0)?);
    sensors.add(RandomSensor::new("humidity", 0.0, 100.0)?);
    sensors.add(setpoint);

    let sinks = MultiSink::new();
    sinks.add("file", JsonLinesSink::open(&args.log_path)?);
    sinks.add("csv", CsvSink::open(&args.csv_path)?);
    sinks.add("memory", MemorySink::new());
    let buffer = BoundedBuffer::<Record>::new(10);

    println!(
        "Logging readings to {} and {}",
        args.log_path.display(),
        args.csv_path.display()
    );
    println!("Press Ctrl+C to stop");

    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for (name, reading) in sensors.read_all() {
                    match bridge.server().broadcast(&reading).await {
                        Ok(report) => tracing::debug!(sensor = %name, clients = report.sent, "Broadcast reading"),
                        Err(e) => tracing::warn!(sensor = %name, error = %e, "Broadcast failed"),
                    }

                    if buffer.add(reading.clone()).is_err() {
                        let counts = sinks.flush(&buffer);
                        tracing::info!(?counts, "Flushed readings");
                        if let Err(e) = buffer.add(reading) {
                            tracing::warn!(error = %e, "Reading dropped");
                        }
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    let counts = sinks.flush(&buffer);
    tracing::info!(?counts, "Final flush");

    println!("{}", serde_json::to_string_pretty(&bridge.get_status().await)?);
    bridge.stop().await;

    Ok(())
}
