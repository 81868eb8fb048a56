use miio_gateway::{Diagnostic, GatewayClient, GatewayConfig, Notification, Request};
use std::time::Duration;

#[tokio::main]
async fn main() -> miio_gateway::Result<()> {
    tracing_subscriber::fmt::init();

    // Usage: listen <host> [config.json]
    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "192.168.1.10".to_string());
    let mut config = match args.next() {
        Some(path) => GatewayConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => GatewayConfig::new(host.clone()),
    };
    if config.host.is_empty() {
        config.host = host;
    }

    println!("Gateway configuration:");
    println!("- Target: {}:{}", config.host, config.port);
    println!("- Heartbeat every {:?}, judged every {:?}", config.heartbeat_interval, config.availability_check_interval);
    println!("- Known sensors: {}", config.sensors.len());

    let mut client = GatewayClient::new(config)?;
    println!("- Unique ID: {}", client.unique_id());

    client.subscribe(|notification: &Notification| -> miio_gateway::Result<()> {
        match notification {
            Notification::Availability { availability, at } => {
                println!("[{}] gateway is {}", at.format("%H:%M:%S"), availability);
            }
            Notification::Push(push) => {
                println!("{} {} {}: {}", push.model, push.sid, push.kind.as_str(), serde_json::Value::Object(push.params.clone()));
            }
        }
        Ok(())
    });

    let mut diagnostics = client.diagnostics();
    tokio::spawn(async move {
        while let Ok(diagnostic) = diagnostics.recv().await {
            if let Diagnostic::DecodeFailed { bytes, reason } = diagnostic {
                eprintln!("Dropped {} byte datagram: {}", bytes, reason);
            }
        }
    });

    client.start().await?;
    println!("\nGateway is {}", client.availability());

    let volume = client
        .call_with_timeout(Request::new("get_prop").with_params(serde_json::json!(["gateway_volume"])), Duration::from_secs(5))
        .await?;
    println!("Gateway volume: {:?}", volume.value());

    println!("Listening, press Ctrl-C to stop...");
    tokio::signal::ctrl_c().await?;

    client.stop().await?;
    println!("\nDone");
    Ok(())
}
