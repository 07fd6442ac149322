//! Loopback round trips across an in-memory link.
//!
//! Run with:
//!   cargo run --example loopback --features logging -- [rounds] [log-level]

use std::env;
use std::sync::Arc;
use std::time::Duration;

use hublink::app::{AppConfig, AppContext, AppWorker, LoopbackClient};
use hublink::logging::{init_logging, LogFormat, LogLevel};
use hublink::transport::MemoryLink;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = env::args().skip(1);
    let rounds: usize = args.next().map(|arg| arg.parse()).transpose()?.unwrap_or(5);
    let level: LogLevel = args.next().map(|arg| arg.parse()).transpose()?.unwrap_or(LogLevel::Info);
    init_logging(LogFormat::Text, level);

    let (host_link, hub_link) = MemoryLink::pair();

    let hub = AppContext::new(
        AppConfig {
            enable_loopback: true,
            worker_thread_name: "hub-app".to_string(),
            ..AppConfig::default()
        },
        Arc::new(hub_link.clone()),
    )?;
    let hub_worker = AppWorker::spawn(hub)?;
    hub_link.attach(hub_worker.link_handler());

    let host = AppContext::new(
        AppConfig {
            worker_thread_name: "host-app".to_string(),
            ..AppConfig::default()
        },
        Arc::new(host_link.clone()),
    )?;
    let host_worker = AppWorker::spawn(host.clone())?;
    host_link.attach(host_worker.link_handler());

    let client = LoopbackClient::register(&host)?;
    for round in 0..rounds {
        let payload = vec![round as u8; 16 * (round + 1)];
        let elapsed = client.test(payload, Duration::from_secs(1))?;
        eprintln!("round {round}: {} bytes echoed in {elapsed:?}", 16 * (round + 1));
    }

    drop(client);
    host_worker.shutdown();
    hub_worker.shutdown();
    Ok(())
}
