use crate::metrics::{init_metrics, serve_metrics, CONTROLLED_VALUE};
use guidance_core::{CancelToken, SimChannel};
use std::thread;
use std::time::Duration;
use tracing::info;

pub fn init() {
    init_metrics();
}

pub fn start_metrics_server(addr: &Option<String>) -> Option<thread::JoinHandle<()>> {
    addr.as_ref().map(|addr| {
        info!(addr = %addr, "Starting metrics server");
        serve_metrics(addr.clone())
    })
}

/// Mirrors the controlled value into its gauge until `stop` is cancelled.
pub fn start_metrics_updater(
    channel: SimChannel<f64>,
    stop: CancelToken,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        CONTROLLED_VALUE.set(channel.value());
        while stop.sleep(Duration::from_millis(200)).is_ok() {
            CONTROLLED_VALUE.set(channel.value());
        }
    })
}
