//! Prometheus metrics for burn sessions.

use guidance_core::tags;
use prometheus::{Encoder, Gauge, IntCounter, Registry, TextEncoder};
use std::sync::LazyLock;
use std::thread;
use tiny_http::{Response, Server};

/// Global metrics registry
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

fn counter(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("valid counter definition");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("counter registered once");
    counter
}

fn gauge(name: &str, help: &str) -> Gauge {
    let gauge = Gauge::new(name, help).expect("valid gauge definition");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("gauge registered once");
    gauge
}

// ============================================================================
// Session Metrics
// ============================================================================

pub static SESSIONS_STARTED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter("guidance_sessions_started_total", "Burn sessions started")
});

pub static SESSIONS_COMPLETED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "guidance_sessions_completed_total",
        "Burn sessions whose worker finished before the abort condition",
    )
});

pub static SESSIONS_ABORTED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "guidance_sessions_aborted_total",
        "Burn sessions preempted by the abort condition",
    )
});

pub static SESSIONS_FAILED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "guidance_sessions_failed_total",
        "Burn sessions ended by a telemetry or configuration error",
    )
});

// ============================================================================
// Control Loop Metrics
// ============================================================================

pub static BURN_ITERATIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(tags::BURN_ITERATIONS.metric, tags::BURN_ITERATIONS.help)
});

pub static ACTUATOR_WRITES: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(tags::ACTUATOR_WRITES.metric, tags::ACTUATOR_WRITES.help)
});

pub static DEBOUNCED_REPORTS: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "guidance_throttle_settled_reports_total",
        "Debounced throttle-settled reports emitted",
    )
});

pub static THROTTLE_COMMAND: LazyLock<Gauge> = LazyLock::new(|| {
    gauge(tags::THROTTLE.metric, tags::THROTTLE.help)
});

pub static CONTROLLED_VALUE: LazyLock<Gauge> = LazyLock::new(|| {
    gauge(tags::CONTROLLED_VALUE.metric, tags::CONTROLLED_VALUE.help)
});

// ============================================================================
// Metrics HTTP Server
// ============================================================================

/// Start the metrics HTTP server on the given address.
/// Returns a join handle for the server thread.
pub fn serve_metrics(bind_addr: String) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let server = match Server::http(&bind_addr) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to start metrics server on {}: {}", bind_addr, e);
                return;
            }
        };

        tracing::info!("Metrics server listening on http://{}/metrics", bind_addr);

        for request in server.incoming_requests() {
            match request.url() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let mut buffer = Vec::new();
                    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
                        tracing::warn!("Failed to encode metrics: {}", e);
                        let _ = request.respond(
                            Response::from_string("Internal Server Error").with_status_code(500),
                        );
                        continue;
                    }
                    let mut response = Response::from_data(buffer);
                    if let Ok(header) = tiny_http::Header::from_bytes(
                        &b"Content-Type"[..],
                        &b"text/plain; version=0.0.4"[..],
                    ) {
                        response = response.with_header(header);
                    }
                    let _ = request.respond(response);
                }
                "/health" => {
                    let _ = request.respond(Response::from_string("OK"));
                }
                "/ready" => {
                    // Ready once a session has been started
                    if SESSIONS_STARTED.get() > 0 {
                        let _ = request.respond(Response::from_string("Ready"));
                    } else {
                        let _ = request
                            .respond(Response::from_string("Not Ready").with_status_code(503));
                    }
                }
                _ => {
                    let _ =
                        request.respond(Response::from_string("Not Found").with_status_code(404));
                }
            }
        }
    })
}

/// Initialize all metrics (forces lazy initialization)
pub fn init_metrics() {
    let _ = SESSIONS_STARTED.get();
    let _ = SESSIONS_COMPLETED.get();
    let _ = SESSIONS_ABORTED.get();
    let _ = SESSIONS_FAILED.get();
    let _ = BURN_ITERATIONS.get();
    let _ = ACTUATOR_WRITES.get();
    let _ = DEBOUNCED_REPORTS.get();
    let _ = THROTTLE_COMMAND.get();
    let _ = CONTROLLED_VALUE.get();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_exposes_session_metrics() {
        init_metrics();
        SESSIONS_STARTED.inc();
        let names: Vec<String> = REGISTRY
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"guidance_sessions_started_total".to_string()));
        assert!(names.contains(&tags::THROTTLE.metric.to_string()));
    }
}
