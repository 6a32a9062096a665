use crate::infra::audit::{AuditEventType, AuditLogger};
use crate::metrics::{
    ACTUATOR_WRITES, BURN_ITERATIONS, DEBOUNCED_REPORTS, SESSIONS_ABORTED, SESSIONS_COMPLETED,
    SESSIONS_FAILED, SESSIONS_STARTED, THROTTLE_COMMAND,
};
use crate::runtime::config::RuntimeConfig;
use crate::runtime::logging::init_tracing;
use crate::runtime::telemetry;
use guidance_core::{
    Actuator, ActuatorSlot, Burn, BurnMode, BurnReport, CancelToken, Comparator, CoreError,
    Debouncer, PlantParams, PreemptibleTask, RangeError, SimActuator, SimulatedPlant,
    TaskOutcome, TelemetryError, TelemetrySource,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

const PLANT_STEP: Duration = Duration::from_millis(10);
const SETTLED_REPORT_DELAY: Duration = Duration::from_millis(250);
const SETTLED_REPORT_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid arguments: {}", .0.join(", "))]
    InvalidArguments(Vec<String>),

    #[error(transparent)]
    Range(#[from] RangeError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("failed to open audit log {}: {source}", .path.display())]
    Audit {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Throttle output that mirrors writes into metrics and, once writes stop
/// for a moment, reports the settled command.
struct ReportingActuator {
    inner: SimActuator,
    settled: Arc<Debouncer>,
}

impl Actuator for ReportingActuator {
    fn write(&mut self, value: f64) -> Result<(), TelemetryError> {
        self.inner.write(value)?;
        THROTTLE_COMMAND.set(value);
        ACTUATOR_WRITES.inc();
        let report = move || {
            DEBOUNCED_REPORTS.inc();
            info!(throttle = value, "throttle settled");
        };
        if let Err(e) = self
            .settled
            .debounce(report, SETTLED_REPORT_DELAY, SETTLED_REPORT_TICK)
        {
            debug!(error = %e, "settled report not scheduled");
        }
        Ok(())
    }
}

pub fn run_from_args() -> ExitCode {
    let config = RuntimeConfig::from_env();
    if config.show_help {
        RuntimeConfig::print_help();
        return ExitCode::SUCCESS;
    }
    let _log_guard = init_tracing(config.json_logs, config.log_dir.as_deref());
    match run(config) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "guidance-ctl failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Runs one burn session against the simulated plant. Expects tracing to be
/// initialized by the caller.
pub fn run(config: RuntimeConfig) -> Result<TaskOutcome<BurnReport>, AppError> {
    if !config.invalid.is_empty() {
        return Err(AppError::InvalidArguments(config.invalid));
    }
    telemetry::init();
    let _metrics_handle = telemetry::start_metrics_server(&config.metrics_addr);
    let audit = init_audit_logger(config.audit_path.as_deref())?;

    audit_event(
        audit.as_deref(),
        AuditEventType::SystemStart,
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "mode": config.mode,
            "metrics_enabled": config.metrics_addr.is_some(),
        }),
    );

    let burn_config = config.burn_config()?;

    let stop = CancelToken::new();
    let plant = SimulatedPlant::new(PlantParams {
        initial: config.start,
        descent_rate: config.descent_rate,
        throttle_gain: config.throttle_gain,
        floor: 0.0,
    });
    let channel = plant.channel();
    let settled = Arc::new(Debouncer::new());
    let slot = ActuatorSlot::new(ReportingActuator {
        inner: plant.actuator(),
        settled: Arc::clone(&settled),
    });
    // Rejected configuration returns before any thread is started.
    let burn = Burn::new(&channel, &slot, burn_config)?;
    let plant_handle = plant.spawn(PLANT_STEP, stop.clone());
    let updater_handle = telemetry::start_metrics_updater(channel.clone(), stop.clone());

    let session_cancel = stop.child();
    let deadline_handle = config.run_seconds.map(|secs| {
        let deadline = session_cancel.clone();
        thread::spawn(move || {
            if deadline.sleep(Duration::from_secs(secs)).is_ok() {
                info!(secs, "run deadline reached, cancelling session");
                deadline.cancel();
            }
        })
    });

    let abort_below = config.abort_below;
    let watched: Arc<dyn TelemetrySource<f64>> = Arc::new(channel.clone());
    let task = PreemptibleTask::new(watched, move |value: &f64| {
        abort_below.is_some_and(|floor| *value < floor)
    })
    .linked_to(&session_cancel)
    .on_abort(move || warn!(?abort_below, "abort floor crossed, preempting burn"));

    let target = config.target;
    let mode = config.mode;

    info!(?mode, start = config.start, target, ?abort_below, "Starting burn session");
    SESSIONS_STARTED.inc();
    audit_event(
        audit.as_deref(),
        AuditEventType::SessionStart,
        serde_json::json!({
            "mode": mode,
            "start": config.start,
            "target": target,
            "abort_below": abort_below,
            "config": burn.config(),
        }),
    );

    let result = task.start(|cancel| match mode {
        BurnMode::Taper => burn.until_reached(target, Comparator::AtOrBelow, cancel),
        BurnMode::Pid => burn.until_pid_reached(target, Comparator::AtOrBelow, cancel),
    });

    record_outcome(audit.as_deref(), &result, channel.value());

    session_cancel.cancel();
    stop.cancel();
    let _ = plant_handle.join();
    let _ = updater_handle.join();
    if let Some(handle) = deadline_handle {
        let _ = handle.join();
    }
    settled.dispose();

    audit_event(
        audit.as_deref(),
        AuditEventType::SystemShutdown,
        serde_json::json!({
            "sessions_started": SESSIONS_STARTED.get(),
            "settled_reports": DEBOUNCED_REPORTS.get(),
        }),
    );

    Ok(result?)
}

fn record_outcome(
    audit: Option<&AuditLogger>,
    result: &Result<TaskOutcome<BurnReport>, CoreError>,
    last_value: f64,
) {
    match result {
        Ok(TaskOutcome::Completed(report)) => {
            SESSIONS_COMPLETED.inc();
            BURN_ITERATIONS.inc_by(report.iterations);
            info!(
                outcome = ?report.outcome,
                iterations = report.iterations,
                writes = report.actuator_writes,
                max_overrun_us = report.max_overrun_us,
                "Burn session complete"
            );
            let details = serde_json::to_value(report).unwrap_or_default();
            audit_event(audit, AuditEventType::SessionCompleted, details);
        }
        Ok(TaskOutcome::Aborted) => {
            SESSIONS_ABORTED.inc();
            warn!(last_value, "Burn session preempted");
            audit_event(
                audit,
                AuditEventType::SessionAborted,
                serde_json::json!({ "last_value": last_value }),
            );
        }
        Err(e) => {
            SESSIONS_FAILED.inc();
            error!(error = %e, last_value, "Burn session failed");
            audit_event(
                audit,
                AuditEventType::SessionFailed,
                serde_json::json!({ "error": e.to_string(), "last_value": last_value }),
            );
        }
    }
}

fn audit_event(audit: Option<&AuditLogger>, event: AuditEventType, details: serde_json::Value) {
    if let Some(logger) = audit {
        if let Err(e) = logger.log_event(event, details) {
            warn!(error = %e, "Failed to write audit entry");
        }
    }
}

fn init_audit_logger(audit_path: Option<&Path>) -> Result<Option<Arc<AuditLogger>>, AppError> {
    audit_path
        .map(|path| {
            let logger = AuditLogger::new(path).map_err(|source| AppError::Audit {
                path: path.to_path_buf(),
                source,
            })?;
            info!(path = %path.display(), "Audit logging enabled");
            Ok(Arc::new(logger))
        })
        .transpose()
}
