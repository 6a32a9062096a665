use guidance_core::{BurnConfig, BurnMode, PidGains, RangeError, ThrottleBounds};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub show_help: bool,
    pub run_seconds: Option<u64>,
    pub json_logs: bool,
    pub log_dir: Option<PathBuf>,
    pub metrics_addr: Option<String>,
    pub audit_path: Option<PathBuf>,
    pub mode: BurnMode,
    pub start: f64,
    pub target: f64,
    pub abort_below: Option<f64>,
    pub descent_rate: f64,
    pub throttle_gain: f64,
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub integral_limit: Option<f64>,
    pub throttle_min: f64,
    pub throttle_max: f64,
    pub sample_period_ms: u64,
    /// Flags whose value was missing or could not be parsed.
    pub invalid: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            show_help: false,
            run_seconds: None,
            json_logs: false,
            log_dir: None,
            metrics_addr: None,
            audit_path: None,
            mode: BurnMode::Taper,
            start: 2000.0,
            target: 1000.0,
            abort_below: None,
            descent_rate: 200.0,
            throttle_gain: 1500.0,
            kp: -0.002,
            ki: 0.0,
            kd: 0.0,
            integral_limit: None,
            throttle_min: 0.0,
            throttle_max: 1.0,
            sample_period_ms: 50,
            invalid: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let args: Vec<String> = std::env::args().collect();
        Self::from_args(&args)
    }

    pub fn from_args(args: &[String]) -> Self {
        let mut cfg = RuntimeConfig::default();
        let mut i = 1;
        while i < args.len() {
            let value = args.get(i + 1);
            let mut consumed = true;
            let flag = args[i].as_str();
            match flag {
                "--run-seconds" => cfg.run_seconds = parse_opt(flag, value, &mut cfg.invalid),
                "--json-logs" => {
                    cfg.json_logs = true;
                    consumed = false;
                }
                "--log-dir" => cfg.log_dir = value.map(PathBuf::from),
                "--metrics-addr" => cfg.metrics_addr = value.cloned(),
                "--audit-log" => cfg.audit_path = value.map(PathBuf::from),
                "--mode" => match value.map(String::as_str) {
                    Some("taper") => cfg.mode = BurnMode::Taper,
                    Some("pid") => cfg.mode = BurnMode::Pid,
                    other => cfg.invalid.push(invalid_flag(flag, other)),
                },
                "--start" => parse_into(flag, value, &mut cfg.start, &mut cfg.invalid),
                "--target" => parse_into(flag, value, &mut cfg.target, &mut cfg.invalid),
                "--abort-below" => cfg.abort_below = parse_opt(flag, value, &mut cfg.invalid),
                "--descent-rate" => parse_into(flag, value, &mut cfg.descent_rate, &mut cfg.invalid),
                "--throttle-gain" => parse_into(flag, value, &mut cfg.throttle_gain, &mut cfg.invalid),
                "--kp" => parse_into(flag, value, &mut cfg.kp, &mut cfg.invalid),
                "--ki" => parse_into(flag, value, &mut cfg.ki, &mut cfg.invalid),
                "--kd" => parse_into(flag, value, &mut cfg.kd, &mut cfg.invalid),
                "--integral-limit" => {
                    cfg.integral_limit = parse_opt(flag, value, &mut cfg.invalid)
                }
                "--throttle-min" => parse_into(flag, value, &mut cfg.throttle_min, &mut cfg.invalid),
                "--throttle-max" => parse_into(flag, value, &mut cfg.throttle_max, &mut cfg.invalid),
                "--sample-period-ms" => parse_into(flag, value, &mut cfg.sample_period_ms, &mut cfg.invalid),
                "--help" | "-h" => {
                    cfg.show_help = true;
                    break;
                }
                _ => consumed = false,
            }
            if consumed && value.is_some() {
                i += 1;
            }
            i += 1;
        }
        cfg
    }

    /// Burn parameters derived from the flags. The remaining checks run
    /// when the burn is constructed.
    pub fn burn_config(&self) -> Result<BurnConfig, RangeError> {
        let throttle = ThrottleBounds::new(self.throttle_min, self.throttle_max)?;
        Ok(BurnConfig {
            throttle,
            gains: PidGains {
                kp: self.kp,
                ki: self.ki,
                kd: self.kd,
            },
            integral_limit: self.integral_limit,
            sample_period: Duration::from_millis(self.sample_period_ms),
            ..Default::default()
        })
    }

    pub fn print_help() {
        println!(
            r#"guidance-ctl - Preemptible closed-loop burn controller

USAGE:
    guidance-ctl [OPTIONS]

OPTIONS:
    --mode <taper|pid>        Control law for the burn [default: taper]
    --start <VALUE>           Initial value of the simulated telemetry [default: 2000]
    --target <VALUE>          Burn until the value falls to this target [default: 1000]
    --abort-below <VALUE>     Preempt the burn if the value drops below this floor
    --descent-rate <RATE>     Plant descent with zero throttle, units/s [default: 200]
    --throttle-gain <RATE>    Additional descent at full throttle, units/s [default: 1500]
    --kp <GAIN>               PID proportional gain [default: -0.002]
    --ki <GAIN>               PID integral gain [default: 0]
    --kd <GAIN>               PID derivative gain [default: 0]
    --integral-limit <LIMIT>  Clamp the PID integral to +/- LIMIT (anti-windup)
    --throttle-min <0..1>     Minimum throttle command [default: 0]
    --throttle-max <0..1>     Maximum throttle command [default: 1]
    --sample-period-ms <MS>   PID sample period [default: 50]
    --run-seconds <SECS>      Cancel the session after a fixed duration
    --json-logs               Output logs in JSON format (for log aggregation)
    --log-dir <PATH>          Also write daily-rolling log files to this directory
    --metrics-addr <ADDR>     Enable Prometheus metrics server on address (e.g., 0.0.0.0:9090)
    --audit-log <PATH>        Enable audit logging to specified JSONL file
    -h, --help                Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                  Set log filter (e.g., RUST_LOG=debug,guidance_core=trace)

EXAMPLES:
    # PID burn with metrics
    guidance-ctl --mode pid --metrics-addr 0.0.0.0:9090

    # Taper burn that is preempted by a low-value condition
    guidance-ctl --target 500 --abort-below 1200 --audit-log /tmp/guidance/audit.jsonl
"#
        );
    }
}

fn invalid_flag(flag: &str, value: Option<&str>) -> String {
    match value {
        Some(v) => format!("{flag} {v}"),
        None => format!("{flag} (missing value)"),
    }
}

fn parse_opt<T: FromStr>(flag: &str, value: Option<&String>, invalid: &mut Vec<String>) -> Option<T> {
    match value.map(|v| v.parse()) {
        Some(Ok(parsed)) => Some(parsed),
        _ => {
            invalid.push(invalid_flag(flag, value.map(String::as_str)));
            None
        }
    }
}

fn parse_into<T: FromStr>(flag: &str, value: Option<&String>, slot: &mut T, invalid: &mut Vec<String>) {
    if let Some(parsed) = parse_opt(flag, value, invalid) {
        *slot = parsed;
    }
}
