//! Metric names shared between the core and its host binaries.

#[derive(Debug, Clone, Copy)]
pub struct Tag {
    pub metric: &'static str,
    pub help: &'static str,
}

pub const CONTROLLED_VALUE: Tag = Tag {
    metric: "guidance_controlled_value",
    help: "Latest controlled telemetry value",
};

pub const THROTTLE: Tag = Tag {
    metric: "guidance_throttle_command",
    help: "Last throttle command written (0.0-1.0)",
};

pub const BURN_ITERATIONS: Tag = Tag {
    metric: "guidance_burn_iterations_total",
    help: "Control loop iterations executed",
};

pub const ACTUATOR_WRITES: Tag = Tag {
    metric: "guidance_actuator_writes_total",
    help: "Commands written to the actuator",
};
