use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Prometheus metrics for an engine node
pub struct EngineMetrics {
    pub registry: Registry,

    // State machine
    pub commands_applied: IntCounterVec,

    // Builds
    pub builds_total: IntCounterVec,
    pub build_log_lines: IntCounter,
    pub build_duration: Histogram,

    // Raft metrics
    pub raft_term: IntGauge,
    pub raft_leader: IntGauge,
}

impl EngineMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let commands_applied = IntCounterVec::new(
            Opts::new(
                "orbit_commands_applied_total",
                "Commands applied to the cluster state by operation and outcome",
            ),
            &["op", "outcome"],
        )?;
        registry.register(Box::new(commands_applied.clone()))?;

        let builds_total = IntCounterVec::new(
            Opts::new("orbit_builds_total", "Deployment builds by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(builds_total.clone()))?;

        let build_log_lines = IntCounter::new(
            "orbit_build_log_lines_total",
            "Build output lines flushed into the cluster state",
        )?;
        registry.register(Box::new(build_log_lines.clone()))?;

        let build_duration = Histogram::with_opts(
            HistogramOpts::new(
                "orbit_build_duration_seconds",
                "Deployment build duration in seconds",
            )
            .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0]),
        )?;
        registry.register(Box::new(build_duration.clone()))?;

        let raft_term = IntGauge::new("orbit_raft_term", "Current Raft term number")?;
        registry.register(Box::new(raft_term.clone()))?;

        let raft_leader =
            IntGauge::new("orbit_raft_leader", "1 if this node is leader, 0 otherwise")?;
        registry.register(Box::new(raft_leader.clone()))?;

        Ok(EngineMetrics {
            registry,
            commands_applied,
            builds_total,
            build_log_lines,
            build_duration,
            raft_term,
            raft_leader,
        })
    }

    pub fn inc_command(&self, op: &str, outcome: &str) {
        self.commands_applied.with_label_values(&[op, outcome]).inc();
    }

    /// Record a finished build
    pub fn observe_build(&self, outcome: &str, duration_secs: f64) {
        self.builds_total.with_label_values(&[outcome]).inc();
        self.build_duration.observe(duration_secs);
    }

    pub fn set_raft(&self, term: u64, leader: bool) {
        self.raft_term.set(term as i64);
        self.raft_leader.set(leader as i64);
    }

    /// Render the registry in the Prometheus text exposition format
    pub fn gather_text(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
