use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::{PoisonError, RwLock};

/// Metric names exported by the controller.
pub mod names {
    pub const SYNC_CYCLES_TOTAL: &str = "alb_sync_cycles_total";
    pub const REMOTE_CALLS_TOTAL: &str = "alb_remote_calls_total";
    pub const REMOTE_CALL_FAILURES_TOTAL: &str = "alb_remote_call_failures_total";
    pub const RECONCILE_FAILURES_TOTAL: &str = "alb_reconcile_failures_total";
    pub const LOOKUP_MISSES_TOTAL: &str = "alb_target_group_lookup_misses_total";
    pub const TEARDOWNS_TOTAL: &str = "alb_load_balancer_teardowns_total";
    pub const MANAGED_LOAD_BALANCERS: &str = "alb_managed_load_balancers";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Counter,
    Gauge,
}

impl Kind {
    fn as_str(self) -> &'static str {
        match self {
            Kind::Counter => "counter",
            Kind::Gauge => "gauge",
        }
    }
}

/// A metric and all of its label series. The key of `series` is the rendered
/// label set (`operation="create_rule"`), empty for the unlabeled series.
struct Family {
    kind: Kind,
    help: String,
    series: BTreeMap<String, i64>,
}

/// A small thread-safe metrics registry that renders in Prometheus text exposition format.
///
/// Updates to unregistered names are ignored.
#[derive(Default)]
pub struct MetricsRegistry {
    families: RwLock<BTreeMap<String, Family>>,
}

fn render_labels(labels: &[(&str, &str)]) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, v.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect::<Vec<_>>()
        .join(",")
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every controller metric from [`names`] registered.
    pub fn controller() -> Self {
        let registry = Self::new();
        registry.register_counter(names::SYNC_CYCLES_TOTAL, "Completed sync cycles");
        registry.register_counter(names::REMOTE_CALLS_TOTAL, "Cloud API calls by operation");
        registry.register_counter(
            names::REMOTE_CALL_FAILURES_TOTAL,
            "Failed cloud API calls by operation",
        );
        registry.register_counter(
            names::RECONCILE_FAILURES_TOTAL,
            "Entities that failed to reconcile",
        );
        registry.register_counter(
            names::LOOKUP_MISSES_TOTAL,
            "Rules that fell back to the first target group",
        );
        registry.register_counter(names::TEARDOWNS_TOTAL, "Load balancer trees torn down");
        registry.register_gauge(names::MANAGED_LOAD_BALANCERS, "Tracked load balancer trees");
        registry
    }

    fn register(&self, name: &str, help: &str, kind: Kind) {
        let mut families = self.families.write().unwrap_or_else(PoisonError::into_inner);
        families.entry(name.to_string()).or_insert_with(|| Family {
            kind,
            help: help.to_string(),
            series: BTreeMap::new(),
        });
    }

    /// Register a counter. If it already exists, this is a no-op.
    pub fn register_counter(&self, name: &str, help: &str) {
        self.register(name, help, Kind::Counter);
    }

    /// Register a gauge. If it already exists, this is a no-op.
    pub fn register_gauge(&self, name: &str, help: &str) {
        self.register(name, help, Kind::Gauge);
    }

    fn update(&self, name: &str, labels: &[(&str, &str)], kind: Kind, f: impl FnOnce(&mut i64)) {
        let mut families = self.families.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(family) = families.get_mut(name)
            && family.kind == kind
        {
            f(family.series.entry(render_labels(labels)).or_insert(0));
        }
    }

    /// Increment a counter by 1.
    pub fn counter_inc(&self, name: &str) {
        self.counter_add_with(name, &[], 1);
    }

    /// Increment a counter by a given amount.
    pub fn counter_add(&self, name: &str, val: u64) {
        self.counter_add_with(name, &[], val);
    }

    /// Increment one labeled series of a counter by 1.
    pub fn counter_inc_with(&self, name: &str, labels: &[(&str, &str)]) {
        self.counter_add_with(name, labels, 1);
    }

    fn counter_add_with(&self, name: &str, labels: &[(&str, &str)], val: u64) {
        let delta = i64::try_from(val).unwrap_or(i64::MAX);
        self.update(name, labels, Kind::Counter, |v| *v = v.saturating_add(delta));
    }

    /// Set a gauge to a specific value.
    pub fn gauge_set(&self, name: &str, val: i64) {
        self.update(name, &[], Kind::Gauge, |v| *v = val);
    }

    /// Current value of a series, 0 if it was never touched.
    pub fn value(&self, name: &str, labels: &[(&str, &str)]) -> i64 {
        let families = self.families.read().unwrap_or_else(PoisonError::into_inner);
        families
            .get(name)
            .and_then(|f| f.series.get(&render_labels(labels)).copied())
            .unwrap_or(0)
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let families = self.families.read().unwrap_or_else(PoisonError::into_inner);
        let mut output = String::new();
        for (name, family) in families.iter() {
            let _ = writeln!(output, "# HELP {} {}", name, family.help);
            let _ = writeln!(output, "# TYPE {} {}", name, family.kind.as_str());
            if family.series.is_empty() {
                let _ = writeln!(output, "{} 0", name);
            }
            for (labels, value) in &family.series {
                if labels.is_empty() {
                    let _ = writeln!(output, "{} {}", name, value);
                } else {
                    let _ = writeln!(output, "{}{{{}}} {}", name, labels, value);
                }
            }
        }
        output
    }
}
