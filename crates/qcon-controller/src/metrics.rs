use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use qcon_relay::RelayStats;

#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    // Launches
    launches_total: AtomicU64,
    launch_failures_total: AtomicU64,
    launch_rejected_total: AtomicU64,

    // Teardown
    kills_total: AtomicU64,
    kill_failures_total: AtomicU64,
    instances_reaped_total: AtomicU64,

    // Relays
    relays_active: AtomicU64,
    relays_total: AtomicU64,
    relay_upstream_failures_total: AtomicU64,
    relay_frames_client_to_upstream_total: AtomicU64,
    relay_frames_upstream_to_client_total: AtomicU64,

    // Test runs
    test_runs_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn launch_succeeded(&self) {
        self.inner.launches_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn launch_failed(&self) {
        self.inner
            .launch_failures_total
            .fetch_add(1, Ordering::Relaxed);
    }

    /// A launch turned away before any resource was allocated.
    pub fn launch_rejected(&self) {
        self.inner
            .launch_rejected_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn instance_killed(&self, ok: bool) {
        self.inner.kills_total.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.inner
                .kill_failures_total
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn instances_reaped(&self, count: usize) {
        self.inner
            .instances_reaped_total
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn relay_opened(&self) {
        self.inner.relays_total.fetch_add(1, Ordering::Relaxed);
        self.inner.relays_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn relay_closed(&self, stats: RelayStats) {
        self.inner.relays_active.fetch_sub(1, Ordering::Relaxed);
        self.inner
            .relay_frames_client_to_upstream_total
            .fetch_add(stats.client_to_upstream, Ordering::Relaxed);
        self.inner
            .relay_frames_upstream_to_client_total
            .fetch_add(stats.upstream_to_client, Ordering::Relaxed);
    }

    pub fn relay_upstream_failed(&self) {
        self.inner
            .relay_upstream_failures_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn test_run_started(&self) {
        self.inner.test_runs_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Renders the counters plus the two instance gauges, which the caller samples from the
    /// registry.
    pub fn render_prometheus(&self, instances_active: usize, slots_in_use: usize) -> String {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let inner = &*self.inner;

        let mut out = String::new();

        push_gauge(&mut out, "qcon_instances_active", instances_active as u64);
        push_gauge(&mut out, "qcon_slots_in_use", slots_in_use as u64);

        push_counter(&mut out, "qcon_launches_total", load(&inner.launches_total));
        push_counter(
            &mut out,
            "qcon_launch_failures_total",
            load(&inner.launch_failures_total),
        );
        push_counter(
            &mut out,
            "qcon_launch_rejected_total",
            load(&inner.launch_rejected_total),
        );

        push_counter(&mut out, "qcon_kills_total", load(&inner.kills_total));
        push_counter(
            &mut out,
            "qcon_kill_failures_total",
            load(&inner.kill_failures_total),
        );
        push_counter(
            &mut out,
            "qcon_instances_reaped_total",
            load(&inner.instances_reaped_total),
        );

        push_gauge(&mut out, "qcon_relays_active", load(&inner.relays_active));
        push_counter(&mut out, "qcon_relays_total", load(&inner.relays_total));
        push_counter(
            &mut out,
            "qcon_relay_upstream_failures_total",
            load(&inner.relay_upstream_failures_total),
        );
        push_counter(
            &mut out,
            "qcon_relay_frames_client_to_upstream_total",
            load(&inner.relay_frames_client_to_upstream_total),
        );
        push_counter(
            &mut out,
            "qcon_relay_frames_upstream_to_client_total",
            load(&inner.relay_frames_upstream_to_client_total),
        );

        push_counter(&mut out, "qcon_test_runs_total", load(&inner.test_runs_total));

        out
    }
}

fn push_gauge(out: &mut String, name: &str, val: u64) {
    push_metric(out, name, "gauge", val);
}

fn push_counter(out: &mut String, name: &str, val: u64) {
    push_metric(out, name, "counter", val);
}

fn push_metric(out: &mut String, name: &str, kind: &str, val: u64) {
    out.push_str("# TYPE ");
    out.push_str(name);
    out.push(' ');
    out.push_str(kind);
    out.push('\n');
    out.push_str(name);
    out.push(' ');
    out.push_str(&val.to_string());
    out.push('\n');
}
