use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static LEASE_ACQUIRE: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("scope_lease_acquire_total", "telescope lease acquisitions by outcome"),
        &["result"],
    )
    .expect("scope_lease_acquire_total definition");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static LEASE_RELEASE: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("scope_lease_release_total", "telescope lease releases by outcome"),
        &["result"],
    )
    .expect("scope_lease_release_total definition");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static CONTROL_DISPATCH: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "scope_control_dispatch_total",
            "control commands sent to telescopes by kind and outcome",
        ),
        &["kind", "result"],
    )
    .expect("scope_control_dispatch_total definition");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static SESSION_LOST: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::with_opts(Opts::new(
        "scope_session_lost_total",
        "realtime sessions lost while a lease was held",
    ))
    .expect("scope_session_lost_total definition");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static TEARDOWN: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::with_opts(Opts::new(
        "scope_teardown_total",
        "coordinator teardowns executed",
    ))
    .expect("scope_teardown_total definition");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

/// Text exposition of every session metric.
pub fn gather() -> String {
    Lazy::force(&LEASE_ACQUIRE);
    Lazy::force(&LEASE_RELEASE);
    Lazy::force(&CONTROL_DISPATCH);
    Lazy::force(&SESSION_LOST);
    Lazy::force(&TEARDOWN);
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if TextEncoder::new().encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn exposes_registered_counters() {
        LEASE_ACQUIRE.with_label_values(&["ok"]).inc();
        TEARDOWN.inc();
        let text = gather();
        assert!(text.contains("scope_lease_acquire_total"));
        assert!(text.contains("scope_teardown_total"));
    }
}
