// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Prometheus metrics for remote execution.
//! Statics are updated directly from the node's dispatch and completion paths.

use once_cell::sync::{Lazy, OnceCell};
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts};
use std::time::Instant;

const NAME_PREFIX: &str = "dynamo_eager_remote";

pub const ERROR_CODE_LABEL: &str = "error_code";

fn metric_name(suffix: &str) -> String {
    format!("{NAME_PREFIX}_{suffix}")
}

pub static RPCS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        metric_name("rpcs_total"),
        "Total enqueue RPCs issued by remote execute nodes",
    )
    .expect("rpcs_total counter")
});

/// `error_code` label values: [`crate::error::ErrorCode::as_str`]
pub static RPC_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            metric_name("rpc_errors_total"),
            "Total enqueue RPCs that completed with an error (label: error_code)",
        ),
        &[ERROR_CODE_LABEL],
    )
    .expect("rpc_errors_total counter vec")
});

pub static INFLIGHT_RPCS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        metric_name("inflight_rpcs"),
        "Enqueue RPCs dispatched and not yet completed",
    )
    .expect("inflight_rpcs gauge")
});

pub static RPC_DURATION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(HistogramOpts::new(
        metric_name("rpc_duration_seconds"),
        "Time from dispatch to completion of an enqueue RPC",
    ))
    .expect("rpc_duration_seconds histogram")
});

pub static SHAPE_ERRORS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        metric_name("shape_errors_total"),
        "Remote shapes that could not be applied after a successful RPC",
    )
    .expect("shape_errors_total counter")
});

static REGISTERED: OnceCell<()> = OnceCell::new();

/// Register the remote execution metrics with a Prometheus registry. Idempotent.
pub fn ensure_metrics_registered(registry: &prometheus::Registry) -> Result<(), prometheus::Error> {
    if REGISTERED.get().is_some() {
        return Ok(());
    }
    registry.register(Box::new(RPCS_TOTAL.clone()))?;
    registry.register(Box::new(RPC_ERRORS_TOTAL.clone()))?;
    registry.register(Box::new(INFLIGHT_RPCS.clone()))?;
    registry.register(Box::new(RPC_DURATION_SECONDS.clone()))?;
    registry.register(Box::new(SHAPE_ERRORS_TOTAL.clone()))?;
    let _ = REGISTERED.set(());
    Ok(())
}

/// RAII guard keeping the in-flight gauge and duration histogram honest on
/// every completion path.
pub(crate) struct RpcMetricsGuard {
    start_time: Instant,
}

impl RpcMetricsGuard {
    pub(crate) fn start() -> Self {
        RPCS_TOTAL.inc();
        INFLIGHT_RPCS.inc();
        Self {
            start_time: Instant::now(),
        }
    }
}

impl Drop for RpcMetricsGuard {
    fn drop(&mut self) {
        INFLIGHT_RPCS.dec();
        RPC_DURATION_SECONDS.observe(self.start_time.elapsed().as_secs_f64());
    }
}
