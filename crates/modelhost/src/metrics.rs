use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::OnceLock;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

static REQ_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
static LOAD_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
static MODELS_LOADED: OnceLock<IntGauge> = OnceLock::new();
static INFERENCE_TIME: OnceLock<Histogram> = OnceLock::new();

pub const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Registers the collectors. Recording before this is a no-op.
pub fn init_metrics() {
    let req_counter = REQ_COUNTER.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("modelhost_requests_total", "Inference requests per model"),
            &["model", "status"],
        )
        .expect("static metric definition")
    });

    let load_counter = LOAD_COUNTER.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("modelhost_model_loads_total", "Model load attempts by outcome"),
            &["result"],
        )
        .expect("static metric definition")
    });

    let models_loaded = MODELS_LOADED.get_or_init(|| {
        IntGauge::new("modelhost_models_loaded", "Models currently loaded")
            .expect("static metric definition")
    });

    let inference_time = INFERENCE_TIME.get_or_init(|| {
        Histogram::with_opts(HistogramOpts::new(
            "modelhost_inference_seconds",
            "Time spent in predict",
        ))
        .expect("static metric definition")
    });

    REGISTRY.register(Box::new(req_counter.clone())).ok();
    REGISTRY.register(Box::new(load_counter.clone())).ok();
    REGISTRY.register(Box::new(models_loaded.clone())).ok();
    REGISTRY.register(Box::new(inference_time.clone())).ok();
}

pub fn inc_request(model: &str, status: &str) {
    if let Some(counter) = REQ_COUNTER.get() {
        counter.with_label_values(&[model, status]).inc();
    }
}

pub fn inc_model_load(result: &str) {
    if let Some(counter) = LOAD_COUNTER.get() {
        counter.with_label_values(&[result]).inc();
    }
}

pub fn set_models_loaded(count: usize) {
    if let Some(gauge) = MODELS_LOADED.get() {
        gauge.set(count as i64);
    }
}

pub fn observe_inference(duration: f64) {
    if let Some(histogram) = INFERENCE_TIME.get() {
        histogram.observe(duration);
    }
}

/// Prometheus text exposition of everything registered.
pub fn gather() -> anyhow::Result<Vec<u8>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorded_metrics_are_exposed() {
        init_metrics();
        init_metrics();

        inc_request("clf", "ok");
        inc_model_load("success");
        set_models_loaded(3);
        observe_inference(0.01);

        let text = String::from_utf8(gather().unwrap()).unwrap();
        assert!(text.contains("modelhost_requests_total{model=\"clf\",status=\"ok\"}"));
        assert!(text.contains("modelhost_model_loads_total"));
        assert!(text.contains("modelhost_models_loaded"));
        assert!(text.contains("modelhost_inference_seconds_count"));
    }
}
