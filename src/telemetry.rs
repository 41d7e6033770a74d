//! Prometheus metrics, compiled in with the `metrics` feature.

mod registry;

pub use registry::Metrics;

use prometheus::Encoder as _;

/// Encode every registered metric in the Prometheus text format.
pub fn render() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&Metrics::global().registry.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
