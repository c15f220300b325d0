//! Scrape bridge: the text served on the metrics endpoint.

use std::sync::Arc;

use crate::registry::SharedRegistry;
use crate::stats::ExporterStats;

/// Renders the device series followed by the exporter self-metrics.
#[derive(Clone)]
pub struct ScrapeBridge {
    registry: SharedRegistry,
    stats: Arc<ExporterStats>,
}

impl ScrapeBridge {
    pub fn new(registry: SharedRegistry, stats: Arc<ExporterStats>) -> Self {
        Self { registry, stats }
    }

    /// Snapshot of every registered series in text exposition format.
    pub fn render(&self) -> String {
        let mut output = self.registry.render();
        output.push_str(&self.stats.encode());
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ReporterRegistry;

    #[test]
    fn test_render_device_series_then_self_metrics() {
        let registry = Arc::new(ReporterRegistry::new("p"));
        registry.ensure("uptime", "", &["name".to_string()]).unwrap();
        let bridge = ScrapeBridge::new(registry, Arc::new(ExporterStats::new("p")));

        let output = bridge.render();
        let device = output.find("# TYPE p_uptime gauge").unwrap();
        let own = output.find("p_exporter_connected").unwrap();
        assert!(device < own);
    }
}
