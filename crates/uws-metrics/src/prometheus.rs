//! Prometheus text exposition format.
//!
//! Renders a metrics snapshot into the Prometheus text exposition format
//! for scraping by a Prometheus server or compatible agent.

use uws_state::ServiceState;

use crate::collector::MetricsSnapshot;

/// Content type for the `/metrics` response.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Render a metrics snapshot into Prometheus text format.
///
/// Produces GAUGE, COUNTER and HISTOGRAM metrics with `service` labels.
pub fn render_prometheus(snapshot: &MetricsSnapshot) -> String {
    let mut out = String::new();

    out.push_str("# HELP uws_service_state Current health state (1 for the active state).\n");
    out.push_str("# TYPE uws_service_state gauge\n");
    for s in &snapshot.services {
        let service = escape_label(&s.service_id);
        for state in ServiceState::ALL {
            out.push_str(&format!(
                "uws_service_state{{service=\"{}\",state=\"{}\"}} {}\n",
                service,
                state.as_str(),
                u8::from(s.state == state)
            ));
        }
    }

    out.push_str("# HELP uws_probes_total Health probes by outcome.\n");
    out.push_str("# TYPE uws_probes_total counter\n");
    for s in &snapshot.services {
        let service = escape_label(&s.service_id);
        for (outcome, count) in &s.probes {
            out.push_str(&format!(
                "uws_probes_total{{service=\"{service}\",outcome=\"{outcome}\"}} {count}\n"
            ));
        }
    }

    out.push_str("# HELP uws_probe_latency_ms Health probe latency in milliseconds.\n");
    out.push_str("# TYPE uws_probe_latency_ms histogram\n");
    for s in &snapshot.services {
        let service = escape_label(&s.service_id);
        for (le, count) in &s.latency.buckets {
            out.push_str(&format!(
                "uws_probe_latency_ms_bucket{{service=\"{service}\",le=\"{le}\"}} {count}\n"
            ));
        }
        out.push_str(&format!(
            "uws_probe_latency_ms_bucket{{service=\"{service}\",le=\"+Inf\"}} {}\n",
            s.latency.count
        ));
        out.push_str(&format!(
            "uws_probe_latency_ms_sum{{service=\"{service}\"}} {}\n",
            s.latency.sum_ms
        ));
        out.push_str(&format!(
            "uws_probe_latency_ms_count{{service=\"{service}\"}} {}\n",
            s.latency.count
        ));
    }

    out.push_str("# HELP uws_restart_attempts_total Restart attempts by lifecycle outcome.\n");
    out.push_str("# TYPE uws_restart_attempts_total counter\n");
    for s in &snapshot.services {
        let service = escape_label(&s.service_id);
        out.push_str(&format!(
            "uws_restart_attempts_total{{service=\"{service}\",outcome=\"success\"}} {}\n",
            s.restarts_succeeded
        ));
        out.push_str(&format!(
            "uws_restart_attempts_total{{service=\"{service}\",outcome=\"failure\"}} {}\n",
            s.restarts_failed
        ));
    }

    out.push_str(
        "# HELP uws_failed_permanently_total Escalations to the failed_permanently state.\n",
    );
    out.push_str("# TYPE uws_failed_permanently_total counter\n");
    for s in &snapshot.services {
        out.push_str(&format!(
            "uws_failed_permanently_total{{service=\"{}\"}} {}\n",
            escape_label(&s.service_id),
            s.failed_permanently
        ));
    }

    out.push_str(
        "# HELP uws_probe_pool_saturated_total Probe cycles skipped waiting for a worker slot.\n",
    );
    out.push_str("# TYPE uws_probe_pool_saturated_total counter\n");
    out.push_str(&format!(
        "uws_probe_pool_saturated_total {}\n",
        snapshot.pool_saturated
    ));

    out
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{HistogramSnapshot, ServiceMetricsSnapshot};

    fn test_service(service_id: &str) -> ServiceMetricsSnapshot {
        ServiceMetricsSnapshot {
            service_id: service_id.to_string(),
            state: ServiceState::Unhealthy,
            probes: vec![
                ("success", 40),
                ("timeout", 3),
                ("connection_failed", 0),
                ("malformed_response", 1),
                ("reported_unhealthy", 2),
            ],
            latency: HistogramSnapshot {
                buckets: vec![(5, 10), (10, 30), (10000, 44)],
                count: 46,
                sum_ms: 1234,
            },
            restarts_succeeded: 1,
            restarts_failed: 2,
            failed_permanently: 0,
        }
    }

    #[test]
    fn render_empty() {
        let output = render_prometheus(&MetricsSnapshot::default());
        // Should still have type declarations.
        assert!(output.contains("# TYPE uws_service_state gauge"));
        assert!(output.contains("# TYPE uws_probe_latency_ms histogram"));
        assert!(output.contains("uws_probe_pool_saturated_total 0"));
    }

    #[test]
    fn render_single_service() {
        let snapshot = MetricsSnapshot {
            services: vec![test_service("db")],
            pool_saturated: 0,
        };
        let output = render_prometheus(&snapshot);

        assert!(output.contains("uws_service_state{service=\"db\",state=\"unhealthy\"} 1"));
        assert!(output.contains("uws_service_state{service=\"db\",state=\"healthy\"} 0"));
        assert!(output.contains("uws_probes_total{service=\"db\",outcome=\"timeout\"} 3"));
        assert!(output.contains("uws_probe_latency_ms_bucket{service=\"db\",le=\"10\"} 30"));
        assert!(output.contains("uws_probe_latency_ms_bucket{service=\"db\",le=\"+Inf\"} 46"));
        assert!(output.contains("uws_probe_latency_ms_sum{service=\"db\"} 1234"));
        assert!(output.contains("uws_restart_attempts_total{service=\"db\",outcome=\"failure\"} 2"));
        assert!(output.contains("uws_failed_permanently_total{service=\"db\"} 0"));
    }

    #[test]
    fn render_escapes_label_values() {
        let snapshot = MetricsSnapshot {
            services: vec![test_service("odd\"id")],
            pool_saturated: 0,
        };
        let output = render_prometheus(&snapshot);
        assert!(output.contains("service=\"odd\\\"id\""));
    }

    #[test]
    fn render_format_is_prometheus_compatible() {
        let snapshot = MetricsSnapshot {
            services: vec![test_service("buckets"), test_service("queue")],
            pool_saturated: 2,
        };
        let output = render_prometheus(&snapshot);

        // Every sample line is `name{labels} value` or `name value`.
        for line in output.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let value = line.rsplit(' ').next().unwrap();
            assert!(value.parse::<f64>().is_ok(), "bad sample value: {line}");
        }
    }
}
