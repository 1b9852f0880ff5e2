use crate::state::{now_unix, FleetState};
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;

const NODE_LABELS: &[&str] = &["id", "node"];
const ACCELERATOR_LABELS: &[&str] = &["id", "node", "index", "name"];

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub fleet_nodes_total: Gauge,
    pub fleet_nodes_connected: Gauge,
    pub fleet_node_up: GaugeVec,
    pub fleet_node_cpu_usage_percent: GaugeVec,
    pub fleet_node_ram_used_gb: GaugeVec,
    pub fleet_node_ram_total_gb: GaugeVec,
    pub fleet_node_ram_usage_percent: GaugeVec,
    pub fleet_node_history_points: GaugeVec,
    pub fleet_node_process_count: GaugeVec,
    pub fleet_accelerator_utilization_percent: GaugeVec,
    pub fleet_accelerator_memory_used_mb: GaugeVec,
    pub fleet_accelerator_memory_total_mb: GaugeVec,
    pub fleet_accelerator_memory_usage_percent: GaugeVec,
    pub fleet_accelerator_temperature_celsius: GaugeVec,
    pub fleet_accelerator_power_draw_watts: GaugeVec,
    pub fleet_accelerator_power_limit_watts: GaugeVec,
    pub fleet_poll_errors_total: CounterVec,
    pub fleet_poll_cycles_total: Counter,
    pub fleet_decode_dropped_lines_total: CounterVec,
    pub fleet_scrape_count_total: Counter,
    pub fleet_uptime_seconds: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let fleet_nodes_total =
            Gauge::with_opts(opts!("fleet_nodes_total", "Number of registered nodes"))?;
        let fleet_nodes_connected = Gauge::with_opts(opts!(
            "fleet_nodes_connected",
            "Number of nodes whose last poll succeeded"
        ))?;
        let fleet_node_up = GaugeVec::new(
            opts!("fleet_node_up", "1 if the last poll of the node succeeded"),
            NODE_LABELS,
        )?;
        let fleet_node_cpu_usage_percent = GaugeVec::new(
            opts!("fleet_node_cpu_usage_percent", "CPU usage by node in percent"),
            NODE_LABELS,
        )?;
        let fleet_node_ram_used_gb = GaugeVec::new(
            opts!("fleet_node_ram_used_gb", "Used RAM by node in GB"),
            NODE_LABELS,
        )?;
        let fleet_node_ram_total_gb = GaugeVec::new(
            opts!("fleet_node_ram_total_gb", "Total RAM by node in GB"),
            NODE_LABELS,
        )?;
        let fleet_node_ram_usage_percent = GaugeVec::new(
            opts!("fleet_node_ram_usage_percent", "RAM usage by node in percent"),
            NODE_LABELS,
        )?;
        let fleet_node_history_points = GaugeVec::new(
            opts!(
                "fleet_node_history_points",
                "Number of history points kept for the node"
            ),
            NODE_LABELS,
        )?;
        let fleet_node_process_count = GaugeVec::new(
            opts!(
                "fleet_node_process_count",
                "Number of processes reported by the node"
            ),
            NODE_LABELS,
        )?;
        let fleet_accelerator_utilization_percent = GaugeVec::new(
            opts!(
                "fleet_accelerator_utilization_percent",
                "Accelerator utilization in percent"
            ),
            ACCELERATOR_LABELS,
        )?;
        let fleet_accelerator_memory_used_mb = GaugeVec::new(
            opts!(
                "fleet_accelerator_memory_used_mb",
                "Accelerator memory used in MB"
            ),
            ACCELERATOR_LABELS,
        )?;
        let fleet_accelerator_memory_total_mb = GaugeVec::new(
            opts!(
                "fleet_accelerator_memory_total_mb",
                "Accelerator memory total in MB"
            ),
            ACCELERATOR_LABELS,
        )?;
        let fleet_accelerator_memory_usage_percent = GaugeVec::new(
            opts!(
                "fleet_accelerator_memory_usage_percent",
                "Accelerator memory usage in percent"
            ),
            ACCELERATOR_LABELS,
        )?;
        let fleet_accelerator_temperature_celsius = GaugeVec::new(
            opts!(
                "fleet_accelerator_temperature_celsius",
                "Accelerator temperature in Celsius"
            ),
            ACCELERATOR_LABELS,
        )?;
        let fleet_accelerator_power_draw_watts = GaugeVec::new(
            opts!(
                "fleet_accelerator_power_draw_watts",
                "Accelerator power draw in watts"
            ),
            ACCELERATOR_LABELS,
        )?;
        let fleet_accelerator_power_limit_watts = GaugeVec::new(
            opts!(
                "fleet_accelerator_power_limit_watts",
                "Accelerator power limit in watts"
            ),
            ACCELERATOR_LABELS,
        )?;
        let fleet_poll_errors_total = CounterVec::new(
            opts!("fleet_poll_errors_total", "Failed polls by node"),
            NODE_LABELS,
        )?;
        let fleet_poll_cycles_total =
            Counter::with_opts(opts!("fleet_poll_cycles_total", "Started poll cycles"))?;
        let fleet_decode_dropped_lines_total = CounterVec::new(
            opts!(
                "fleet_decode_dropped_lines_total",
                "Lines or sections skipped while decoding node output"
            ),
            &["section"],
        )?;
        let fleet_scrape_count_total =
            Counter::with_opts(opts!("fleet_scrape_count_total", "Number of /metrics scrapes"))?;
        let fleet_uptime_seconds =
            Gauge::with_opts(opts!("fleet_uptime_seconds", "Collector uptime in seconds"))?;

        register(&registry, &fleet_nodes_total)?;
        register(&registry, &fleet_nodes_connected)?;
        register(&registry, &fleet_node_up)?;
        register(&registry, &fleet_node_cpu_usage_percent)?;
        register(&registry, &fleet_node_ram_used_gb)?;
        register(&registry, &fleet_node_ram_total_gb)?;
        register(&registry, &fleet_node_ram_usage_percent)?;
        register(&registry, &fleet_node_history_points)?;
        register(&registry, &fleet_node_process_count)?;
        register(&registry, &fleet_accelerator_utilization_percent)?;
        register(&registry, &fleet_accelerator_memory_used_mb)?;
        register(&registry, &fleet_accelerator_memory_total_mb)?;
        register(&registry, &fleet_accelerator_memory_usage_percent)?;
        register(&registry, &fleet_accelerator_temperature_celsius)?;
        register(&registry, &fleet_accelerator_power_draw_watts)?;
        register(&registry, &fleet_accelerator_power_limit_watts)?;
        register(&registry, &fleet_poll_errors_total)?;
        register(&registry, &fleet_poll_cycles_total)?;
        register(&registry, &fleet_decode_dropped_lines_total)?;
        register(&registry, &fleet_scrape_count_total)?;
        register(&registry, &fleet_uptime_seconds)?;

        Ok(Arc::new(Self {
            registry,
            fleet_nodes_total,
            fleet_nodes_connected,
            fleet_node_up,
            fleet_node_cpu_usage_percent,
            fleet_node_ram_used_gb,
            fleet_node_ram_total_gb,
            fleet_node_ram_usage_percent,
            fleet_node_history_points,
            fleet_node_process_count,
            fleet_accelerator_utilization_percent,
            fleet_accelerator_memory_used_mb,
            fleet_accelerator_memory_total_mb,
            fleet_accelerator_memory_usage_percent,
            fleet_accelerator_temperature_celsius,
            fleet_accelerator_power_draw_watts,
            fleet_accelerator_power_limit_watts,
            fleet_poll_errors_total,
            fleet_poll_cycles_total,
            fleet_decode_dropped_lines_total,
            fleet_scrape_count_total,
            fleet_uptime_seconds,
        }))
    }

    /// Rebuilds every per-node series from the fleet table, so removed nodes
    /// and accelerators disappear from the exposition.
    pub fn update_from_fleet(&self, fleet: &FleetState) {
        self.fleet_nodes_total.set(fleet.len() as f64);
        self.fleet_nodes_connected
            .set(fleet.connected_count() as f64);
        self.fleet_uptime_seconds
            .set(now_unix().saturating_sub(fleet.started_at_unix).max(0) as f64);

        self.fleet_node_up.reset();
        self.fleet_node_cpu_usage_percent.reset();
        self.fleet_node_ram_used_gb.reset();
        self.fleet_node_ram_total_gb.reset();
        self.fleet_node_ram_usage_percent.reset();
        self.fleet_node_history_points.reset();
        self.fleet_node_process_count.reset();
        self.fleet_accelerator_utilization_percent.reset();
        self.fleet_accelerator_memory_used_mb.reset();
        self.fleet_accelerator_memory_total_mb.reset();
        self.fleet_accelerator_memory_usage_percent.reset();
        self.fleet_accelerator_temperature_celsius.reset();
        self.fleet_accelerator_power_draw_watts.reset();
        self.fleet_accelerator_power_limit_watts.reset();

        for node in fleet.nodes() {
            let id = node.profile.id.to_string();
            let name = node.profile.display_name();
            let labels: [&str; 2] = [&id, name];
            self.fleet_node_history_points
                .with_label_values(&labels)
                .set(node.history.len() as f64);

            let Some(snapshot) = &node.snapshot else {
                self.fleet_node_up.with_label_values(&labels).set(0.0);
                continue;
            };
            self.fleet_node_up
                .with_label_values(&labels)
                .set(if snapshot.connected { 1.0 } else { 0.0 });
            self.fleet_node_cpu_usage_percent
                .with_label_values(&labels)
                .set(snapshot.cpu_usage_percent);
            self.fleet_node_ram_used_gb
                .with_label_values(&labels)
                .set(snapshot.ram_used_gb);
            self.fleet_node_ram_total_gb
                .with_label_values(&labels)
                .set(snapshot.ram_total_gb);
            self.fleet_node_ram_usage_percent
                .with_label_values(&labels)
                .set(snapshot.ram_used_percent());
            self.fleet_node_process_count
                .with_label_values(&labels)
                .set(snapshot.processes.len() as f64);

            for gpu in &snapshot.accelerators {
                let index = gpu.index.to_string();
                let labels: [&str; 4] = [&id, name, &index, &gpu.name];
                self.fleet_accelerator_utilization_percent
                    .with_label_values(&labels)
                    .set(gpu.utilization_percent);
                self.fleet_accelerator_memory_used_mb
                    .with_label_values(&labels)
                    .set(gpu.memory_used_mb);
                self.fleet_accelerator_memory_total_mb
                    .with_label_values(&labels)
                    .set(gpu.memory_total_mb);
                self.fleet_accelerator_memory_usage_percent
                    .with_label_values(&labels)
                    .set(gpu.memory_used_percent());
                self.fleet_accelerator_temperature_celsius
                    .with_label_values(&labels)
                    .set(gpu.temperature_celsius);
                self.fleet_accelerator_power_draw_watts
                    .with_label_values(&labels)
                    .set(gpu.power_draw_watts);
                self.fleet_accelerator_power_limit_watts
                    .with_label_values(&labels)
                    .set(gpu.power_limit_watts);
            }
        }
    }

    pub fn inc_scrape_count(&self) {
        self.fleet_scrape_count_total.inc();
    }

    pub fn inc_poll_cycle(&self) {
        self.fleet_poll_cycles_total.inc();
    }

    pub fn inc_poll_error(&self, id: &str, node: &str) {
        self.fleet_poll_errors_total
            .with_label_values(&[id, node])
            .inc();
    }

    pub fn inc_decode_dropped(&self, section: &str) {
        self.fleet_decode_dropped_lines_total
            .with_label_values(&[section])
            .inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}
