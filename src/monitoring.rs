use std::{fs, path::Path, time::Duration};

use anyhow::Result;
use chrono::Utc;
use log::{error, info};
use sysinfo::{Disks, System};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::db::{Database, SystemMetrics};

const THERMAL_ZONE: &str = "/sys/class/thermal/thermal_zone0/temp";

/// Samples the station's own CPU, memory, disk and temperature.
pub struct SystemSampler {
    system: System,
    disks: Disks,
}

impl SystemSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a delta; the first refresh only sets the baseline.
        system.refresh_cpu_usage();

        Self {
            system,
            disks: Disks::new_with_refreshed_list(),
        }
    }

    pub fn sample(&mut self) -> SystemMetrics {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        self.disks.refresh();

        SystemMetrics {
            timestamp: Utc::now(),
            cpu_usage: average_cpu(&self.system),
            cpu_temp: read_cpu_temp(Path::new(THERMAL_ZONE)),
            ram_usage: percent(self.system.used_memory(), self.system.total_memory()),
            disk_usage: self.root_disk_usage(),
        }
    }

    fn root_disk_usage(&self) -> f64 {
        let disk = self
            .disks
            .list()
            .iter()
            .find(|disk| disk.mount_point() == Path::new("/"))
            .or_else(|| self.disks.list().first());

        match disk {
            Some(disk) => percent(
                disk.total_space().saturating_sub(disk.available_space()),
                disk.total_space(),
            ),
            None => 0.0,
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

fn average_cpu(system: &System) -> f32 {
    let cpus = system.cpus();
    if cpus.is_empty() {
        return 0.0;
    }
    cpus.iter().map(|cpu| cpu.cpu_usage()).sum::<f32>() / cpus.len() as f32
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    used as f64 / total as f64 * 100.0
}

/// Millidegrees in the thermal zone file, as degrees Celsius.
fn read_cpu_temp(path: &Path) -> Option<f64> {
    let raw = fs::read_to_string(path).ok()?;
    raw.trim().parse::<f64>().ok().map(|milli| milli / 1000.0)
}

/// Periodic task that stores one [`SystemMetrics`] row per interval.
pub struct SystemMonitor {
    cancel_token: CancellationToken,
    handle: JoinHandle<()>,
}

impl SystemMonitor {
    pub fn start(db: Database, interval: Duration) -> Self {
        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(monitor_loop(db, interval, cancel_token.clone()));
        info!("System monitoring every {}s", interval.as_secs());

        Self {
            cancel_token,
            handle,
        }
    }

    pub async fn stop(self) {
        self.cancel_token.cancel();
        if let Err(err) = self.handle.await {
            error!("System monitor failed to join: {err}");
        }
    }
}

async fn monitor_loop(db: Database, interval: Duration, cancel_token: CancellationToken) {
    let mut sampler = SystemSampler::new();
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel_token.cancelled() => break,
        }

        let metrics = sampler.sample();
        if let Err(err) = store(&db, &metrics).await {
            error!("Failed to store system metrics: {err:#}");
        }
    }
}

async fn store(db: &Database, metrics: &SystemMetrics) -> Result<()> {
    db.insert_system_metrics(metrics).await?;
    log::debug!(
        "cpu {:.1}% ram {:.1}% disk {:.1}% temp {:?}",
        metrics.cpu_usage,
        metrics.ram_usage,
        metrics.disk_usage,
        metrics.cpu_temp
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn thermal_zone_is_millidegrees() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "48312").unwrap();

        assert_eq!(read_cpu_temp(file.path()), Some(48.312));
        assert_eq!(read_cpu_temp(Path::new("/definitely/not/here")), None);
    }

    #[test]
    fn percentages_handle_empty_totals() {
        assert_eq!(percent(1, 0), 0.0);
        assert_eq!(percent(25, 100), 25.0);
    }

    #[test]
    fn sample_is_within_range() {
        let metrics = SystemSampler::new().sample();
        assert!((0.0..=100.0).contains(&metrics.ram_usage));
        assert!((0.0..=100.0).contains(&metrics.disk_usage));
    }

    #[tokio::test]
    async fn monitor_stores_rows_until_stopped() {
        let db = Database::open_in_memory().unwrap();
        let monitor = SystemMonitor::start(db.clone(), Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(90)).await;
        monitor.stop().await;

        let rows = db
            .fetch_all("SELECT monitoring_id FROM system_monitoring", &[])
            .await
            .unwrap();
        assert!(!rows.is_empty());
    }
}
