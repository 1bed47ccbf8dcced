use std::{
    process::{Child, Command, Stdio},
    thread,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use log::{error, info, warn};
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};

use crate::config::{BrokerConfig, HostSystem};

const SERVICE_NAME: &str = "mosquitto";

/// Process-level operations on the local broker.
pub trait BrokerProcess: Send {
    /// Whether a broker process is alive, by process name.
    fn is_running(&mut self) -> bool;
    /// Launches a broker child process and returns its pid.
    fn spawn(&mut self) -> Result<u32>;
    /// Restarts the broker through the operating system's service manager.
    fn restart_service(&mut self) -> Result<()>;
    /// Stops a broker this process launched. Returns false when there was none.
    fn terminate_spawned(&mut self) -> Result<bool>;
}

pub struct SystemBrokerProcess {
    config: BrokerConfig,
    system: System,
    child: Option<Child>,
}

impl SystemBrokerProcess {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            system: System::new(),
            child: None,
        }
    }
}

impl BrokerProcess for SystemBrokerProcess {
    fn is_running(&mut self) -> bool {
        self.system
            .refresh_processes_specifics(ProcessesToUpdate::All, ProcessRefreshKind::everything());

        self.system.processes().values().any(|process| {
            let name = process.name().to_string_lossy();
            self.config
                .process_names
                .iter()
                .any(|wanted| name.eq_ignore_ascii_case(wanted))
        })
    }

    fn spawn(&mut self) -> Result<u32> {
        if let Some(mut stale) = self.child.take() {
            // A previous attempt that never came up.
            let _ = stale.kill();
            let _ = stale.wait();
        }

        let child = Command::new(&self.config.command)
            .args(&self.config.args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to launch {}", self.config.command))?;

        let pid = child.id();
        self.child = Some(child);
        Ok(pid)
    }

    fn restart_service(&mut self) -> Result<()> {
        match self.config.system {
            HostSystem::Linux => run_command("sudo", &["systemctl", "restart", SERVICE_NAME]),
            HostSystem::Windows => {
                run_command("sc", &["stop", SERVICE_NAME])?;
                run_command("sc", &["start", SERVICE_NAME])
            }
        }
    }

    fn terminate_spawned(&mut self) -> Result<bool> {
        let Some(mut child) = self.child.take() else {
            return Ok(false);
        };

        child.kill().context("failed to stop broker child")?;
        child.wait().context("failed to reap broker child")?;
        Ok(true)
    }
}

fn run_command(program: &str, args: &[&str]) -> Result<()> {
    let status = Command::new(program)
        .args(args)
        .status()
        .with_context(|| format!("failed to run {program} {}", args.join(" ")))?;

    if !status.success() {
        bail!("{program} {} exited with {status}", args.join(" "));
    }
    Ok(())
}

/// Makes sure a local broker is up before ingestion connects. Blocking; run
/// it on a blocking worker.
pub struct BrokerSupervisor<P = SystemBrokerProcess> {
    process: P,
}

impl BrokerSupervisor<SystemBrokerProcess> {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(SystemBrokerProcess::new(config.clone()))
    }
}

impl<P: BrokerProcess> BrokerSupervisor<P> {
    pub fn new(process: P) -> Self {
        Self { process }
    }

    pub fn process(&self) -> &P {
        &self.process
    }

    /// Up to `max_retries` launch-wait-check cycles, `timeout` apart, then one
    /// service restart. Returns whether a broker is running at the end.
    pub fn ensure_running(&mut self, max_retries: u32, timeout: Duration) -> bool {
        if self.process.is_running() {
            info!("MQTT broker already running");
            return true;
        }

        for attempt in 1..=max_retries {
            info!("Starting MQTT broker (attempt {attempt}/{max_retries})");
            match self.process.spawn() {
                Ok(pid) => {
                    thread::sleep(timeout);
                    if self.process.is_running() {
                        info!("MQTT broker started (pid {pid})");
                        return true;
                    }
                    warn!("MQTT broker (pid {pid}) not running after {}ms", timeout.as_millis());
                }
                Err(err) => error!("Failed to start MQTT broker: {err:#}"),
            }
            thread::sleep(timeout);
        }

        info!("Restarting the MQTT broker service");
        match self.process.restart_service() {
            Ok(()) => {
                info!("MQTT broker service restarted");
                self.process.is_running()
            }
            Err(err) => {
                error!("Failed to restart MQTT broker service: {err:#}");
                false
            }
        }
    }

    pub fn shutdown(&mut self) {
        match self.process.terminate_spawned() {
            Ok(true) => info!("MQTT broker stopped"),
            Ok(false) => {}
            Err(err) => error!("Failed to stop MQTT broker: {err:#}"),
        }
    }
}
