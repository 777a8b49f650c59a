use std::ops::Range;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::assembly::FileAssembler;
use super::config::RelayConfig;
use super::core::{Backoff, SlotBuffer};
use super::errors::{RelayError, Result};
use super::partition::partition;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug)]
pub struct RunSummary {
    pub partition: Vec<Range<u32>>,
    pub failed_fans: Vec<u32>,
    pub all_received: bool,
}

/// Starts one process per fan plus the jockey process and supervises them.
///
/// Children are `program` re-invoked with the `fan` and `jockey`
/// subcommands and the same configuration file.
pub struct Orchestrator {
    cfg: RelayConfig,
    config_path: PathBuf,
    program: PathBuf,
}

impl Orchestrator {
    pub fn new(cfg: RelayConfig, config_path: impl Into<PathBuf>, program: impl Into<PathBuf>) -> Orchestrator {
        Orchestrator {
            cfg,
            config_path: config_path.into(),
            program: program.into(),
        }
    }

    pub fn fan_command(&self, fan_id: u32, group: &Range<u32>) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--config")
            .arg(&self.config_path)
            .arg("fan")
            .arg("--id")
            .arg(fan_id.to_string())
            .arg("--first")
            .arg(group.start.to_string())
            .arg("--count")
            .arg((group.end - group.start).to_string());
        cmd
    }

    pub fn jockey_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--config").arg(&self.config_path).arg("jockey");
        cmd
    }

    fn spawn(&self, name: &str, mut cmd: Command) -> Result<Child> {
        let child = cmd.spawn().map_err(|e| RelayError::io(&self.program, e))?;
        info!("started {} (pid {})", name, child.id());
        Ok(child)
    }

    pub fn run(&self) -> Result<RunSummary> {
        self.cfg.validate()?;
        FileAssembler::from_config(&self.cfg.assembly, &self.cfg.storage.extension).clean()?;

        let groups = partition(self.cfg.run.shard_count, self.cfg.run.fan_count)?;
        let buffer = SlotBuffer::create(&self.cfg.shmem)?;
        buffer.watch_signals()?;

        let mut fans: Vec<(u32, Child)> = Vec::with_capacity(groups.len());
        for (fan_id, group) in groups.iter().enumerate() {
            let fan_id = fan_id as u32;
            match self.spawn(&format!("fan {} with shards {:?}", fan_id, group), self.fan_command(fan_id, group)) {
                Ok(child) => fans.push((fan_id, child)),
                Err(e) => {
                    kill_all(fans.iter_mut().map(|(_, child)| child));
                    return Err(e);
                }
            }
        }
        let jockey = match self.spawn("jockey", self.jockey_command()) {
            Ok(child) => child,
            Err(e) => {
                kill_all(fans.iter_mut().map(|(_, child)| child));
                return Err(e);
            }
        };

        let mut children = Children {
            fans,
            jockey: Some(jockey),
        };
        let result = supervise(&buffer, &mut children);
        if result.is_err() {
            children.kill();
        }
        let failed_fans = result?;
        Ok(RunSummary {
            partition: groups,
            failed_fans,
            all_received: buffer.all_received(),
        })
    }
}

/// Children still running. Reaped ones are removed.
struct Children {
    fans: Vec<(u32, Child)>,
    jockey: Option<Child>,
}

impl Children {
    fn is_empty(&self) -> bool {
        self.fans.is_empty() && self.jockey.is_none()
    }

    /// Reaps every fan that has exited and returns the ids of those that failed.
    fn reap_fans(&mut self) -> Result<Vec<u32>> {
        let mut failed = Vec::new();
        let mut running = Vec::with_capacity(self.fans.len());
        for (fan_id, mut child) in self.fans.drain(..) {
            match child.try_wait()? {
                Some(status) if status.success() => debug!("fan {} finished", fan_id),
                Some(status) => {
                    warn!("fan {} exited with {}", fan_id, status);
                    failed.push(fan_id);
                }
                None => running.push((fan_id, child)),
            }
        }
        self.fans = running;
        Ok(failed)
    }

    fn reap_jockey(&mut self) -> Result<Option<ExitStatus>> {
        let status = match self.jockey.as_mut() {
            Some(child) => child.try_wait()?,
            None => None,
        };
        if status.is_some() {
            self.jockey = None;
        }
        Ok(status)
    }

    fn kill(&mut self) {
        kill_all(self.fans.iter_mut().map(|(_, child)| child).chain(self.jockey.as_mut()));
        self.fans.clear();
        self.jockey = None;
    }
}

/// Polls every child until all have exited.
///
/// The run fails as soon as the jockey fails, a fan fails while shards are
/// still missing, or a termination signal arrives. The caller kills whatever
/// is still running in that case.
fn supervise(buffer: &SlotBuffer, children: &mut Children) -> Result<Vec<u32>> {
    let poll = Backoff::new(POLL_INTERVAL);
    let mut failed_fans = Vec::new();
    while !children.is_empty() {
        if buffer.is_closing() {
            warn!("termination signal received, stopping every child");
            return Err(RelayError::Interrupted);
        }

        if let Some(status) = children.reap_jockey()? {
            check_status("jockey", status)?;
            info!("jockey finished");
        }

        let failed = children.reap_fans()?;
        if !failed.is_empty() && !buffer.all_received() && children.jockey.is_some() {
            // A failed fan never delivers its whole group, so the jockey
            // would wait forever.
            error!("fans {:?} failed before every shard was delivered, stopping jockey", failed);
            return Err(RelayError::Child {
                name: format!("fan {}", failed[0]),
                status: "exited before delivering its shards".to_string(),
            });
        }
        failed_fans.extend(failed);

        if !children.is_empty() {
            poll.wait();
        }
    }
    Ok(failed_fans)
}

fn check_status(name: &str, status: ExitStatus) -> Result<()> {
    if status.success() {
        return Ok(());
    }
    Err(RelayError::Child {
        name: name.to_string(),
        status: status.to_string(),
    })
}

fn kill_all<'a>(children: impl Iterator<Item = &'a mut Child>) {
    for child in children {
        if let Err(e) = child.kill() {
            warn!("unable to stop pid {}: {}", child.id(), e);
        }
        let _ = child.wait();
    }
}
