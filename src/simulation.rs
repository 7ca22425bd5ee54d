//! Per-group simulation state.
//!
//! A group (design point) moves `NotStarted -> Running -> Finished`, may be reset to
//! `NotStarted` by a timeout, and may be `Dropped` by the launcher at any time. Every rank keeps
//! its own table; rank 0 alone talks to the launcher, so only its table fills the outbox.

use crate::checkpoint::{invalid_data, read_i32, read_len, write_i32, write_len, Persist};
use crate::error::EnsembleError;
use crate::options::Options;
use crate::protocol::LauncherMessage;
use crate::types::{JobStatus, SimulationStatus};

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{event, Level};

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SimulationRecord {
    pub status: SimulationStatus,
    /// Set when the group was reset after a timeout. Cleared by fresh data.
    pub timeout: bool,
    #[serde(skip)]
    pub last_message: Option<Instant>,
    pub job_id: Option<String>,
    pub job_status: JobStatus,
    pub parameters: Option<Vec<f64>>,
}

/// Checks that a launcher command names a design point of this study and, when it carries
/// parameters, one value per varying parameter.
///
/// A `job` line may omit its parameters, in which case they are queried later.
pub fn validate_launcher_message(
    message: &LauncherMessage,
    options: &Options,
) -> Result<(), EnsembleError> {
    let (simu_id, parameters) = match message {
        LauncherMessage::Job {
            simu_id,
            parameters,
            ..
        } => (*simu_id, (!parameters.is_empty()).then_some(parameters)),
        LauncherMessage::SimuInfo {
            simu_id,
            parameters,
        } => (*simu_id, Some(parameters)),
        LauncherMessage::Drop { simu_id, .. } => (*simu_id, None),
        _ => return Ok(()),
    };
    if simu_id >= options.sampling_size {
        return Err(EnsembleError::protocol(format!(
            "simulation {simu_id} out of range for {} design points",
            options.sampling_size
        )));
    }
    if let Some(parameters) = parameters {
        if parameters.len() != options.nb_parameters {
            return Err(EnsembleError::protocol(format!(
                "simulation {simu_id} has {} parameters, expected {}",
                parameters.len(),
                options.nb_parameters
            )));
        }
    }
    Ok(())
}

/// All groups known to one rank, indexed by group id.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SimulationTable {
    records: Vec<SimulationRecord>,
    outbox: Vec<LauncherMessage>,
}

impl SimulationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, simu_id: usize) -> Option<&SimulationRecord> {
        self.records.get(simu_id)
    }

    /// Returns the record for `simu_id`, creating it and any lower ids on first reference.
    pub fn get_mut(&mut self, simu_id: usize) -> &mut SimulationRecord {
        if simu_id >= self.records.len() {
            self.records
                .resize_with(simu_id + 1, SimulationRecord::default);
        }
        &mut self.records[simu_id]
    }

    pub fn records(&self) -> impl Iterator<Item = (usize, &SimulationRecord)> {
        self.records.iter().enumerate()
    }

    pub fn is_dropped(&self, simu_id: usize) -> bool {
        self.get(simu_id)
            .is_some_and(|r| r.status == SimulationStatus::Dropped)
    }

    pub fn count(&self, status: SimulationStatus) -> usize {
        self.records.iter().filter(|r| r.status == status).count()
    }

    /// Records data arrival. Returns true if the group just started running.
    pub fn touch(&mut self, simu_id: usize, now: Instant) -> bool {
        let record = self.get_mut(simu_id);
        record.last_message = Some(now);
        record.timeout = false;
        if record.status != SimulationStatus::NotStarted {
            return false;
        }
        record.status = SimulationStatus::Running;
        record.job_status = JobStatus::Running;
        event!(Level::DEBUG, simu_id, "simulation running");
        self.outbox.push(LauncherMessage::SimuStatus {
            simu_id,
            status: SimulationStatus::Running,
        });
        true
    }

    /// Marks a running group finished. Returns false if it was not running.
    pub fn finish(&mut self, simu_id: usize) -> bool {
        let record = self.get_mut(simu_id);
        if record.status != SimulationStatus::Running {
            return false;
        }
        record.status = SimulationStatus::Finished;
        record.job_status = JobStatus::Finished;
        event!(Level::INFO, simu_id, "simulation finished");
        self.outbox.push(LauncherMessage::SimuStatus {
            simu_id,
            status: SimulationStatus::Finished,
        });
        true
    }

    /// Returns a running group to `NotStarted` after a timeout.
    pub fn reset(&mut self, simu_id: usize) {
        let record = self.get_mut(simu_id);
        if record.status != SimulationStatus::Running {
            return;
        }
        record.status = SimulationStatus::NotStarted;
        record.last_message = None;
        record.timeout = true;
        record.job_status = JobStatus::TimedOut;
    }

    /// Resets every running group silent for longer than `timeout`, queueing a notification for
    /// the launcher. Returns the ids reset.
    pub fn check_timeouts(&mut self, now: Instant, timeout: Duration) -> Vec<usize> {
        let expired: Vec<usize> = self
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.status == SimulationStatus::Running)
            .filter(|(_, r)| {
                r.last_message
                    .map_or(true, |last| now.saturating_duration_since(last) > timeout)
            })
            .map(|(id, _)| id)
            .collect();
        for &simu_id in &expired {
            event!(Level::WARN, simu_id, "simulation timed out");
            self.reset(simu_id);
            self.outbox.push(LauncherMessage::Timeout {
                simu_id: Some(simu_id),
            });
        }
        expired
    }

    pub fn set_parameters(&mut self, simu_id: usize, parameters: Vec<f64>) {
        self.get_mut(simu_id).parameters = Some(parameters);
    }

    /// Applies a launcher command to the table. Returns false for messages that carry no
    /// per-group state.
    pub fn apply(&mut self, message: &LauncherMessage) -> bool {
        match message {
            LauncherMessage::Job {
                simu_id,
                job_id,
                parameters,
            } => {
                let record = self.get_mut(*simu_id);
                record.job_id = Some(job_id.clone());
                record.job_status = JobStatus::Submitted;
                if !parameters.is_empty() {
                    record.parameters = Some(parameters.clone());
                }
                // A resubmitted group runs again. Timesteps it already sent stay recorded.
                if record.status == SimulationStatus::Dropped {
                    record.status = SimulationStatus::NotStarted;
                    record.timeout = false;
                    record.last_message = None;
                    event!(Level::INFO, simu_id, job_id = %job_id, "simulation resubmitted");
                }
                true
            }
            LauncherMessage::Drop { simu_id, job_id } => {
                let record = self.get_mut(*simu_id);
                record.status = SimulationStatus::Dropped;
                record.job_status = JobStatus::Cancelled;
                record.job_id = Some(job_id.clone());
                event!(Level::INFO, simu_id, job_id = %job_id, "simulation dropped");
                true
            }
            LauncherMessage::SimuInfo {
                simu_id,
                parameters,
            } => {
                self.set_parameters(*simu_id, parameters.clone());
                true
            }
            _ => false,
        }
    }

    /// Takes the messages queued for the launcher.
    pub fn drain_outbox(&mut self) -> Vec<LauncherMessage> {
        std::mem::take(&mut self.outbox)
    }

    /// Normalises state read back from a checkpoint: running groups may have lost updates and
    /// restart from `NotStarted`. Returns `(finished, reset)` counts.
    pub fn reset_after_restart(&mut self) -> (usize, usize) {
        let mut reset = 0;
        for record in &mut self.records {
            if record.status == SimulationStatus::Running {
                record.status = SimulationStatus::NotStarted;
                reset += 1;
            }
        }
        (self.count(SimulationStatus::Finished), reset)
    }
}

impl Persist for SimulationTable {
    fn save(&self, writer: &mut dyn Write) -> std::io::Result<()> {
        write_len(writer, self.records.len())?;
        for record in &self.records {
            write_i32(writer, record.status.code())?;
        }
        Ok(())
    }

    fn restore(&mut self, reader: &mut dyn Read) -> std::io::Result<()> {
        let count = read_len(reader)?;
        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            let status = SimulationStatus::try_from(read_i32(reader)?)
                .map_err(|code| invalid_data(format!("unknown simulation status {code}")))?;
            records.push(SimulationRecord {
                status,
                ..Default::default()
            });
        }
        self.records = records;
        Ok(())
    }
}
