//! Simulation and job status values.

use serde::Serialize;
use strum_macros::Display;

/// Server-side status of a simulation group.
///
/// The discriminants are the values used on the launcher channel and in checkpoint files.
#[derive(Clone, Copy, Debug, Default, Display, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SimulationStatus {
    #[default]
    NotStarted = 0,
    Running = 1,
    Finished = 2,
    Dropped = 3,
}

impl SimulationStatus {
    /// Wire and checkpoint encoding.
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for SimulationStatus {
    type Error = i32;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::NotStarted),
            1 => Ok(Self::Running),
            2 => Ok(Self::Finished),
            3 => Ok(Self::Dropped),
            other => Err(other),
        }
    }
}

/// Launcher-side scheduling status of a simulation job.
///
/// Tracked separately from [SimulationStatus]: a job may be submitted long before any data
/// arrives, and may be cancelled while data is still in flight.
#[derive(Clone, Copy, Debug, Default, Display, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Unknown,
    Submitted,
    Running,
    Finished,
    Cancelled,
    TimedOut,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_round_trip() {
        for status in [
            SimulationStatus::NotStarted,
            SimulationStatus::Running,
            SimulationStatus::Finished,
            SimulationStatus::Dropped,
        ] {
            assert_eq!(Ok(status), SimulationStatus::try_from(status.code()));
        }
        assert_eq!(Err(4), SimulationStatus::try_from(4));
    }

    #[test]
    fn display_is_snake_case() {
        assert_eq!("not_started", SimulationStatus::NotStarted.to_string());
        assert_eq!("timed_out", JobStatus::TimedOut.to_string());
    }
}
