//! Checkpoint and restart.
//!
//! Each (field, server rank, client rank) slot is written to `<dir>/<field>.<server>.<client>.ckpt`
//! and the simulation statuses of a server rank to `<dir>/simulations.<server>.ckpt`. All values
//! are native-endian. Files are written to a temporary name and renamed into place so a crash
//! mid-write leaves the previous checkpoint intact.

use crate::error::EnsembleError;
use crate::field::FieldTable;
use crate::metrics::CHECKPOINT_TIME;
use crate::simulation::SimulationTable;

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use ndarray::{Array1, ArrayView1};
use tracing::{event, Level};
// Bring traits into scope to use as_bytes and as_bytes_mut methods.
use zerocopy::{AsBytes, FromBytes};

/// State that can be written to and read back from a checkpoint stream.
///
/// `restore` overwrites an already-sized value in place, so the reader must supply exactly the
/// bytes `save` produced for a value of the same shape.
pub trait Persist {
    fn save(&self, writer: &mut dyn Write) -> std::io::Result<()>;
    fn restore(&mut self, reader: &mut dyn Read) -> std::io::Result<()>;
}

pub fn write_i32(writer: &mut dyn Write, value: i32) -> std::io::Result<()> {
    writer.write_all(value.as_bytes())
}

pub fn read_i32(reader: &mut dyn Read) -> std::io::Result<i32> {
    let mut value = 0_i32;
    reader.read_exact(value.as_bytes_mut())?;
    Ok(value)
}

pub fn write_u64(writer: &mut dyn Write, value: u64) -> std::io::Result<()> {
    writer.write_all(value.as_bytes())
}

pub fn read_u64(reader: &mut dyn Read) -> std::io::Result<u64> {
    let mut value = 0_u64;
    reader.read_exact(value.as_bytes_mut())?;
    Ok(value)
}

/// Writes a length as i32, failing if it does not fit.
pub fn write_len(writer: &mut dyn Write, len: usize) -> std::io::Result<()> {
    let len = i32::try_from(len).map_err(invalid_data)?;
    write_i32(writer, len)
}

/// Reads a non-negative i32 length.
pub fn read_len(reader: &mut dyn Read) -> std::io::Result<usize> {
    let len = read_i32(reader)?;
    usize::try_from(len).map_err(invalid_data)
}

pub fn write_slice<T: AsBytes>(writer: &mut dyn Write, values: &[T]) -> std::io::Result<()> {
    writer.write_all(values.as_bytes())
}

pub fn read_slice_into<T: AsBytes + FromBytes>(
    reader: &mut dyn Read,
    values: &mut [T],
) -> std::io::Result<()> {
    reader.read_exact(values.as_bytes_mut())
}

pub fn write_array<T: AsBytes + Clone>(
    writer: &mut dyn Write,
    array: &Array1<T>,
) -> std::io::Result<()> {
    match array.as_slice() {
        Some(values) => write_slice(writer, values),
        None => write_slice(writer, &array.to_vec()),
    }
}

pub fn read_array_into<T: AsBytes + FromBytes + Clone>(
    reader: &mut dyn Read,
    array: &mut Array1<T>,
) -> std::io::Result<()> {
    if let Some(values) = array.as_slice_mut() {
        return read_slice_into(reader, values);
    }
    let mut values = array.to_vec();
    read_slice_into(reader, &mut values)?;
    array.assign(&ArrayView1::from(&values[..]));
    Ok(())
}

pub(crate) fn invalid_data<E>(error: E) -> std::io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    std::io::Error::new(std::io::ErrorKind::InvalidData, error)
}

/// Writes `value` to `path` via a temporary file.
pub fn save_file(path: &Path, value: &dyn Persist) -> std::io::Result<()> {
    let tmp = path.with_extension("ckpt.tmp");
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        value.save(&mut writer)?;
        writer.flush()?;
    }
    fs::rename(tmp, path)
}

/// Outcome of restoring a server rank from its checkpoint directory.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RestoreSummary {
    /// Groups already finished before the restart.
    pub finished: usize,
    /// Groups that were running and have been reset.
    pub reset: usize,
    /// Number of (field, client rank) slots read back.
    pub slots: usize,
}

/// Saves and restores all state owned by one server rank.
#[derive(Clone, Debug)]
pub struct Checkpointer {
    dir: PathBuf,
    server_rank: usize,
}

impl Checkpointer {
    pub fn new(dir: impl Into<PathBuf>, server_rank: usize) -> Self {
        Self {
            dir: dir.into(),
            server_rank,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn field_path(&self, field: &str, client_rank: usize) -> PathBuf {
        self.dir
            .join(format!("{field}.{}.{client_rank}.ckpt", self.server_rank))
    }

    pub fn simulations_path(&self) -> PathBuf {
        self.dir
            .join(format!("simulations.{}.ckpt", self.server_rank))
    }

    /// Writes every slot and the simulation statuses. Returns the number of files written.
    #[tracing::instrument(level = "DEBUG", skip(self, fields, simulations), fields(server_rank = self.server_rank))]
    pub fn save(
        &self,
        fields: &FieldTable,
        simulations: &SimulationTable,
    ) -> Result<usize, EnsembleError> {
        let start = Instant::now();
        fs::create_dir_all(&self.dir)?;
        let mut written = 0;
        for (name, client_rank, slot) in fields.slots() {
            save_file(&self.field_path(name, client_rank), slot)?;
            written += 1;
        }
        save_file(&self.simulations_path(), simulations)?;
        written += 1;
        CHECKPOINT_TIME
            .with_label_values(&[])
            .observe(start.elapsed().as_secs_f64());
        event!(Level::DEBUG, written, "checkpoint written");
        Ok(written)
    }

    /// Reads back whatever this rank last saved.
    ///
    /// Missing or unreadable files are logged and skipped, so a rank with no usable restart data
    /// simply starts fresh.
    #[tracing::instrument(level = "DEBUG", skip(self, fields, simulations), fields(server_rank = self.server_rank))]
    pub fn restore(
        &self,
        fields: &mut FieldTable,
        simulations: &mut SimulationTable,
    ) -> RestoreSummary {
        let mut summary = RestoreSummary::default();
        match self.restore_simulations(simulations) {
            Ok((finished, reset)) => {
                summary.finished = finished;
                summary.reset = reset;
            }
            Err(error) => event!(
                Level::WARN,
                path = %self.simulations_path().display(),
                %error,
                "no simulation checkpoint, starting fresh"
            ),
        }
        let names: Vec<String> = fields.configured().to_vec();
        for name in names {
            for (client_rank, path) in self.field_files(&name) {
                match read_whole(&path)
                    .and_then(|bytes| fields.restore_slot(&name, client_rank, &bytes))
                {
                    Ok(()) => summary.slots += 1,
                    Err(error) => event!(
                        Level::WARN,
                        path = %path.display(),
                        %error,
                        "failed to read field checkpoint, slot starts fresh"
                    ),
                }
            }
        }
        event!(
            Level::INFO,
            finished = summary.finished,
            reset = summary.reset,
            slots = summary.slots,
            "restored from checkpoint"
        );
        summary
    }

    fn restore_simulations(
        &self,
        simulations: &mut SimulationTable,
    ) -> std::io::Result<(usize, usize)> {
        let mut reader = BufReader::new(File::open(self.simulations_path())?);
        simulations.restore(&mut reader)?;
        Ok(simulations.reset_after_restart())
    }

    /// Lists `(client_rank, path)` for every checkpoint file of `field` on this rank.
    fn field_files(&self, field: &str) -> Vec<(usize, PathBuf)> {
        let prefix = format!("{field}.{}.", self.server_rank);
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut files: Vec<(usize, PathBuf)> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                let client = name.strip_prefix(&prefix)?.strip_suffix(".ckpt")?;
                Some((client.parse().ok()?, entry.path()))
            })
            .collect();
        files.sort();
        files
    }
}

fn read_whole(path: &Path) -> Result<Vec<u8>, EnsembleError> {
    Ok(fs::read(path)?)
}

/// Wraps a byte buffer in a reader for [Persist::restore].
pub(crate) fn reader(bytes: &[u8]) -> Cursor<&[u8]> {
    Cursor::new(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moments::{MinMax, Quantile, Variance};
    use crate::test_utils;
    use crate::types::SimulationStatus;

    fn round_trip<P: Persist>(value: &P, fresh: &mut P) {
        let mut buffer = Vec::new();
        value.save(&mut buffer).unwrap();
        let mut cursor = reader(&buffer);
        fresh.restore(&mut cursor).unwrap();
        assert_eq!(buffer.len() as u64, cursor.position());
    }

    #[test]
    fn accumulators_restore_bit_identical() {
        let mut variance = Variance::new(3);
        let mut min_max = MinMax::new(3);
        let mut quantile = Quantile::new(3, 0.5);
        for i in 0..9 {
            let x = [i as f64, (i * i) as f64 * 0.1, -(i as f64)];
            variance.increment(&x);
            min_max.increment(&x);
            quantile.increment(&x);
        }
        let mut restored_variance = Variance::new(3);
        round_trip(&variance, &mut restored_variance);
        assert_eq!(variance, restored_variance);
        let mut restored_min_max = MinMax::new(3);
        round_trip(&min_max, &mut restored_min_max);
        assert_eq!(min_max, restored_min_max);
        let mut restored_quantile = Quantile::new(3, 0.5);
        round_trip(&quantile, &mut restored_quantile);
        assert_eq!(quantile, restored_quantile);
    }

    #[test]
    fn truncated_input_fails() {
        let mut variance = Variance::new(2);
        variance.increment(&[1.0, 2.0]);
        let mut buffer = Vec::new();
        variance.save(&mut buffer).unwrap();
        buffer.truncate(buffer.len() - 1);
        let mut restored = Variance::new(2);
        assert!(restored.restore(&mut reader(&buffer)).is_err());
    }

    #[test]
    fn negative_length_is_invalid() {
        let mut buffer = Vec::new();
        write_i32(&mut buffer, -1).unwrap();
        let error = read_len(&mut reader(&buffer)).unwrap_err();
        assert_eq!(std::io::ErrorKind::InvalidData, error.kind());
    }

    #[test]
    fn paths_follow_naming_scheme() {
        let checkpointer = Checkpointer::new("/tmp/ckpt", 3);
        assert_eq!(
            PathBuf::from("/tmp/ckpt/temperature.3.7.ckpt"),
            checkpointer.field_path("temperature", 7)
        );
        assert_eq!(
            PathBuf::from("/tmp/ckpt/simulations.3.ckpt"),
            checkpointer.simulations_path()
        );
    }

    #[test]
    fn save_and_restore_directory() {
        let dir = tempfile::tempdir().unwrap();
        let options = test_utils::get_test_options();
        let checkpointer = Checkpointer::new(dir.path(), 0);

        let mut fields = FieldTable::new(options.clone());
        let mut simulations = SimulationTable::new();
        test_utils::feed_group(&mut fields, &mut simulations, 0, &[0, 1], 4);
        test_utils::feed_group(&mut fields, &mut simulations, 1, &[0, 1], 4);
        simulations.get_mut(0).status = SimulationStatus::Finished;
        let written = checkpointer.save(&fields, &simulations).unwrap();
        // Two fields times two client ranks, plus the simulation file.
        assert_eq!(5, written);

        let mut restored_fields = FieldTable::new(options);
        let mut restored_simulations = SimulationTable::new();
        let summary = checkpointer.restore(&mut restored_fields, &mut restored_simulations);
        assert_eq!(
            RestoreSummary {
                finished: 1,
                reset: 1,
                slots: 4
            },
            summary
        );
        assert_eq!(
            SimulationStatus::NotStarted,
            restored_simulations.get(1).map(|r| r.status).unwrap()
        );
        assert_eq!(fields, restored_fields);
    }

    #[test]
    fn missing_directory_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let checkpointer = Checkpointer::new(dir.path().join("absent"), 1);
        let mut fields = FieldTable::new(test_utils::get_test_options());
        let mut simulations = SimulationTable::new();
        let summary = checkpointer.restore(&mut fields, &mut simulations);
        assert_eq!(RestoreSummary::default(), summary);
        assert!(simulations.is_empty());
    }
}
