//! Per-field statistics owned by one server rank.

use crate::checkpoint::{read_len, read_slice_into, reader, write_len, write_slice, Persist};
use crate::error::EnsembleError;
use crate::moments::{MinMax, Moments, Quantile, ThresholdExceedance};
use crate::options::{Operation, Options};
use crate::protocol::DataMessage;
use crate::sobol::Sobol;
use crate::types::StepBitmap;

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;

use hashbrown::HashMap;

/// Every enabled accumulator for one timestep of one (field, client rank).
#[derive(Clone, Debug, PartialEq)]
pub struct StatisticsSet {
    pub moments: Option<Moments>,
    pub min_max: Option<MinMax>,
    pub thresholds: Vec<ThresholdExceedance>,
    pub quantiles: Vec<Quantile>,
    pub sobol: Option<Sobol>,
}

impl StatisticsSet {
    pub fn new(vect_size: usize, options: &Options) -> Self {
        let thresholds = if options.has(Operation::Threshold) {
            options
                .thresholds
                .iter()
                .map(|t| ThresholdExceedance::new(vect_size, *t))
                .collect()
        } else {
            Vec::new()
        };
        let quantiles = if options.has(Operation::Quantile) {
            options
                .quantiles
                .iter()
                .map(|q| Quantile::new(vect_size, *q))
                .collect()
        } else {
            Vec::new()
        };
        Self {
            moments: Moments::for_order(vect_size, options.moment_order()),
            min_max: options
                .has(Operation::MinMax)
                .then(|| MinMax::new(vect_size)),
            thresholds,
            quantiles,
            sobol: options
                .sobol_enabled()
                .then(|| Sobol::new(options.sobol_method, vect_size, options.nb_parameters)),
        }
    }

    /// Folds one message worth of vectors.
    ///
    /// Under Sobol' the vectors are `[A, B, C_1, ...]`; the other statistics see both independent
    /// samples `A` and `B`. Otherwise there is a single vector.
    pub fn increment(&mut self, vectors: &[&[f64]]) {
        let samples = if self.sobol.is_some() {
            &vectors[..2]
        } else {
            &vectors[..1]
        };
        for x in samples {
            if let Some(moments) = self.moments.as_mut() {
                moments.increment(x);
            }
            if let Some(min_max) = self.min_max.as_mut() {
                min_max.increment(x);
            }
            self.thresholds.iter_mut().for_each(|t| t.increment(x));
            self.quantiles.iter_mut().for_each(|q| q.increment(x));
        }
        if let Some(sobol) = self.sobol.as_mut() {
            sobol.estimator_mut().increment(vectors);
        }
    }
}

impl Persist for StatisticsSet {
    fn save(&self, writer: &mut dyn Write) -> std::io::Result<()> {
        if let Some(moments) = &self.moments {
            moments.save(writer)?;
        }
        if let Some(min_max) = &self.min_max {
            min_max.save(writer)?;
        }
        for threshold in &self.thresholds {
            threshold.save(writer)?;
        }
        for quantile in &self.quantiles {
            quantile.save(writer)?;
        }
        if let Some(sobol) = &self.sobol {
            sobol.save(writer)?;
        }
        Ok(())
    }

    fn restore(&mut self, reader: &mut dyn Read) -> std::io::Result<()> {
        if let Some(moments) = self.moments.as_mut() {
            moments.restore(reader)?;
        }
        if let Some(min_max) = self.min_max.as_mut() {
            min_max.restore(reader)?;
        }
        for threshold in &mut self.thresholds {
            threshold.restore(reader)?;
        }
        for quantile in &mut self.quantiles {
            quantile.restore(reader)?;
        }
        if let Some(sobol) = self.sobol.as_mut() {
            sobol.restore(reader)?;
        }
        Ok(())
    }
}

/// Outcome of recording one data message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Recorded {
    Updated,
    /// The timestep was already recorded for this group; nothing changed.
    Duplicate,
}

/// Statistics for every timestep of one (field, client rank) slot, plus the per-group
/// completion bitmaps.
#[derive(Clone, Debug, PartialEq)]
pub struct RankStatistics {
    vect_size: usize,
    timesteps: Vec<StatisticsSet>,
    /// Indexed by group id.
    step_simu: Vec<StepBitmap>,
}

impl RankStatistics {
    pub fn new(vect_size: usize, options: &Options) -> Self {
        Self {
            vect_size,
            timesteps: (0..options.nb_time_steps)
                .map(|_| StatisticsSet::new(vect_size, options))
                .collect(),
            step_simu: Vec::new(),
        }
    }

    pub fn vect_size(&self) -> usize {
        self.vect_size
    }

    pub fn timesteps(&self) -> &[StatisticsSet] {
        &self.timesteps
    }

    fn nb_time_steps(&self) -> usize {
        self.timesteps.len()
    }

    /// Folds the vectors of `simu_id` at `timestep` unless that timestep was already seen.
    pub fn record(&mut self, timestep: usize, simu_id: usize, vectors: &[&[f64]]) -> Recorded {
        let nb_time_steps = self.nb_time_steps();
        if simu_id >= self.step_simu.len() {
            self.step_simu
                .resize_with(simu_id + 1, || StepBitmap::new(nb_time_steps));
        }
        if !self.step_simu[simu_id].set(timestep) {
            return Recorded::Duplicate;
        }
        self.timesteps[timestep].increment(vectors);
        Recorded::Updated
    }

    /// Whether every timestep has been recorded for `simu_id`.
    pub fn is_complete(&self, simu_id: usize) -> bool {
        self.step_simu
            .get(simu_id)
            .is_some_and(StepBitmap::is_full)
    }

    pub fn steps_seen(&self, simu_id: usize) -> usize {
        self.step_simu.get(simu_id).map_or(0, StepBitmap::count)
    }
}

impl Persist for RankStatistics {
    fn save(&self, writer: &mut dyn Write) -> std::io::Result<()> {
        write_len(writer, self.vect_size)?;
        write_len(writer, self.nb_time_steps())?;
        for set in &self.timesteps {
            set.save(writer)?;
        }
        write_len(writer, self.step_simu.len())?;
        for bitmap in &self.step_simu {
            write_len(writer, bitmap.words().len())?;
            write_slice(writer, bitmap.words())?;
        }
        Ok(())
    }

    fn restore(&mut self, reader: &mut dyn Read) -> std::io::Result<()> {
        let vect_size = read_len(reader)?;
        let nb_time_steps = read_len(reader)?;
        if vect_size != self.vect_size || nb_time_steps != self.nb_time_steps() {
            return Err(crate::checkpoint::invalid_data(format!(
                "checkpoint holds {nb_time_steps} timesteps of size {vect_size}, expected {} of size {}",
                self.nb_time_steps(),
                self.vect_size
            )));
        }
        for set in &mut self.timesteps {
            set.restore(reader)?;
        }
        let groups = read_len(reader)?;
        let mut step_simu = Vec::with_capacity(groups);
        for _ in 0..groups {
            let mut words = vec![0_u32; read_len(reader)?];
            read_slice_into(reader, &mut words)?;
            let bitmap = StepBitmap::from_words(words, nb_time_steps).ok_or_else(|| {
                crate::checkpoint::invalid_data("completion bitmap does not match timestep count")
            })?;
            step_simu.push(bitmap);
        }
        self.step_simu = step_simu;
        Ok(())
    }
}

/// Slots of one field, keyed by client rank.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FieldData {
    slots: BTreeMap<usize, RankStatistics>,
}

impl FieldData {
    pub fn slot(&self, client_rank: usize) -> Option<&RankStatistics> {
        self.slots.get(&client_rank)
    }

    pub fn slots(&self) -> impl Iterator<Item = (usize, &RankStatistics)> {
        self.slots.iter().map(|(rank, slot)| (*rank, slot))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// All fields seen by one server rank.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldTable {
    options: Arc<Options>,
    fields: HashMap<String, FieldData>,
}

impl FieldTable {
    pub fn new(options: impl Into<Arc<Options>>) -> Self {
        Self {
            options: options.into(),
            fields: HashMap::new(),
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Field names accepted from simulations.
    pub fn configured(&self) -> &[String] {
        &self.options.fields
    }

    pub fn get(&self, name: &str) -> Option<&FieldData> {
        self.fields.get(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Every slot as `(field, client rank, statistics)`, ordered by field then client rank.
    pub fn slots(&self) -> impl Iterator<Item = (&str, usize, &RankStatistics)> {
        let mut names: Vec<&String> = self.fields.keys().collect();
        names.sort();
        names.into_iter().flat_map(move |name| {
            self.fields[name]
                .slots()
                .map(move |(rank, slot)| (name.as_str(), rank, slot))
        })
    }

    /// Validates a decoded message and folds it into the slot it names.
    ///
    /// `expected_vect_size` is the slice size this rank should receive from the client, when the
    /// layout is known.
    pub fn insert(
        &mut self,
        message: &DataMessage,
        expected_vect_size: Option<usize>,
    ) -> Result<Recorded, EnsembleError> {
        if self.options.field_index(&message.field).is_none() {
            return Err(EnsembleError::UnknownField {
                name: message.field.clone(),
            });
        }
        if message.simu_id >= self.options.sampling_size {
            return Err(EnsembleError::protocol(format!(
                "simulation {} out of range for {} design points",
                message.simu_id, self.options.sampling_size
            )));
        }
        if message.timestep >= self.options.nb_time_steps {
            return Err(EnsembleError::protocol(format!(
                "timestep {} out of range for {} timesteps",
                message.timestep, self.options.nb_time_steps
            )));
        }
        if message.vect_size == 0 {
            return Err(EnsembleError::protocol("empty data message"));
        }
        if let Some(expected) = expected_vect_size {
            if expected != message.vect_size {
                return Err(EnsembleError::protocol(format!(
                    "client rank {} sent {} values, expected {expected}",
                    message.client_rank, message.vect_size
                )));
            }
        }
        let vectors = message.vectors();
        if vectors.len() != self.options.vectors_per_message() {
            return Err(EnsembleError::protocol(format!(
                "message carries {} vectors, expected {}",
                vectors.len(),
                self.options.vectors_per_message()
            )));
        }

        let options = &self.options;
        let slot = self
            .fields
            .entry_ref(message.field.as_str())
            .or_default()
            .slots
            .entry(message.client_rank)
            .or_insert_with(|| RankStatistics::new(message.vect_size, options));
        if slot.vect_size != message.vect_size {
            return Err(EnsembleError::protocol(format!(
                "field {} from client rank {} changed size from {} to {}",
                message.field, message.client_rank, slot.vect_size, message.vect_size
            )));
        }
        Ok(slot.record(message.timestep, message.simu_id, &vectors))
    }

    /// Whether `simu_id` has every timestep of every configured field for every owned client
    /// rank.
    pub fn check_simu_state(&self, simu_id: usize, owned_client_ranks: &[usize]) -> bool {
        self.options.fields.iter().all(|name| {
            self.fields.get(name).is_some_and(|field| {
                owned_client_ranks.iter().all(|rank| {
                    field
                        .slot(*rank)
                        .is_some_and(|slot| slot.is_complete(simu_id))
                })
            })
        })
    }

    /// Rebuilds one slot from checkpoint bytes.
    pub fn restore_slot(
        &mut self,
        name: &str,
        client_rank: usize,
        bytes: &[u8],
    ) -> Result<(), EnsembleError> {
        let vect_size = read_len(&mut reader(bytes))?;
        let mut slot = RankStatistics::new(vect_size, &self.options);
        slot.restore(&mut reader(bytes))?;
        self.fields
            .entry_ref(name)
            .or_default()
            .slots
            .insert(client_rank, slot);
        Ok(())
    }

    fn sobol_estimators(&self) -> impl Iterator<Item = &Sobol> {
        self.fields
            .values()
            .flat_map(|field| field.slots.values())
            .flat_map(|slot| slot.timesteps.iter())
            .filter_map(|set| set.sobol.as_ref())
    }

    /// Recomputes every Sobol' confidence interval.
    pub fn update_confidence(&mut self) {
        self.fields
            .values_mut()
            .flat_map(|field| field.slots.values_mut())
            .flat_map(|slot| slot.timesteps.iter_mut())
            .filter_map(|set| set.sobol.as_mut())
            .for_each(|sobol| sobol.estimator_mut().update_confidence());
    }

    /// Whether every Sobol' interval of every timestep, parameter and slot is below `tolerance`.
    /// False while no estimator exists.
    pub fn check_convergence(&self, tolerance: f64) -> bool {
        let max_order = self.options.sobol_max_order;
        let mut estimators = self.sobol_estimators().peekable();
        estimators.peek().is_some()
            && estimators.all(|sobol| sobol.estimator().is_converged(tolerance, max_order))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DataMessageBuilder;
    use crate::test_utils;

    fn message(field: &str, timestep: usize, simu_id: usize, client_rank: usize, values: &[f64]) -> DataMessage {
        let bytes = DataMessageBuilder::new(field, timestep, simu_id, client_rank)
            .vector(values)
            .build(1)
            .unwrap();
        DataMessage::decode(&bytes, 1).unwrap()
    }

    #[test]
    fn insert_creates_slots_lazily() {
        let mut fields = FieldTable::new(test_utils::get_test_options());
        assert!(fields.is_empty());
        let recorded = fields
            .insert(&message("temperature", 0, 0, 1, &[1.0, 2.0]), Some(2))
            .unwrap();
        assert_eq!(Recorded::Updated, recorded);
        assert_eq!(1, fields.len());
        let slot = fields.get("temperature").unwrap().slot(1).unwrap();
        assert_eq!(2, slot.vect_size());
        assert_eq!(4, slot.timesteps().len());
        assert_eq!(1, slot.steps_seen(0));
    }

    #[test]
    fn duplicate_does_not_change_accumulators() {
        let mut fields = FieldTable::new(test_utils::get_test_options());
        fields
            .insert(&message("temperature", 1, 1, 0, &[1.0, 2.0]), None)
            .unwrap();
        let before = fields.clone();
        let recorded = fields
            .insert(&message("temperature", 1, 1, 0, &[9.0, 9.0]), None)
            .unwrap();
        assert_eq!(Recorded::Duplicate, recorded);
        assert_eq!(before, fields);
    }

    #[test]
    fn invalid_messages_rejected() {
        let mut fields = FieldTable::new(test_utils::get_test_options());
        assert!(matches!(
            fields.insert(&message("velocity", 0, 0, 0, &[1.0]), None),
            Err(EnsembleError::UnknownField { .. })
        ));
        assert!(fields
            .insert(&message("temperature", 4, 0, 0, &[1.0]), None)
            .is_err());
        assert!(fields
            .insert(&message("temperature", 0, 0, 0, &[1.0]), Some(2))
            .is_err());
        fields
            .insert(&message("temperature", 0, 0, 0, &[1.0]), None)
            .unwrap();
        // Group ids are design point indices.
        assert!(matches!(
            fields.insert(&message("temperature", 0, 5_000_000, 0, &[1.0]), None),
            Err(EnsembleError::Protocol { .. })
        ));
        // The slot size is fixed by the first message.
        assert!(fields
            .insert(&message("temperature", 1, 0, 0, &[1.0, 2.0]), None)
            .is_err());
    }

    #[test]
    fn completion_requires_every_field_rank_and_step() {
        let options = test_utils::get_test_options();
        let mut fields = FieldTable::new(options.clone());
        let owned = [0, 1];
        for field in &options.fields {
            for rank in owned {
                for timestep in 0..options.nb_time_steps {
                    assert!(!fields.check_simu_state(1, &owned));
                    fields
                        .insert(&message(field, timestep, 1, rank, &[timestep as f64]), None)
                        .unwrap();
                }
            }
        }
        assert!(fields.check_simu_state(1, &owned));
        assert!(!fields.check_simu_state(0, &owned));
        assert!(!fields.check_simu_state(1, &[0, 1, 2]));
    }

    #[test]
    fn statistics_follow_inputs() {
        let mut fields = FieldTable::new(Options {
            sampling_size: 3,
            ..test_utils::get_test_options()
        });
        for (simu_id, values) in [[1.0, 2.0, 3.0], [3.0, 2.0, 1.0], [5.0, 5.0, 5.0]]
            .iter()
            .enumerate()
        {
            fields
                .insert(&message("pressure", 0, simu_id, 0, values), None)
                .unwrap();
        }
        let set = &fields.get("pressure").unwrap().slot(0).unwrap().timesteps()[0];
        let moments = set.moments.as_ref().unwrap();
        assert_eq!(vec![3.0, 3.0, 3.0], moments.mean().to_vec());
        assert_eq!(Some(vec![4.0, 3.0, 4.0]), moments.variance().map(|v| v.to_vec()));
        let min_max = set.min_max.as_ref().unwrap();
        assert_eq!(vec![1.0, 2.0, 1.0], min_max.min().unwrap().to_vec());
        assert_eq!(vec![2, 1, 2], set.thresholds[0].exceedances().to_vec());
        assert_eq!(3, set.quantiles[0].count());
    }

    #[test]
    fn sobol_convergence_needs_data() {
        let options = test_utils::get_test_sobol_options();
        let mut fields = FieldTable::new(options.clone());
        assert!(!fields.check_convergence(1.0));
        test_utils::feed_sobol_points(&mut fields, 0, 50);
        fields.update_confidence();
        assert!(fields.check_convergence(2.5));
        assert!(!fields.check_convergence(1e-6));
    }

    #[test]
    fn slot_restore_round_trip() {
        let options = test_utils::get_test_sobol_options();
        let mut fields = FieldTable::new(options.clone());
        test_utils::feed_sobol_points(&mut fields, 1, 6);
        let (name, rank, slot) = fields.slots().next().unwrap();
        let mut bytes = Vec::new();
        slot.save(&mut bytes).unwrap();

        let mut restored = FieldTable::new(options);
        restored.restore_slot(name, rank, &bytes).unwrap();
        assert_eq!(Some(slot), restored.get(name).unwrap().slot(rank));

        bytes.truncate(bytes.len() - 2);
        assert!(restored.restore_slot(name, rank, &bytes).is_err());
    }
}
