//! Per-channel wrappers around the note/sequence sinks, and a by-name
//! registry of them.
//!
//! An [`Instrument`] never owns sequence storage; it only remembers which
//! `sequence_id`s it asked the [`crate::traits::SequenceSink`] to create, so
//! it can cancel them later. [`InstrumentManager`] is the usual entry point:
//! it owns the shared sinks and hands out instruments by name.

use crate::error::SchedulerError;
use crate::traits::{NoteSink, SequenceSink};
use crate::types::Sequence;
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex};

/// The most commonly used imports.
pub mod prelude {
    pub use super::{Instrument, InstrumentConfig, InstrumentManager};
}

/// Validated construction parameters for an [`Instrument`].
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentConfig {
    /// MIDI channel this instrument sends on, 0..=15.
    channel: u8,
    /// Optional human-readable name. The canonical name lives in
    /// [`InstrumentManager`]'s registry key; this is free-form.
    name: Option<String>,
    /// Velocity used by [`Instrument::play_note`] when the caller doesn't
    /// supply one, 0..=127.
    default_velocity: u8,
    /// Constant pitch offset applied to every outbound note, clamped (not
    /// wrapped) to 0..=127 at output. Stored unclamped so config round-trips
    /// exactly; only the applied result is clamped.
    transpose: i16,
}

impl InstrumentConfig {
    /// Validates and builds a config.
    pub fn new(
        channel: u8,
        name: Option<String>,
        default_velocity: u8,
        transpose: i16,
    ) -> Result<Self, SchedulerError> {
        if channel > 15 {
            return Err(SchedulerError::Validation(format!(
                "channel {channel} is outside 0..=15"
            )));
        }
        if default_velocity > 127 {
            return Err(SchedulerError::Validation(format!(
                "default_velocity {default_velocity} is outside 0..=127"
            )));
        }
        if !(-127..=127).contains(&transpose) {
            return Err(SchedulerError::Validation(format!(
                "transpose {transpose} is outside -127..=127"
            )));
        }
        Ok(Self {
            channel,
            name,
            default_velocity,
            transpose,
        })
    }

    /// MIDI channel.
    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Optional name.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Fallback velocity.
    pub fn default_velocity(&self) -> u8 {
        self.default_velocity
    }

    /// Unclamped transpose offset.
    pub fn transpose(&self) -> i16 {
        self.transpose
    }
}

/// Clamps `pitch + transpose` into 0..=127. A C8 transposed up an octave
/// past the top of the range plays C8, not a wrapped-around low note.
fn apply_transpose(pitch: u8, transpose: i16) -> u8 {
    (pitch as i16 + transpose).clamp(0, 127) as u8
}

/// A channel-bound wrapper over a [`NoteSink`] and a [`SequenceSink`].
///
/// Applies the instrument's transpose and default velocity to outbound
/// notes, stamps its own channel onto everything it sends, and tracks the
/// sequence ids it has asked the sequence sink to schedule.
pub struct Instrument {
    config: InstrumentConfig,
    note_sink: Arc<dyn NoteSink>,
    sequence_sink: Arc<dyn SequenceSink>,
    active_sequence_ids: Mutex<Vec<u64>>,
}

impl Instrument {
    /// Builds an instrument driving `note_sink` and `sequence_sink`.
    pub fn new(
        config: InstrumentConfig,
        note_sink: Arc<dyn NoteSink>,
        sequence_sink: Arc<dyn SequenceSink>,
    ) -> Self {
        Self {
            config,
            note_sink,
            sequence_sink,
            active_sequence_ids: Mutex::new(Vec::new()),
        }
    }

    /// This instrument's configuration.
    pub fn config(&self) -> &InstrumentConfig {
        &self.config
    }

    /// Plays a single note on this instrument's channel: `velocity`
    /// defaults to the config's `default_velocity`, `duration` to 0.5
    /// beats. Pitch is transposed and clamped before being sent.
    pub fn play_note(
        &self,
        pitch: u8,
        velocity: Option<u8>,
        duration: f64,
    ) -> Result<(), SchedulerError> {
        if pitch > 127 {
            return Err(SchedulerError::Validation(format!(
                "pitch {pitch} is outside 0..=127"
            )));
        }
        let velocity = velocity.unwrap_or(self.config.default_velocity);
        if velocity > 127 {
            return Err(SchedulerError::Validation(format!(
                "velocity {velocity} is outside 0..=127"
            )));
        }
        if duration <= 0.0 {
            return Err(SchedulerError::Validation(format!(
                "duration {duration} must be positive"
            )));
        }
        let pitch = apply_transpose(pitch, self.config.transpose);
        self.note_sink.note_on(pitch, velocity, self.config.channel);
        Ok(())
    }

    /// Stops a note previously started with [`Instrument::play_note`],
    /// applying the same transpose so the pitches match.
    pub fn stop_note(&self, pitch: u8) -> Result<(), SchedulerError> {
        if pitch > 127 {
            return Err(SchedulerError::Validation(format!(
                "pitch {pitch} is outside 0..=127"
            )));
        }
        let pitch = apply_transpose(pitch, self.config.transpose);
        self.note_sink.note_off(pitch, self.config.channel);
        Ok(())
    }

    /// Schedules `sequence` through the sequence sink, transposing every
    /// note and, if `override_channel` is true, replacing every note's
    /// channel with this instrument's own. The original `sequence` is left
    /// untouched; a transposed copy is what gets scheduled. The returned
    /// `sequence_id` is recorded in [`Instrument::active_sequence_ids`].
    pub fn play_sequence(
        &self,
        sequence: &Sequence,
        override_channel: bool,
    ) -> Result<u64, SchedulerError> {
        let channel_override = override_channel.then_some(self.config.channel);
        let copy = sequence.instrument_copy(channel_override, self.config.transpose);
        let sequence_id = self.sequence_sink.schedule_sequence(copy)?;
        self.active_sequence_ids.lock().unwrap().push(sequence_id);
        Ok(sequence_id)
    }

    /// Stops a sequence this instrument started, forgetting its id.
    pub fn stop_sequence(&self, sequence_id: u64) -> Result<(), SchedulerError> {
        self.sequence_sink.stop_sequence(sequence_id)?;
        self.active_sequence_ids
            .lock()
            .unwrap()
            .retain(|&id| id != sequence_id);
        Ok(())
    }

    /// Stops every sequence this instrument has started, returning the
    /// count stopped. Ids that the sequence sink no longer recognizes are
    /// still forgotten locally, since `stop_all_sequences` is meant to
    /// guarantee a clean `active_sequence_ids` afterward.
    pub fn stop_all_sequences(&self) -> usize {
        let ids = std::mem::take(&mut *self.active_sequence_ids.lock().unwrap());
        for &id in &ids {
            if let Err(e) = self.sequence_sink.stop_sequence(id) {
                log::warn!("stopping sequence {id} during stop_all_sequences: {e}");
            }
        }
        ids.len()
    }

    /// The sequence ids this instrument has scheduled and not yet stopped.
    pub fn active_sequence_ids(&self) -> Vec<u64> {
        self.active_sequence_ids.lock().unwrap().clone()
    }
}

/// A by-name registry of [`Instrument`]s sharing one note sink and one
/// sequence sink.
pub struct InstrumentManager {
    instruments: Mutex<FxHashMap<String, Arc<Instrument>>>,
    note_sink: Arc<dyn NoteSink>,
    sequence_sink: Arc<dyn SequenceSink>,
}

impl InstrumentManager {
    /// Builds a manager that will hand every instrument it creates the same
    /// `note_sink` and `sequence_sink`.
    pub fn new(note_sink: Arc<dyn NoteSink>, sequence_sink: Arc<dyn SequenceSink>) -> Self {
        Self {
            instruments: Mutex::new(FxHashMap::default()),
            note_sink,
            sequence_sink,
        }
    }

    /// Creates and registers a new instrument under `name`. Returns `false`
    /// (without error) if `name` is already taken or `config`'s parameters
    /// don't validate; the spec treats both as non-fatal "didn't happen"
    /// outcomes rather than errors.
    pub fn create_instrument(
        &self,
        name: &str,
        channel: u8,
        default_velocity: u8,
        transpose: i16,
    ) -> bool {
        let Ok(config) = InstrumentConfig::new(channel, Some(name.to_string()), default_velocity, transpose)
        else {
            return false;
        };
        let mut instruments = self.instruments.lock().unwrap();
        if instruments.contains_key(name) {
            return false;
        }
        let instrument = Instrument::new(
            config,
            Arc::clone(&self.note_sink),
            Arc::clone(&self.sequence_sink),
        );
        instruments.insert(name.to_string(), Arc::new(instrument));
        true
    }

    /// Looks up an instrument by name.
    pub fn get_instrument(&self, name: &str) -> Option<Arc<Instrument>> {
        self.instruments.lock().unwrap().get(name).cloned()
    }

    /// Whether `name` is registered.
    pub fn has_instrument(&self, name: &str) -> bool {
        self.instruments.lock().unwrap().contains_key(name)
    }

    /// Every registered name, in no particular order.
    pub fn get_instrument_names(&self) -> Vec<String> {
        self.instruments.lock().unwrap().keys().cloned().collect()
    }

    /// A copy of the full name→instrument registry.
    pub fn list_instruments(&self) -> Vec<(String, Arc<Instrument>)> {
        self.instruments
            .lock()
            .unwrap()
            .iter()
            .map(|(name, instrument)| (name.clone(), Arc::clone(instrument)))
            .collect()
    }

    /// Removes `name`, first stopping every sequence it owns. Returns
    /// `false` if `name` wasn't registered.
    pub fn remove_instrument(&self, name: &str) -> bool {
        let instrument = self.instruments.lock().unwrap().remove(name);
        match instrument {
            Some(instrument) => {
                instrument.stop_all_sequences();
                true
            }
            None => false,
        }
    }

    /// Stops every sequence owned by every instrument, returning the total
    /// count stopped (summed before any of the stopping happens, matching
    /// the spec's "pre-stop total").
    pub fn stop_all_instruments(&self) -> usize {
        let instruments: Vec<Arc<Instrument>> =
            self.instruments.lock().unwrap().values().cloned().collect();
        let total: usize = instruments
            .iter()
            .map(|i| i.active_sequence_ids().len())
            .sum();
        for instrument in &instruments {
            instrument.stop_all_sequences();
        }
        total
    }

    /// Sum of active sequence counts across every registered instrument.
    pub fn get_total_active_sequences(&self) -> usize {
        self.instruments
            .lock()
            .unwrap()
            .values()
            .map(|i| i.active_sequence_ids().len())
            .sum()
    }

    /// Linear scan for every instrument on `channel`.
    pub fn get_instruments_by_channel(&self, channel: u8) -> Vec<(String, Arc<Instrument>)> {
        self.instruments
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, instrument)| instrument.config().channel() == channel)
            .map(|(name, instrument)| (name.clone(), Arc::clone(instrument)))
            .collect()
    }

    /// Stops every instrument's sequences, then empties the registry.
    /// Returns the number of instruments removed.
    pub fn clear_all_instruments(&self) -> usize {
        self.stop_all_instruments();
        let mut instruments = self.instruments.lock().unwrap();
        let count = instruments.len();
        instruments.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingNoteSink {
        ons: Mutex<Vec<(u8, u8, u8)>>,
        offs: Mutex<Vec<(u8, u8)>>,
    }
    impl NoteSink for RecordingNoteSink {
        fn note_on(&self, pitch: u8, velocity: u8, channel: u8) {
            self.ons.lock().unwrap().push((pitch, velocity, channel));
        }
        fn note_off(&self, pitch: u8, channel: u8) {
            self.offs.lock().unwrap().push((pitch, channel));
        }
        fn port_open(&self) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct RecordingSequenceSink {
        next_id: AtomicUsize,
        scheduled: Mutex<Vec<Sequence>>,
        stopped: Mutex<Vec<u64>>,
    }
    impl SequenceSink for RecordingSequenceSink {
        fn schedule_sequence(&self, sequence: Sequence) -> Result<u64, SchedulerError> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) as u64;
            self.scheduled.lock().unwrap().push(sequence);
            Ok(id)
        }
        fn stop_sequence(&self, sequence_id: u64) -> Result<(), SchedulerError> {
            self.stopped.lock().unwrap().push(sequence_id);
            Ok(())
        }
    }

    fn bass() -> (Instrument, Arc<RecordingNoteSink>, Arc<RecordingSequenceSink>) {
        let notes = Arc::new(RecordingNoteSink::default());
        let sequences = Arc::new(RecordingSequenceSink::default());
        let config = InstrumentConfig::new(1, Some("bass".to_string()), 100, -12).unwrap();
        let instrument = Instrument::new(
            config,
            Arc::clone(&notes) as Arc<dyn NoteSink>,
            Arc::clone(&sequences) as Arc<dyn SequenceSink>,
        );
        (instrument, notes, sequences)
    }

    #[test]
    fn play_note_transposes_and_stamps_channel() {
        let (bass, notes, _seqs) = bass();
        bass.play_note(60, None, 0.5).unwrap();
        assert_eq!(*notes.ons.lock().unwrap(), vec![(48, 100, 1)]);
    }

    #[test]
    fn stop_note_uses_same_transpose() {
        let (bass, notes, _seqs) = bass();
        bass.stop_note(60).unwrap();
        assert_eq!(*notes.offs.lock().unwrap(), vec![(48, 1)]);
    }

    #[test]
    fn transpose_clamps_rather_than_wraps() {
        let (bass, notes, _seqs) = bass();
        // transpose -12 on a low pitch would go negative without clamping.
        bass.play_note(2, Some(100), 0.5).unwrap();
        assert_eq!(notes.ons.lock().unwrap()[0].0, 0);
    }

    #[test]
    fn play_sequence_tracks_and_releases_ids() {
        let (bass, _notes, seqs) = bass();
        let seq = Sequence::from_tuple_list(&[(60u8, 100u8, 0u8, 0.5f64)]).unwrap();
        let sid = bass.play_sequence(&seq, true).unwrap();
        assert_eq!(bass.active_sequence_ids(), vec![sid]);

        let scheduled = seqs.scheduled.lock().unwrap();
        assert_eq!(scheduled[0].notes()[0].channel(), 1);
        assert_eq!(scheduled[0].notes()[0].pitch(), 48);
        drop(scheduled);

        bass.stop_sequence(sid).unwrap();
        assert!(bass.active_sequence_ids().is_empty());
        assert_eq!(*seqs.stopped.lock().unwrap(), vec![sid]);
    }

    #[test]
    fn manager_rejects_duplicate_names() {
        let notes = Arc::new(RecordingNoteSink::default()) as Arc<dyn NoteSink>;
        let sequences = Arc::new(RecordingSequenceSink::default()) as Arc<dyn SequenceSink>;
        let manager = InstrumentManager::new(notes, sequences);
        assert!(manager.create_instrument("lead", 0, 100, 0));
        assert!(!manager.create_instrument("lead", 1, 100, 0));
    }

    #[test]
    fn manager_stop_all_instruments_returns_pre_stop_total() {
        let notes = Arc::new(RecordingNoteSink::default()) as Arc<dyn NoteSink>;
        let sequences = Arc::new(RecordingSequenceSink::default()) as Arc<dyn SequenceSink>;
        let manager = InstrumentManager::new(notes, sequences);
        manager.create_instrument("a", 0, 100, 0);
        manager.create_instrument("b", 1, 100, 0);

        let seq = || Sequence::from_tuple_list(&[(60u8, 100u8, 0u8, 0.5f64)]).unwrap();
        for name in ["a", "b"] {
            let instrument = manager.get_instrument(name).unwrap();
            instrument.play_sequence(&seq(), true).unwrap();
            instrument.play_sequence(&seq(), true).unwrap();
        }

        assert_eq!(manager.stop_all_instruments(), 4);
        for name in ["a", "b"] {
            assert!(manager.get_instrument(name).unwrap().active_sequence_ids().is_empty());
        }
    }

    #[test]
    fn manager_remove_instrument_stops_its_sequences() {
        let notes = Arc::new(RecordingNoteSink::default()) as Arc<dyn NoteSink>;
        let sequences = Arc::new(RecordingSequenceSink::default()) as Arc<dyn SequenceSink>;
        let manager = InstrumentManager::new(notes, sequences);
        manager.create_instrument("lead", 0, 100, 0);
        let seq = Sequence::from_tuple_list(&[(60u8, 100u8, 0u8, 0.5f64)]).unwrap();
        manager
            .get_instrument("lead")
            .unwrap()
            .play_sequence(&seq, true)
            .unwrap();

        assert!(manager.remove_instrument("lead"));
        assert!(!manager.has_instrument("lead"));
        assert!(!manager.remove_instrument("lead"));
    }

    #[test]
    fn manager_filters_by_channel() {
        let notes = Arc::new(RecordingNoteSink::default()) as Arc<dyn NoteSink>;
        let sequences = Arc::new(RecordingSequenceSink::default()) as Arc<dyn SequenceSink>;
        let manager = InstrumentManager::new(notes, sequences);
        manager.create_instrument("a", 0, 100, 0);
        manager.create_instrument("b", 0, 100, 0);
        manager.create_instrument("c", 5, 100, 0);
        assert_eq!(manager.get_instruments_by_channel(0).len(), 2);
        assert_eq!(manager.get_instruments_by_channel(5).len(), 1);
    }

    #[test]
    fn clear_all_instruments_empties_registry() {
        let notes = Arc::new(RecordingNoteSink::default()) as Arc<dyn NoteSink>;
        let sequences = Arc::new(RecordingSequenceSink::default()) as Arc<dyn SequenceSink>;
        let manager = InstrumentManager::new(notes, sequences);
        manager.create_instrument("a", 0, 100, 0);
        manager.create_instrument("b", 1, 100, 0);
        assert_eq!(manager.clear_all_instruments(), 2);
        assert_eq!(manager.get_instrument_names().len(), 0);
    }
}
