use super::Note;
use crate::error::SchedulerError;

/// An ordered collection of [`Note`]s played together, optionally looping.
///
/// Construction fails on an empty note list or a non-positive tempo
/// override. The `loop` flag is the one field meant to be mutated after
/// construction: flipping it from `true` to `false` is how a caller stops a
/// looping sequence at its next iteration boundary (see
/// [`crate::Sequencer::stop_loop`]).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Sequence {
    notes: Vec<Note>,
    /// Per-sequence tempo override. Ignored by the transport, which is
    /// always driven by the single global tempo; retained for callers that
    /// want to record authorial intent.
    tempo_bpm: Option<f64>,
    name: Option<String>,
    loop_enabled: bool,
}

impl Sequence {
    /// Builds a [Sequence] from already-constructed notes.
    pub fn from_notes(notes: Vec<Note>) -> Result<Self, SchedulerError> {
        Self::new(notes, None, None, false)
    }

    /// Builds a [Sequence] from the legacy `(pitch, velocity, channel,
    /// duration)` tuple list. Successive tuples are laid end to end:
    /// tuple `i`'s `start_beat` is the running sum of the durations of
    /// tuples `0..i`.
    pub fn from_tuple_list(tuples: &[(u8, u8, u8, f64)]) -> Result<Self, SchedulerError> {
        let mut notes = Vec::with_capacity(tuples.len());
        let mut cursor = 0.0;
        for tuple in tuples {
            notes.push(Note::from_tuple(*tuple, cursor)?);
            cursor += tuple.3;
        }
        Self::from_notes(notes)
    }

    /// Full constructor, used when a name or tempo override is wanted.
    pub fn new(
        notes: Vec<Note>,
        tempo_bpm: Option<f64>,
        name: Option<String>,
        loop_enabled: bool,
    ) -> Result<Self, SchedulerError> {
        if notes.is_empty() {
            return Err(SchedulerError::Validation(
                "a sequence must have at least one note".to_string(),
            ));
        }
        if let Some(bpm) = tempo_bpm {
            if bpm <= 0.0 {
                return Err(SchedulerError::Validation(format!(
                    "tempo_bpm override {bpm} must be positive"
                )));
            }
        }
        Ok(Self {
            notes,
            tempo_bpm,
            name,
            loop_enabled,
        })
    }

    /// Converts back to the legacy tuple-list shape. Round-trips with
    /// [`Sequence::from_tuple_list`] on channel and pitch as long as every
    /// note was itself produced from a four-element tuple.
    pub fn to_tuple_list(&self) -> Vec<(u8, u8, u8, f64)> {
        self.notes.iter().map(Note::to_tuple).collect()
    }

    /// The notes, in schedule order.
    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    /// `max(start_beat + duration)` over all notes.
    pub fn total_duration(&self) -> f64 {
        self.notes
            .iter()
            .map(|n| n.start_beat() + n.duration())
            .fold(0.0, f64::max)
    }

    /// Whether this sequence currently loops.
    pub fn is_looping(&self) -> bool {
        self.loop_enabled
    }

    /// Sets the loop flag.
    pub fn set_looping(&mut self, looping: bool) {
        self.loop_enabled = looping;
    }

    /// Optional name.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Optional per-sequence tempo override.
    pub fn tempo_bpm(&self) -> Option<f64> {
        self.tempo_bpm
    }

    /// Returns a copy of this sequence with every pitch shifted by
    /// `transpose` (clamped to 0..=127), and, if `channel_override` is
    /// `Some`, every note's channel replaced with it.
    ///
    /// Used by [`crate::Instrument::play_sequence`] to stamp outbound
    /// sequences with the instrument's transpose (and, depending on the
    /// caller's `override_channel` flag, its channel) without mutating the
    /// caller's original.
    pub fn instrument_copy(&self, channel_override: Option<u8>, transpose: i16) -> Self {
        let notes = self
            .notes
            .iter()
            .map(|n| {
                let shifted = (n.pitch() as i16 + transpose).clamp(0, 127) as u8;
                let n = n.with_pitch(shifted);
                match channel_override {
                    Some(channel) => n.with_channel(channel),
                    None => n,
                }
            })
            .collect();
        Self {
            notes,
            tempo_bpm: self.tempo_bpm,
            name: self.name.clone(),
            loop_enabled: self.loop_enabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_notes_are_rejected() {
        assert!(Sequence::from_notes(vec![]).is_err());
    }

    #[test]
    fn tuple_list_lays_notes_end_to_end() {
        let tuples = [(60u8, 100u8, 0u8, 0.5f64), (64, 100, 0, 0.5), (67, 100, 0, 1.0)];
        let seq = Sequence::from_tuple_list(&tuples).unwrap();
        assert_eq!(seq.notes()[1].start_beat(), 0.5);
        assert_eq!(seq.notes()[2].start_beat(), 1.0);
        assert_eq!(seq.total_duration(), 2.0);
    }

    #[test]
    fn tuple_list_round_trips() {
        let tuples = [(60u8, 100u8, 0u8, 0.5f64), (64, 90, 1, 1.0)];
        let seq = Sequence::from_tuple_list(&tuples).unwrap();
        assert_eq!(seq.to_tuple_list(), tuples);
    }

    #[test]
    fn non_positive_tempo_override_is_rejected() {
        let notes = vec![Note::new(60, 100, 0.5, 0.0, 0).unwrap()];
        assert!(Sequence::new(notes, Some(0.0), None, false).is_err());
    }

    #[test]
    fn transpose_clamps_instead_of_wrapping() {
        let notes = vec![Note::new(120, 100, 0.5, 0.0, 0).unwrap()];
        let seq = Sequence::from_notes(notes).unwrap();
        let shifted = seq.instrument_copy(Some(2), 20);
        assert_eq!(shifted.notes()[0].pitch(), 127);
        assert_eq!(shifted.notes()[0].channel(), 2);
    }

    #[test]
    fn instrument_copy_leaves_channel_when_no_override() {
        let notes = vec![Note::new(60, 100, 0.5, 0.0, 3).unwrap()];
        let seq = Sequence::from_notes(notes).unwrap();
        let copy = seq.instrument_copy(None, 0);
        assert_eq!(copy.notes()[0].channel(), 3);
    }
}
