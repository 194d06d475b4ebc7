//! Expands [`Sequence`]s into paired note-on/note-off transport events, and
//! owns the self-rescheduling logic that makes looping sequences work.

use crate::error::SchedulerError;
use crate::traits::{NoteSink, SequenceSink};
use crate::transport::Transport;
use crate::types::Sequence;
use crate::util::IdFactory;
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex, Weak};

struct SequenceState {
    sequence: Sequence,
    current_iteration: u64,
}

/// Owns a catalog of active sequences and drives them against a
/// [`Transport`], turning each into a stream of note-on/note-off callbacks.
///
/// A `Sequencer` is always held behind an `Arc`: looping sequences
/// reschedule themselves via a critical transport callback that needs to
/// call back into the sequencer, so the sequencer keeps a [`Weak`] reference
/// to itself (set up with [`Arc::new_cyclic`]) rather than requiring every
/// caller to thread a reference through.
pub struct Sequencer {
    this: Weak<Sequencer>,
    transport: Arc<Transport>,
    note_sink: Arc<dyn NoteSink>,
    states: Mutex<FxHashMap<u64, SequenceState>>,
    ids: IdFactory,
}

impl Sequencer {
    /// Creates a sequencer driving `transport` and emitting through
    /// `note_sink`.
    pub fn new(transport: Arc<Transport>, note_sink: Arc<dyn NoteSink>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            this: weak.clone(),
            transport,
            note_sink,
            states: Mutex::new(FxHashMap::default()),
            ids: IdFactory::default(),
        })
    }

    /// Fire-and-forget single note, scheduled `duration` beats long starting
    /// at `beat`. Does not create any sequencer-side state: there's nothing
    /// to loop or cancel.
    pub fn schedule_note(
        &self,
        beat: f64,
        pitch: u8,
        velocity: u8,
        channel: u8,
        duration: f64,
    ) -> Result<(), SchedulerError> {
        crate::types::Note::new(pitch, velocity, duration, 0.0, channel)?;

        let on_sink = Arc::clone(&self.note_sink);
        self.transport
            .schedule_event(beat, move || on_sink.note_on(pitch, velocity, channel), true);

        let off_sink = Arc::clone(&self.note_sink);
        self.transport.schedule_event(
            beat + duration,
            move || off_sink.note_off(pitch, channel),
            true,
        );
        Ok(())
    }

    /// Schedules `sequence` to begin at the transport's current beat,
    /// returning its sequence id.
    pub fn schedule_sequence(&self, sequence: Sequence) -> Result<u64, SchedulerError> {
        let sequence_id = self.ids.mint();
        let base_beat = self.transport.current_beat();
        self.states.lock().unwrap().insert(
            sequence_id,
            SequenceState {
                sequence,
                current_iteration: 0,
            },
        );
        self.schedule_iteration(sequence_id, base_beat);
        Ok(sequence_id)
    }

    /// Same as [`Sequencer::schedule_sequence`] but takes the legacy
    /// `(pitch, velocity, channel, duration)` tuple list.
    pub fn schedule_tuple_list(
        &self,
        tuples: &[(u8, u8, u8, f64)],
    ) -> Result<u64, SchedulerError> {
        self.schedule_sequence(Sequence::from_tuple_list(tuples)?)
    }

    fn schedule_iteration(&self, sequence_id: u64, base_beat: f64) {
        let (notes, sequence_length, is_looping) = {
            let mut states = self.states.lock().unwrap();
            let Some(state) = states.get_mut(&sequence_id) else {
                return;
            };
            let notes: Vec<_> = state.sequence.notes().to_vec();
            let sequence_length = state.sequence.total_duration();
            let is_looping = state.sequence.is_looping();
            if is_looping {
                state.current_iteration += 1;
            }
            (notes, sequence_length, is_looping)
        };

        for note in notes {
            let on_sink = Arc::clone(&self.note_sink);
            let (pitch, velocity, channel, duration) = note.to_tuple();
            self.transport.schedule_event(
                base_beat + note.start_beat(),
                move || on_sink.note_on(pitch, velocity, channel),
                true,
            );

            let off_sink = Arc::clone(&self.note_sink);
            self.transport.schedule_event(
                base_beat + note.start_beat() + duration,
                move || off_sink.note_off(pitch, channel),
                true,
            );
        }

        if is_looping {
            let next_base = base_beat + sequence_length;
            let this = self.this.clone();
            self.transport.schedule_critical_event(next_base, move || {
                let Some(sequencer) = this.upgrade() else {
                    return;
                };
                let still_looping = sequencer
                    .states
                    .lock()
                    .unwrap()
                    .get(&sequence_id)
                    .map(|s| s.sequence.is_looping())
                    .unwrap_or(false);
                if still_looping {
                    sequencer.schedule_iteration(sequence_id, next_base);
                }
            });
        }
    }

    /// Starts (or restarts) looping for `sequence_id`. A no-op if it's
    /// already looping. If it wasn't looping, immediately reschedules the
    /// next iteration from the transport's current beat: there is no
    /// pending "schedule next iteration" callback left to pick it back up.
    pub fn start_loop(&self, sequence_id: u64) -> Result<(), SchedulerError> {
        let was_looping = {
            let mut states = self.states.lock().unwrap();
            let state = states
                .get_mut(&sequence_id)
                .ok_or_else(|| not_found(sequence_id))?;
            let was_looping = state.sequence.is_looping();
            state.sequence.set_looping(true);
            was_looping
        };
        if !was_looping {
            let base_beat = self.transport.current_beat();
            self.schedule_iteration(sequence_id, base_beat);
        }
        Ok(())
    }

    /// Stops `sequence_id` from looping. The current iteration still plays
    /// to its end; no further iteration is enqueued after that. Calling this
    /// on a sequence that isn't looping logs a warning but is not an error.
    pub fn stop_loop(&self, sequence_id: u64) -> Result<(), SchedulerError> {
        let mut states = self.states.lock().unwrap();
        let state = states
            .get_mut(&sequence_id)
            .ok_or_else(|| not_found(sequence_id))?;
        if !state.sequence.is_looping() {
            log::warn!("stop_loop called on sequence {sequence_id}, which isn't looping");
        }
        state.sequence.set_looping(false);
        Ok(())
    }

    /// Forgets `sequence_id`'s sequencer-side state. Already-enqueued
    /// note-on/off events continue to fire: their closures don't consult
    /// this map.
    pub fn remove_sequence(&self, sequence_id: u64) -> Result<(), SchedulerError> {
        self.states
            .lock()
            .unwrap()
            .remove(&sequence_id)
            .map(|_| ())
            .ok_or_else(|| not_found(sequence_id))
    }

    /// Forgets every sequence's state. Same caveat as
    /// [`Sequencer::remove_sequence`].
    pub fn clear_all_sequences(&self) {
        self.states.lock().unwrap().clear();
    }

    /// Emits a note-off for every (channel, pitch) pair through the MIDI
    /// sink, if it's open. Used on panic-stop.
    pub fn all_notes_off(&self) {
        if !self.note_sink.port_open() {
            return;
        }
        for channel in 0..16u8 {
            for pitch in 0..128u8 {
                self.note_sink.note_off(pitch, channel);
            }
        }
    }

    /// The number of sequences currently tracked (looping or not).
    pub fn active_sequence_count(&self) -> usize {
        self.states.lock().unwrap().len()
    }
}

impl SequenceSink for Sequencer {
    fn schedule_sequence(&self, sequence: Sequence) -> Result<u64, SchedulerError> {
        Sequencer::schedule_sequence(self, sequence)
    }

    fn stop_sequence(&self, sequence_id: u64) -> Result<(), SchedulerError> {
        self.remove_sequence(sequence_id)
    }
}

fn not_found(sequence_id: u64) -> SchedulerError {
    SchedulerError::NotFound(format!("no sequence with id {sequence_id}"))
}
