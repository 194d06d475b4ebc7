use crate::error::SchedulerError;

/// A single musical event: a pitch sounding for a duration, at some offset
/// within whatever [`Sequence`](super::Sequence) it belongs to.
///
/// Immutable after construction; [`Note::new`] rejects anything out of
/// range so that invalid notes never reach the scheduler.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Note {
    /// MIDI note number, 0..=127. 60 is middle C.
    pitch: u8,
    /// MIDI velocity, 0..=127.
    velocity: u8,
    /// Duration in beats. Always positive.
    duration: f64,
    /// Offset, in beats, from the start of the owning sequence.
    start_beat: f64,
    /// MIDI channel, 0..=15.
    channel: u8,
}

impl Note {
    /// Creates a new [Note], validating every field.
    pub fn new(
        pitch: u8,
        velocity: u8,
        duration: f64,
        start_beat: f64,
        channel: u8,
    ) -> Result<Self, SchedulerError> {
        if pitch > 127 {
            return Err(SchedulerError::Validation(format!(
                "pitch {pitch} is outside 0..=127"
            )));
        }
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
        if start_beat < 0.0 {
            return Err(SchedulerError::Validation(format!(
                "start_beat {start_beat} must be non-negative"
            )));
        }
        if channel > 15 {
            return Err(SchedulerError::Validation(format!(
                "channel {channel} is outside 0..=15"
            )));
        }
        Ok(Self {
            pitch,
            velocity,
            duration,
            start_beat,
            channel,
        })
    }

    /// Builds a [Note] from the legacy `(pitch, velocity, channel, duration)`
    /// tuple shape, placing it at `start_beat`.
    pub fn from_tuple(tuple: (u8, u8, u8, f64), start_beat: f64) -> Result<Self, SchedulerError> {
        let (pitch, velocity, channel, duration) = tuple;
        Self::new(pitch, velocity, duration, start_beat, channel)
    }

    /// Returns the `(pitch, velocity, channel, duration)` legacy tuple shape.
    pub fn to_tuple(&self) -> (u8, u8, u8, f64) {
        (self.pitch, self.velocity, self.channel, self.duration)
    }

    /// MIDI note number.
    pub fn pitch(&self) -> u8 {
        self.pitch
    }

    /// MIDI velocity.
    pub fn velocity(&self) -> u8 {
        self.velocity
    }

    /// Duration, in beats.
    pub fn duration(&self) -> f64 {
        self.duration
    }

    /// Offset, in beats, from the start of the owning sequence.
    pub fn start_beat(&self) -> f64 {
        self.start_beat
    }

    /// MIDI channel.
    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Returns a copy of this note with a different channel.
    pub fn with_channel(&self, channel: u8) -> Self {
        Self { channel, ..*self }
    }

    /// Returns a copy of this note with its pitch replaced.
    pub fn with_pitch(&self, pitch: u8) -> Self {
        Self { pitch, ..*self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_note_is_constructed() {
        let n = Note::new(60, 100, 0.5, 0.0, 0).unwrap();
        assert_eq!(n.pitch(), 60);
        assert_eq!(n.to_tuple(), (60, 100, 0, 0.5));
    }

    #[test]
    fn zero_duration_is_rejected() {
        assert!(Note::new(60, 100, 0.0, 0.0, 0).is_err());
    }

    #[test]
    fn out_of_range_pitch_is_rejected() {
        assert!(Note::new(128, 100, 0.5, 0.0, 0).is_err());
    }

    #[test]
    fn negative_start_beat_is_rejected() {
        assert!(Note::new(60, 100, 0.5, -1.0, 0).is_err());
    }

    #[test]
    fn tuple_round_trip_preserves_channel_and_pitch() {
        let tuple = (67u8, 90u8, 3u8, 1.25f64);
        let n = Note::from_tuple(tuple, 2.0).unwrap();
        assert_eq!(n.to_tuple(), tuple);
    }
}
