// Copyright (c) 2024 Mike Tsao

#![deny(missing_docs, unused_imports, unused_variables)]
#![allow(dead_code)]

//! `baton` is a precise, tempo-aware transport and sequencer for scheduling
//! musical events.
//!
//! Three layers compose upward, each fully usable without the one above:
//!
//! * [`Transport`] is a monotonic, tempo-aware clock: give it a beat and a
//!   callback and it fires the callback at the right wall-clock instant,
//!   either inline or on a worker pool.
//! * [`Sequencer`] expands [`Sequence`]s into paired note-on/note-off
//!   [`Transport`] events, including self-rescheduling loops.
//! * [`Instrument`] and [`InstrumentManager`] wrap a channel, a default
//!   velocity, and a transpose offset around the note and sequence sinks,
//!   and track which sequences each instrument owns.
//!
//! The crate never emits raw MIDI bytes itself: [`traits::NoteSink`] and
//! [`traits::SequenceSink`] are the capability interfaces a caller's own
//! MIDI output port and sequencer implement. See the `baton-midi-backend`
//! workspace member for a real port-backed [`traits::NoteSink`].
//!
//! This crate is `no_std`-incompatible by design: the dispatcher needs
//! threads, mutexes, and a monotonic clock, all of which come from `std`.

/// A collection of imports that are useful to most users of this crate.
pub mod prelude {
    pub use crate::{
        config::SchedulerConfig,
        error::{Result, SchedulerError},
        instrument::{Instrument, InstrumentConfig, InstrumentManager},
        traits::{NoteSink, SequenceSink},
        transport::{JitterStats, ThreadPoolStats, Transport},
        types::{Note, Sequence},
    };
}

pub use config::SchedulerConfig;
pub use error::{Result, SchedulerError};
pub use instrument::{Instrument, InstrumentConfig, InstrumentManager};
pub use sequencer::Sequencer;
pub use transport::{JitterStats, ThreadPoolStats, Transport};
pub use types::{Note, Sequence};

pub mod config;
pub mod error;
pub mod instrument;
pub mod sequencer;
pub mod traits;
pub mod transport;
pub mod types;
mod util;
