//! # Reservation Object Stress Driver
//!
//! Drives one [`ReservationObject`](resv_object::ReservationObject) through
//! rounds of exclusive/shared fence traffic while reader threads snapshot it
//! lock-free. Each round:
//!
//! 1. installs a new exclusive fence, which empties the shared set;
//! 2. inserts `run.fences` shared fences in forward, backward or seeded
//!    random order, validating the trie periodically;
//! 3. checks that enumeration returns exactly the inserted fences in
//!    insertion order;
//! 4. signals the round's timeline and waits for the object to go idle.
//!
//! Readers count every snapshot whose shared fences do not belong to the
//! round of its exclusive fence. A clean run reports zero.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod run;

pub use config::{InsertOrder, RunConfig, StressConfig};
pub use error::{StressError, StressResult};
pub use run::{StressReport, insertion_order, run_stress};
