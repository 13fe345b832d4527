//! Keyed single-flight storage shared by the client and working-copy caches.

pub mod keyed;

pub use keyed::{KeyedSlots, Lookup};
