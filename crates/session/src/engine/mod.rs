// Local collaboration state: CRDT document, presence, and the derived roster.

pub mod awareness;
pub mod doc;
pub mod listeners;
pub mod roster;
pub mod throttle;
