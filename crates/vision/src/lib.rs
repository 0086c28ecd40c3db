//! Screen overlay pipeline: capture frames, detect objects off-thread, keep
//! boxes on screen while they are fresh, and ring an alert on new sightings.

pub mod pipeline;

pub use pipeline::*;
