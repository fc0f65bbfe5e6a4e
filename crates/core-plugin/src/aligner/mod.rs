//! Built-in aligner plugins.

mod index;
mod mappy;
mod mappy_rs;
mod no_op;

pub use mappy::MappyAligner;
pub use mappy_rs::MappyRsAligner;
pub use no_op::NoOpAligner;
