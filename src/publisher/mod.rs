pub mod batch;
pub mod emitter;
pub mod envelope;

pub use batch::{BatchError, BatchEvent, BatchReport};
pub use emitter::Publisher;
pub use envelope::{ENVELOPE_VERSION, Envelope};
