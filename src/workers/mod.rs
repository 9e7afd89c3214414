pub mod slot_poller;

pub use slot_poller::{PollError, PollOutcome, SlotPoller, SlotPollerConfig};
