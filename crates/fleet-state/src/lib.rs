// ── Module declarations ───────────────────────────────────────────────────────

pub mod blob;
pub mod bus;
pub mod envelope;
pub mod error;
pub mod gateway;
pub mod names;
pub mod payload;

// ── Public re-exports ─────────────────────────────────────────────────────────

pub use blob::{cid_from_data, BlobStore};
pub use bus::{Bus, BusSubscription, LocalBus};
pub use envelope::Envelope;
pub use error::StateError;
pub use gateway::StateGateway;
pub use names::{NamePointer, NameRegistry, ACTIVE_JOBS, FLEET_REGISTRY};
