//! attest-shim
//!
//! Daemon core that sits behind a binder hook in the keystore process and
//! decides, per intercepted call, whether to forge key attestation.
//!
//! # Module Structure
//!
//! - `envelope`: framed pre-call / post-call records and decisions
//! - `policy`: package rule tries, mode flags, caller resolution
//! - `cache`: bounded LRU shared by the handlers
//! - `handlers`: key generation, key entry fetch, remote provisioning
//! - `dispatcher`: routes records to handlers, degrades failures to pass-through
//! - `transport`, `watcher`, `config`: daemon plumbing

pub mod cache;
pub mod config;
pub mod device;
pub mod dispatcher;
pub mod envelope;
pub mod forge;
pub mod handlers;
pub mod keystore;
pub mod parcel;
pub mod policy;
pub mod snapshot;
pub mod transport;
pub mod watcher;

pub use cache::BoundedCache;
pub use device::DeviceProfile;
pub use dispatcher::{CacheCapacities, Dispatcher, TargetKind};
pub use envelope::{Decision, FramingError, Identity, InterceptedCall, Phase, Record};
pub use forge::{Forge, ForgeError, SoftwareForge};
pub use handlers::HandlerError;
pub use policy::{ModeFlags, PolicyEngine, PolicySnapshot, Verdict};
pub use snapshot::{Snapshot, SnapshotCell};
pub use transport::{BootstrapError, ServeOutcome};
