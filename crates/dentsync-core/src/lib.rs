//! dentsync core library
//!
//! Offline-first synchronization core for the dental clinic client. The
//! hosted document store stays the source of truth; this crate keeps a
//! durable write-behind queue of local mutations and a local mirror of the
//! remote entities the signed-in user can see.
//!
//! # Architecture
//!
//! - **SyncQueue**: durable FIFO of pending create/update/delete mutations
//! - **LocalMirror**: per-entity cache fed by snapshots and deltas
//! - **SubscriptionRegistry**: one live remote watch per (entity, scope)
//! - **ConflictResolver**: pure per-entity merge policy
//! - **SyncOrchestrator**: the single task that wires everything together
//!
//! # Quick Start
//!
//! ```text
//! let persistence = Arc::new(SqlitePersistence::open(&config)?);
//! let orchestrator = SyncOrchestrator::new(
//!     config, remote, identity, persistence, ConnectivityMonitor::new(true),
//! );
//! let handle = spawn_orchestrator(orchestrator);
//!
//! // Optimistic local write, flushed when online
//! let id = handle.update_local(EntityType::Appointment, patch).await?;
//! ```
//!
//! # Modules
//!
//! - `orchestrator`: lifecycle, flush loop and reconciliation (main entry point)
//! - `queue`: persisted mutation queue with dead letters
//! - `mirror`: local entity caches
//! - `subscriptions`: remote watch bookkeeping
//! - `resolver`: conflict policies
//! - `remote`: collaborator traits (remote store, identity) and
//!   `MemoryRemote`, an in-process reference `RemoteChannel` with scripted
//!   failures, used by the test suites and for running without a backend
//! - `connectivity`, `events`: online flag and UI event broadcast
//! - `roles`, `schema`, `stats`: per-role subscriptions, payload validation,
//!   dashboard figures
//! - `storage`: key-value persistence (SQLite and in-memory)
//! - `config`: application configuration

pub mod config;
pub mod connectivity;
pub mod document;
pub mod error;
pub mod events;
pub mod mirror;
pub mod models;
pub mod orchestrator;
pub mod queue;
pub mod remote;
pub mod resolver;
pub mod roles;
pub mod schema;
pub mod stats;
pub mod storage;
pub mod subscriptions;

pub use config::Config;
pub use connectivity::{ConnectivityEvent, ConnectivityMonitor};
pub use document::Document;
pub use error::{ErrorCode, ErrorKind, RemoteError, SyncError, ValidationError};
pub use events::{EventBus, SyncEvent};
pub use mirror::LocalMirror;
pub use models::{EntityType, Identity, MutationAction, MutationRecord, Role};
pub use orchestrator::{
    spawn_orchestrator, FlushReport, OrchestratorHandle, SyncOrchestrator, SyncStatus,
};
pub use queue::{DeadLetterRetry, RequeueOutcome, SyncQueue};
pub use remote::{IdentityProvider, RemoteChannel};
pub use resolver::{ConflictPolicy, ConflictResolver};
pub use storage::{LocalPersistence, MemoryPersistence, SqlitePersistence, StorageError};
pub use subscriptions::{SubscriptionKey, SubscriptionRegistry, SubscriptionState};
