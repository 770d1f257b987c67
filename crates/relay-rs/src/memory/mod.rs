//! Persistent memory tiers: session narrative, project-level episodic
//! documents, externalized artifacts and the version store behind them.

pub mod artifacts;
pub mod compression;
pub mod document;
pub mod episodic;
pub mod session;

pub use artifacts::ArtifactStore;
pub use document::{MemoryDocument, VersionStore};
pub use episodic::{DocumentRef, EpisodicDoc, EpisodicMemoryConfig, EpisodicMemoryManager};
pub use session::{SessionMemoryConfig, SessionMemoryManager, SessionRef};
