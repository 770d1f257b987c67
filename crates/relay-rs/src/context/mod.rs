//! Context window management: token accounting, zones, working memory,
//! and the optimization pipeline that keeps the live context in budget.

pub mod adaptive;
pub mod operation;
pub mod optimizer;
pub mod snapshot;
pub mod summarizer;
pub mod tokens;
pub mod window;
pub mod working;

pub use adaptive::{AdaptiveOptimizer, OptimizationProfile, ProfileName};
pub use operation::{Operation, OperationKind};
pub use optimizer::{ContextOptimizer, OptimizationResult, OptimizerConfig, Technique};
pub use snapshot::{ContextItem, ContextSnapshot, ItemBody, ItemKind};
pub use summarizer::{ExtractiveSummarizer, Summarizer, SummaryRequest};
pub use tokens::TokenEstimator;
pub use window::{ContextWindowManager, RecommendedAction, WindowSnapshot, Zone, ZoneThresholds};
pub use working::{Capacity, WorkingMemory, WorkingMemoryConfig};
