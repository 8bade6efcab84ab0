//! Sentinel core liquidation logic.
//!
//! This crate provides the decision core of the bot:
//! - Bounded candidate set and hot/warm watch partition
//! - Reserve index gating and RPC budget enforcement
//! - Pre-simulated plan cache and profit/risk gating
//! - Decision trace retention and miss classification
//! - In-flight locks, duplicate gating and the pipeline orchestrator
//! - Configuration, token metadata, diagnostic dumps

mod budget;
mod candidates;
pub mod config;
mod decision_trace;
mod dump;
mod hot_set;
mod inflight;
mod miss_classifier;
mod pipeline;
mod presim;
mod profit;
mod quoter;
mod reserve_index;
mod risk_gate;
mod tokens;
pub mod wad_math;

pub use budget::{
    near_band, BudgetConfig, BudgetDenial, BudgetVerdict, FallbackConfig, FallbackOrchestrator,
    PredictiveBudgetTracker, RiskRanked, ScopeDecision,
};
pub use candidates::{Candidate, CandidateManager};
pub use config::{
    config, init_config, BotConfig, CloseFactorMode, KeyStrategy, RelayFallback, RelayMode,
    TipMode,
};
pub use decision_trace::{
    AttemptMeta, DecisionAction, DecisionTrace, DecisionTraceStore, TraceStoreConfig,
    TraceThresholds,
};
pub use dump::{
    verify_dump, DumpCollateral, DumpDebt, DumpEntry, DumpReserves, HotSetDump, StatusSnapshot,
    VerifyReport, DUMP_SCHEMA_VERSION,
};
pub use hot_set::{HotSetEntry, HotSetTracker, Tier, TriggerKind};
pub use inflight::{AttemptedBlocks, InFlightLocks, RedisKv};
pub use miss_classifier::{
    ClassifiedMiss, CompetitorLiquidation, MissClassifier, MissClassifierConfig, MissReason,
};
pub use pipeline::{AttemptPhase, DecisionRequest, Pipeline};
pub use presim::{LiquidationPlan, PreSimCache};
pub use profit::{ProfitBreakdown, ProfitCalculator, ProfitEstimate};
pub use quoter::{StaticQuoter, SwapQuote, SwapQuoter};
pub use reserve_index::{RecheckDecision, ReserveIndexTracker, ReserveIndices};
pub use risk_gate::{GateInput, GateOutcome, PnlWindow, RiskGate, RiskGateConfig, SkipReason};
pub use tokens::{normalize_address, TokenInfo, TokenRegistry};
