//! Sentinel chain interaction layer.
//!
//! This crate provides:
//! - Endpoint management for HTTP, WebSocket and private-relay connections
//! - Typed contract bindings for the pool, price feeds and Multicall3
//! - Streaming event ingestion with backfill and reorg-safe dedupe
//! - Batched health factor reads via Multicall3
//! - Price oracle with alias/ratio feeds and a hot cache
//! - Calldata template cache with offset patching
//! - Multi-key signing, nonce tracking, private submission, write racing
//! - Gas strategies and the replace-by-fee ladder
//! - Revert selector classification

pub mod contracts;
mod event_ingestor;
pub mod gas;
mod health_factor;
mod keys;
mod price_oracle;
mod private_tx;
mod provider;
mod revert;
mod template;
mod write_racer;

pub use event_ingestor::{
    parse_pool_event, BackfillResult, EventIngestor, IngestorConfig, PoolEvent, ReserveCoalescer,
    ReserveDataUpdate, SeenLogs,
};
pub use gas::{
    create_gas_strategy, Eip1559GasStrategy, GasBurstConfig, GasBurstManager, GasParams,
    GasStrategy, TipStrategy, TrackedAttemptTx,
};
pub use health_factor::{
    health_factor_from_reserves, AccountData, BatchResult, HealthFactorEngine, HfEngineConfig,
    ReserveAmount, UserPosition,
};
pub use keys::{KeySelection, MultiKeyManager};
pub use price_oracle::{
    delta_bps, normalize_chainlink_price, FeedConfig, FlushOutcome, OracleConfig, PriceError,
    PriceOracle, PricePoint, PriceSource, Readiness,
};
pub use private_tx::{
    FallbackMode, PrivateMode, PrivateTxConfig, PrivateTxSender, SubmitOutcome, SubmitPath,
};
pub use provider::EndpointManager;
pub use revert::{ClassifiedRevert, RevertCategory, RevertClassifier};
pub use template::{patch_user_and_repay, CalldataTemplate, TemplateCache};
pub use write_racer::{raw_tx_hash, RaceOutcome, WriteRacer};
