//! Pipeline orchestration.
//!
//! Three ingress paths (pool events, head blocks, price signals) converge
//! on one decision path served by a pool of workers: compute HF at the
//! current block, consult the plan cache, run the risk gate, then sign and
//! submit through the private sender with the racer as fallback while the
//! gas burst ladder watches the transaction. Every decision leaves a
//! trace; every competitor liquidation is classified against that history.

use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, U256};
use alloy::rpc::types::TransactionRequest;
use anyhow::{Context, Result};
use dashmap::{DashMap, DashSet};
use futures::StreamExt;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};

use sentinel_chain::{
    patch_user_and_repay, EndpointManager, EventIngestor, GasBurstManager, GasStrategy,
    HealthFactorEngine, MultiKeyManager, PoolEvent, PriceOracle, PrivateTxSender,
    ReserveCoalescer, ReserveDataUpdate, RevertClassifier, TemplateCache, TrackedAttemptTx,
    WriteRacer,
};

use crate::budget::{FallbackOrchestrator, PredictiveBudgetTracker, RiskRanked, ScopeDecision};
use crate::candidates::CandidateManager;
use crate::config::{BotConfig, CloseFactorMode};
use crate::decision_trace::{
    AttemptMeta, DecisionTrace, DecisionTraceStore, TraceThresholds,
};
use crate::dump::{DumpCollateral, DumpDebt, DumpReserves, HotSetDump, StatusSnapshot};
use crate::hot_set::{HotSetEntry, HotSetTracker, Tier, TriggerKind};
use crate::inflight::{AttemptedBlocks, InFlightLocks};
use crate::miss_classifier::{CompetitorLiquidation, MissClassifier};
use crate::presim::{LiquidationPlan, PreSimCache};
use crate::profit::ProfitCalculator;
use crate::quoter::SwapQuoter;
use crate::reserve_index::ReserveIndexTracker;
use crate::risk_gate::{GateInput, GateOutcome, PnlWindow, RiskGate, SkipReason};
use crate::tokens::TokenRegistry;
use crate::wad_math::{amount_from_usd_base, apply_bps_down, usd_to_base};

/// Lifecycle of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptPhase {
    Eligible,
    Planning,
    Signed,
    Submitted,
    Mined,
    Replaced,
    Reverted,
    Abandoned,
}

impl AttemptPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Mined | Self::Replaced | Self::Reverted | Self::Abandoned
        )
    }

    /// Legal forward transitions of the state machine.
    pub fn can_advance_to(&self, next: AttemptPhase) -> bool {
        use AttemptPhase::*;
        matches!(
            (self, next),
            (Eligible, Planning)
                | (Planning, Signed)
                | (Planning, Abandoned)
                | (Signed, Submitted)
                | (Signed, Abandoned)
                | (Submitted, Mined)
                | (Submitted, Replaced)
                | (Submitted, Reverted)
                | (Submitted, Abandoned)
        )
    }
}

/// Work item flowing into the decision workers.
#[derive(Debug, Clone)]
pub struct DecisionRequest {
    pub user: Address,
    pub trigger: TriggerKind,
    pub block: u64,
}

/// All long-lived collaborators, wired once in the binary.
pub struct Pipeline {
    pub config: BotConfig,
    pub endpoints: Arc<EndpointManager>,
    pub ingestor: Arc<EventIngestor>,
    pub coalescer: Arc<ReserveCoalescer>,
    pub hf_engine: Arc<HealthFactorEngine>,
    pub oracle: Arc<PriceOracle>,
    pub tokens: Arc<TokenRegistry>,
    pub candidates: Arc<CandidateManager>,
    pub hot_set: Arc<HotSetTracker>,
    pub reserve_index: Arc<ReserveIndexTracker>,
    pub budget: Arc<PredictiveBudgetTracker>,
    pub fallback: Arc<FallbackOrchestrator>,
    pub presim: Arc<PreSimCache>,
    pub templates: Arc<TemplateCache>,
    pub profit: Arc<ProfitCalculator>,
    pub risk_gate: Arc<RiskGate>,
    pub traces: Arc<DecisionTraceStore>,
    pub miss_classifier: Arc<MissClassifier>,
    pub keys: Arc<MultiKeyManager>,
    pub gas_strategy: Arc<dyn GasStrategy>,
    pub private_tx: Arc<PrivateTxSender>,
    pub racer: Arc<WriteRacer>,
    pub burst: Arc<GasBurstManager>,
    pub reverts: Arc<RevertClassifier>,
    pub quoter: Arc<dyn SwapQuoter>,
    pub inflight: Arc<InFlightLocks>,
    pub attempted: Arc<AttemptedBlocks>,
    pub pnl: Arc<PnlWindow>,

    /// reserve -> users touching it, maintained from pool events.
    reserve_users: DashMap<Address, DashSet<Address>>,
    /// Users quarantined after a revert, until the stored block.
    quarantine: DashMap<Address, u64>,
    /// Per-symbol debounce of price triggers.
    last_price_trigger_ms: DashMap<String, u64>,
    /// Last hot price per symbol, for drop detection on refresh.
    last_price_answer: DashMap<String, U256>,
    /// Attempt phase per user, for observability.
    attempt_phase: DashMap<Address, AttemptPhase>,
    chain_id: AtomicU64,
    started_at: Instant,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: BotConfig,
        endpoints: Arc<EndpointManager>,
        ingestor: Arc<EventIngestor>,
        hf_engine: Arc<HealthFactorEngine>,
        oracle: Arc<PriceOracle>,
        tokens: Arc<TokenRegistry>,
        candidates: Arc<CandidateManager>,
        hot_set: Arc<HotSetTracker>,
        reserve_index: Arc<ReserveIndexTracker>,
        budget: Arc<PredictiveBudgetTracker>,
        fallback: Arc<FallbackOrchestrator>,
        presim: Arc<PreSimCache>,
        templates: Arc<TemplateCache>,
        profit: Arc<ProfitCalculator>,
        risk_gate: Arc<RiskGate>,
        traces: Arc<DecisionTraceStore>,
        miss_classifier: Arc<MissClassifier>,
        keys: Arc<MultiKeyManager>,
        gas_strategy: Arc<dyn GasStrategy>,
        private_tx: Arc<PrivateTxSender>,
        racer: Arc<WriteRacer>,
        burst: Arc<GasBurstManager>,
        quoter: Arc<dyn SwapQuoter>,
        inflight: Arc<InFlightLocks>,
    ) -> Self {
        let coalescer = Arc::new(ReserveCoalescer::new(
            Duration::from_millis(config.ingest.coalesce_window_ms),
            config.ingest.coalesce_max_batch,
        ));
        Self {
            coalescer,
            endpoints,
            ingestor,
            hf_engine,
            oracle,
            tokens,
            candidates,
            hot_set,
            reserve_index,
            budget,
            fallback,
            presim,
            templates,
            profit,
            risk_gate,
            traces,
            miss_classifier,
            keys,
            gas_strategy,
            private_tx,
            racer,
            burst,
            reverts: Arc::new(RevertClassifier::new()),
            quoter,
            inflight,
            attempted: Arc::new(AttemptedBlocks::new(config.ingest.dedupe_capacity)),
            pnl: Arc::new(PnlWindow::new()),
            reserve_users: DashMap::new(),
            quarantine: DashMap::new(),
            last_price_trigger_ms: DashMap::new(),
            last_price_answer: DashMap::new(),
            attempt_phase: DashMap::new(),
            chain_id: AtomicU64::new(0),
            started_at: Instant::now(),
            config,
        }
    }

    /// Seed state from chain history and warm the price oracle.
    #[instrument(skip(self))]
    pub async fn bootstrap(&self) -> Result<()> {
        info!("Starting bootstrap");

        let chain_id = self.endpoints.chain_id().await?;
        self.chain_id.store(chain_id, Ordering::Relaxed);
        let head = self.endpoints.block_number().await?;

        self.oracle.refresh_all(head).await?;

        if self.config.ingest.backfill_enabled {
            let backfill = self.ingestor.backfill(head).await?;
            let now = now_ms();
            for user in &backfill.users {
                self.candidates.add(*user, now);
            }
            info!(
                users = backfill.users.len(),
                logs = backfill.logs_scanned,
                "Candidates seeded from backfill"
            );

            // Initial HF sweep over the seeded set, budget permitting.
            self.budget.start_tick(now);
            let addresses = self.candidates.addresses();
            let sweep: Vec<Address> = addresses
                .into_iter()
                .take(self.budget.remaining(None))
                .collect();
            if !sweep.is_empty() {
                let batch = self.hf_engine.batch(&sweep, Some(head)).await?;
                self.budget.record_evaluated(sweep.len(), None);
                for (user, data) in &batch.accounts {
                    self.absorb_account(*user, data.hf(), data, head, TriggerKind::Head);
                }
                info!(
                    evaluated = batch.accounts.len(),
                    failed = batch.failures.len(),
                    hot = self.hot_set.hot_len(),
                    warm = self.hot_set.warm_len(),
                    "Initial health sweep complete"
                );
            }
        }

        info!(chain_id = chain_id, head = head, "Bootstrap complete");
        Ok(())
    }

    /// Run the supervisor: three ingress loops plus the worker pool.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!(workers = self.config.pipeline.decision_workers, "Starting pipeline");

        let (work_tx, work_rx) = mpsc::channel::<DecisionRequest>(self.config.pipeline.queue_capacity);
        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));

        // Decision workers.
        for worker_id in 0..self.config.pipeline.decision_workers {
            let pipeline = self.clone();
            let rx = work_rx.clone();
            tokio::spawn(async move {
                loop {
                    let request = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    let Some(request) = request else { break };
                    if let Err(e) = pipeline.clone().decide(request.clone()).await {
                        warn!(worker = worker_id, user = %request.user, error = %e, "Decision failed");
                    }
                }
            });
        }

        // Pool event loop with exponential reconnect backoff.
        {
            let pipeline = self.clone();
            let tx = work_tx.clone();
            tokio::spawn(async move {
                let mut backoff = Duration::from_secs(1);
                loop {
                    let started = Instant::now();
                    match pipeline.pool_event_loop(tx.clone()).await {
                        Ok(()) => warn!("Pool event stream ended, reconnecting"),
                        Err(e) => error!(error = %e, "Pool event loop failed, reconnecting"),
                    }
                    // A connection that survived a while resets the ladder.
                    if started.elapsed() > Duration::from_secs(60) {
                        backoff = Duration::from_secs(1);
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(60));
                }
            });
        }

        // Head loop with exponential reconnect backoff.
        {
            let pipeline = self.clone();
            let tx = work_tx.clone();
            tokio::spawn(async move {
                let mut backoff = Duration::from_secs(1);
                loop {
                    let started = Instant::now();
                    match pipeline.head_loop(tx.clone()).await {
                        Ok(()) => warn!("Head stream ended, reconnecting"),
                        Err(e) => error!(error = %e, "Head loop failed, reconnecting"),
                    }
                    if started.elapsed() > Duration::from_secs(60) {
                        backoff = Duration::from_secs(1);
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(60));
                }
            });
        }

        // Coalescer flush ticker.
        {
            let pipeline = self.clone();
            let tx = work_tx.clone();
            tokio::spawn(async move {
                let window = Duration::from_millis(pipeline.config.ingest.coalesce_window_ms.max(10));
                let mut ticker = interval(window);
                loop {
                    ticker.tick().await;
                    if let Some(batch) = pipeline.coalescer.flush_elapsed() {
                        pipeline.process_reserve_batch(batch, &tx).await;
                    }
                }
            });
        }

        // Maintenance: cache pruning, provider health, stale revisits.
        let maintenance = {
            let pipeline = self.clone();
            let tx = work_tx.clone();
            tokio::spawn(async move {
                let mut ticker = interval(Duration::from_secs(10));
                loop {
                    ticker.tick().await;
                    pipeline.maintenance_tick(&tx).await;
                }
            })
        };

        maintenance.await.context("maintenance task ended")?;
        Ok(())
    }

    async fn pool_event_loop(&self, tx: mpsc::Sender<DecisionRequest>) -> Result<()> {
        let mut stream = self.ingestor.subscribe_pool_events().await?;
        info!("Pool event subscription active");

        while let Some(event) = stream.next().await {
            self.on_pool_event(event, &tx).await;
        }
        Ok(())
    }

    async fn head_loop(&self, tx: mpsc::Sender<DecisionRequest>) -> Result<()> {
        let mut stream = self.ingestor.subscribe_heads().await?;
        info!("Head subscription active");

        while let Some(block) = stream.next().await {
            self.on_head(block, &tx).await;
        }
        Ok(())
    }

    /// Event pipeline entry.
    pub async fn on_pool_event(&self, event: PoolEvent, tx: &mpsc::Sender<DecisionRequest>) {
        debug!(
            event_type = event.event_type(),
            block = event.block_number(),
            log_index = event.log_index(),
            "Pool event"
        );

        match &event {
            PoolEvent::ReserveDataUpdated(update) => {
                if let Some(batch) = self.coalescer.push(update.clone()) {
                    self.process_reserve_batch(batch, tx).await;
                }
                return;
            }
            PoolEvent::LiquidationCall {
                collateral_asset,
                debt_asset,
                user,
                debt_to_cover,
                liquidated_collateral,
                liquidator,
                block_number,
                ..
            } => {
                self.on_competitor_liquidation(CompetitorLiquidation {
                    user: *user,
                    liquidator: *liquidator,
                    collateral_asset: *collateral_asset,
                    debt_asset: *debt_asset,
                    debt_to_cover: *debt_to_cover,
                    liquidated_collateral: *liquidated_collateral,
                    block: *block_number,
                    ts_ms: now_ms(),
                });
            }
            PoolEvent::Supply { reserve, .. }
            | PoolEvent::Withdraw { reserve, .. }
            | PoolEvent::Borrow { reserve, .. }
            | PoolEvent::Repay { reserve, .. } => {
                if let Some(user) = event.user() {
                    self.reserve_users.entry(*reserve).or_default().insert(user);
                }
            }
        }

        let Some(user) = event.user() else { return };
        let now = now_ms();
        if self.candidates.add(user, now) {
            self.miss_classifier.note_tracked(user);
        } else {
            self.candidates.touch(&user, now);
        }

        // Position changed: stale plans and cached HF are worthless.
        self.presim.invalidate_user(&user);
        self.hf_engine.invalidate_user(&user);

        self.enqueue(
            tx,
            DecisionRequest {
                user,
                trigger: TriggerKind::Event,
                block: event.block_number(),
            },
            true,
        )
        .await;
    }

    /// Head pipeline entry.
    pub async fn on_head(&self, block: u64, tx: &mpsc::Sender<DecisionRequest>) {
        self.endpoints.record_head(block);
        let now = now_ms();
        self.budget.start_tick(now);

        // Refresh the price oracle against the new head and derive price
        // drop signals from the hot cache movement.
        if let Err(e) = self.oracle.refresh_all(block).await {
            warn!(error = %e, "Oracle refresh failed on head");
        }
        let drops = self.detect_price_drops();
        for (symbol, drop_bps) in drops {
            self.on_price_signal(&symbol, drop_bps, tx).await;
        }

        // Hot entries, lowest HF first, budget capped.
        let scope = self.fallback.decide(now);
        let hot = self.hot_set.get_hot_set();
        let ranked: Vec<RiskRanked> = hot
            .iter()
            .map(|e| RiskRanked {
                address: e.address,
                hf: e.hf,
                debt_usd: e.total_debt_usd,
            })
            .collect();
        let selected = match scope {
            ScopeDecision::Passive => Vec::new(),
            ScopeDecision::NearBandOnly { max_users } | ScopeDecision::Broadened { max_users, .. } => {
                let mut picked = self.budget.downsample_to_fit(ranked, None);
                picked.truncate(max_users);
                picked
            }
        };

        if !selected.is_empty() {
            self.budget.record_evaluated(selected.len(), None);
            for entry in selected {
                self.enqueue(
                    tx,
                    DecisionRequest {
                        user: entry.address,
                        trigger: TriggerKind::Head,
                        block,
                    },
                    true,
                )
                .await;
            }
        }

        // Opportunistic cold revisit: a few stale candidates per head.
        let stale = self
            .candidates
            .get_stale(self.config.watch.stale_check_ms, now);
        for candidate in stale.into_iter().take(4) {
            self.enqueue(
                tx,
                DecisionRequest {
                    user: candidate.address,
                    trigger: TriggerKind::Head,
                    block,
                },
                false,
            )
            .await;
        }
    }

    /// Price pipeline entry (debounced, per-asset threshold).
    pub async fn on_price_signal(
        &self,
        symbol: &str,
        drop_bps: u64,
        tx: &mpsc::Sender<DecisionRequest>,
    ) {
        let now = now_ms();
        self.fallback.record_price_drop(drop_bps, now);

        if drop_bps < self.config.price_drop_bps_for(symbol) {
            return;
        }
        {
            let mut last = self.last_price_trigger_ms.entry(symbol.to_string()).or_insert(0);
            if now.saturating_sub(*last) < self.config.pipeline.price_debounce_ms {
                return;
            }
            *last = now;
        }

        info!(symbol = symbol, drop_bps = drop_bps, "Price shock, emergency scan");
        metrics::increment_counter!("price_triggers_total");

        // Near-band users of that asset, capped.
        let asset = self.tokens.get_by_symbol(symbol).map(|t| t.address);
        let block = self.endpoints.last_head();
        let band_ceiling = 1.0 + self.config.fallback.near_band_bps as f64 / 10_000.0;

        let mut users: Vec<Address> = match asset.and_then(|a| self.reserve_users.get(&a)) {
            Some(set) => set.iter().map(|u| *u).collect(),
            None => self.hot_set.get_hot_set().iter().map(|e| e.address).collect(),
        };
        users.retain(|user| {
            self.hot_set
                .get(user)
                .map(|entry| entry.hf <= band_ceiling)
                .unwrap_or(true)
        });
        users.truncate(self.config.pipeline.emergency_scan_max_users);

        let verdict = self.budget.can_evaluate_users(users.len(), asset);
        if !verdict.allowed {
            let ranked: Vec<RiskRanked> = users
                .iter()
                .filter_map(|u| {
                    self.hot_set.get(u).map(|e| RiskRanked {
                        address: *u,
                        hf: e.hf,
                        debt_usd: e.total_debt_usd,
                    })
                })
                .collect();
            users = self
                .budget
                .downsample_to_fit(ranked, asset)
                .into_iter()
                .map(|r| r.address)
                .collect();
        }
        self.budget.record_evaluated(users.len(), asset);

        for user in users {
            self.enqueue(
                tx,
                DecisionRequest {
                    user,
                    trigger: TriggerKind::Price,
                    block,
                },
                true,
            )
            .await;
        }
    }

    /// Reserve-data batch through the index gate.
    async fn process_reserve_batch(
        &self,
        batch: Vec<ReserveDataUpdate>,
        tx: &mpsc::Sender<DecisionRequest>,
    ) {
        for update in batch {
            let decision = self.reserve_index.should_recheck(
                update.reserve,
                update.liquidity_index,
                update.variable_borrow_index,
                update.block_number,
            );
            if !decision.should {
                continue;
            }
            debug!(
                reserve = %update.reserve,
                delta_bps = decision.max_delta_bps,
                reason = decision.reason,
                "Reserve indexes moved, rechecking holders"
            );

            let Some(users) = self.reserve_users.get(&update.reserve) else {
                continue;
            };
            let ranked: Vec<RiskRanked> = users
                .iter()
                .filter_map(|u| {
                    let user = *u;
                    self.hot_set.get(&user).map(|e| RiskRanked {
                        address: user,
                        hf: e.hf,
                        debt_usd: e.total_debt_usd,
                    })
                })
                .collect();
            let picked = self.budget.downsample_to_fit(ranked, Some(update.reserve));
            self.budget.record_evaluated(picked.len(), Some(update.reserve));

            for entry in picked {
                self.enqueue(
                    tx,
                    DecisionRequest {
                        user: entry.address,
                        trigger: TriggerKind::Event,
                        block: update.block_number,
                    },
                    false,
                )
                .await;
            }
        }
    }

    /// The shared decision path.
    #[instrument(skip(self), fields(user = %request.user, trigger = ?request.trigger, block = request.block))]
    pub async fn decide(self: Arc<Self>, request: DecisionRequest) -> Result<()> {
        let user = request.user;
        let now = now_ms();

        if let Some(until) = self.quarantine.get(&user).map(|b| *b) {
            if request.block < until {
                return Ok(());
            }
            self.quarantine.remove(&user);
        }

        let prev_hf = self.candidates.get(&user).and_then(|c| c.last_hf);
        let Some(account) = self.hf_engine.get_account_data(user, Some(request.block)).await
        else {
            return Ok(());
        };
        let hf = account.hf();
        self.absorb_account(user, hf, &account, request.block, request.trigger);

        if hf >= 1.0 {
            // Near-band users leave a skip trace so later misses can be
            // explained as latency rather than absence.
            if hf <= self.hot_set.hot_threshold() {
                self.record_skip(
                    user,
                    request.block,
                    hf,
                    prev_hf,
                    SkipReason::HfNotBelowThreshold,
                    Some(account.debt_usd()),
                    None,
                );
            }
            return Ok(());
        }

        self.miss_classifier.note_liquidatable(user, request.block);

        if self.attempted.contains(&user, request.block) {
            return Ok(());
        }
        if !self.inflight.try_acquire(user, now).await {
            debug!(user = %user, "Attempt already in flight");
            return Ok(());
        }
        self.set_phase(user, AttemptPhase::Eligible);

        let outcome = self.plan_and_execute(user, &request, &account, prev_hf).await;
        match outcome {
            Ok(Some(submitted)) => {
                // Attempt submitted; the receipt watcher settles the lock.
                let pipeline = self.clone();
                tokio::spawn(async move {
                    pipeline
                        .watch_receipt(
                            user,
                            submitted.tx_hash,
                            submitted.key_index,
                            submitted.est_profit_usd,
                        )
                        .await;
                });
            }
            Ok(None) => {
                self.inflight.release(user).await;
                self.clear_phase(user);
            }
            Err(e) => {
                warn!(user = %user, error = %e, "Attempt pipeline error");
                self.inflight.release(user).await;
                self.clear_phase(user);
            }
        }
        Ok(())
    }

    /// Plan, gate and execute one liquidation. Returns submission details
    /// when a transaction went out.
    async fn plan_and_execute(
        &self,
        user: Address,
        request: &DecisionRequest,
        account: &sentinel_chain::AccountData,
        prev_hf: Option<f64>,
    ) -> Result<Option<SubmittedAttempt>> {
        let hf = account.hf();
        let block = request.block;
        self.set_phase(user, AttemptPhase::Planning);

        // Gather gas conditions first; they gate everything.
        let gas = self
            .gas_strategy
            .fetch_params(self.endpoints.http_url())
            .await?;
        let gas_price_wei = gas.bid_per_gas();

        // Plan: cache hit or fresh computation.
        let plan = match self.lookup_or_plan(user, block).await {
            Ok(plan) => plan,
            Err(PlanFailure::Skip(reason)) => {
                self.record_skip(user, block, hf, prev_hf, reason, Some(account.debt_usd()), None);
                return Ok(None);
            }
            Err(PlanFailure::Error(e)) => return Err(e),
        };

        let debt_symbol = self.tokens.symbol(&plan.debt_asset).unwrap_or("?").to_string();
        let price_result = self.oracle.get_price(&debt_symbol);
        let (repay_base, price_error) = match &price_result {
            Ok(price) => (
                self.tokens.usd_base(
                    &plan.debt_asset,
                    plan.repay_amount,
                    price.answer,
                    price.decimals,
                ),
                None,
            ),
            Err(e) => (U256::ZERO, Some(e)),
        };

        let bonus_bps = self.tokens.liquidation_bonus_bps(&plan.collateral_asset);
        let estimate = self.profit.estimate(
            repay_base,
            bonus_bps,
            usd_to_base(self.config.execution.gas_cost_usd),
        );

        let input = GateInput {
            user,
            block,
            already_attempted: self.attempted.contains(&user, block),
            gas_price_wei,
            hf_wad: account.health_factor,
            collateral_base: account.total_collateral_base,
            debt_base: account.total_debt_base,
            repay_amount: plan.repay_amount,
            repay_decimals: self.tokens.decimals(&plan.debt_asset),
            repay_base,
            price_outcome: price_error,
            est_net_base: estimate.net_base,
            rolling_pnl_base: self.pnl.rolling_sum(now_ms()),
        };

        match self.risk_gate.evaluate(&input) {
            GateOutcome::Skip(reason) => {
                self.record_skip(
                    user,
                    block,
                    hf,
                    prev_hf,
                    reason,
                    Some(account.debt_usd()),
                    Some(estimate.net_usd()),
                );
                Ok(None)
            }
            GateOutcome::Ok => {
                self.execute_attempt(user, request, account, prev_hf, plan, gas, estimate.net_usd())
                    .await
            }
        }
    }

    /// Sign, submit, and hand off to the bump ladder.
    #[allow(clippy::too_many_arguments)]
    async fn execute_attempt(
        &self,
        user: Address,
        request: &DecisionRequest,
        account: &sentinel_chain::AccountData,
        prev_hf: Option<f64>,
        plan: LiquidationPlan,
        gas: sentinel_chain::GasParams,
        est_profit_usd: f64,
    ) -> Result<Option<SubmittedAttempt>> {
        let block = request.block;
        let hf = account.hf();

        let key_index = self.keys.select_key(user);
        let nonce = self.keys.acquire_nonce(key_index, &self.endpoints).await?;

        // Patch the cached calldata skeleton with the real borrower and
        // repay amount.
        let template = self
            .templates
            .get_template(plan.debt_asset, plan.collateral_asset, block);
        let repay_word = match self.config.execution.close_factor_mode {
            CloseFactorMode::Half => plan.repay_amount,
            CloseFactorMode::Full => U256::MAX,
        };
        let calldata = patch_user_and_repay(&template, user, repay_word);

        let mut tx_request = TransactionRequest::default()
            .with_to(self.endpoints.pool_address())
            .with_input(calldata)
            .with_value(U256::ZERO)
            .with_nonce(nonce)
            .with_gas_limit(self.config.execution.gas_limit)
            .with_chain_id(self.chain_id.load(Ordering::Relaxed));
        gas.apply(&mut tx_request);

        let raw = match self.keys.sign(key_index, tx_request.clone()).await {
            Ok(raw) => raw,
            Err(e) => {
                self.keys.complete(key_index).await;
                return Err(e);
            }
        };
        self.set_phase(user, AttemptPhase::Signed);

        let submitted = match self.private_tx.submit(&raw).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let error_text = e.to_string();
                self.keys
                    .handle_broadcast_error(key_index, &error_text, &self.endpoints)
                    .await;
                self.keys.complete(key_index).await;

                // Endpoints that simulate before accepting return the
                // revert payload in the error body; classify it and back
                // off the position when the pool says it is not
                // liquidatable.
                if let Some(revert_hex) = extract_revert_hex(&error_text) {
                    let revert = self.reverts.classify_hex(revert_hex);
                    warn!(
                        user = %user,
                        code = revert.short_code,
                        category = revert.category.as_str(),
                        "Submission rejected with revert data"
                    );
                    metrics::increment_counter!(
                        "submit_reverts_total",
                        "code" => revert.short_code
                    );
                    if !revert.retryable {
                        self.quarantine
                            .insert(user, self.endpoints.last_head() + 25);
                        self.hot_set.remove(&user);
                    }
                }

                self.record_skip(
                    user,
                    block,
                    hf,
                    prev_hf,
                    SkipReason::CallstaticFailed,
                    Some(account.debt_usd()),
                    Some(est_profit_usd),
                );
                return Ok(None);
            }
        };
        self.set_phase(user, AttemptPhase::Submitted);
        self.attempted.mark(user, block);

        let gas_price_gwei = gas.bid_gwei();
        info!(
            user = %user,
            tx_hash = %submitted.tx_hash,
            path = submitted.path.as_str(),
            fallback_used = submitted.fallback_used,
            key = key_index,
            nonce = nonce,
            gas_price_gwei = gas_price_gwei,
            est_profit_usd = est_profit_usd,
            "Liquidation submitted"
        );
        metrics::increment_counter!("attempts_total", "path" => submitted.path.as_str());

        self.traces.record(DecisionTrace::attempt(
            user,
            now_ms(),
            block,
            self.endpoints.last_head().saturating_sub(block),
            hf,
            prev_hf,
            self.thresholds(),
            account.debt_usd(),
            est_profit_usd,
            AttemptMeta {
                tx_hash: submitted.tx_hash,
                key_index,
                gas_price_gwei,
            },
        ));

        // Hand the transaction to the bump ladder; the caller spawns the
        // receipt watcher.
        let _ladder = self.burst.clone().track_transaction(TrackedAttemptTx {
            user,
            tx_hash: submitted.tx_hash,
            nonce,
            key_index,
            base_tx: tx_request,
            gas,
        });

        Ok(Some(SubmittedAttempt {
            tx_hash: submitted.tx_hash,
            key_index,
            est_profit_usd,
        }))
    }

    /// Poll for the receipt until mined or abandoned, then settle.
    async fn watch_receipt(
        self: Arc<Self>,
        user: Address,
        tx_hash: alloy::primitives::B256,
        key_index: usize,
        est_profit_usd: f64,
    ) {
        let deadline = Instant::now() + Duration::from_secs(45);
        let mut phase = AttemptPhase::Submitted;

        while Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(800)).await;
            match self.endpoints.transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => {
                    if receipt.status() {
                        phase = AttemptPhase::Mined;
                        info!(user = %user, tx_hash = %tx_hash, "Liquidation mined");
                        metrics::increment_counter!("attempts_mined_total");
                        self.pnl
                            .record(usd_to_base(est_profit_usd).to::<u128>() as i128, now_ms());
                        self.candidates.remove(&user);
                        self.hot_set.remove(&user);
                        self.presim.invalidate_user(&user);
                    } else {
                        phase = AttemptPhase::Reverted;
                        warn!(user = %user, tx_hash = %tx_hash, "Liquidation reverted");
                        metrics::increment_counter!("attempts_reverted_total");
                        // Gas burned; charge it against the daily window
                        // and keep hands off the position for a while.
                        self.pnl.record(
                            -(usd_to_base(self.config.execution.gas_cost_usd).to::<u128>() as i128),
                            now_ms(),
                        );
                        let head = self.endpoints.last_head();
                        self.quarantine.insert(user, head + 25);
                    }
                    break;
                }
                Ok(None) => continue,
                Err(e) => {
                    debug!(user = %user, error = %e, "Receipt poll failed");
                }
            }
        }

        if !phase.is_terminal() {
            phase = AttemptPhase::Abandoned;
            warn!(user = %user, tx_hash = %tx_hash, "Attempt abandoned without receipt");
            metrics::increment_counter!("attempts_abandoned_total");
        }

        // Terminal: cancel pending bumps, settle the nonce, free the lock.
        self.burst.untrack(&tx_hash);
        self.keys.complete(key_index).await;
        if phase != AttemptPhase::Mined {
            if let Err(e) = self.keys.resync(key_index, &self.endpoints).await {
                debug!(error = %e, "Post-attempt nonce resync failed");
            }
        }
        self.set_phase(user, phase);
        self.inflight.release(user).await;
        self.clear_phase(user);
    }

    /// Plan lookup with fallthrough to fresh computation.
    async fn lookup_or_plan(
        &self,
        user: Address,
        block: u64,
    ) -> std::result::Result<LiquidationPlan, PlanFailure> {
        // Any unexpired plan for this user at a recent block tag works;
        // probe the current block first.
        let assets = self.tokens.addresses();
        for debt in &assets {
            for collateral in &assets {
                if debt == collateral {
                    continue;
                }
                if let Some(plan) = self.presim.get(user, *debt, *collateral, block, block) {
                    return Ok(plan);
                }
            }
        }
        let plan = self.compute_plan(user, block).await?;
        self.presim.set(plan.clone());
        Ok(plan)
    }

    /// Choose debt and collateral reserves, size the repay, and sanity
    /// check the swap route.
    async fn compute_plan(
        &self,
        user: Address,
        block: u64,
    ) -> std::result::Result<LiquidationPlan, PlanFailure> {
        let assets = self.tokens.addresses();
        let position = self
            .hf_engine
            .read_user_reserves(user, &assets, Some(block))
            .await
            .map_err(PlanFailure::Error)?;

        // Largest debt and largest enabled collateral by USD value.
        let mut best_debt: Option<(Address, U256, U256)> = None; // (asset, amount, usd)
        for debt in &position.debts {
            let Some(usd) = self.reserve_usd(&debt.asset, debt.amount) else {
                continue;
            };
            if best_debt.as_ref().map(|(_, _, b)| usd > *b).unwrap_or(true) {
                best_debt = Some((debt.asset, debt.amount, usd));
            }
        }
        let mut best_collateral: Option<(Address, U256, U256)> = None;
        for collateral in position.collaterals.iter().filter(|c| c.usage_as_collateral) {
            let Some(usd) = self.reserve_usd(&collateral.asset, collateral.amount) else {
                continue;
            };
            if best_collateral
                .as_ref()
                .map(|(_, _, b)| usd > *b)
                .unwrap_or(true)
            {
                best_collateral = Some((collateral.asset, collateral.amount, usd));
            }
        }

        let Some((debt_asset, debt_amount, debt_usd)) = best_debt else {
            return Err(PlanFailure::Skip(SkipReason::DustPosition));
        };
        let Some((collateral_asset, _collateral_amount, _collateral_usd)) = best_collateral else {
            return Err(PlanFailure::Skip(SkipReason::DustPosition));
        };

        // Repay per the close-factor mode; Full still sizes the plan by
        // the whole reserve and submits max debtToCover at encode time.
        let repay_amount = match self.config.execution.close_factor_mode {
            CloseFactorMode::Half => debt_amount / U256::from(2u64),
            CloseFactorMode::Full => debt_amount,
        };
        let repay_usd = match self.config.execution.close_factor_mode {
            CloseFactorMode::Half => debt_usd / U256::from(2u64),
            CloseFactorMode::Full => debt_usd,
        };

        // Expected collateral at current prices including the bonus.
        let bonus_bps = self.tokens.liquidation_bonus_bps(&collateral_asset);
        let expected_usd = repay_usd * U256::from(10_000u64 + bonus_bps as u64) / U256::from(10_000u64);
        let collateral_price = self.price_of(&collateral_asset).ok_or(PlanFailure::Skip(
            SkipReason::PriceMissing,
        ))?;
        let expected_collateral = amount_from_usd_base(
            expected_usd,
            self.tokens.decimals(&collateral_asset),
            collateral_price.0,
            collateral_price.1,
        );

        // Swap sanity: selling the seized collateral must cover the repay
        // within the slippage tolerance.
        let quote = self
            .quoter
            .quote(collateral_asset, debt_asset, expected_collateral)
            .await
            .map_err(|_| PlanFailure::Skip(SkipReason::CallstaticFailed))?;
        let slippage_bps = (self.config.execution.max_slippage_pct * 100.0) as u16;
        if quote.amount_out < apply_bps_down(repay_amount, slippage_bps) {
            return Err(PlanFailure::Skip(SkipReason::SlippageExceeded));
        }

        let bonus_estimate = self.profit.estimate(
            repay_usd,
            bonus_bps,
            usd_to_base(self.config.execution.gas_cost_usd),
        );

        let mut snapshot: SmallVec<[(Address, U256); 4]> = SmallVec::new();
        if let Some((price, _)) = self.price_of(&collateral_asset) {
            snapshot.push((collateral_asset, price));
        }
        if let Some((price, _)) = self.price_of(&debt_asset) {
            snapshot.push((debt_asset, price));
        }

        Ok(LiquidationPlan {
            user,
            debt_asset,
            collateral_asset,
            block_tag: block,
            repay_amount,
            expected_collateral,
            estimated_profit_usd: bonus_estimate.net_usd(),
            created_at_ms: now_ms(),
            price_snapshot: snapshot,
        })
    }

    /// Classify a competitor liquidation and fold the result back into
    /// the watch set.
    pub fn on_competitor_liquidation(&self, event: CompetitorLiquidation) {
        let classified = self.miss_classifier.classify(&event, &self.traces);
        info!(
            user = %event.user,
            liquidator = %event.liquidator,
            block = event.block,
            reason = classified.reason.as_str(),
            notes = %classified.notes,
            "Competitor liquidation classified"
        );

        // Their call changed the position; our view of it is stale.
        self.presim.invalidate_user(&event.user);
        self.hf_engine.invalidate_user(&event.user);
        self.hot_set.remove(&event.user);
        self.candidates.touch(&event.user, now_ms());
    }

    /// Fold a fresh account read into candidates and the hot/warm sets.
    fn absorb_account(
        &self,
        user: Address,
        hf: f64,
        account: &sentinel_chain::AccountData,
        block: u64,
        trigger: TriggerKind,
    ) {
        let now = now_ms();
        self.candidates.update_hf(&user, hf, now);

        let tier = self.hot_set.update(HotSetEntry {
            address: user,
            hf,
            last_updated_ts_ms: now,
            last_block: block,
            total_collateral_usd: account.collateral_usd(),
            total_debt_usd: account.debt_usd(),
            trigger_kind: trigger,
        });
        if tier != Tier::Cold {
            self.miss_classifier.note_tracked(user);
        }

        // Stablecoin-only accounts get the longer HF cache TTL.
        if hf.is_finite() {
            let stable = self
                .reserve_users
                .iter()
                .filter(|entry| entry.value().contains(&user))
                .all(|entry| self.tokens.is_stablecoin(entry.key()));
            self.hf_engine.mark_stable(user, stable);
        }
    }

    fn record_skip(
        &self,
        user: Address,
        block: u64,
        hf: f64,
        prev_hf: Option<f64>,
        reason: SkipReason,
        est_debt_usd: Option<f64>,
        est_profit_usd: Option<f64>,
    ) {
        self.attempted.mark(user, block);
        self.traces.record(DecisionTrace::skip(
            user,
            now_ms(),
            block,
            self.endpoints.last_head().saturating_sub(block),
            hf,
            prev_hf,
            self.thresholds(),
            reason,
            est_debt_usd,
            est_profit_usd,
        ));
    }

    fn thresholds(&self) -> TraceThresholds {
        TraceThresholds {
            min_debt_usd: self.config.execution.min_debt_usd,
            min_profit_usd: self.config.execution.min_profit_usd,
            max_slippage_pct: self.config.execution.max_slippage_pct,
        }
    }

    /// Compare refreshed hot prices against the previous refresh and
    /// report drops in bps.
    fn detect_price_drops(&self) -> Vec<(String, u64)> {
        let mut drops = Vec::new();
        for symbol in self.tokens.symbols() {
            let Ok(point) = self.oracle.get_price(symbol) else {
                continue;
            };
            let previous = self
                .last_price_answer
                .insert(symbol.to_string(), point.answer);
            if let Some(previous) = previous {
                if point.answer < previous {
                    let drop = sentinel_chain::delta_bps(previous, point.answer);
                    if drop > 0 && drop != u64::MAX {
                        drops.push((symbol.to_string(), drop));
                    }
                }
            }
        }
        drops
    }

    fn reserve_usd(&self, asset: &Address, amount: U256) -> Option<U256> {
        let (price, decimals) = self.price_of(asset)?;
        Some(self.tokens.usd_base(asset, amount, price, decimals))
    }

    fn price_of(&self, asset: &Address) -> Option<(U256, u8)> {
        let symbol = self.tokens.symbol(asset)?;
        let point = self.oracle.get_price(symbol).ok()?;
        Some((point.answer, point.decimals))
    }

    async fn enqueue(
        &self,
        tx: &mpsc::Sender<DecisionRequest>,
        request: DecisionRequest,
        critical: bool,
    ) {
        let depth = self.config.pipeline.queue_capacity - tx.capacity();
        if !critical && depth >= self.config.pipeline.queue_high {
            metrics::increment_counter!("decision_queue_shed_total");
            debug!(depth = depth, "Queue above high-water mark, shedding request");
            return;
        }
        if tx.send(request).await.is_err() {
            warn!("Decision queue closed");
        }
    }

    fn set_phase(&self, user: Address, next: AttemptPhase) {
        match self.attempt_phase.get(&user).map(|p| *p) {
            Some(current) if !current.can_advance_to(next) && current != next => {
                debug!(user = %user, from = ?current, to = ?next, "Out-of-order phase transition");
            }
            _ => {}
        }
        self.attempt_phase.insert(user, next);
    }

    fn clear_phase(&self, user: Address) {
        self.attempt_phase.remove(&user);
    }

    pub fn phase_of(&self, user: &Address) -> Option<AttemptPhase> {
        self.attempt_phase.get(user).map(|p| *p)
    }

    /// Status snapshot for the external status surface.
    pub fn status_snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs(),
            subscription_healthy: self.endpoints.silence_ms() < 30_000,
            ws_silence_ms: self.endpoints.silence_ms(),
            hot_count: self.hot_set.hot_len(),
            warm_count: self.hot_set.warm_len(),
            candidate_count: self.candidates.len(),
            min_hf: self.hot_set.min_hf(),
            last_block: self.endpoints.last_head(),
            head_lag_blocks: 0,
        }
    }

    /// Write an atomic hot-set dump.
    pub fn dump_hot_set(&self, path: &std::path::Path) -> Result<()> {
        let entries = self
            .hot_set
            .get_hot_set()
            .into_iter()
            .map(|entry| {
                let last_skip = self
                    .traces
                    .latest(&entry.address, now_ms())
                    .and_then(|t| t.skip_reason);
                let reserves = Some(DumpReserves {
                    collaterals: vec![DumpCollateral {
                        value_usd: entry.total_collateral_usd,
                        liquidation_threshold_bps: wad_lt_bps(entry.hf, &entry),
                    }],
                    debts: vec![DumpDebt {
                        value_usd: entry.total_debt_usd,
                    }],
                });
                (entry, reserves, last_skip)
            })
            .collect();
        let dump = HotSetDump::from_entries("hot", self.hot_set.hot_threshold(), entries);
        dump.write_atomic(path)
    }

    async fn maintenance_tick(&self, tx: &mpsc::Sender<DecisionRequest>) {
        let head = self.endpoints.last_head();
        self.presim.prune_expired(head);
        self.traces.prune(now_ms());
        self.hf_engine.invalidate_before(head.saturating_sub(10));

        let healthy = self.endpoints.health_check(30_000).await;
        self.fallback.set_provider_health(healthy);
        if !healthy {
            metrics::increment_counter!("provider_unhealthy_total");
            // Broadened scope kicks in on the next head; also nudge the
            // most at-risk entries through right away.
            for entry in self.hot_set.get_top_k(8) {
                self.enqueue(
                    tx,
                    DecisionRequest {
                        user: entry.address,
                        trigger: TriggerKind::Head,
                        block: head,
                    },
                    true,
                )
                .await;
            }
        }
    }

}

/// Submission details handed from the execution path to the receipt
/// watcher.
struct SubmittedAttempt {
    tx_hash: alloy::primitives::B256,
    key_index: usize,
    est_profit_usd: f64,
}

/// Planning failure: either a structured skip or a hard error.
enum PlanFailure {
    Skip(SkipReason),
    Error(anyhow::Error),
}

/// Effective liquidation threshold implied by an entry's HF and balances,
/// in bps, for dump re-derivation. Falls back to the HF-implied value.
fn wad_lt_bps(hf: f64, entry: &HotSetEntry) -> u16 {
    if entry.total_collateral_usd <= 0.0 || !hf.is_finite() {
        return 8_000;
    }
    let implied = hf * entry.total_debt_usd / entry.total_collateral_usd * 10_000.0;
    implied.clamp(1.0, 10_000.0) as u16
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Pull the first 0x-prefixed hex blob of at least selector length out of
/// an RPC error body.
fn extract_revert_hex(error_text: &str) -> Option<&str> {
    let start = error_text.find("0x")?;
    let candidate = &error_text[start..];
    let end = candidate[2..]
        .find(|c: char| !c.is_ascii_hexdigit())
        .map(|i| i + 2)
        .unwrap_or(candidate.len());
    let blob = &candidate[..end];
    // Selector is 4 bytes: "0x" plus at least 8 hex chars.
    if blob.len() >= 10 {
        Some(blob)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transitions() {
        use AttemptPhase::*;
        assert!(Eligible.can_advance_to(Planning));
        assert!(Planning.can_advance_to(Signed));
        assert!(Signed.can_advance_to(Submitted));
        assert!(Submitted.can_advance_to(Mined));
        assert!(Submitted.can_advance_to(Reverted));
        assert!(Submitted.can_advance_to(Replaced));
        assert!(Planning.can_advance_to(Abandoned));

        // No going backwards or skipping submission.
        assert!(!Mined.can_advance_to(Planning));
        assert!(!Eligible.can_advance_to(Submitted));
        assert!(!Submitted.can_advance_to(Planning));

        assert!(Mined.is_terminal());
        assert!(Reverted.is_terminal());
        assert!(!Planning.is_terminal());
    }

    #[test]
    fn test_extract_revert_hex() {
        let text = "server returned an error response: execution reverted: 0xb629b0e4, data none";
        assert_eq!(extract_revert_hex(text), Some("0xb629b0e4"));

        // Too short to carry a selector.
        assert_eq!(extract_revert_hex("nonce too low 0xab"), None);
        assert_eq!(extract_revert_hex("plain text error"), None);
    }

    #[test]
    fn test_implied_lt_for_dumps() {
        let entry = HotSetEntry {
            address: Address::repeat_byte(1),
            hf: 1.6,
            last_updated_ts_ms: 0,
            last_block: 0,
            total_collateral_usd: 1_000.0,
            total_debt_usd: 500.0,
            trigger_kind: TriggerKind::Head,
        };
        // HF 1.6 at 1000/500 implies an 80% liquidation threshold.
        assert_eq!(wad_lt_bps(1.6, &entry), 8_000);
    }
}
