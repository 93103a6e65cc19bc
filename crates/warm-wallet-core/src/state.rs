// Orchestrator: owns the wallet, suggester list, sessions, answer cache and
// the supervised per-suggester pipelines.
//
// `WarmWallet` is a cheap `Clone` handle over shared state so spawned
// pipeline tasks can call back into it. No lock is held across an `.await`.

use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use anyhow::Context;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::answers::{Answer, AnswerBatch, AnswerCache};
use crate::config::Config;
use crate::db::{Database, RecordStore};
use crate::especial::WsConnector;
use crate::identity::WalletIdentity;
use crate::registry::{
    read_suggesters, ContractRegistry, RegistryError, Suggester, SuggesterBook, SuggesterRegistry,
};
use crate::session::{Connector, FailedDialPolicy, SessionError, SessionRegistry};
use crate::wallet::WalletManager;

/// Remote operation that returns a suggester's answers.
pub const LOAD_ANSWERS_FUNC: &str = "asker.load.answers";

/// Result of one connect-then-load-answers pipeline.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub address: String,
    /// Number of answers ingested, or why the pipeline stopped.
    pub result: Result<usize, SessionError>,
}

struct Shared {
    wallet: WalletManager,
    registry: Arc<dyn SuggesterRegistry>,
    sessions: SessionRegistry,
    suggesters: RwLock<SuggesterBook>,
    answers: Mutex<AnswerCache>,
    pipelines: Mutex<JoinSet<PipelineOutcome>>,
}

#[derive(Clone)]
pub struct WarmWallet {
    shared: Arc<Shared>,
}

impl WarmWallet {
    pub fn new(
        store: Arc<dyn RecordStore>,
        registry: Arc<dyn SuggesterRegistry>,
        connector: Arc<dyn Connector>,
        policy: FailedDialPolicy,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                wallet: WalletManager::new(store),
                registry,
                sessions: SessionRegistry::new(connector, policy),
                suggesters: RwLock::new(SuggesterBook::default()),
                answers: Mutex::new(AnswerCache::new()),
                pipelines: Mutex::new(JoinSet::new()),
            }),
        }
    }

    /// Open the configured database and wire up the contract registry and
    /// WebSocket connector.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let db = Database::open(&config.database.path).context("failed to open database")?;
        let registry = ContractRegistry::new(
            config.registry.rpc_url.clone(),
            config.registry.contract_address.clone(),
        );
        let connector = WsConnector::new(
            config.session.connect_timeout(),
            config.session.request_timeout(),
        );
        Ok(Self::new(
            Arc::new(db),
            Arc::new(registry),
            Arc::new(connector),
            config.session.failed_dial_policy(),
        ))
    }

    fn answer_cache(&self) -> MutexGuard<'_, AnswerCache> {
        self.shared.answers.lock().expect("answer cache mutex poisoned")
    }

    fn pipelines(&self) -> MutexGuard<'_, JoinSet<PipelineOutcome>> {
        self.shared.pipelines.lock().expect("pipeline set mutex poisoned")
    }

    // -----------------------------------------------------------------------
    // Wallet
    // -----------------------------------------------------------------------

    /// Load the local identity, creating and persisting one on first use.
    pub fn load_wallet(&self) -> anyhow::Result<WalletIdentity> {
        self.shared.wallet.load_wallet()
    }

    pub fn wallet(&self) -> Option<WalletIdentity> {
        self.shared.wallet.current()
    }

    // -----------------------------------------------------------------------
    // Suggesters
    // -----------------------------------------------------------------------

    /// Read the suggester list from the registry, replace the current list,
    /// and spawn one connect-then-load-answers pipeline per suggester.
    ///
    /// Returns as soon as the list is stored; pipelines run on their own and
    /// their failures are only logged. If the registry read fails the
    /// current list is left untouched and nothing is spawned.
    pub async fn load_suggesters(&self) -> Result<Vec<Suggester>, RegistryError> {
        let suggesters = read_suggesters(self.shared.registry.as_ref()).await?;

        *self
            .shared
            .suggesters
            .write()
            .expect("suggester book lock poisoned") = SuggesterBook::new(suggesters.clone());

        let mut pipelines = self.pipelines();
        // Finished pipelines already logged their outcome; only keep the
        // ones still running.
        while let Some(joined) = pipelines.try_join_next() {
            if let Err(e) = joined {
                warn!(error = %e, "suggester pipeline task did not complete");
            }
        }
        for suggester in &suggesters {
            let this = self.clone();
            let address = suggester.address.clone();
            pipelines.spawn(async move { this.run_pipeline(address).await });
        }
        debug!(count = suggesters.len(), "spawned suggester pipelines");

        Ok(suggesters)
    }

    async fn run_pipeline(&self, address: String) -> PipelineOutcome {
        let result = match self.connect_to_suggester(&address).await {
            Ok(()) => self.load_suggester_answers(&address).await,
            Err(e) => Err(e),
        };
        match &result {
            Ok(count) => info!(%address, count, "loaded suggester answers"),
            Err(e) => warn!(%address, error = %e, "suggester pipeline failed"),
        }
        PipelineOutcome { address, result }
    }

    /// Look a suggester up by raw address; the address is canonicalized first.
    pub fn suggester_for_address(&self, raw_address: &str) -> Option<Suggester> {
        self.shared
            .suggesters
            .read()
            .expect("suggester book lock poisoned")
            .get(raw_address)
            .cloned()
    }

    pub fn suggesters(&self) -> Vec<Suggester> {
        self.shared
            .suggesters
            .read()
            .expect("suggester book lock poisoned")
            .list()
            .to_vec()
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// Make sure a session exists for the suggester's endpoint. Connection
    /// failures are logged, not returned; only an unknown address is an
    /// error.
    pub async fn connect_to_suggester(&self, raw_address: &str) -> Result<(), SessionError> {
        let suggester = self
            .suggester_for_address(raw_address)
            .ok_or_else(|| SessionError::UnknownSuggester(raw_address.to_string()))?;
        self.shared.sessions.connect(&suggester.url).await;
        Ok(())
    }

    /// Registered session urls and whether each is live.
    pub fn session_statuses(&self) -> Vec<(String, bool)> {
        self.shared.sessions.statuses()
    }

    // -----------------------------------------------------------------------
    // Answers
    // -----------------------------------------------------------------------

    /// Fetch the suggester's answers over its session and merge them into
    /// the cache. Fails with `NotConnected`, without sending anything, when
    /// there is no live session.
    pub async fn load_suggester_answers(&self, raw_address: &str) -> Result<usize, SessionError> {
        let suggester = self
            .suggester_for_address(raw_address)
            .ok_or_else(|| SessionError::UnknownSuggester(raw_address.to_string()))?;

        let transport = match self.shared.sessions.get(&suggester.url) {
            Some(t) if t.is_connected() => t,
            _ => return Err(SessionError::NotConnected(raw_address.to_string())),
        };

        let data = transport.send(LOAD_ANSWERS_FUNC, None).await?;
        let batch: AnswerBatch = serde_json::from_value(data)?;
        let answers = batch.into_vec();
        let count = answers.len();
        self.ingest_answers(answers);
        Ok(count)
    }

    /// Merge a batch into the cache: incoming answers first, then every
    /// prior answer whose id the batch does not carry.
    pub fn ingest_answers(&self, batch: impl Into<AnswerBatch>) {
        self.answer_cache().ingest(batch);
    }

    pub fn answers(&self) -> Vec<Answer> {
        self.answer_cache().answers().to_vec()
    }

    pub fn answer(&self, id: &str) -> Option<Answer> {
        self.answer_cache().get(id).cloned()
    }

    // -----------------------------------------------------------------------
    // Channels
    // -----------------------------------------------------------------------

    /// Channel creation is not supported yet; this is a no-op.
    pub async fn create_channel(&self) {
        debug!("create_channel called; channels are not created by this client");
    }

    // -----------------------------------------------------------------------
    // Supervision
    // -----------------------------------------------------------------------

    /// Wait for every pipeline spawned so far and return their outcomes.
    /// Pipelines that panicked or were aborted are logged and skipped.
    pub async fn join_pipelines(&self) -> Vec<PipelineOutcome> {
        let mut set = std::mem::take(&mut *self.pipelines());
        let mut outcomes = Vec::with_capacity(set.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!(error = %e, "suggester pipeline task did not complete"),
            }
        }
        outcomes
    }

    /// Like [`join_pipelines`](Self::join_pipelines), but stops waiting at
    /// `deadline`. Returns the outcomes collected so far and how many
    /// pipelines were still running; those stay supervised, so `shutdown`
    /// can abort them.
    pub async fn join_pipelines_until(&self, deadline: Instant) -> (Vec<PipelineOutcome>, usize) {
        let mut set = std::mem::take(&mut *self.pipelines());
        let mut outcomes = Vec::with_capacity(set.len());
        loop {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(Ok(outcome))) => outcomes.push(outcome),
                Ok(Some(Err(e))) => warn!(error = %e, "suggester pipeline task did not complete"),
                Ok(None) | Err(_) => break,
            }
        }

        let running = set.len();
        if running > 0 {
            let mut pipelines = self.pipelines();
            if pipelines.is_empty() {
                *pipelines = set;
            } else {
                // Pipelines spawned while we waited already own the slot.
                warn!(count = running, "detaching suggester pipelines past their deadline");
                set.detach_all();
            }
        }
        (outcomes, running)
    }

    /// Number of spawned pipelines that have not been joined yet.
    pub fn pending_pipelines(&self) -> usize {
        self.pipelines().len()
    }

    /// Abort every pipeline that is still running.
    pub fn shutdown(&self) {
        let mut pipelines = self.pipelines();
        if !pipelines.is_empty() {
            info!(count = pipelines.len(), "aborting unfinished suggester pipelines");
        }
        pipelines.abort_all();
    }
}
