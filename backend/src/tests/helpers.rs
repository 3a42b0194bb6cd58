// Common test utilities and shared test setup
use std::sync::Arc;
use std::time::Duration;

use dealflow_shared::{ChangeDelta, EntityType, RuleProcessingSummary};

use super::fixtures::{DealFixture, WorkflowFixture};
use crate::outcomes::WfmOutcomeExecutor;
use crate::rules::{EngineConfig, RuleEngine};
use crate::store::{InMemoryStore, Stores};

pub struct TestContext {
    pub store: Arc<InMemoryStore>,
    pub stores: Stores,
    pub engine: Arc<RuleEngine>,
    pub executor: WfmOutcomeExecutor,
    pub workflow: WorkflowFixture,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_config(EngineConfig::default()).await
    }

    pub async fn with_timeout(timeout: Duration) -> Self {
        Self::with_config(EngineConfig {
            rule_timeout: timeout,
            ..EngineConfig::default()
        })
        .await
    }

    pub async fn with_config(config: EngineConfig) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let stores = Stores::from_backend(store.clone());
        let engine = Arc::new(RuleEngine::new(stores.clone(), config));
        let executor = WfmOutcomeExecutor::new(stores.clone()).with_rule_engine(engine.clone());

        let workflow = WorkflowFixture::default();
        for step in workflow.steps() {
            store.seed_step(step).await;
        }

        Self {
            store,
            stores,
            engine,
            executor,
            workflow,
        }
    }

    pub fn deal(&self) -> DealFixture {
        DealFixture::new(&self.workflow)
    }

    pub async fn seed_deal(&self, deal: &DealFixture) {
        self.store.seed_entity(EntityType::Deal, deal.snapshot()).await;
    }

    /// Fire `DEAL_UPDATED` for the deal with the given delta.
    pub async fn deal_updated(&self, deal: &DealFixture, delta: ChangeDelta) -> RuleProcessingSummary {
        self.engine
            .process_business_rules(EntityType::Deal, &deal.id, "DEAL_UPDATED", deal.snapshot(), delta)
            .await
    }
}
