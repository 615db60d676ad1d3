use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;

use crate::config::SchedulerConfig;
use crate::database::SchedulerDatabase;
use crate::generation::{LlmResponseGenerator, ResponseGenerator};
use crate::models::EntryCreatedEvent;
use crate::orchestrator::ResponseOrchestrator;
use crate::scheduler::CycleRunner;
use crate::webhook::WebhookGateway;

/// Everything the process needs wired together: store, orchestrator, cycle
/// runner and webhook gateway, plus the ingress channel the server feeds.
pub struct SchedulerRuntime {
    pub config: SchedulerConfig,
    pub db: Arc<SchedulerDatabase>,
    pub cycles: Arc<CycleRunner>,
    pub gateway: Arc<WebhookGateway>,
    pub entry_tx: flume::Sender<EntryCreatedEvent>,
    entry_rx: flume::Receiver<EntryCreatedEvent>,
}

pub struct SchedulerRuntimeBuilder {
    config: SchedulerConfig,
    generator: Option<Arc<dyn ResponseGenerator>>,
}

impl SchedulerRuntimeBuilder {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            generator: None,
        }
    }

    /// Override the collaborator client, mainly for tests and dry runs.
    pub fn with_generator(mut self, generator: Arc<dyn ResponseGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn build(self) -> Result<SchedulerRuntime> {
        let config = self.config;
        let db = Arc::new(
            SchedulerDatabase::new(&config.database_path)
                .with_context(|| format!("Failed to open database at {}", config.database_path))?,
        );

        let generator = self.generator.unwrap_or_else(|| {
            Arc::new(LlmResponseGenerator::new(
                config.llm_api_url.clone(),
                config.llm_api_key.clone(),
                config.llm_model.clone(),
                Duration::from_secs(config.generation_timeout_secs),
            ))
        });

        let orchestrator = Arc::new(ResponseOrchestrator::new(
            db.clone(),
            generator,
            config.clone(),
        ));
        let cycles = Arc::new(CycleRunner::new(orchestrator, config.clone()));
        let gateway = Arc::new(WebhookGateway::new(db.clone(), config.clone()));
        let (entry_tx, entry_rx) = flume::unbounded();

        Ok(SchedulerRuntime {
            config,
            db,
            cycles,
            gateway,
            entry_tx,
            entry_rx,
        })
    }
}

impl SchedulerRuntime {
    pub fn bootstrap(config: SchedulerConfig) -> Result<Self> {
        SchedulerRuntimeBuilder::new(config).build()
    }

    /// Start the cycle loop and the webhook drain. Both run until the
    /// process exits; dropping the handles does not stop them.
    pub fn spawn_background_tasks(&self) -> (JoinHandle<()>, JoinHandle<()>) {
        let cycles = self.cycles.clone();
        let cycle_task = tokio::spawn(async move {
            cycles.run_loop().await;
        });

        let gateway = self.gateway.clone();
        let entry_rx = self.entry_rx.clone();
        let gateway_task = tokio::spawn(async move {
            gateway.run(entry_rx).await;
        });

        (cycle_task, gateway_task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::temp_db_path;
    use crate::generation::{GeneratedResponse, GenerationError};
    use crate::models::{HistoryItem, Persona};
    use async_trait::async_trait;

    struct NoopGenerator;

    #[async_trait]
    impl ResponseGenerator for NoopGenerator {
        async fn generate(
            &self,
            _entry_text: &str,
            _persona: Persona,
            _history: &[HistoryItem],
        ) -> Result<GeneratedResponse, GenerationError> {
            Err(GenerationError::Upstream("noop".to_string()))
        }
    }

    #[tokio::test]
    async fn bootstrap_wires_the_gateway_to_the_store() {
        let mut config = SchedulerConfig::default();
        config.database_path = temp_db_path("runtime")
            .to_string_lossy()
            .into_owned();
        let runtime = SchedulerRuntimeBuilder::new(config)
            .with_generator(Arc::new(NoopGenerator))
            .build()
            .expect("bootstrap");

        let event = EntryCreatedEvent {
            entry_id: "e1".to_string(),
            user_id: "u1".to_string(),
            content_length: 200,
            created_at: chrono::Utc::now(),
        };
        runtime
            .gateway
            .on_entry_created(&event, chrono::Utc::now())
            .expect("gateway accepts events");
        assert!(!runtime.cycles.is_paused());
    }
}
