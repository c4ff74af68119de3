use std::sync::Arc;

use sqlx::PgPool;

use crate::billing::{
    AutoTopUpService, BillingJobs, BillingStore, CreditMeter, FeatureManager, HttpPaymentGateway,
    MemoryBillingStore, PaymentGateway, PricingOracle, UnconfiguredPaymentGateway, UsageWatchdog,
    WalletLedger,
};
use crate::config;
use crate::db::{PgBillingStore, PgModerationStore};
use crate::moderation::{
    ContentRegistry, MemoryModerationStore, ModerationAssignmentService, ModerationQueueService,
    ModerationStore, ModerationWorkflowService,
};
use crate::notifications::{self, NotificationSink};
use crate::organizations::{OrganizationDirectory, PgOrganizationDirectory, StaticOrganizationDirectory};

/// External systems the core talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub gateway: Arc<dyn PaymentGateway>,
    pub notifier: Arc<dyn NotificationSink>,
    pub directory: Arc<dyn OrganizationDirectory>,
    pub content: ContentRegistry,
}

impl Collaborators {
    /// Adapters selected from the environment around the given directory.
    pub fn from_config(directory: Arc<dyn OrganizationDirectory>) -> Self {
        let gateway: Arc<dyn PaymentGateway> = match config::PAYMENT_GATEWAY_URL.as_deref() {
            Some(url) => Arc::new(HttpPaymentGateway::new(
                url,
                config::PAYMENT_GATEWAY_TOKEN.clone(),
            )),
            None => Arc::new(UnconfiguredPaymentGateway),
        };
        Self {
            gateway,
            notifier: notifications::from_config(),
            directory,
            content: ContentRegistry::new(),
        }
    }
}

// key: platform -> service graph shared by handlers and schedulers
#[derive(Clone)]
pub struct Platform {
    pub meter: CreditMeter,
    pub top_up: AutoTopUpService,
    pub watchdog: UsageWatchdog,
    pub moderation: ModerationQueueService,
}

impl Platform {
    pub fn assemble(
        billing: Arc<dyn BillingStore>,
        moderation: Arc<dyn ModerationStore>,
        collaborators: Collaborators,
    ) -> Self {
        let ledger = WalletLedger::new(billing.clone());
        let features = FeatureManager::new(ledger.clone());
        let meter = CreditMeter::new(ledger.clone(), PricingOracle::new(billing.clone()), features);
        let top_up = AutoTopUpService::new(
            ledger,
            collaborators.gateway.clone(),
            collaborators.notifier.clone(),
            collaborators.directory.clone(),
        );
        let watchdog = UsageWatchdog::new(
            billing,
            collaborators.notifier.clone(),
            collaborators.directory.clone(),
        );

        let assignments = ModerationAssignmentService::new(
            moderation.clone(),
            collaborators.notifier.clone(),
            collaborators.directory.clone(),
        );
        let workflows = ModerationWorkflowService::new(
            moderation.clone(),
            assignments.clone(),
            collaborators.notifier.clone(),
            collaborators.content,
        );
        let moderation =
            ModerationQueueService::new(moderation, assignments, workflows, collaborators.notifier);

        Self {
            meter,
            top_up,
            watchdog,
            moderation,
        }
    }

    pub fn postgres(pool: PgPool) -> Self {
        let directory = Arc::new(PgOrganizationDirectory::new(pool.clone()));
        Self::assemble(
            Arc::new(PgBillingStore::new(pool.clone())),
            Arc::new(PgModerationStore::new(pool)),
            Collaborators::from_config(directory),
        )
    }

    pub fn in_memory(collaborators: Collaborators) -> Self {
        Self::assemble(
            Arc::new(MemoryBillingStore::new()),
            Arc::new(MemoryModerationStore::new()),
            collaborators,
        )
    }

    /// In-memory stores with an empty directory, for local runs without Postgres.
    pub fn local() -> Self {
        Self::in_memory(Collaborators::from_config(Arc::new(
            StaticOrganizationDirectory::new(),
        )))
    }

    pub fn billing_jobs(&self) -> BillingJobs {
        BillingJobs {
            top_up: self.top_up.clone(),
            features: self.meter.features().clone(),
            watchdog: self.watchdog.clone(),
            timezone: *config::REPORTING_TIMEZONE,
        }
    }
}
