//! Dispatch Pipeline
//!
//! ticket → customer → ranked shortlist → selection → assignment. Each stage
//! consumes the previous stage's struct and returns an extended one.

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use crate::arbiter::SelectionArbiter;
use crate::config::DispatchConfig;
use crate::coordinator::AssignmentCoordinator;
use crate::distance::DistanceResolver;
use crate::error::{DispatchError, DispatchResult};
use crate::models::{
    ArbitratedTicket, CustomerId, DispatchOutcome, LoadedTicket, RankedTicket, ReleaseResult,
    TechnicianId, Ticket,
};
use crate::ranker::CandidateRanker;
use crate::store::{DispatchStore, SqliteDispatchStore};

pub struct Dispatcher {
    store: Arc<dyn DispatchStore>,
    ranker: CandidateRanker,
    arbiter: SelectionArbiter,
    coordinator: AssignmentCoordinator,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn DispatchStore>, ranker: CandidateRanker, arbiter: SelectionArbiter) -> Self {
        let coordinator = AssignmentCoordinator::new(store.clone());
        Self {
            store,
            ranker,
            arbiter,
            coordinator,
        }
    }

    /// Opens the SQLite store and wires the production providers.
    pub async fn from_config(config: &DispatchConfig) -> Result<Self> {
        let store = Arc::new(SqliteDispatchStore::new(&config.db_path).await?);
        let resolver = DistanceResolver::from_config(config)?;
        let ranker = CandidateRanker::from_config(resolver, config);
        let arbiter = SelectionArbiter::from_config(config)?;
        Ok(Self::new(store, ranker, arbiter))
    }

    pub async fn load(&self, ticket: Ticket) -> DispatchResult<LoadedTicket> {
        let customer = self
            .store
            .find_customer(ticket.customer_id)
            .await?
            .ok_or(DispatchError::CustomerNotFound(ticket.customer_id))?;
        Ok(LoadedTicket { ticket, customer })
    }

    pub async fn rank(&self, loaded: LoadedTicket) -> DispatchResult<RankedTicket> {
        let candidates = self.store.free_technicians().await?;
        if candidates.is_empty() {
            return Err(DispatchError::NoCandidatesAvailable);
        }

        let shortlist = self.ranker.rank(&loaded.customer, candidates).await?;
        Ok(RankedTicket { loaded, shortlist })
    }

    pub async fn arbitrate(&self, ranked: RankedTicket) -> ArbitratedTicket {
        let selection = self.arbiter.choose(&ranked.shortlist).await;
        ArbitratedTicket { ranked, selection }
    }

    pub async fn commit(&self, arbitrated: ArbitratedTicket) -> DispatchResult<DispatchOutcome> {
        let chosen = arbitrated.chosen();
        let assignment = self
            .coordinator
            .assign(
                &arbitrated.ranked.loaded.customer,
                &chosen.technician,
                chosen.distance_km,
                chosen.provider,
                arbitrated.selection.justification.clone(),
            )
            .await?;
        Ok(DispatchOutcome { arbitrated, assignment })
    }

    /// Ranks and arbitrates without writing anything.
    pub async fn recommend(&self, customer_id: CustomerId) -> DispatchResult<ArbitratedTicket> {
        let loaded = self.load(Ticket { customer_id }).await?;
        let ranked = self.rank(loaded).await?;
        Ok(self.arbitrate(ranked).await)
    }

    #[tracing::instrument(skip(self))]
    pub async fn dispatch(&self, customer_id: CustomerId) -> DispatchResult<DispatchOutcome> {
        let arbitrated = self.recommend(customer_id).await?;
        let outcome = self.commit(arbitrated).await?;
        info!(
            technician_id = outcome.assignment.technician_id,
            fallback = outcome.arbitrated.selection.is_fallback(),
            "Dispatch complete"
        );
        Ok(outcome)
    }

    pub async fn release(&self, technician_id: TechnicianId) -> DispatchResult<ReleaseResult> {
        self.coordinator.release(technician_id).await
    }
}
