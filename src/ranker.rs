//! Candidate Ranker
//!
//! Resolves every technician's distance to the customer concurrently and keeps
//! the nearest few. Technicians that cannot be measured are recorded as
//! skipped, not dropped silently.

use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::config::DispatchConfig;
use crate::distance::DistanceResolver;
use crate::error::{DispatchError, DispatchResult};
use crate::models::{
    Customer, DistanceResult, ProviderTag, RankedShortlist, ShortlistEntry, SkipReason,
    SkippedCandidate, Technician,
};

pub const DEFAULT_SHORTLIST_SIZE: usize = 3;
pub const DEFAULT_CONCURRENCY: usize = 8;

#[derive(Clone)]
pub struct CandidateRanker {
    resolver: DistanceResolver,
    shortlist_size: usize,
    concurrency: usize,
}

impl CandidateRanker {
    pub fn new(resolver: DistanceResolver) -> Self {
        Self {
            resolver,
            shortlist_size: DEFAULT_SHORTLIST_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn from_config(resolver: DistanceResolver, config: &DispatchConfig) -> Self {
        Self::new(resolver)
            .with_shortlist_size(config.shortlist_size)
            .with_concurrency(config.resolver_concurrency)
    }

    pub fn with_shortlist_size(mut self, size: usize) -> Self {
        self.shortlist_size = size.max(1);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub async fn rank(&self, customer: &Customer, technicians: Vec<Technician>) -> DispatchResult<RankedShortlist> {
        if technicians.is_empty() {
            return Err(DispatchError::NoCandidatesAvailable);
        }

        let origin = customer.coordinate();
        if origin.is_none() {
            warn!(customer_id = customer.id, "Customer has no coordinates");
        }

        // `buffered` yields in input order regardless of which lookup finishes first.
        let resolver = &self.resolver;
        let resolved: Vec<_> = stream::iter(technicians)
            .map(move |tech| async move {
                let resolution = match (origin, tech.coordinate()) {
                    (Some(from), Some(to)) => Some(resolver.resolve(from, to).await),
                    _ => None,
                };
                (tech, resolution)
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut evaluated = Vec::with_capacity(resolved.len());
        let mut skipped = Vec::new();
        let mut candidates = Vec::new();

        for (tech, resolution) in resolved {
            let (distance_km, provider, skip, failures) = match resolution {
                None => (None, ProviderTag::Failed, Some(SkipReason::MissingCoordinates), Vec::new()),
                Some(r) => match r.distance_km {
                    Some(km) => (Some(km), r.provider, None, r.failures),
                    None => (None, ProviderTag::Failed, Some(SkipReason::AllProvidersFailed), r.failures),
                },
            };

            evaluated.push(DistanceResult {
                technician_id: tech.id,
                distance_km,
                provider,
            });

            match (distance_km, skip) {
                (Some(km), _) => {
                    debug!(
                        technician_id = tech.id,
                        distance_km = km,
                        %provider,
                        failed_providers = failures.len(),
                        "Technician measured"
                    );
                    candidates.push(ShortlistEntry {
                        technician: tech,
                        distance_km: km,
                        provider,
                        failures,
                    });
                }
                (None, reason) => {
                    let reason = reason.unwrap_or(SkipReason::AllProvidersFailed);
                    warn!(technician_id = tech.id, %reason, "Technician skipped from ranking");
                    skipped.push(SkippedCandidate {
                        technician_id: tech.id,
                        reason,
                        failures,
                    });
                }
            }
        }

        // stable: equal distances keep input order
        candidates.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));
        candidates.truncate(self.shortlist_size);

        info!(
            customer_id = customer.id,
            shortlisted = candidates.len(),
            skipped = skipped.len(),
            "Ranking complete"
        );

        match RankedShortlist::new(candidates, evaluated, skipped.clone()) {
            Some(shortlist) => Ok(shortlist),
            None => Err(DispatchError::NoResolvableDistance { skipped }),
        }
    }
}
