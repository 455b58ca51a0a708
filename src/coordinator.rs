//! Assignment Coordinator
//!
//! The only writer of technician availability and assignment status. Commits
//! are atomic in the store and guarded by a conditional claim on the
//! technician, so two dispatches can never both win the same technician.

use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{DispatchError, DispatchResult};
use crate::models::{Assignment, Customer, NewAssignment, ProviderTag, ReleaseResult, Technician, TechnicianId};
use crate::store::{CommitOutcome, DispatchStore};

#[derive(Clone)]
pub struct AssignmentCoordinator {
    store: Arc<dyn DispatchStore>,
}

impl AssignmentCoordinator {
    pub fn new(store: Arc<dyn DispatchStore>) -> Self {
        Self { store }
    }

    /// Closes open assignments of either party, marks the technician busy
    /// with this customer, and records a new `assigned` row.
    #[tracing::instrument(skip(self, customer, technician, justification), fields(customer_id = customer.id, technician_id = technician.id))]
    pub async fn assign(
        &self,
        customer: &Customer,
        technician: &Technician,
        distance_km: f64,
        provider: ProviderTag,
        justification: String,
    ) -> DispatchResult<Assignment> {
        let new = NewAssignment {
            customer_id: customer.id,
            customer_name: customer.name.clone(),
            technician_id: technician.id,
            technician_name: technician.name.clone(),
            distance_km,
            provider,
            justification,
        };

        match self.store.commit_assignment(new).await? {
            CommitOutcome::Committed { assignment, orphaned_technicians } => {
                for orphan in orphaned_technicians {
                    warn!(
                        orphaned_technician_id = orphan,
                        "Previous assignment for this customer was completed; technician stays busy until released"
                    );
                }
                info!(assignment_id = assignment.id, distance_km, %provider, "Technician assigned");
                Ok(assignment)
            }
            CommitOutcome::Conflict => {
                warn!("Technician was claimed by another dispatch");
                Err(DispatchError::AssignmentConflict { technician_id: technician.id })
            }
            CommitOutcome::TechnicianMissing => Err(DispatchError::TechnicianNotFound(technician.id)),
        }
    }

    /// Returns a technician to the pool. Releasing a free technician is a no-op.
    pub async fn release(&self, technician_id: TechnicianId) -> DispatchResult<ReleaseResult> {
        let result = self
            .store
            .release_technician(technician_id)
            .await?
            .ok_or(DispatchError::TechnicianNotFound(technician_id))?;

        match result {
            ReleaseResult::Noop { .. } => {
                info!(technician_id, "Technician already free, nothing to release")
            }
            ReleaseResult::Released { closed_assignments, .. } => {
                info!(technician_id, closed_assignments, "Technician released")
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AssignmentStatus, Availability};
    use crate::store::SqliteDispatchStore;
    use tempfile::NamedTempFile;

    fn customer(id: i64) -> Customer {
        Customer { id, name: format!("Customer {}", id), latitude: Some(0.0), longitude: Some(0.0) }
    }

    fn technician(id: i64) -> Technician {
        Technician {
            id,
            name: format!("Tech {}", id),
            latitude: Some(0.0),
            longitude: Some(0.05),
            availability: Availability::Free,
            assigned_customer: None,
        }
    }

    async fn setup() -> (NamedTempFile, Arc<SqliteDispatchStore>, AssignmentCoordinator) {
        let temp_file = NamedTempFile::new().unwrap();
        let store = Arc::new(SqliteDispatchStore::new(temp_file.path()).await.unwrap());
        for id in [1, 2] {
            store.upsert_customer(&customer(id)).await.unwrap();
        }
        store.upsert_technician(&technician(20)).await.unwrap();
        let coordinator = AssignmentCoordinator::new(store.clone());
        (temp_file, store, coordinator)
    }

    #[tokio::test]
    async fn test_second_claim_on_same_technician_conflicts() {
        let (_tmp, store, coordinator) = setup().await;
        let tech = technician(20);

        coordinator
            .assign(&customer(1), &tech, 5.56, ProviderTag::GeometricFallback, "nearest".into())
            .await
            .unwrap();
        let err = coordinator
            .assign(&customer(2), &tech, 5.56, ProviderTag::GeometricFallback, "nearest".into())
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::AssignmentConflict { technician_id: 20 }));
        assert!(store.assignments_for_customer(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_assigns_have_a_single_winner() {
        let (_tmp, store, coordinator) = setup().await;

        let a = {
            let c = coordinator.clone();
            tokio::spawn(async move {
                c.assign(&customer(1), &technician(20), 5.0, ProviderTag::GeometricFallback, "a".into()).await
            })
        };
        let b = {
            let c = coordinator.clone();
            tokio::spawn(async move {
                c.assign(&customer(2), &technician(20), 5.0, ProviderTag::GeometricFallback, "b".into()).await
            })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);

        let open: Vec<_> = store
            .assignments_for_technician(20)
            .await
            .unwrap()
            .into_iter()
            .filter(|a| a.status == AssignmentStatus::Assigned)
            .collect();
        assert_eq!(open.len(), 1);
    }

    #[tokio::test]
    async fn test_release_twice_has_no_extra_side_effects() {
        let (_tmp, store, coordinator) = setup().await;
        coordinator
            .assign(&customer(1), &technician(20), 5.0, ProviderTag::PrimaryRouting, "r".into())
            .await
            .unwrap();

        let first = coordinator.release(20).await.unwrap();
        assert_eq!(first, ReleaseResult::Released { technician_id: 20, closed_assignments: 1 });
        let after_first = store.assignments_for_technician(20).await.unwrap();

        let second = coordinator.release(20).await.unwrap();
        assert!(second.is_noop());
        assert_eq!(store.assignments_for_technician(20).await.unwrap(), after_first);
    }

    #[tokio::test]
    async fn test_redispatched_customer_leaves_previous_technician_busy() {
        let (_tmp, store, coordinator) = setup().await;
        store.upsert_technician(&technician(21)).await.unwrap();

        coordinator
            .assign(&customer(1), &technician(20), 5.0, ProviderTag::PrimaryRouting, "first".into())
            .await
            .unwrap();
        let second = coordinator
            .assign(&customer(1), &technician(21), 6.0, ProviderTag::PrimaryRouting, "second".into())
            .await
            .unwrap();
        assert_eq!(second.technician_id, 21);

        let open: Vec<_> = store
            .assignments_for_customer(1)
            .await
            .unwrap()
            .into_iter()
            .filter(|a| a.status == AssignmentStatus::Assigned)
            .collect();
        assert_eq!(open, vec![second]);

        let previous = store.find_technician(20).await.unwrap().unwrap();
        assert!(!previous.is_free());
        assert_eq!(
            coordinator.release(20).await.unwrap(),
            ReleaseResult::Released { technician_id: 20, closed_assignments: 0 }
        );
    }

    #[tokio::test]
    async fn test_release_unknown_technician() {
        let (_tmp, _store, coordinator) = setup().await;
        let err = coordinator.release(77).await.unwrap_err();
        assert!(matches!(err, DispatchError::TechnicianNotFound(77)));
    }
}
