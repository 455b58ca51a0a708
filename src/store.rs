//! Dispatch State Store
//!
//! Interface over the three persisted collections (customers, technicians,
//! assignments) and its SQLite implementation. Multi-row mutations run as a
//! single `IMMEDIATE` transaction so concurrent writers are serialised.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task;

use crate::models::{
    Assignment, AssignmentStatus, Availability, Customer, CustomerId, NewAssignment, ProviderTag,
    ReleaseResult, Technician, TechnicianId,
};

/// Result of trying to commit an assignment.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Committed {
        assignment: Assignment,
        /// Technicians whose open assignment with this customer was completed
        /// by the commit. They stay busy until released.
        orphaned_technicians: Vec<TechnicianId>,
    },
    /// The technician was no longer free; nothing was written.
    Conflict,
    TechnicianMissing,
}

#[async_trait]
pub trait DispatchStore: Send + Sync {
    async fn find_customer(&self, id: CustomerId) -> Result<Option<Customer>>;
    async fn find_technician(&self, id: TechnicianId) -> Result<Option<Technician>>;
    async fn free_technicians(&self) -> Result<Vec<Technician>>;
    async fn assignments_for_technician(&self, id: TechnicianId) -> Result<Vec<Assignment>>;
    async fn assignments_for_customer(&self, id: CustomerId) -> Result<Vec<Assignment>>;
    async fn upsert_customer(&self, customer: &Customer) -> Result<()>;
    async fn upsert_technician(&self, technician: &Technician) -> Result<()>;

    /// Completes open assignments of the technician or customer, claims the
    /// technician if it is still free, and inserts the new assignment.
    async fn commit_assignment(&self, new: NewAssignment) -> Result<CommitOutcome>;

    /// `None` when the technician does not exist.
    async fn release_technician(&self, id: TechnicianId) -> Result<Option<ReleaseResult>>;
}

#[derive(Clone)]
pub struct SqliteDispatchStore {
    db_path: PathBuf,
}

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const ASSIGNMENT_COLUMNS: &str = "id, customer_id, technician_id, customer_name, technician_name, \
     distance_km, provider, justification, status, created_at";

fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open dispatch database {}", path.display()))?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

fn technician_from_row(row: &Row<'_>) -> rusqlite::Result<Technician> {
    let is_free: bool = row.get(4)?;
    Ok(Technician {
        id: row.get(0)?,
        name: row.get(1)?,
        latitude: row.get(2)?,
        longitude: row.get(3)?,
        availability: if is_free { Availability::Free } else { Availability::Assigned },
        assigned_customer: row.get(5)?,
    })
}

struct AssignmentRow {
    id: i64,
    customer_id: i64,
    technician_id: i64,
    customer_name: String,
    technician_name: String,
    distance_km: f64,
    provider: String,
    justification: String,
    status: String,
    created_at: String,
}

impl AssignmentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            customer_id: row.get(1)?,
            technician_id: row.get(2)?,
            customer_name: row.get(3)?,
            technician_name: row.get(4)?,
            distance_km: row.get(5)?,
            provider: row.get(6)?,
            justification: row.get(7)?,
            status: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn into_assignment(self) -> Result<Assignment> {
        Ok(Assignment {
            id: self.id,
            customer_id: self.customer_id,
            technician_id: self.technician_id,
            customer_name: self.customer_name,
            technician_name: self.technician_name,
            distance_km: self.distance_km,
            provider: ProviderTag::try_from(self.provider)
                .with_context(|| format!("Corrupt provider on assignment {}", self.id))?,
            justification: self.justification,
            status: AssignmentStatus::try_from(self.status)
                .with_context(|| format!("Corrupt status on assignment {}", self.id))?,
            created_at: DateTime::parse_from_rfc3339(&self.created_at)?.with_timezone(&Utc),
        })
    }
}

fn query_assignments(conn: &Connection, column: &str, id: i64) -> Result<Vec<Assignment>> {
    let sql = format!(
        "SELECT {} FROM assignments WHERE {} = ?1 ORDER BY id ASC",
        ASSIGNMENT_COLUMNS, column
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![id], AssignmentRow::from_row)?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row?.into_assignment()?);
    }
    Ok(out)
}

impl SqliteDispatchStore {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let path_clone = path.clone();

        task::spawn_blocking(move || {
            let conn = open(&path_clone)?;

            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS customers (
                    id INTEGER PRIMARY KEY,
                    name TEXT NOT NULL,
                    latitude REAL,
                    longitude REAL
                );
                CREATE TABLE IF NOT EXISTS technicians (
                    id INTEGER PRIMARY KEY,
                    name TEXT NOT NULL,
                    latitude REAL,
                    longitude REAL,
                    is_free INTEGER NOT NULL DEFAULT 1,
                    availability_status TEXT NOT NULL DEFAULT 'free',
                    assigned_customer INTEGER
                );
                CREATE TABLE IF NOT EXISTS assignments (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    customer_id INTEGER NOT NULL,
                    technician_id INTEGER NOT NULL,
                    customer_name TEXT NOT NULL,
                    technician_name TEXT NOT NULL,
                    distance_km REAL NOT NULL,
                    provider TEXT NOT NULL,
                    justification TEXT NOT NULL,
                    status TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_technicians_free ON technicians(is_free);
                CREATE INDEX IF NOT EXISTS idx_assignments_technician ON assignments(technician_id);
                CREATE INDEX IF NOT EXISTS idx_assignments_customer ON assignments(customer_id);
                "#,
            )?;

            Ok::<_, anyhow::Error>(())
        }).await??;

        Ok(Self { db_path: path })
    }
}

#[async_trait]
impl DispatchStore for SqliteDispatchStore {
    async fn find_customer(&self, id: CustomerId) -> Result<Option<Customer>> {
        let path = self.db_path.clone();

        task::spawn_blocking(move || {
            let conn = open(&path)?;
            let customer = conn.query_row(
                "SELECT id, name, latitude, longitude FROM customers WHERE id = ?1",
                params![id],
                |row| Ok(Customer {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    latitude: row.get(2)?,
                    longitude: row.get(3)?,
                }),
            ).optional()?;
            Ok::<_, anyhow::Error>(customer)
        }).await?
    }

    async fn find_technician(&self, id: TechnicianId) -> Result<Option<Technician>> {
        let path = self.db_path.clone();

        task::spawn_blocking(move || {
            let conn = open(&path)?;
            let tech = conn.query_row(
                "SELECT id, name, latitude, longitude, is_free, assigned_customer FROM technicians WHERE id = ?1",
                params![id],
                technician_from_row,
            ).optional()?;
            Ok::<_, anyhow::Error>(tech)
        }).await?
    }

    async fn free_technicians(&self) -> Result<Vec<Technician>> {
        let path = self.db_path.clone();

        task::spawn_blocking(move || {
            let conn = open(&path)?;
            let mut stmt = conn.prepare(
                "SELECT id, name, latitude, longitude, is_free, assigned_customer
                 FROM technicians WHERE is_free = 1 ORDER BY id ASC",
            )?;
            let techs = stmt
                .query_map([], technician_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok::<_, anyhow::Error>(techs)
        }).await?
    }

    async fn assignments_for_technician(&self, id: TechnicianId) -> Result<Vec<Assignment>> {
        let path = self.db_path.clone();

        task::spawn_blocking(move || {
            let conn = open(&path)?;
            query_assignments(&conn, "technician_id", id)
        }).await?
    }

    async fn assignments_for_customer(&self, id: CustomerId) -> Result<Vec<Assignment>> {
        let path = self.db_path.clone();

        task::spawn_blocking(move || {
            let conn = open(&path)?;
            query_assignments(&conn, "customer_id", id)
        }).await?
    }

    async fn upsert_customer(&self, customer: &Customer) -> Result<()> {
        let path = self.db_path.clone();
        let customer = customer.clone();

        task::spawn_blocking(move || {
            let conn = open(&path)?;
            conn.execute(
                "INSERT INTO customers (id, name, latitude, longitude) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name,
                     latitude = excluded.latitude, longitude = excluded.longitude",
                params![customer.id, &customer.name, customer.latitude, customer.longitude],
            )?;
            Ok::<_, anyhow::Error>(())
        }).await?
    }

    async fn upsert_technician(&self, technician: &Technician) -> Result<()> {
        let path = self.db_path.clone();
        let tech = technician.clone();

        task::spawn_blocking(move || {
            let conn = open(&path)?;
            conn.execute(
                "INSERT INTO technicians (id, name, latitude, longitude, is_free, availability_status, assigned_customer)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name,
                     latitude = excluded.latitude, longitude = excluded.longitude,
                     is_free = excluded.is_free, availability_status = excluded.availability_status,
                     assigned_customer = excluded.assigned_customer",
                params![
                    tech.id,
                    &tech.name,
                    tech.latitude,
                    tech.longitude,
                    tech.is_free(),
                    tech.availability.as_str(),
                    tech.assigned_customer,
                ],
            )?;
            Ok::<_, anyhow::Error>(())
        }).await?
    }

    async fn commit_assignment(&self, new: NewAssignment) -> Result<CommitOutcome> {
        let path = self.db_path.clone();

        task::spawn_blocking(move || {
            let mut conn = open(&path)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let orphaned_technicians = {
                let mut stmt = tx.prepare(
                    "SELECT DISTINCT technician_id FROM assignments
                     WHERE status = 'assigned' AND customer_id = ?2 AND technician_id != ?1
                     ORDER BY technician_id ASC",
                )?;
                let ids = stmt
                    .query_map(params![new.technician_id, new.customer_id], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<TechnicianId>>>()?;
                ids
            };

            // 1. close stale assignments for either party
            tx.execute(
                "UPDATE assignments SET status = 'completed'
                 WHERE status = 'assigned' AND (technician_id = ?1 OR customer_id = ?2)",
                params![new.technician_id, new.customer_id],
            )?;

            // 2. claim the technician only if still free
            let claimed = tx.execute(
                "UPDATE technicians SET is_free = 0, availability_status = 'assigned', assigned_customer = ?2
                 WHERE id = ?1 AND is_free = 1",
                params![new.technician_id, new.customer_id],
            )?;

            if claimed == 0 {
                let exists = tx.query_row(
                    "SELECT 1 FROM technicians WHERE id = ?1",
                    params![new.technician_id],
                    |_| Ok(()),
                ).optional()?.is_some();
                // dropping `tx` rolls back step 1
                return Ok(if exists { CommitOutcome::Conflict } else { CommitOutcome::TechnicianMissing });
            }

            // 3. record the new assignment
            let created_at = Utc::now();
            tx.execute(
                "INSERT INTO assignments (customer_id, technician_id, customer_name, technician_name,
                     distance_km, provider, justification, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'assigned', ?8)",
                params![
                    new.customer_id,
                    new.technician_id,
                    &new.customer_name,
                    &new.technician_name,
                    new.distance_km,
                    new.provider.as_str(),
                    &new.justification,
                    created_at.to_rfc3339(),
                ],
            )?;
            let id = tx.last_insert_rowid();
            tx.commit()?;

            let assignment = Assignment {
                id,
                customer_id: new.customer_id,
                technician_id: new.technician_id,
                customer_name: new.customer_name,
                technician_name: new.technician_name,
                distance_km: new.distance_km,
                provider: new.provider,
                justification: new.justification,
                status: AssignmentStatus::Assigned,
                created_at,
            };
            Ok::<_, anyhow::Error>(CommitOutcome::Committed { assignment, orphaned_technicians })
        }).await?
    }

    async fn release_technician(&self, id: TechnicianId) -> Result<Option<ReleaseResult>> {
        let path = self.db_path.clone();

        task::spawn_blocking(move || {
            let mut conn = open(&path)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let is_free: Option<bool> = tx.query_row(
                "SELECT is_free FROM technicians WHERE id = ?1",
                params![id],
                |row| row.get(0),
            ).optional()?;

            let result = match is_free {
                None => return Ok(None),
                Some(true) => ReleaseResult::Noop { technician_id: id },
                Some(false) => {
                    tx.execute(
                        "UPDATE technicians SET is_free = 1, availability_status = 'free', assigned_customer = NULL
                         WHERE id = ?1",
                        params![id],
                    )?;
                    let closed = tx.execute(
                        "UPDATE assignments SET status = 'completed'
                         WHERE technician_id = ?1 AND status != 'completed'",
                        params![id],
                    )?;
                    ReleaseResult::Released { technician_id: id, closed_assignments: closed }
                }
            };

            tx.commit()?;
            Ok::<_, anyhow::Error>(Some(result))
        }).await?
    }
}
