//! Dispatch Data Model
//!
//! Customers, technicians, distance results and assignment records, plus the
//! per-stage structs a dispatch request is threaded through.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type CustomerId = i64;
pub type TechnicianId = i64;

/// A geographic point in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// True when both components are finite and within the WGS84 ranges.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

fn coordinate_of(latitude: Option<f64>, longitude: Option<f64>) -> Option<Coordinate> {
    match (latitude, longitude) {
        (Some(lat), Some(lon)) => Some(Coordinate::new(lat, lon)),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: CustomerId,
    pub name: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

impl Customer {
    pub fn coordinate(&self) -> Option<Coordinate> {
        coordinate_of(self.latitude, self.longitude)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Free,
    Assigned,
}

impl Availability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Availability::Free => "free",
            Availability::Assigned => "assigned",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Technician {
    pub id: TechnicianId,
    pub name: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default = "default_availability")]
    pub availability: Availability,
    #[serde(default)]
    pub assigned_customer: Option<CustomerId>,
}

fn default_availability() -> Availability {
    Availability::Free
}

impl Technician {
    pub fn coordinate(&self) -> Option<Coordinate> {
        coordinate_of(self.latitude, self.longitude)
    }

    pub fn is_free(&self) -> bool {
        self.availability == Availability::Free
    }
}

/// Which distance computation produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderTag {
    PrimaryRouting,
    SecondaryRouting,
    GeometricFallback,
    Failed,
}

impl ProviderTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderTag::PrimaryRouting => "primary-routing",
            ProviderTag::SecondaryRouting => "secondary-routing",
            ProviderTag::GeometricFallback => "geometric-fallback",
            ProviderTag::Failed => "failed",
        }
    }
}

impl fmt::Display for ProviderTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for ProviderTag {
    type Error = anyhow::Error;

    fn try_from(s: String) -> anyhow::Result<Self> {
        match s.as_str() {
            "primary-routing" => Ok(ProviderTag::PrimaryRouting),
            "secondary-routing" => Ok(ProviderTag::SecondaryRouting),
            "geometric-fallback" => Ok(ProviderTag::GeometricFallback),
            "failed" => Ok(ProviderTag::Failed),
            other => anyhow::bail!("unknown provider tag '{}'", other),
        }
    }
}

/// A provider that failed while resolving one distance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderFailure {
    pub provider: ProviderTag,
    pub error: String,
}

/// Distance of one technician from the customer. `distance_km == None` means unresolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistanceResult {
    pub technician_id: TechnicianId,
    pub distance_km: Option<f64>,
    pub provider: ProviderTag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Assigned,
    Completed,
}

impl AssignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentStatus::Assigned => "assigned",
            AssignmentStatus::Completed => "completed",
        }
    }
}

impl TryFrom<String> for AssignmentStatus {
    type Error = anyhow::Error;

    fn try_from(s: String) -> anyhow::Result<Self> {
        match s.as_str() {
            "assigned" => Ok(AssignmentStatus::Assigned),
            "completed" => Ok(AssignmentStatus::Completed),
            other => anyhow::bail!("unknown assignment status '{}'", other),
        }
    }
}

/// An assignment row. Only `status` ever changes after insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: i64,
    pub customer_id: CustomerId,
    pub technician_id: TechnicianId,
    pub customer_name: String,
    pub technician_name: String,
    pub distance_km: f64,
    pub provider: ProviderTag,
    pub justification: String,
    pub status: AssignmentStatus,
    pub created_at: DateTime<Utc>,
}

/// Everything needed to write a new assignment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewAssignment {
    pub customer_id: CustomerId,
    pub customer_name: String,
    pub technician_id: TechnicianId,
    pub technician_name: String,
    pub distance_km: f64,
    pub provider: ProviderTag,
    pub justification: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReleaseResult {
    /// Technician was already free; nothing was written.
    Noop { technician_id: TechnicianId },
    Released {
        technician_id: TechnicianId,
        closed_assignments: usize,
    },
}

impl ReleaseResult {
    pub fn is_noop(&self) -> bool {
        matches!(self, ReleaseResult::Noop { .. })
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// PIPELINE STAGES
// ──────────────────────────────────────────────────────────────────────────────

/// Incoming service request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub customer_id: CustomerId,
}

/// Ticket with its customer loaded.
#[derive(Debug, Clone, Serialize)]
pub struct LoadedTicket {
    pub ticket: Ticket,
    pub customer: Customer,
}

/// One ranked candidate handed to the arbiter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShortlistEntry {
    pub technician: Technician,
    pub distance_km: f64,
    pub provider: ProviderTag,
    /// Providers tried before `provider` succeeded, in chain order
    pub failures: Vec<ProviderFailure>,
}

/// Why a technician was left out of the ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MissingCoordinates,
    AllProvidersFailed,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::MissingCoordinates => f.write_str("missing coordinates"),
            SkipReason::AllProvidersFailed => f.write_str("all distance providers failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedCandidate {
    pub technician_id: TechnicianId,
    pub reason: SkipReason,
    /// Empty when the technician was never measured
    pub failures: Vec<ProviderFailure>,
}

/// Ranked shortlist. Never empty, sorted ascending by distance.
#[derive(Debug, Clone, Serialize)]
pub struct RankedShortlist {
    entries: Vec<ShortlistEntry>,
    /// Every technician's resolution outcome, in input order.
    pub evaluated: Vec<DistanceResult>,
    pub skipped: Vec<SkippedCandidate>,
}

impl RankedShortlist {
    /// Returns `None` when `entries` is empty.
    pub fn new(
        entries: Vec<ShortlistEntry>,
        evaluated: Vec<DistanceResult>,
        skipped: Vec<SkippedCandidate>,
    ) -> Option<Self> {
        if entries.is_empty() {
            return None;
        }
        Some(Self { entries, evaluated, skipped })
    }

    pub fn entries(&self) -> &[ShortlistEntry] {
        &self.entries
    }

    pub fn nearest(&self) -> &ShortlistEntry {
        &self.entries[0]
    }

    pub fn find(&self, technician_id: TechnicianId) -> Option<&ShortlistEntry> {
        self.entries.iter().find(|e| e.technician.id == technician_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RankedTicket {
    pub loaded: LoadedTicket,
    pub shortlist: RankedShortlist,
}

/// Why the arbiter fell back to the nearest technician.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ArbiterFailure {
    Timeout,
    Unavailable(String),
    EmptyResponse,
    MalformedResponse(String),
    UnknownCandidate(i64),
}

impl fmt::Display for ArbiterFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArbiterFailure::Timeout => f.write_str("model timed out"),
            ArbiterFailure::Unavailable(e) => write!(f, "model unavailable: {}", e),
            ArbiterFailure::EmptyResponse => f.write_str("model returned an empty response"),
            ArbiterFailure::MalformedResponse(e) => write!(f, "model returned malformed output: {}", e),
            ArbiterFailure::UnknownCandidate(id) => write!(f, "model chose id {} outside the shortlist", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "source", content = "failure", rename_all = "snake_case")]
pub enum SelectionSource {
    Model,
    Fallback(ArbiterFailure),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Selection {
    pub technician_id: TechnicianId,
    pub justification: String,
    pub source: SelectionSource,
}

impl Selection {
    pub fn is_fallback(&self) -> bool {
        matches!(self.source, SelectionSource::Fallback(_))
    }
}

/// Ranked ticket with the arbiter's pick. Output of a dry run.
#[derive(Debug, Clone, Serialize)]
pub struct ArbitratedTicket {
    pub ranked: RankedTicket,
    pub selection: Selection,
}

impl ArbitratedTicket {
    /// The shortlist entry the arbiter picked.
    pub fn chosen(&self) -> &ShortlistEntry {
        self.ranked
            .shortlist
            .find(self.selection.technician_id)
            .unwrap_or_else(|| self.ranked.shortlist.nearest())
    }
}

/// Final stage of a committed dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchOutcome {
    pub arbitrated: ArbitratedTicket,
    pub assignment: Assignment,
}
