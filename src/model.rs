use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Fallible constructor for caller-supplied bounds.
    pub fn checked(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

// ── Identity ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Student,
    Professor,
    ClubManager,
    LabTech,
    Lhc,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "STUDENT",
            Role::Professor => "PROFESSOR",
            Role::ClubManager => "CLUB_MANAGER",
            Role::LabTech => "LAB_TECH",
            Role::Lhc => "LHC",
            Role::Admin => "ADMIN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "STUDENT" => Some(Role::Student),
            "PROFESSOR" => Some(Role::Professor),
            "CLUB_MANAGER" => Some(Role::ClubManager),
            "LAB_TECH" => Some(Role::LabTech),
            "LHC" => Some(Role::Lhc),
            "ADMIN" => Some(Role::Admin),
            _ => None,
        }
    }
}

/// A registered portal user. The email is where notices are delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub department_id: Option<Ulid>,
    pub club_id: Option<Ulid>,
}

impl User {
    pub fn caller(&self) -> Caller {
        Caller {
            user_id: self.id,
            role: self.role,
            department_id: self.department_id,
            club_id: self.club_id,
        }
    }
}

/// The acting identity every policy check is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub user_id: Ulid,
    pub role: Role,
    pub department_id: Option<Ulid>,
    pub club_id: Option<Ulid>,
}

// ── Inventory ────────────────────────────────────────────────────

/// Exactly one owner per resource; the enum makes the two references
/// mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Owner {
    Department(Ulid),
    Club(Ulid),
}

impl Owner {
    pub fn type_str(&self) -> &'static str {
        match self {
            Owner::Department(_) => "DEPARTMENT",
            Owner::Club(_) => "CLUB",
        }
    }

    pub fn id(&self) -> Ulid {
        match self {
            Owner::Department(id) | Owner::Club(id) => *id,
        }
    }

    pub fn parse(owner_type: &str, id: Ulid) -> Option<Self> {
        match owner_type.to_ascii_uppercase().as_str() {
            "DEPARTMENT" => Some(Owner::Department(id)),
            "CLUB" => Some(Owner::Club(id)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: Ulid,
    pub name: String,
    /// Total stock.
    pub quantity: u32,
    pub owner: Owner,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    pub name: String,
    pub capacity: u32,
}

// ── Requests and bookings ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Pending,
    Approved,
    Rejected,
    Cancelled,
    Waitlisted,
    Overridden,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "PENDING",
            Status::Approved => "APPROVED",
            Status::Rejected => "REJECTED",
            Status::Cancelled => "CANCELLED",
            Status::Waitlisted => "WAITLISTED",
            Status::Overridden => "OVERRIDDEN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Some(Status::Pending),
            "APPROVED" => Some(Status::Approved),
            "REJECTED" => Some(Status::Rejected),
            "CANCELLED" => Some(Status::Cancelled),
            "WAITLISTED" => Some(Status::Waitlisted),
            "OVERRIDDEN" => Some(Status::Overridden),
            _ => None,
        }
    }

    /// Reachable again only via REOPEN.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Rejected | Status::Cancelled | Status::Overridden)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Approve,
    Reject,
    Cancel,
    Override,
    Reopen,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Approve => "APPROVE",
            Action::Reject => "REJECT",
            Action::Cancel => "CANCEL",
            Action::Override => "OVERRIDE",
            Action::Reopen => "REOPEN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "APPROVE" => Some(Action::Approve),
            "REJECT" => Some(Action::Reject),
            "CANCEL" => Some(Action::Cancel),
            "OVERRIDE" => Some(Action::Override),
            "REOPEN" => Some(Action::Reopen),
            _ => None,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityType {
    ResourceRequest,
    RoomBooking,
    Resource,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::ResourceRequest => "RESOURCE_REQUEST",
            EntityType::RoomBooking => "ROOM_BOOKING",
            EntityType::Resource => "RESOURCE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "RESOURCE_REQUEST" => Some(EntityType::ResourceRequest),
            "ROOM_BOOKING" => Some(EntityType::RoomBooking),
            "RESOURCE" => Some(EntityType::Resource),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub requester_id: Ulid,
    pub quantity: u32,
    pub span: Span,
    pub status: Status,
    pub roll_number: Option<String>,
    pub reason: Option<String>,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomBooking {
    pub id: Ulid,
    pub room_id: Ulid,
    pub requester_id: Ulid,
    pub span: Span,
    pub purpose: Option<String>,
    pub status: Status,
    /// Only meaningful while WAITLISTED.
    pub queue_position: Option<u32>,
    pub created_at: Ms,
}

/// Either side of `applyAction`'s result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entity {
    Request(ResourceRequest),
    Booking(RoomBooking),
}

impl Entity {
    pub fn id(&self) -> Ulid {
        match self {
            Entity::Request(r) => r.id,
            Entity::Booking(b) => b.id,
        }
    }

    pub fn status(&self) -> Status {
        match self {
            Entity::Request(r) => r.status,
            Entity::Booking(b) => b.status,
        }
    }
}

// ── Audit log ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditAction {
    Transition(Action),
    Promote,
    AddResource,
    RemoveResource,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Transition(a) => a.as_str(),
            AuditAction::Promote => "PROMOTE",
            AuditAction::AddResource => "ADD_RESOURCE",
            AuditAction::RemoveResource => "REMOVE_RESOURCE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PROMOTE" => Some(AuditAction::Promote),
            "ADD_RESOURCE" => Some(AuditAction::AddResource),
            "REMOVE_RESOURCE" => Some(AuditAction::RemoveResource),
            other => Action::parse(other).map(AuditAction::Transition),
        }
    }
}

/// Append-only audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Ulid,
    pub user_id: Ulid,
    pub role: Role,
    pub action: AuditAction,
    pub entity_type: EntityType,
    pub entity_id: Ulid,
    pub old_state: Option<String>,
    pub new_state: Option<String>,
    pub created_at: Ms,
}

// ── Interval state ───────────────────────────────────────────────

/// Anything placed on a timeline and indexed by `span.start`.
pub trait Timed {
    fn id(&self) -> Ulid;
    fn span(&self) -> Span;
}

impl Timed for RoomBooking {
    fn id(&self) -> Ulid {
        self.id
    }
    fn span(&self) -> Span {
        self.span
    }
}

impl Timed for ResourceRequest {
    fn id(&self) -> Ulid {
        self.id
    }
    fn span(&self) -> Span {
        self.span
    }
}

/// Entries sorted by `span.start` with binary-search window lookups.
#[derive(Debug, Clone)]
pub struct Timeline<T> {
    pub entries: Vec<T>,
}

impl<T> Default for Timeline<T> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<T: Timed> Timeline<T> {
    /// Insert maintaining sort order by span.start.
    pub fn insert(&mut self, entry: T) {
        let start = entry.span().start;
        let pos = self.entries.partition_point(|e| e.span().start <= start);
        self.entries.insert(pos, entry);
    }

    pub fn get(&self, id: Ulid) -> Option<&T> {
        self.entries.iter().find(|e| e.id() == id)
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut T> {
        self.entries.iter_mut().find(|e| e.id() == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Return only entries whose span overlaps the query window.
    /// Uses binary search to skip entries starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &T> {
        let query = *query;
        let right_bound = self.entries.partition_point(|e| e.span().start < query.end);
        self.entries[..right_bound]
            .iter()
            .filter(move |e| e.span().end > query.start)
    }
}

#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    pub bookings: Timeline<RoomBooking>,
}

impl RoomState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            bookings: Timeline::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub resource: Resource,
    pub requests: Timeline<ResourceRequest>,
    /// Removed from the catalogue; kept so its requests stay auditable.
    pub retired: bool,
}

impl ResourceState {
    pub fn new(resource: Resource) -> Self {
        Self {
            resource,
            requests: Timeline::default(),
            retired: false,
        }
    }
}

/// The event types, flat with no nesting. This is the WAL record format.
///
/// A status change carries its audit entry so both land in one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        user: User,
    },
    RoomCreated {
        room: Room,
    },
    ResourceCreated {
        resource: Resource,
        log: LogEntry,
    },
    ResourceRemoved {
        id: Ulid,
        log: LogEntry,
    },
    /// Snapshot-only: a resource as it stood at compaction time.
    ResourceRestored {
        resource: Resource,
        retired: bool,
    },
    RequestSubmitted {
        request: ResourceRequest,
    },
    BookingSubmitted {
        booking: RoomBooking,
    },
    RequestStatusChanged {
        id: Ulid,
        resource_id: Ulid,
        status: Status,
        log: LogEntry,
    },
    BookingStatusChanged {
        id: Ulid,
        room_id: Ulid,
        status: Status,
        queue_position: Option<u32>,
        log: LogEntry,
    },
    /// An APPROVED booking leaving APPROVED together with the waitlisted
    /// booking promoted into its slot. Both changes and both audit entries
    /// share one record.
    BookingReleased {
        id: Ulid,
        room_id: Ulid,
        status: Status,
        log: LogEntry,
        promoted: Ulid,
        promote_log: LogEntry,
    },
    /// Snapshot-only: restores audit history during compaction replay.
    LogAppended {
        log: LogEntry,
    },
}

impl Event {
    /// The audit entries this event appends, in order.
    pub fn log_entries(&self) -> impl Iterator<Item = &LogEntry> {
        let (first, second) = match self {
            Event::BookingReleased {
                log, promote_log, ..
            } => (Some(log), Some(promote_log)),
            Event::ResourceCreated { log, .. }
            | Event::ResourceRemoved { log, .. }
            | Event::RequestStatusChanged { log, .. }
            | Event::BookingStatusChanged { log, .. }
            | Event::LogAppended { log } => (Some(log), None),
            Event::UserRegistered { .. }
            | Event::RoomCreated { .. }
            | Event::ResourceRestored { .. }
            | Event::RequestSubmitted { .. }
            | Event::BookingSubmitted { .. } => (None, None),
        };
        first.into_iter().chain(second)
    }
}
