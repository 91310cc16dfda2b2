use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::policy;

use super::{Engine, EngineError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestFilter {
    pub resource_id: Option<Ulid>,
    pub status: Option<Status>,
    pub requester_id: Option<Ulid>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub room_id: Option<Ulid>,
    pub status: Option<Status>,
    pub requester_id: Option<Ulid>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    pub action: Option<AuditAction>,
    pub entity_type: Option<EntityType>,
}

/// One page of the audit log plus the unpaged match count.
#[derive(Debug, Clone)]
pub struct LogPage {
    pub entries: Vec<LogEntry>,
    pub total: usize,
    pub page: usize,
    pub limit: usize,
}

/// Which requests a caller may see. Approvers see the stock they approve;
/// everyone else sees only their own.
fn request_visible(caller: &Caller, resource: &Resource, request: &ResourceRequest) -> bool {
    if request.requester_id == caller.user_id {
        return true;
    }
    match caller.role {
        Role::Admin => true,
        Role::LabTech | Role::ClubManager => policy::can_approve_resource(caller, resource),
        Role::Student | Role::Professor | Role::Lhc => false,
    }
}

impl Engine {
    pub fn get_user(&self, id: &Ulid) -> Option<User> {
        self.users.get(id).map(|u| u.value().clone())
    }

    pub async fn get_request(&self, id: &Ulid) -> Option<ResourceRequest> {
        let resource_id = *self.request_resources.get(id)?.value();
        let rs = self.get_resource(&resource_id)?;
        let guard = rs.read().await;
        guard.requests.get(*id).cloned()
    }

    pub async fn get_booking(&self, id: &Ulid) -> Option<RoomBooking> {
        let room_id = *self.booking_rooms.get(id)?.value();
        let rs = self.get_room(&room_id)?;
        let guard = rs.read().await;
        guard.bookings.get(*id).cloned()
    }

    pub async fn list_rooms(&self) -> Vec<Room> {
        let arcs: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut rooms = Vec::with_capacity(arcs.len());
        for rs in arcs {
            rooms.push(rs.read().await.room.clone());
        }
        rooms.sort_by(|a, b| a.name.cmp(&b.name));
        rooms
    }

    /// The live catalogue. Club-owned stock is hidden from roles that may not
    /// see it.
    pub async fn list_resources(&self, caller: &Caller) -> Vec<Resource> {
        let show_club = policy::can_view_club_resources(caller);
        let arcs: Vec<_> = self.resources.iter().map(|e| e.value().clone()).collect();
        let mut resources = Vec::with_capacity(arcs.len());
        for rs in arcs {
            let guard = rs.read().await;
            if guard.retired {
                continue;
            }
            if matches!(guard.resource.owner, Owner::Club(_)) && !show_club {
                continue;
            }
            resources.push(guard.resource.clone());
        }
        resources.sort_by(|a, b| a.name.cmp(&b.name));
        resources
    }

    /// Requests visible to `caller` matching `filter`, newest first.
    pub async fn list_requests(&self, caller: &Caller, filter: &RequestFilter) -> Vec<ResourceRequest> {
        let arcs: Vec<_> = match filter.resource_id {
            Some(id) => self.get_resource(&id).into_iter().collect(),
            None => self.resources.iter().map(|e| e.value().clone()).collect(),
        };
        let mut out = Vec::new();
        for rs in arcs {
            let guard = rs.read().await;
            out.extend(
                guard
                    .requests
                    .entries
                    .iter()
                    .filter(|r| filter.status.is_none_or(|s| r.status == s))
                    .filter(|r| filter.requester_id.is_none_or(|u| r.requester_id == u))
                    .filter(|r| request_visible(caller, &guard.resource, r))
                    .cloned(),
            );
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        out
    }

    /// Bookings matching `filter`, newest first. Room schedules are public.
    pub async fn list_bookings(&self, filter: &BookingFilter) -> Vec<RoomBooking> {
        let arcs: Vec<_> = match filter.room_id {
            Some(id) => self.get_room(&id).into_iter().collect(),
            None => self.rooms.iter().map(|e| e.value().clone()).collect(),
        };
        let mut out = Vec::new();
        for rs in arcs {
            let guard = rs.read().await;
            out.extend(
                guard
                    .bookings
                    .entries
                    .iter()
                    .filter(|b| filter.status.is_none_or(|s| b.status == s))
                    .filter(|b| filter.requester_id.is_none_or(|u| b.requester_id == u))
                    .cloned(),
            );
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        out
    }

    /// Calendar feed: APPROVED bookings lying entirely inside `window`,
    /// ordered by start.
    pub async fn approved_bookings(&self, window: Span) -> Vec<RoomBooking> {
        let arcs: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for rs in arcs {
            let guard = rs.read().await;
            out.extend(
                guard
                    .bookings
                    .overlapping(&window)
                    .filter(|b| b.status == Status::Approved && window.contains_span(&b.span))
                    .cloned(),
            );
        }
        out.sort_by(|a, b| a.span.start.cmp(&b.span.start).then(a.id.cmp(&b.id)));
        out
    }

    /// Audit log, newest first. `page` is 1-based; `limit` defaults to
    /// `DEFAULT_LOG_PAGE_SIZE` and is capped at `MAX_LOG_PAGE_SIZE`.
    pub async fn list_logs(
        &self,
        caller: &Caller,
        filter: &LogFilter,
        page: Option<usize>,
        limit: Option<usize>,
    ) -> Result<LogPage, EngineError> {
        if !policy::is_admin(caller) {
            return Err(EngineError::Forbidden("only an admin may read the audit log"));
        }
        let page = page.unwrap_or(1).max(1);
        let limit = limit.unwrap_or(DEFAULT_LOG_PAGE_SIZE).clamp(1, MAX_LOG_PAGE_SIZE);

        let logs = self.logs.read().await;
        let matching: Vec<&LogEntry> = logs
            .iter()
            .rev()
            .filter(|l| filter.action.is_none_or(|a| l.action == a))
            .filter(|l| filter.entity_type.is_none_or(|t| l.entity_type == t))
            .collect();
        let total = matching.len();
        let entries = matching
            .into_iter()
            .skip((page - 1).saturating_mul(limit))
            .take(limit)
            .cloned()
            .collect();
        Ok(LogPage {
            entries,
            total,
            page,
            limit,
        })
    }
}
