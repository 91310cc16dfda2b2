use ulid::Ulid;

use crate::model::*;
use crate::notify::NoticeKind;
use crate::policy;

use super::availability::{available_quantity, oversubscribed_spans};
use super::conflict::{has_conflict, now_ms};
use super::waitlist::{booking_label, next_queue_position, promote_entry, promotion_candidate};
use super::{Engine, EngineError};

// ── Approval Workflow ─────────────────────────────────────────────

/// Every legal (state, action) pair. Anything absent is illegal.
const TRANSITIONS: &[(Status, Action, Status)] = &[
    (Status::Pending, Action::Approve, Status::Approved),
    (Status::Pending, Action::Reject, Status::Rejected),
    (Status::Pending, Action::Cancel, Status::Cancelled),
    (Status::Approved, Action::Cancel, Status::Cancelled),
    (Status::Waitlisted, Action::Cancel, Status::Cancelled),
    (Status::Pending, Action::Override, Status::Overridden),
    (Status::Approved, Action::Override, Status::Overridden),
    (Status::Waitlisted, Action::Override, Status::Overridden),
    (Status::Rejected, Action::Override, Status::Overridden),
    (Status::Cancelled, Action::Override, Status::Overridden),
    (Status::Rejected, Action::Reopen, Status::Pending),
    (Status::Cancelled, Action::Reopen, Status::Pending),
    (Status::Overridden, Action::Reopen, Status::Pending),
];

pub fn next_status(from: Status, action: Action) -> Option<Status> {
    TRANSITIONS
        .iter()
        .find(|(s, a, _)| *s == from && *a == action)
        .map(|(_, _, to)| *to)
}

fn notice_for(action: Action) -> Option<NoticeKind> {
    match action {
        Action::Approve => Some(NoticeKind::Approved),
        Action::Reject => Some(NoticeKind::Rejected),
        Action::Cancel => Some(NoticeKind::Cancelled),
        Action::Override | Action::Reopen => None,
    }
}

pub(super) fn audit_entry(
    caller: &Caller,
    action: AuditAction,
    entity_type: EntityType,
    entity_id: Ulid,
    old_state: Option<String>,
    new_state: Option<String>,
) -> LogEntry {
    LogEntry {
        id: Ulid::new(),
        user_id: caller.user_id,
        role: caller.role,
        action,
        entity_type,
        entity_id,
        old_state,
        new_state,
        created_at: now_ms(),
    }
}

fn status_log(caller: &Caller, action: Action, entity_type: EntityType, id: Ulid, from: Status, to: Status) -> LogEntry {
    audit_entry(
        caller,
        AuditAction::Transition(action),
        entity_type,
        id,
        Some(from.as_str().to_string()),
        Some(to.as_str().to_string()),
    )
}

/// Role gates shared by both entity types. `approver` is the type-specific
/// approval predicate.
fn authorize(
    caller: &Caller,
    action: Action,
    requester_id: Ulid,
    approver: impl FnOnce(&Caller) -> bool,
) -> Result<(), EngineError> {
    let allowed = match action {
        Action::Override | Action::Reopen => policy::is_admin(caller),
        Action::Approve | Action::Reject => approver(caller),
        Action::Cancel => policy::can_cancel(caller, requester_id),
    };
    if allowed {
        Ok(())
    } else {
        Err(EngineError::Forbidden(match action {
            Action::Override | Action::Reopen => "only an admin may override or reopen",
            Action::Approve | Action::Reject => "role may not approve or reject this request",
            Action::Cancel => "only the requester or an admin may cancel",
        }))
    }
}

impl Engine {
    /// Run one workflow action against a request or booking.
    ///
    /// Order: authorize, check legality, persist the status change together
    /// with its audit entry, then notify. For rooms, an APPROVED booking
    /// that stops being APPROVED promotes from the waitlist in the same
    /// record. A failed persist leaves nothing changed.
    pub async fn apply_action(
        &self,
        entity_type: EntityType,
        entity_id: Ulid,
        action: Action,
        caller: &Caller,
    ) -> Result<Entity, EngineError> {
        let result = match entity_type {
            EntityType::RoomBooking => self
                .apply_booking_action(entity_id, action, caller)
                .await
                .map(Entity::Booking),
            EntityType::ResourceRequest => self
                .apply_request_action(entity_id, action, caller)
                .await
                .map(Entity::Request),
            EntityType::Resource => Err(EngineError::Validation(
                "workflow actions apply to requests and bookings only".into(),
            )),
        };
        match &result {
            Ok(entity) => {
                metrics::counter!(
                    crate::observability::TRANSITIONS_TOTAL,
                    "entity" => entity_type.as_str(),
                    "action" => action.as_str(),
                    "status" => "ok"
                )
                .increment(1);
                tracing::info!(
                    entity = entity_type.as_str(),
                    id = %entity_id,
                    action = action.as_str(),
                    status = entity.status().as_str(),
                    user_id = %caller.user_id,
                    "transition applied"
                );
            }
            Err(e) => {
                metrics::counter!(
                    crate::observability::TRANSITIONS_TOTAL,
                    "entity" => entity_type.as_str(),
                    "action" => action.as_str(),
                    "status" => e.class().as_str()
                )
                .increment(1);
            }
        }
        result
    }

    async fn apply_booking_action(
        &self,
        id: Ulid,
        action: Action,
        caller: &Caller,
    ) -> Result<RoomBooking, EngineError> {
        let mut guard = self.resolve_booking_write(&id).await?;
        let rs = &mut *guard;
        let current = rs.bookings.get(id).cloned().ok_or(EngineError::NotFound(id))?;

        authorize(caller, action, current.requester_id, policy::can_approve_room)?;
        let mut to = next_status(current.status, action).ok_or(EngineError::IllegalTransition {
            from: current.status,
            action,
        })?;

        // An APPROVED booking may have landed on the slot since admission;
        // the loser goes back in line instead of double-booking the room.
        let mut queue_position = None;
        if to == Status::Approved && has_conflict(rs, &current.span, Some(id)) {
            to = Status::Waitlisted;
            queue_position = Some(next_queue_position(rs, &current.span));
            tracing::info!(booking_id = %id, "approval raced an existing booking, re-waitlisted");
        }

        let log = status_log(caller, action, EntityType::RoomBooking, id, current.status, to);
        let room_id = rs.room.id;
        // Leaving APPROVED frees the slot. The release and the promotion it
        // causes are written as one record.
        let promoted = (current.status == Status::Approved && to != Status::Approved)
            .then(|| promotion_candidate(rs, &current.span, Some(id)))
            .flatten();
        let event = match promoted {
            Some(promoted) => Event::BookingReleased {
                id,
                room_id,
                status: to,
                log,
                promoted,
                promote_log: promote_entry(caller, promoted),
            },
            None => Event::BookingStatusChanged {
                id,
                room_id,
                status: to,
                queue_position,
                log,
            },
        };
        self.persist_room(rs, event).await?;

        if to != Status::Waitlisted
            && let Some(kind) = notice_for(action)
        {
            self.notify_user(current.requester_id, kind, booking_label(rs));
        }
        if let Some(promoted) = promoted {
            self.announce_promotion(rs, promoted);
        }

        rs.bookings.get(id).cloned().ok_or(EngineError::NotFound(id))
    }

    async fn apply_request_action(
        &self,
        id: Ulid,
        action: Action,
        caller: &Caller,
    ) -> Result<ResourceRequest, EngineError> {
        let mut guard = self.resolve_request_write(&id).await?;
        let rs = &mut *guard;
        let current = rs.requests.get(id).cloned().ok_or(EngineError::NotFound(id))?;
        authorize(caller, action, current.requester_id, |c| {
            policy::can_approve_resource(c, &rs.resource)
        })?;
        let to = next_status(current.status, action).ok_or(EngineError::IllegalTransition {
            from: current.status,
            action,
        })?;
        if to == Status::Pending && rs.retired {
            return Err(EngineError::Validation("resource has been removed".into()));
        }

        if to == Status::Approved {
            let available = available_quantity(rs, &current.span, Some(id));
            if current.quantity > available {
                if self.options.revalidate_on_approve {
                    return Err(EngineError::InsufficientQuantity { available });
                }
                tracing::warn!(
                    request_id = %id,
                    requested = current.quantity,
                    available,
                    "approving beyond available stock"
                );
            }
        }

        let log = status_log(caller, action, EntityType::ResourceRequest, id, current.status, to);
        let resource_id = rs.resource.id;
        self.persist_resource(
            rs,
            Event::RequestStatusChanged {
                id,
                resource_id,
                status: to,
                log,
            },
        )
        .await?;

        if to == Status::Approved && !self.options.revalidate_on_approve {
            for span in oversubscribed_spans(rs, &current.span) {
                tracing::warn!(
                    %resource_id,
                    start = span.start,
                    end = span.end,
                    "resource over-committed"
                );
            }
        }

        if let Some(kind) = notice_for(action) {
            self.notify_user(current.requester_id, kind, rs.resource.name.clone());
        }

        rs.requests.get(id).cloned().ok_or(EngineError::NotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATUSES: [Status; 6] = [
        Status::Pending,
        Status::Approved,
        Status::Rejected,
        Status::Cancelled,
        Status::Waitlisted,
        Status::Overridden,
    ];

    #[test]
    fn approve_and_reject_only_from_pending() {
        for s in ALL_STATUSES {
            let expect_ok = s == Status::Pending;
            assert_eq!(next_status(s, Action::Approve).is_some(), expect_ok, "{s} approve");
            assert_eq!(next_status(s, Action::Reject).is_some(), expect_ok, "{s} reject");
        }
    }

    #[test]
    fn cancel_only_from_live_states() {
        assert_eq!(next_status(Status::Pending, Action::Cancel), Some(Status::Cancelled));
        assert_eq!(next_status(Status::Approved, Action::Cancel), Some(Status::Cancelled));
        assert_eq!(next_status(Status::Waitlisted, Action::Cancel), Some(Status::Cancelled));
        for s in [Status::Rejected, Status::Cancelled, Status::Overridden] {
            assert_eq!(next_status(s, Action::Cancel), None);
        }
    }

    #[test]
    fn override_from_anything_but_overridden() {
        for s in ALL_STATUSES {
            let expected = (s != Status::Overridden).then_some(Status::Overridden);
            assert_eq!(next_status(s, Action::Override), expected, "{s}");
        }
    }

    #[test]
    fn reopen_only_from_terminal() {
        for s in ALL_STATUSES {
            let expected = s.is_terminal().then_some(Status::Pending);
            assert_eq!(next_status(s, Action::Reopen), expected, "{s}");
        }
    }

    #[test]
    fn override_and_reopen_are_silent() {
        assert_eq!(notice_for(Action::Override), None);
        assert_eq!(notice_for(Action::Reopen), None);
        assert_eq!(notice_for(Action::Approve), Some(NoticeKind::Approved));
    }
}
