use ulid::Ulid;

use crate::model::*;
use crate::notify::NoticeKind;

use super::conflict::has_conflict;
use super::transitions::audit_entry;
use super::{Engine, EngineError};

/// One past the highest queue position among WAITLISTED bookings that
/// overlap `span`; 1 when none do.
///
/// Positions are scoped to the overlap cohort, not to the room: two
/// waitlists on disjoint slots both start at 1.
pub fn next_queue_position(rs: &RoomState, span: &Span) -> u32 {
    rs.bookings
        .overlapping(span)
        .filter(|b| b.status == Status::Waitlisted)
        .filter_map(|b| b.queue_position)
        .max()
        .map_or(1, |max| max.saturating_add(1))
}

/// The WAITLISTED booking overlapping `freed` that should be approved next:
/// lowest queue position first, skipping any that still conflict with an
/// APPROVED booking. Ties (possible across cohorts) fall back to submission
/// order.
///
/// `releasing` names an APPROVED booking that is about to leave APPROVED in
/// the same write; it no longer blocks anyone.
pub fn promotion_candidate(rs: &RoomState, freed: &Span, releasing: Option<Ulid>) -> Option<Ulid> {
    let mut waiting: Vec<&RoomBooking> = rs
        .bookings
        .overlapping(freed)
        .filter(|b| b.status == Status::Waitlisted)
        .collect();
    waiting.sort_by_key(|b| (b.queue_position.unwrap_or(u32::MAX), b.created_at, b.id));
    waiting
        .into_iter()
        .find(|b| {
            !rs.bookings
                .overlapping(&b.span)
                .any(|o| o.status == Status::Approved && o.id != b.id && Some(o.id) != releasing)
        })
        .map(|b| b.id)
}

pub(super) fn promote_entry(actor: &Caller, id: Ulid) -> LogEntry {
    audit_entry(
        actor,
        AuditAction::Promote,
        EntityType::RoomBooking,
        id,
        Some(Status::Waitlisted.as_str().to_string()),
        Some(Status::Approved.as_str().to_string()),
    )
}

pub(super) fn booking_label(rs: &RoomState) -> String {
    format!("{} (Room Booking)", rs.room.name)
}

impl Engine {
    /// Decide PENDING or WAITLISTED for a new booking and persist it. The
    /// caller holds the room's write lock, so the conflict check and the
    /// write cannot interleave with another admission or approval.
    pub(super) async fn admit_locked(
        &self,
        rs: &mut RoomState,
        mut booking: RoomBooking,
    ) -> Result<RoomBooking, EngineError> {
        if has_conflict(rs, &booking.span, None) {
            booking.status = Status::Waitlisted;
            booking.queue_position = Some(next_queue_position(rs, &booking.span));
        } else {
            booking.status = Status::Pending;
            booking.queue_position = None;
        }
        self.persist_room(rs, Event::BookingSubmitted { booking: booking.clone() })
            .await?;

        metrics::counter!(crate::observability::ADMISSIONS_TOTAL, "status" => booking.status.as_str())
            .increment(1);
        tracing::debug!(
            booking_id = %booking.id,
            room_id = %booking.room_id,
            status = booking.status.as_str(),
            queue_position = booking.queue_position,
            "booking admitted"
        );
        Ok(booking)
    }

    /// Approve at most one WAITLISTED booking overlapping `freed`. Runs after
    /// an APPROVED booking leaves APPROVED, under the same room lock.
    pub(super) async fn promote_locked(
        &self,
        rs: &mut RoomState,
        freed: Span,
        actor: &Caller,
    ) -> Result<Option<RoomBooking>, EngineError> {
        let Some(id) = promotion_candidate(rs, &freed, None) else {
            return Ok(None);
        };
        let log = promote_entry(actor, id);
        let room_id = rs.room.id;
        self.persist_room(
            rs,
            Event::BookingStatusChanged {
                id,
                room_id,
                status: Status::Approved,
                queue_position: None,
                log,
            },
        )
        .await?;

        Ok(self.announce_promotion(rs, id))
    }

    /// Metrics, log line and notice for a promotion that is already durable.
    pub(super) fn announce_promotion(&self, rs: &RoomState, id: Ulid) -> Option<RoomBooking> {
        let promoted = rs.bookings.get(id).cloned()?;
        metrics::counter!(crate::observability::PROMOTIONS_TOTAL).increment(1);
        tracing::info!(booking_id = %id, room_id = %rs.room.id, "promoted from waitlist");
        self.notify_user(promoted.requester_id, NoticeKind::Promoted, booking_label(rs));
        Some(promoted)
    }

    /// Promote the next eligible WAITLISTED booking for a freed slot.
    /// Returns `None` when the room is unknown or nobody is eligible.
    pub async fn promote_from_waitlist(
        &self,
        room_id: Ulid,
        start: Ms,
        end: Ms,
        actor: &Caller,
    ) -> Result<Option<RoomBooking>, EngineError> {
        let freed = super::conflict::validate_span(start, end)?;
        let Some(rs) = self.get_room(&room_id) else {
            return Ok(None);
        };
        let mut guard = rs.write().await;
        self.promote_locked(&mut guard, freed, actor).await
    }
}
