use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Caller-supplied bounds: ordered, inside the supported epoch range, no
/// wider than a semester.
pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    use crate::limits::*;
    let span = Span::checked(start, end)
        .ok_or_else(|| EngineError::Validation("start time must be before end time".into()))?;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(span)
}

/// First APPROVED booking in the room overlapping `span`, skipping `exclude`.
pub fn conflicting_booking(rs: &RoomState, span: &Span, exclude: Option<Ulid>) -> Option<Ulid> {
    rs.bookings
        .overlapping(span)
        .find(|b| b.status == Status::Approved && Some(b.id) != exclude)
        .map(|b| b.id)
}

/// True iff some APPROVED booking other than `exclude` overlaps `span`.
/// PENDING and WAITLISTED bookings never block.
pub fn has_conflict(rs: &RoomState, span: &Span, exclude: Option<Ulid>) -> bool {
    conflicting_booking(rs, span, exclude).is_some()
}

impl Engine {
    /// Conflict check against a room by id. An unknown room has no bookings
    /// and so never conflicts.
    pub async fn room_has_conflict(&self, room_id: Ulid, span: Span, exclude: Option<Ulid>) -> bool {
        match self.get_room(&room_id) {
            Some(rs) => has_conflict(&*rs.read().await, &span, exclude),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room_with(bookings: &[(Ms, Ms, Status)]) -> (RoomState, Vec<Ulid>) {
        let mut rs = RoomState::new(Room {
            id: Ulid::new(),
            name: "LHC-201".into(),
            capacity: 120,
        });
        let mut ids = Vec::new();
        for &(start, end, status) in bookings {
            let id = Ulid::new();
            ids.push(id);
            rs.bookings.insert(RoomBooking {
                id,
                room_id: rs.room.id,
                requester_id: Ulid::new(),
                span: Span::new(start, end),
                purpose: None,
                status,
                queue_position: None,
                created_at: 0,
            });
        }
        (rs, ids)
    }

    #[test]
    fn only_approved_bookings_block() {
        let (rs, _) = room_with(&[
            (1000, 2000, Status::Pending),
            (1000, 2000, Status::Waitlisted),
            (1000, 2000, Status::Cancelled),
        ]);
        assert!(!has_conflict(&rs, &Span::new(1500, 1800), None));

        let (rs, ids) = room_with(&[(1000, 2000, Status::Approved)]);
        assert!(has_conflict(&rs, &Span::new(1500, 2500), None));
        assert_eq!(conflicting_booking(&rs, &Span::new(500, 1001), None), Some(ids[0]));
    }

    #[test]
    fn touching_endpoints_do_not_conflict() {
        let (rs, _) = room_with(&[(1000, 2000, Status::Approved)]);
        assert!(!has_conflict(&rs, &Span::new(2000, 3000), None));
        assert!(!has_conflict(&rs, &Span::new(0, 1000), None));
    }

    #[test]
    fn excluded_booking_is_ignored() {
        let (rs, ids) = room_with(&[(1000, 2000, Status::Approved)]);
        assert!(!has_conflict(&rs, &Span::new(1000, 2000), Some(ids[0])));
    }

    #[test]
    fn validate_span_rejects_inverted_and_out_of_range() {
        let base = crate::limits::MIN_VALID_TIMESTAMP_MS;
        assert!(matches!(validate_span(base + 10, base + 10), Err(EngineError::Validation(_))));
        assert!(matches!(validate_span(base + 10, base), Err(EngineError::Validation(_))));
        assert!(matches!(validate_span(0, 10), Err(EngineError::LimitExceeded(_))));
        assert!(validate_span(base, base + 3_600_000).is_ok());
    }
}
