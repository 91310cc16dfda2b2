use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

// ── Availability Calculator ───────────────────────────────────────

/// Stock minus the summed quantities of every APPROVED request overlapping
/// `span`, skipping `exclude`.
///
/// Deliberately conservative: two approved requests that overlap the window
/// but not each other both count, so the result can undershoot the true
/// per-instant free stock. It never overshoots. A negative remainder means
/// the stock was over-committed somewhere; it is reported and clamped to 0.
pub fn available_quantity(rs: &ResourceState, span: &Span, exclude: Option<Ulid>) -> u32 {
    let used: u64 = rs
        .requests
        .overlapping(span)
        .filter(|r| r.status == Status::Approved && Some(r.id) != exclude)
        .map(|r| u64::from(r.quantity))
        .sum();
    let raw = i64::from(rs.resource.quantity) - used as i64;
    if raw < 0 {
        tracing::warn!(
            resource_id = %rs.resource.id,
            stock = rs.resource.quantity,
            approved = used,
            "approved quantity exceeds stock"
        );
    }
    raw.max(0) as u32
}

/// Sweep-line: time ranges inside `window` where the APPROVED quantity in use
/// at a single instant is greater than the stock. Empty when the invariant
/// holds.
pub fn oversubscribed_spans(rs: &ResourceState, window: &Span) -> Vec<Span> {
    let capacity = i64::from(rs.resource.quantity);

    // +q at start, -q at end; ends sort before starts at the same instant
    // because intervals are half-open.
    let mut events: Vec<(Ms, i64)> = Vec::new();
    for r in rs.requests.overlapping(window) {
        if r.status != Status::Approved {
            continue;
        }
        let q = i64::from(r.quantity);
        events.push((r.span.start.max(window.start), q));
        events.push((r.span.end.min(window.end), -q));
    }
    events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut result: Vec<Span> = Vec::new();
    let mut in_use: i64 = 0;
    let mut over_start: Option<Ms> = None;

    for (time, delta) in &events {
        in_use += delta;
        if in_use > capacity && over_start.is_none() {
            over_start = Some(*time);
        } else if in_use <= capacity
            && let Some(start) = over_start.take()
            && *time > start
        {
            match result.last_mut() {
                Some(last) if last.end >= start => last.end = last.end.max(*time),
                _ => result.push(Span::new(start, *time)),
            }
        }
    }

    result
}

impl Engine {
    /// Free units of a resource over `span`. An unknown resource has none.
    pub async fn available_quantity(
        &self,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    ) -> Result<u32, EngineError> {
        let span = super::conflict::validate_span(start, end)?;
        match self.get_resource(&resource_id) {
            Some(rs) => Ok(available_quantity(&*rs.read().await, &span, exclude)),
            None => Ok(0),
        }
    }
}
