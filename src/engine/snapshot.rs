use std::collections::HashMap;

use ulid::Ulid;

use crate::model::*;

/// Insertion-ordered map so snapshots replay in first-seen order.
struct Ordered<T> {
    order: Vec<Ulid>,
    items: HashMap<Ulid, T>,
}

impl<T> Default for Ordered<T> {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            items: HashMap::new(),
        }
    }
}

impl<T> Ordered<T> {
    fn put(&mut self, id: Ulid, item: T) {
        if self.items.insert(id, item).is_none() {
            self.order.push(id);
        }
    }

    fn get_mut(&mut self, id: &Ulid) -> Option<&mut T> {
        self.items.get_mut(id)
    }

    fn into_values(mut self) -> impl Iterator<Item = T> {
        self.order.into_iter().filter_map(move |id| self.items.remove(&id))
    }
}

/// Collapse a WAL history into the shortest event list that replays to the
/// same state: one record per user, room, resource, request and booking at
/// its latest state, then every audit entry in original order.
pub fn fold_snapshot(history: &[Event]) -> Vec<Event> {
    let mut users: Ordered<User> = Ordered::default();
    let mut rooms: Ordered<Room> = Ordered::default();
    let mut resources: Ordered<(Resource, bool)> = Ordered::default();
    let mut requests: Ordered<ResourceRequest> = Ordered::default();
    let mut bookings: Ordered<RoomBooking> = Ordered::default();
    let mut logs: Vec<LogEntry> = Vec::new();

    for event in history {
        match event {
            Event::UserRegistered { user } => users.put(user.id, user.clone()),
            Event::RoomCreated { room } => rooms.put(room.id, room.clone()),
            Event::ResourceCreated { resource, .. } => {
                resources.put(resource.id, (resource.clone(), false));
            }
            Event::ResourceRestored { resource, retired } => {
                resources.put(resource.id, (resource.clone(), *retired));
            }
            Event::ResourceRemoved { id, .. } => {
                if let Some((_, retired)) = resources.get_mut(id) {
                    *retired = true;
                }
            }
            Event::RequestSubmitted { request } => requests.put(request.id, request.clone()),
            Event::BookingSubmitted { booking } => bookings.put(booking.id, booking.clone()),
            Event::RequestStatusChanged { id, status, .. } => {
                if let Some(r) = requests.get_mut(id) {
                    r.status = *status;
                }
            }
            Event::BookingStatusChanged {
                id,
                status,
                queue_position,
                ..
            } => {
                if let Some(b) = bookings.get_mut(id) {
                    b.status = *status;
                    b.queue_position = *queue_position;
                }
            }
            Event::BookingReleased {
                id, status, promoted, ..
            } => {
                if let Some(b) = bookings.get_mut(id) {
                    b.status = *status;
                    b.queue_position = None;
                }
                if let Some(b) = bookings.get_mut(promoted) {
                    b.status = Status::Approved;
                    b.queue_position = None;
                }
            }
            Event::LogAppended { .. } => {}
        }
        logs.extend(event.log_entries().cloned());
    }

    let mut out = Vec::new();
    out.extend(users.into_values().map(|user| Event::UserRegistered { user }));
    out.extend(rooms.into_values().map(|room| Event::RoomCreated { room }));
    out.extend(
        resources
            .into_values()
            .map(|(resource, retired)| Event::ResourceRestored { resource, retired }),
    );
    out.extend(requests.into_values().map(|request| Event::RequestSubmitted { request }));
    out.extend(bookings.into_values().map(|booking| Event::BookingSubmitted { booking }));
    out.extend(logs.into_iter().map(|log| Event::LogAppended { log }));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admin() -> Caller {
        Caller {
            user_id: Ulid::new(),
            role: Role::Admin,
            department_id: None,
            club_id: None,
        }
    }

    fn log(caller: &Caller, action: AuditAction, entity_type: EntityType, id: Ulid) -> LogEntry {
        LogEntry {
            id: Ulid::new(),
            user_id: caller.user_id,
            role: caller.role,
            action,
            entity_type,
            entity_id: id,
            old_state: None,
            new_state: None,
            created_at: 0,
        }
    }

    #[test]
    fn status_changes_collapse_into_latest_state() {
        let a = admin();
        let room = Room {
            id: Ulid::new(),
            name: "LHC-1".into(),
            capacity: 40,
        };
        let booking = RoomBooking {
            id: Ulid::new(),
            room_id: room.id,
            requester_id: a.user_id,
            span: Span::new(1_000, 2_000),
            purpose: None,
            status: Status::Waitlisted,
            queue_position: Some(1),
            created_at: 0,
        };
        let promote = log(&a, AuditAction::Promote, EntityType::RoomBooking, booking.id);
        let history = vec![
            Event::RoomCreated { room: room.clone() },
            Event::BookingSubmitted {
                booking: booking.clone(),
            },
            Event::BookingStatusChanged {
                id: booking.id,
                room_id: room.id,
                status: Status::Approved,
                queue_position: None,
                log: promote.clone(),
            },
        ];

        let snap = fold_snapshot(&history);
        let mut approved = booking;
        approved.status = Status::Approved;
        approved.queue_position = None;
        assert_eq!(
            snap,
            vec![
                Event::RoomCreated { room },
                Event::BookingSubmitted { booking: approved },
                Event::LogAppended { log: promote },
            ]
        );
    }

    #[test]
    fn a_release_keeps_both_bookings_and_both_entries() {
        let a = admin();
        let room = Room {
            id: Ulid::new(),
            name: "LHC-2".into(),
            capacity: 40,
        };
        let held = RoomBooking {
            id: Ulid::new(),
            room_id: room.id,
            requester_id: a.user_id,
            span: Span::new(1_000, 2_000),
            purpose: None,
            status: Status::Approved,
            queue_position: None,
            created_at: 0,
        };
        let queued = RoomBooking {
            id: Ulid::new(),
            status: Status::Waitlisted,
            queue_position: Some(1),
            created_at: 1,
            ..held.clone()
        };
        let cancel = log(&a, AuditAction::Transition(Action::Cancel), EntityType::RoomBooking, held.id);
        let promote = log(&a, AuditAction::Promote, EntityType::RoomBooking, queued.id);
        let history = vec![
            Event::RoomCreated { room: room.clone() },
            Event::BookingSubmitted { booking: held.clone() },
            Event::BookingSubmitted { booking: queued.clone() },
            Event::BookingReleased {
                id: held.id,
                room_id: room.id,
                status: Status::Cancelled,
                log: cancel.clone(),
                promoted: queued.id,
                promote_log: promote.clone(),
            },
        ];

        let snap = fold_snapshot(&history);
        let cancelled = RoomBooking {
            status: Status::Cancelled,
            ..held
        };
        let approved = RoomBooking {
            status: Status::Approved,
            queue_position: None,
            ..queued
        };
        assert_eq!(
            snap,
            vec![
                Event::RoomCreated { room },
                Event::BookingSubmitted { booking: cancelled },
                Event::BookingSubmitted { booking: approved },
                Event::LogAppended { log: cancel },
                Event::LogAppended { log: promote },
            ]
        );
    }

    #[test]
    fn removed_resources_survive_as_retired() {
        let a = admin();
        let resource = Resource {
            id: Ulid::new(),
            name: "Projector".into(),
            quantity: 2,
            owner: Owner::Department(Ulid::new()),
        };
        let add = log(&a, AuditAction::AddResource, EntityType::Resource, resource.id);
        let remove = log(&a, AuditAction::RemoveResource, EntityType::Resource, resource.id);
        let history = vec![
            Event::ResourceCreated {
                resource: resource.clone(),
                log: add.clone(),
            },
            Event::ResourceRemoved {
                id: resource.id,
                log: remove.clone(),
            },
        ];
        let snap = fold_snapshot(&history);
        assert_eq!(
            snap,
            vec![
                Event::ResourceRestored {
                    resource,
                    retired: true
                },
                Event::LogAppended { log: add },
                Event::LogAppended { log: remove },
            ]
        );
    }

    #[test]
    fn folding_a_snapshot_is_stable() {
        let a = admin();
        let user = User {
            id: a.user_id,
            name: "Root".into(),
            email: "root@college.edu".into(),
            role: Role::Admin,
            department_id: None,
            club_id: None,
        };
        let entry = log(&a, AuditAction::Transition(Action::Cancel), EntityType::RoomBooking, Ulid::new());
        let history = vec![Event::UserRegistered { user }, Event::LogAppended { log: entry }];
        let once = fold_snapshot(&history);
        assert_eq!(fold_snapshot(&once), once);
    }
}
