use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::policy;

use super::availability::available_quantity;
use super::conflict::{now_ms, validate_span};
use super::transitions::audit_entry;
use super::{Engine, EngineError};

/// Fields a caller supplies for a resource request; everything else is
/// derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewResourceRequest {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub quantity: u32,
    pub start: Ms,
    pub end: Ms,
    pub roll_number: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRoomBooking {
    pub id: Ulid,
    pub room_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub purpose: Option<String>,
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::LimitExceeded(field));
    }
    Ok(())
}

fn check_optional_len(field: &'static str, value: &Option<String>, max: usize) -> Result<(), EngineError> {
    match value {
        Some(v) => check_len(field, v, max),
        None => Ok(()),
    }
}

fn validate_user(user: &User) -> Result<(), EngineError> {
    if user.name.trim().is_empty() {
        return Err(EngineError::Validation("name is required".into()));
    }
    check_len("name too long", &user.name, MAX_NAME_LEN)?;
    check_len("email too long", &user.email, MAX_EMAIL_LEN)?;
    if !user.email.contains('@') {
        return Err(EngineError::Validation(format!("invalid email: {}", user.email)));
    }
    Ok(())
}

/// Claim `id` in an id → owner index, or fail if any owner already has it.
/// Ids are global, so this is what stops the same id landing on two rooms
/// (or resources) whose locks are independent.
fn reserve_id(index: &DashMap<Ulid, Ulid>, id: Ulid, owner: Ulid) -> Result<(), EngineError> {
    match index.entry(id) {
        Entry::Occupied(_) => Err(EngineError::AlreadyExists(id)),
        Entry::Vacant(slot) => {
            slot.insert(owner);
            Ok(())
        }
    }
}

fn to_json(resource: &Resource) -> Option<String> {
    match serde_json::to_string(resource) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::warn!(resource_id = %resource.id, "could not serialize resource for audit: {e}");
            None
        }
    }
}

impl Engine {
    // ── Directory ─────────────────────────────────────────────

    /// Seed the first user. Only accepted while the directory is empty, and
    /// only for an ADMIN, so every later registration has someone to
    /// authorize it. Returns false (and changes nothing) once users exist.
    pub async fn bootstrap_admin(&self, user: User) -> Result<bool, EngineError> {
        let _directory = self.directory.lock().await;
        if !self.users.is_empty() {
            return Ok(false);
        }
        if user.role != Role::Admin {
            return Err(EngineError::Validation("the first user must be an ADMIN".into()));
        }
        validate_user(&user)?;
        let event = Event::UserRegistered { user: user.clone() };
        self.wal_append(&event).await?;
        tracing::info!(user_id = %user.id, "bootstrap admin registered");
        self.users.insert(user.id, user);
        Ok(true)
    }

    pub async fn register_user(&self, caller: &Caller, user: User) -> Result<User, EngineError> {
        if !policy::is_admin(caller) {
            return Err(EngineError::Forbidden("only an admin may register users"));
        }
        validate_user(&user)?;
        let _directory = self.directory.lock().await;
        if self.users.contains_key(&user.id) {
            return Err(EngineError::AlreadyExists(user.id));
        }
        if self.users.iter().any(|u| u.email.eq_ignore_ascii_case(&user.email)) {
            return Err(EngineError::Validation(format!("email already registered: {}", user.email)));
        }
        self.wal_append(&Event::UserRegistered { user: user.clone() })
            .await?;
        self.users.insert(user.id, user.clone());
        tracing::info!(user_id = %user.id, role = user.role.as_str(), "user registered");
        Ok(user)
    }

    /// The policy identity for a user id.
    pub fn caller_for(&self, user_id: Ulid) -> Result<Caller, EngineError> {
        self.users
            .get(&user_id)
            .map(|u| u.caller())
            .ok_or(EngineError::UnknownUser(user_id))
    }

    // ── Inventory ─────────────────────────────────────────────

    pub async fn create_room(&self, caller: &Caller, room: Room) -> Result<Room, EngineError> {
        if !policy::is_admin(caller) {
            return Err(EngineError::Forbidden("only an admin may create rooms"));
        }
        check_len("name too long", &room.name, MAX_NAME_LEN)?;
        let _directory = self.directory.lock().await;
        if self.rooms.contains_key(&room.id) {
            return Err(EngineError::AlreadyExists(room.id));
        }
        self.wal_append(&Event::RoomCreated { room: room.clone() }).await?;
        self.rooms
            .insert(room.id, Arc::new(RwLock::new(RoomState::new(room.clone()))));
        tracing::info!(room_id = %room.id, name = %room.name, "room created");
        Ok(room)
    }

    /// Add a resource to the catalogue. Club stock is managed by its club
    /// manager, department stock by an admin. Audited as ADD_RESOURCE.
    pub async fn create_resource(&self, caller: &Caller, resource: Resource) -> Result<Resource, EngineError> {
        if !policy::can_manage_resource(caller, &resource.owner) {
            return Err(EngineError::Forbidden("role may not manage this resource"));
        }
        check_len("name too long", &resource.name, MAX_NAME_LEN)?;
        if resource.name.trim().is_empty() {
            return Err(EngineError::Validation("name is required".into()));
        }
        let _directory = self.directory.lock().await;
        if self.resources.contains_key(&resource.id) {
            return Err(EngineError::AlreadyExists(resource.id));
        }
        let log = audit_entry(
            caller,
            AuditAction::AddResource,
            EntityType::Resource,
            resource.id,
            None,
            to_json(&resource),
        );
        let event = Event::ResourceCreated {
            resource: resource.clone(),
            log,
        };
        self.wal_append(&event).await?;
        self.resources.insert(
            resource.id,
            Arc::new(RwLock::new(ResourceState::new(resource.clone()))),
        );
        self.record_log(&event).await;
        tracing::info!(resource_id = %resource.id, owner = resource.owner.type_str(), "resource created");
        Ok(resource)
    }

    /// Retire a resource. Refused while any request against it is still
    /// PENDING, APPROVED or WAITLISTED. Audited as REMOVE_RESOURCE.
    pub async fn remove_resource(&self, caller: &Caller, id: Ulid) -> Result<Resource, EngineError> {
        let rs = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;
        if guard.retired {
            return Err(EngineError::NotFound(id));
        }
        if !policy::can_manage_resource(caller, &guard.resource.owner) {
            return Err(EngineError::Forbidden("role may not manage this resource"));
        }
        let live = guard
            .requests
            .entries
            .iter()
            .filter(|r| matches!(r.status, Status::Pending | Status::Approved | Status::Waitlisted))
            .count();
        if live > 0 {
            return Err(EngineError::Validation(format!(
                "resource has {live} open request(s)"
            )));
        }
        let log = audit_entry(
            caller,
            AuditAction::RemoveResource,
            EntityType::Resource,
            id,
            to_json(&guard.resource),
            None,
        );
        self.persist_resource(&mut guard, Event::ResourceRemoved { id, log })
            .await?;
        tracing::info!(resource_id = %id, "resource removed");
        Ok(guard.resource.clone())
    }

    // ── Intake ────────────────────────────────────────────────

    /// Validate and admit a resource request as PENDING. The availability
    /// check and the write happen under the resource's write lock, so two
    /// concurrent requests can never both pass against the same stock.
    pub async fn submit_resource_request(
        &self,
        caller: &Caller,
        new: NewResourceRequest,
    ) -> Result<ResourceRequest, EngineError> {
        let result = self.submit_resource_request_inner(caller, new).await;
        if let Err(e) = &result {
            metrics::counter!(
                crate::observability::INTAKE_REJECTIONS_TOTAL,
                "entity" => EntityType::ResourceRequest.as_str(),
                "class" => e.class().as_str()
            )
            .increment(1);
        }
        result
    }

    async fn submit_resource_request_inner(
        &self,
        caller: &Caller,
        new: NewResourceRequest,
    ) -> Result<ResourceRequest, EngineError> {
        if !policy::can_request_resource(caller) {
            return Err(EngineError::Forbidden("role may not request resources"));
        }
        if new.quantity == 0 {
            return Err(EngineError::Validation("quantity must be positive".into()));
        }
        if new.quantity > MAX_REQUEST_QUANTITY {
            return Err(EngineError::LimitExceeded("quantity too large"));
        }
        let span = validate_span(new.start, new.end)?;
        let roll_number = new.roll_number.filter(|r| !r.trim().is_empty());
        if caller.role == Role::Student && roll_number.is_none() {
            return Err(EngineError::Validation("roll number is required for students".into()));
        }
        check_optional_len("roll number too long", &roll_number, MAX_ROLL_NUMBER_LEN)?;
        check_optional_len("reason too long", &new.reason, MAX_REASON_LEN)?;

        let rs = self
            .get_resource(&new.resource_id)
            .ok_or(EngineError::NotFound(new.resource_id))?;
        let mut guard = rs.write().await;
        if guard.retired {
            return Err(EngineError::NotFound(new.resource_id));
        }
        if self.request_resources.contains_key(&new.id) {
            return Err(EngineError::AlreadyExists(new.id));
        }
        if guard.requests.len() >= MAX_ENTRIES_PER_TIMELINE {
            return Err(EngineError::LimitExceeded("too many requests on resource"));
        }

        let available = available_quantity(&guard, &span, None);
        if new.quantity > available {
            tracing::debug!(
                resource_id = %new.resource_id,
                requested = new.quantity,
                available,
                "request exceeds available stock"
            );
            return Err(EngineError::InsufficientQuantity { available });
        }

        let request = ResourceRequest {
            id: new.id,
            resource_id: new.resource_id,
            requester_id: caller.user_id,
            quantity: new.quantity,
            span,
            status: Status::Pending,
            roll_number,
            reason: new.reason,
            created_at: now_ms(),
        };
        reserve_id(&self.request_resources, request.id, request.resource_id)?;
        if let Err(e) = self
            .persist_resource(&mut guard, Event::RequestSubmitted { request: request.clone() })
            .await
        {
            self.request_resources.remove(&request.id);
            return Err(e);
        }
        tracing::debug!(request_id = %request.id, resource_id = %request.resource_id, "request submitted");
        Ok(request)
    }

    /// Validate a room booking and hand it to waitlist admission, which
    /// decides PENDING or WAITLISTED.
    pub async fn submit_room_booking(
        &self,
        caller: &Caller,
        new: NewRoomBooking,
    ) -> Result<RoomBooking, EngineError> {
        let result = self.submit_room_booking_inner(caller, new).await;
        if let Err(e) = &result {
            metrics::counter!(
                crate::observability::INTAKE_REJECTIONS_TOTAL,
                "entity" => EntityType::RoomBooking.as_str(),
                "class" => e.class().as_str()
            )
            .increment(1);
        }
        result
    }

    async fn submit_room_booking_inner(
        &self,
        caller: &Caller,
        new: NewRoomBooking,
    ) -> Result<RoomBooking, EngineError> {
        if !policy::can_book_room(caller) {
            return Err(EngineError::Forbidden("role may not book rooms"));
        }
        let span = validate_span(new.start, new.end)?;
        check_optional_len("purpose too long", &new.purpose, MAX_PURPOSE_LEN)?;

        let rs = self.get_room(&new.room_id).ok_or(EngineError::NotFound(new.room_id))?;
        let mut guard = rs.write().await;
        if guard.bookings.len() >= MAX_ENTRIES_PER_TIMELINE {
            return Err(EngineError::LimitExceeded("too many bookings on room"));
        }
        let id = new.id;
        reserve_id(&self.booking_rooms, id, new.room_id)?;

        let booking = RoomBooking {
            id: new.id,
            room_id: new.room_id,
            requester_id: caller.user_id,
            span,
            purpose: new.purpose,
            status: Status::Pending,
            queue_position: None,
            created_at: now_ms(),
        };
        let admitted = self.admit_locked(&mut guard, booking).await;
        if admitted.is_err() {
            self.booking_rooms.remove(&id);
        }
        admitted
    }
}
