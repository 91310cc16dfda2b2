//! Role-based access predicates.
//!
//! Pure functions over a [`Caller`]. Every predicate matches on [`Role`]
//! exhaustively, so adding a role fails to compile until each rule is
//! revisited.

use ulid::Ulid;

use crate::model::{Caller, Owner, Resource, Role};

pub fn is_admin(caller: &Caller) -> bool {
    caller.role == Role::Admin
}

/// Admin always; otherwise the club manager of a club-owned resource or the
/// lab technician of a department-owned resource.
pub fn can_approve_resource(caller: &Caller, resource: &Resource) -> bool {
    match caller.role {
        Role::Admin => true,
        Role::ClubManager => match resource.owner {
            Owner::Club(club) => caller.club_id == Some(club),
            Owner::Department(_) => false,
        },
        Role::LabTech => match resource.owner {
            Owner::Department(dept) => caller.department_id == Some(dept),
            Owner::Club(_) => false,
        },
        Role::Student | Role::Professor | Role::Lhc => false,
    }
}

pub fn can_approve_room(caller: &Caller) -> bool {
    match caller.role {
        Role::Lhc | Role::Admin => true,
        Role::Student | Role::Professor | Role::ClubManager | Role::LabTech => false,
    }
}

pub fn can_request_resource(caller: &Caller) -> bool {
    match caller.role {
        Role::Student | Role::Professor | Role::ClubManager | Role::Admin => true,
        Role::LabTech | Role::Lhc => false,
    }
}

/// Students cannot book rooms.
pub fn can_book_room(caller: &Caller) -> bool {
    match caller.role {
        Role::Professor | Role::ClubManager | Role::Admin => true,
        Role::Student | Role::LabTech | Role::Lhc => false,
    }
}

pub fn can_view_club_resources(caller: &Caller) -> bool {
    match caller.role {
        Role::Professor | Role::LabTech => false,
        Role::Student | Role::ClubManager | Role::Lhc | Role::Admin => true,
    }
}

pub fn can_manage_club_resources(caller: &Caller, club_id: Ulid) -> bool {
    match caller.role {
        Role::Admin => true,
        Role::ClubManager => caller.club_id == Some(club_id),
        Role::Student | Role::Professor | Role::LabTech | Role::Lhc => false,
    }
}

/// Adding or removing a resource: club stock by its manager (or admin),
/// department stock by admin only.
pub fn can_manage_resource(caller: &Caller, owner: &Owner) -> bool {
    match owner {
        Owner::Club(club) => can_manage_club_resources(caller, *club),
        Owner::Department(_) => is_admin(caller),
    }
}

/// Only the original requester or an admin may cancel.
pub fn can_cancel(caller: &Caller, requester_id: Ulid) -> bool {
    caller.user_id == requester_id || is_admin(caller)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_ROLES: [Role; 6] = [
        Role::Student,
        Role::Professor,
        Role::ClubManager,
        Role::LabTech,
        Role::Lhc,
        Role::Admin,
    ];

    fn caller(role: Role) -> Caller {
        Caller {
            user_id: Ulid::new(),
            role,
            department_id: None,
            club_id: None,
        }
    }

    fn resource(owner: Owner) -> Resource {
        Resource {
            id: Ulid::new(),
            name: "Oscilloscope".into(),
            quantity: 4,
            owner,
        }
    }

    #[test]
    fn admin_approves_everything() {
        let admin = caller(Role::Admin);
        assert!(can_approve_resource(&admin, &resource(Owner::Club(Ulid::new()))));
        assert!(can_approve_resource(&admin, &resource(Owner::Department(Ulid::new()))));
        assert!(can_approve_room(&admin));
        assert!(is_admin(&admin));
    }

    #[test]
    fn club_manager_approves_only_own_club() {
        let club = Ulid::new();
        let mut manager = caller(Role::ClubManager);
        manager.club_id = Some(club);

        assert!(can_approve_resource(&manager, &resource(Owner::Club(club))));
        assert!(!can_approve_resource(&manager, &resource(Owner::Club(Ulid::new()))));
        assert!(!can_approve_resource(&manager, &resource(Owner::Department(club))));
    }

    #[test]
    fn lab_tech_approves_only_own_department() {
        let dept = Ulid::new();
        let mut tech = caller(Role::LabTech);
        tech.department_id = Some(dept);

        assert!(can_approve_resource(&tech, &resource(Owner::Department(dept))));
        assert!(!can_approve_resource(&tech, &resource(Owner::Department(Ulid::new()))));
        assert!(!can_approve_resource(&tech, &resource(Owner::Club(dept))));
    }

    #[test]
    fn manager_without_club_cannot_approve() {
        let manager = caller(Role::ClubManager);
        assert!(!can_approve_resource(&manager, &resource(Owner::Club(Ulid::new()))));
    }

    #[test]
    fn room_approval_is_lhc_or_admin() {
        let allowed: Vec<Role> = ALL_ROLES
            .into_iter()
            .filter(|r| can_approve_room(&caller(*r)))
            .collect();
        assert_eq!(allowed, vec![Role::Lhc, Role::Admin]);
    }

    #[test]
    fn request_resource_roles() {
        let allowed: Vec<Role> = ALL_ROLES
            .into_iter()
            .filter(|r| can_request_resource(&caller(*r)))
            .collect();
        assert_eq!(
            allowed,
            vec![Role::Student, Role::Professor, Role::ClubManager, Role::Admin]
        );
    }

    #[test]
    fn book_room_excludes_students() {
        assert!(!can_book_room(&caller(Role::Student)));
        assert!(can_book_room(&caller(Role::Professor)));
        assert!(can_book_room(&caller(Role::ClubManager)));
        assert!(can_book_room(&caller(Role::Admin)));
        assert!(!can_book_room(&caller(Role::Lhc)));
        assert!(!can_book_room(&caller(Role::LabTech)));
    }

    #[test]
    fn club_visibility() {
        assert!(!can_view_club_resources(&caller(Role::Professor)));
        assert!(!can_view_club_resources(&caller(Role::LabTech)));
        assert!(can_view_club_resources(&caller(Role::Student)));
        assert!(can_view_club_resources(&caller(Role::Lhc)));
    }

    #[test]
    fn manage_resources() {
        let club = Ulid::new();
        let mut manager = caller(Role::ClubManager);
        manager.club_id = Some(club);

        assert!(can_manage_club_resources(&manager, club));
        assert!(!can_manage_club_resources(&manager, Ulid::new()));
        assert!(can_manage_resource(&manager, &Owner::Club(club)));
        assert!(!can_manage_resource(&manager, &Owner::Department(Ulid::new())));
        assert!(can_manage_resource(&caller(Role::Admin), &Owner::Department(Ulid::new())));
    }

    #[test]
    fn cancel_requires_ownership_or_admin() {
        let owner = caller(Role::Professor);
        assert!(can_cancel(&owner, owner.user_id));
        assert!(!can_cancel(&caller(Role::Professor), owner.user_id));
        assert!(!can_cancel(&caller(Role::Lhc), owner.user_id));
        assert!(can_cancel(&caller(Role::Admin), owner.user_id));
    }
}
