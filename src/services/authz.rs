use crate::error::ApiError;
use crate::models::auth::AuthenticatedUser;
use crate::models::user::Role;

/// What a request is trying to do. Handlers ask for a capability instead of
/// comparing role strings inline, so the role matrix lives in one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// School settings, member roles, deactivation.
    ManageSchool,
    /// Custom charges, belt-test fees, ledger access, payment collection.
    ManageBilling,
    /// Create/update member and family records.
    ManageMembers,
    /// Class schedule CRUD.
    ManageClasses,
    /// Check students in.
    RecordAttendance,
    /// Event CRUD and owner-initiated bulk registration.
    ManageEvents,
    /// Self-service event registration (own students / self).
    RegisterStudents,
    /// Post to the school feed.
    PostToFeed,
    /// Publish or retire announcements.
    ManageAnnouncements,
}

pub fn allows(role: Role, capability: Capability) -> bool {
    use Capability::*;
    match capability {
        ManageSchool | ManageBilling => matches!(role, Role::Owner),
        ManageMembers | ManageClasses | RecordAttendance | ManageEvents | ManageAnnouncements => {
            matches!(role, Role::Owner | Role::Admin)
        }
        RegisterStudents | PostToFeed => true,
    }
}

/// The single authorization gate: a typed decision, 403 on refusal.
pub fn require(user: &AuthenticatedUser, capability: Capability) -> Result<(), ApiError> {
    if allows(user.role, capability) {
        Ok(())
    } else {
        Err(ApiError::Forbidden("Insufficient permissions"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_has_every_capability() {
        for cap in [
            Capability::ManageSchool,
            Capability::ManageBilling,
            Capability::ManageMembers,
            Capability::ManageClasses,
            Capability::RecordAttendance,
            Capability::ManageEvents,
            Capability::RegisterStudents,
            Capability::PostToFeed,
            Capability::ManageAnnouncements,
        ] {
            assert!(allows(Role::Owner, cap), "{cap:?}");
        }
    }

    #[test]
    fn admin_runs_the_floor_but_not_the_books() {
        assert!(allows(Role::Admin, Capability::ManageClasses));
        assert!(allows(Role::Admin, Capability::RecordAttendance));
        assert!(allows(Role::Admin, Capability::ManageEvents));
        assert!(allows(Role::Admin, Capability::ManageMembers));
        assert!(!allows(Role::Admin, Capability::ManageBilling));
        assert!(!allows(Role::Admin, Capability::ManageSchool));
    }

    #[test]
    fn parents_and_students_can_register_and_post_only() {
        for role in [Role::Parent, Role::Student] {
            assert!(allows(role, Capability::RegisterStudents));
            assert!(allows(role, Capability::PostToFeed));
            assert!(!allows(role, Capability::ManageEvents));
            assert!(!allows(role, Capability::ManageBilling));
            assert!(!allows(role, Capability::RecordAttendance));
        }
    }
}
