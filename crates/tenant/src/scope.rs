//! Validation of the scope string format `<namespace>.<Resource>.<ACTION>`.

const ALLOWED_ACTIONS: &[&str] = &["READ", "CREATE", "UPDATE", "DELETE", "ALL"];

/// Checks a scope against `^<NS>\.[A-Za-z]+\.(READ|CREATE|UPDATE|DELETE|ALL)$`.
pub fn is_valid_scope(scope: &str) -> bool {
    let parts: Vec<&str> = scope.split('.').collect();
    let [namespace, resource, action] = parts.as_slice() else { return false };

    !namespace.is_empty()
        && namespace.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        && !resource.is_empty()
        && resource.chars().all(|c| c.is_ascii_alphabetic())
        && ALLOWED_ACTIONS.contains(action)
}

/// Admin wildcard that satisfies any scope check.
pub const WILDCARD_SCOPE: &str = "*";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_scopes() {
        assert!(is_valid_scope("incidents.Ticket.READ"));
        assert!(is_valid_scope("changes.Request.ALL"));
    }

    #[test]
    fn rejects_bad_action() {
        assert!(!is_valid_scope("incidents.Ticket.LIST"));
    }

    #[test]
    fn rejects_missing_segments() {
        assert!(!is_valid_scope("incidents.READ"));
        assert!(!is_valid_scope("incidents.Ticket.READ.extra"));
    }

    #[test]
    fn rejects_numeric_resource_segment() {
        assert!(!is_valid_scope("incidents.Ticket2.READ"));
    }
}
