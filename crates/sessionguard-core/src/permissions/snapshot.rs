use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::PermissionFetchError;

/// Landing page for customers
const CUSTOMER_DASHBOARD: &str = "/dashboard";

/// Landing page for staff (underwriters and managers)
const STAFF_DASHBOARD: &str = "/admin-dashboard";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum Role {
    Customer,
    Underwriter,
    Manager,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Underwriter => "underwriter",
            Role::Manager => "manager",
        }
    }

    pub fn is_staff(&self) -> bool {
        matches!(self, Role::Underwriter | Role::Manager)
    }

    /// Landing page used when the backend does not name one.
    pub fn default_dashboard_route(&self) -> &'static str {
        if self.is_staff() {
            STAFF_DASHBOARD
        } else {
            CUSTOMER_DASHBOARD
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of what the authenticated identity may do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct PermissionSnapshot {
    pub role: Role,
    pub capabilities: BTreeMap<String, bool>,
    pub dashboard_route: String,
}

impl PermissionSnapshot {
    /// Unknown capabilities are `false`.
    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.get(name).copied().unwrap_or(false)
    }

    /// Parse the permissions endpoint body.
    ///
    /// Accepts `{role, capabilities, dashboard_route}` as well as the older
    /// `{user: {user_type}, permissions, dashboard_route}` layout.
    pub fn from_json(body: &Value) -> Result<Self, PermissionFetchError> {
        let response: PermissionsResponse = serde_json::from_value(body.clone())
            .map_err(|e| PermissionFetchError::Malformed(e.to_string()))?;

        let role = response
            .role
            .or(response.user.map(|u| u.user_type))
            .ok_or_else(|| PermissionFetchError::Malformed("missing role".to_string()))?;

        let capabilities = response
            .capabilities
            .unwrap_or_default()
            .into_iter()
            .map(|(name, value)| (name, is_truthy(&value)))
            .collect();

        let dashboard_route = response
            .dashboard_route
            .filter(|route| !route.is_empty())
            .unwrap_or_else(|| role.default_dashboard_route().to_string());

        Ok(Self {
            role,
            capabilities,
            dashboard_route,
        })
    }
}

#[derive(Debug, Deserialize)]
struct PermissionsResponse {
    #[serde(default)]
    role: Option<Role>,
    #[serde(default)]
    user: Option<UserSummary>,
    #[serde(default, alias = "permissions")]
    capabilities: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    dashboard_route: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserSummary {
    user_type: Role,
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_role_capabilities_shape() {
        let body = json!({
            "role": "underwriter",
            "capabilities": {"can_quote_policies": true, "can_approve_claims": false},
            "dashboard_route": "/admin-dashboard"
        });
        let snapshot = PermissionSnapshot::from_json(&body).unwrap();
        assert_eq!(snapshot.role, Role::Underwriter);
        assert!(snapshot.has_capability("can_quote_policies"));
        assert!(!snapshot.has_capability("can_approve_claims"));
        assert!(!snapshot.has_capability("unknown"));
        assert_eq!(snapshot.dashboard_route, "/admin-dashboard");
    }

    #[test]
    fn test_parse_user_permissions_shape() {
        let body = json!({
            "user": {"id": 4, "email": "c@example.com", "user_type": "customer", "is_active": true},
            "permissions": {
                "can_view_dashboard": true,
                "can_submit_claims": true,
                "can_approve_claims": false,
                "needs_profile_setup": true
            },
            "customer_profile": null,
            "dashboard_route": "/dashboard"
        });
        let snapshot = PermissionSnapshot::from_json(&body).unwrap();
        assert_eq!(snapshot.role, Role::Customer);
        assert!(snapshot.has_capability("can_submit_claims"));
        assert!(snapshot.has_capability("needs_profile_setup"));
        assert!(!snapshot.has_capability("can_approve_claims"));
    }

    #[test]
    fn test_missing_dashboard_route_falls_back_by_role() {
        let customer = PermissionSnapshot::from_json(&json!({"role": "customer"})).unwrap();
        assert_eq!(customer.dashboard_route, "/dashboard");
        assert!(customer.capabilities.is_empty());

        let manager = PermissionSnapshot::from_json(&json!({"role": "manager", "dashboard_route": ""})).unwrap();
        assert_eq!(manager.dashboard_route, "/admin-dashboard");
    }

    #[test]
    fn test_non_boolean_capabilities_use_truthiness() {
        let body = json!({
            "role": "manager",
            "capabilities": {"a": 1, "b": 0, "c": "yes", "d": "", "e": null}
        });
        let snapshot = PermissionSnapshot::from_json(&body).unwrap();
        assert!(snapshot.has_capability("a"));
        assert!(!snapshot.has_capability("b"));
        assert!(snapshot.has_capability("c"));
        assert!(!snapshot.has_capability("d"));
        assert!(!snapshot.has_capability("e"));
    }

    #[test]
    fn test_malformed_bodies() {
        for body in [
            json!({"capabilities": {}}),
            json!({"role": "admin"}),
            json!("customer"),
        ] {
            let err = PermissionSnapshot::from_json(&body).unwrap_err();
            assert!(matches!(err, PermissionFetchError::Malformed(_)), "{:?}", body);
        }
    }

    #[test]
    fn test_role_helpers() {
        assert!(Role::Manager.is_staff());
        assert!(!Role::Customer.is_staff());
        assert_eq!(Role::Underwriter.to_string(), "underwriter");
    }
}
