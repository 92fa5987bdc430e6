pub mod click;
pub mod offer;
pub mod request;
pub mod rules;
pub mod status;

pub use click::{new_event_id, ClickMeta, EdgeClickEvent, QueuedClick};
pub use offer::{
    AbTestConfig, ConditionKind, ConditionOperator, Destination, OfferConfig, OfferStatus,
    RotationConfig, RotationMode, RoutingAction, RoutingCondition, RoutingRule, Variant,
};
pub use request::EdgeRequest;
pub use rules::{DeviceRule, DeviceType, GeoRule, RuleMode, RuleScope, RuleStatus, ScopedRule};
pub use status::{BackendHealthStatus, TenantState, TenantStatus};
