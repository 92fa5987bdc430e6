pub mod conditions;
pub mod router;
pub mod selection;

use thiserror::Error;

use crate::models::ConditionOperator;

pub use conditions::RouteContext;
pub use router::{DecisionKind, RoutingDecision, SmartRouter};

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("invalid regex '{pattern}': {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("{operator:?} needs numeric operands, got '{value}'")]
    NonNumeric {
        operator: ConditionOperator,
        value: String,
    },
    #[error("rule {0} has nothing to route to")]
    EmptyDestinations(String),
    #[error("unsupported condition value {0}")]
    InvalidValue(String),
}
