pub mod engine;
pub mod objects;
pub mod routes;
pub mod transport;
pub mod urls;

pub use engine::Engine;
pub use objects::{
    Authorization, AuthorizationStatus, Challenge, ChallengeKind, ChallengeStatus,
    ChallengeValidator, Identifier, Order, OrderStatus, Registration, Requirement,
};
pub use routes::routes;
pub use transport::VerifiedRequest;
