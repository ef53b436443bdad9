//! Access control for AI-powered endpoints: tiered daily rate limits,
//! budget-bounded invitation reflinks, and an escalating IP blacklist, all
//! behind one facade.
//!
//! The usual wiring is [`access::AccessControl`] over a store, with
//! [`http::access_control_middleware`] guarding the AI routes and
//! [`http::admin_router`] mounted behind the application's admin auth.

pub mod abuse; // content classification feeding the blacklist
pub mod access; // the facade composing every gate
pub mod blacklist; // escalating IP violation tracking
pub mod cache; // TTL read cache with explicit invalidation
pub mod config; // runtime configuration
pub mod error; // error handling
pub mod http; // axum middleware and admin routes
pub mod identity; // caller identity extraction
pub mod observability; // log setup
pub mod rate_limit; // tiered daily rate limiting
pub mod reflink; // invitation tokens with budgets
pub mod store; // storage traits and the in-process store

pub use access::{AccessControl, AccessGrant, AccessRequest};
pub use config::AccessConfig;
pub use error::{Error, ErrorDetails};
pub use identity::{Identity, RequestIdentity};
pub use rate_limit::{RateLimitStatus, RateLimitTier};
pub use reflink::{AiFeature, Budget, Reflink};
pub use store::MemoryStore;
