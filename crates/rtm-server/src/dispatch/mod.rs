//! Message dispatch: registration tables, authorization, per-message scope
//! and the built-in message types.

pub mod authorizer;
pub mod dispatcher;
pub mod handlers;
pub mod registry;
pub mod scope;
pub mod validation;

pub use dispatcher::MessageDispatcher;
pub use registry::{
    AuthorizationPredicate, AuthorizerRegistry, HandlerError, HandlerRegistry, MessageHandler,
};
pub use scope::{ConnectionScope, RequestContext, ScopeSeed};
