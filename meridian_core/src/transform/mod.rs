//! Transform engine: compiles declarative field-mapping expressions and
//! evaluates them against raw vendor records on a dedicated CPU pool,
//! producing candidate entities plus pass/fail selector results.

pub mod engine;
pub mod expression;
pub mod models;

pub use engine::{TransformEngine, TransformResult};
pub use expression::{CompiledExpression, ExpressionCache};
pub use models::{EntityMappings, MappedEntity, Mapping, ResourceConfig, Selector};
