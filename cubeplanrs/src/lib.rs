pub mod cache;
pub mod config;
pub mod dialect;
pub mod error;
pub mod join_graph;
pub mod logging;
pub mod models;
pub mod params;
pub mod pre_aggregations;
pub mod query_builder;
pub mod registry;
pub mod request;
pub mod sql_ast;
pub mod template;
pub mod time;

pub use cache::CompilerCache;
pub use config::CompilerConfig;
pub use dialect::{dialect_for, Dialect};
pub use error::{CubePlanError, Result as CubePlanResult};
pub use models::{CubeDefinition, PreAggregationDefinition, PreAggregationType};
pub use pre_aggregations::{CanonicalQuery, PreAggregationDescription, SqlAndParams};
pub use query_builder::{CompiledQuery, OrderMember, QueryCompiler};
pub use registry::CubeRegistry;
pub use request::{DateRangeSpec, FilterOperator, FilterSpec, QuerySpec, TimeDimensionSpec};
