pub mod cache;
pub mod cron;
pub mod engine;
pub mod firewall;
pub mod folding;
pub mod interp;
pub mod ops;
pub mod source;

pub use cache::{CacheManager, CacheStore, MemoryCacheStore, cache_key, source_signature};
pub use cron::CronSchedule;
pub use engine::{
    EnginePhase, EngineProgress, ExecuteOptions, ExecutionContext, ExecutionMeta, QueryEngine,
    StreamOptions, execute_all,
};
pub use firewall::{PrivacyConfig, PrivacyLevel, check_compatibility, collect_source_ids, source_id};
pub use folding::{FoldPlan, compute_parquet_projection_columns, compute_parquet_row_limit, plan_folding};
pub use interp::{RowCtx, evaluate};
pub use ops::{NoQueries, RightTableResolver, apply_operation, eval_predicate};
pub use source::odata::{ODataConnector, ODataQuery, compose_url};
pub use source::{
    Adapters, ApiAdapter, ApiRequest, Connector, ConnectorMeta, ConnectorRegistry,
    ConnectorResult, DatabaseAdapter, FileAdapter, FileEntry, FileStat, LoadHints, SourceState,
    TableAdapter, load_source,
};

// Re-export for convenience
pub use sheetflow_common::{CancelToken, FlowError, FlowErrorKind, Table, Value};
pub use sheetflow_parse::query::{Operation, Query, SourceSpec, Step};
