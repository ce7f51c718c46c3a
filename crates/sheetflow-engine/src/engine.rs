//! Query execution orchestrator.
//!
//! Plans folding, enforces the privacy firewall before any fetch, loads
//! the source, runs the residual steps in order, and optionally streams
//! row batches. Every suspension point (source load, step boundary,
//! batch emission) checks the cancel token.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value as Json;
use sheetflow_common::table::{RowStream, TableStream};
use sheetflow_common::{CancelToken, FlowError, Table};
use sheetflow_parse::query::{Query, SourceSpec, Step};
use tracing::debug;

use crate::cache::{CacheManager, cache_key, source_signature};
use crate::cron::CronSchedule;
use crate::firewall::{PrivacyConfig, check_compatibility, collect_source_ids};
use crate::folding::{FoldPlan, plan_folding};
use crate::ops::{RightTableResolver, apply_operation};
use crate::source::{Adapters, LoadHints, load_source};

/* ─────────────────────────────── context ──────────────────────────── */

/// Everything a query needs at execution time: the query map for
/// references, the adapter seams, privacy levels, and the cache.
#[derive(Default)]
pub struct ExecutionContext {
    pub queries: FxHashMap<String, Query>,
    pub adapters: Adapters,
    pub privacy: PrivacyConfig,
    pub cache: Option<CacheManager>,
    /// Caller-defined signature mixed into cache keys (credentials
    /// scope, locale, anything that changes results).
    pub context_signature: Json,
}

impl ExecutionContext {
    pub fn add_query(&mut self, query: Query) {
        self.queries.insert(query.id.clone(), query);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Fold,
    Load,
    Step,
    Stream,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineProgress {
    pub phase: EnginePhase,
    pub processed: usize,
    pub total: Option<usize>,
}

type ProgressFn<'a> = dyn Fn(EngineProgress) + 'a;

#[derive(Default)]
pub struct ExecuteOptions<'a> {
    pub cancel: CancelToken,
    pub progress: Option<&'a ProgressFn<'a>>,
    /// Bypass the cache even when configured.
    pub no_cache: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionMeta {
    pub folded_steps: usize,
    pub folded_request: Option<String>,
    pub cache_hit: bool,
    pub row_count: usize,
    pub steps_run: usize,
}

pub struct StreamOptions<'a> {
    pub batch_size: usize,
    /// When false the engine drops rows after each callback and the
    /// returned table is empty.
    pub materialize: bool,
    pub on_batch: &'a mut dyn FnMut(&[Vec<sheetflow_common::Value>]) -> Result<(), FlowError>,
}

/* ─────────────────────────────── engine ───────────────────────────── */

#[derive(Default)]
pub struct QueryEngine;

impl QueryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn execute_query(
        &self,
        query: &Query,
        ctx: &ExecutionContext,
        opts: &ExecuteOptions<'_>,
    ) -> Result<Table, FlowError> {
        self.execute_query_with_meta(query, ctx, opts)
            .map(|(table, _)| table)
    }

    pub fn execute_query_with_meta(
        &self,
        query: &Query,
        ctx: &ExecutionContext,
        opts: &ExecuteOptions<'_>,
    ) -> Result<(Table, ExecutionMeta), FlowError> {
        let mut visiting = FxHashSet::default();
        self.execute_inner(query, ctx, opts, &mut visiting)
    }

    /// Streaming execution: the full pipeline runs, then rows surface
    /// in `batch_size` chunks with a cancel check between batches.
    pub fn execute_query_streaming(
        &self,
        query: &Query,
        ctx: &ExecutionContext,
        opts: &ExecuteOptions<'_>,
        stream: &mut StreamOptions<'_>,
    ) -> Result<Table, FlowError> {
        let (table, _) = self.execute_query_with_meta(query, ctx, opts)?;
        let total = table.row_count();
        let table = Arc::new(table);
        let mut rows = TableStream::new(Arc::clone(&table), stream.batch_size);
        let mut processed = 0usize;
        while let Some(batch) = rows.next_batch() {
            // Batch emission is a suspension point.
            opts.cancel.check()?;
            (stream.on_batch)(&batch)?;
            processed += batch.len();
            emit(opts, EnginePhase::Stream, processed, Some(total));
        }
        if stream.materialize {
            Ok((*table).clone())
        } else {
            Ok(table.head(0))
        }
    }

    /// Next refresh instant for a query carrying a cron schedule.
    pub fn next_refresh(
        &self,
        query: &Query,
        after: chrono::NaiveDateTime,
    ) -> Result<Option<chrono::NaiveDateTime>, FlowError> {
        match &query.refresh {
            None => Ok(None),
            Some(expr) => CronSchedule::parse(expr)?.next_run(after).map(Some),
        }
    }

    fn execute_inner(
        &self,
        query: &Query,
        ctx: &ExecutionContext,
        opts: &ExecuteOptions<'_>,
        visiting: &mut FxHashSet<String>,
    ) -> Result<(Table, ExecutionMeta), FlowError> {
        opts.cancel.check()?;
        if !visiting.insert(query.id.clone()) {
            return Err(FlowError::invalid_argument(
                "query",
                format!("query '{}' references itself", query.id),
            ));
        }

        // Privacy is checked before anything is fetched.
        let source_ids = collect_source_ids(query, &ctx.queries);
        check_compatibility(&source_ids, &ctx.privacy)?;

        let plan = plan_folding(&query.source, &query.steps);
        emit(opts, EnginePhase::Fold, plan.folded_steps, None);
        debug!(
            query = %query.id,
            folded = plan.folded_steps,
            request = plan.folded_request.as_deref().unwrap_or(""),
            "planned folding"
        );

        let mut meta = ExecutionMeta {
            folded_steps: plan.folded_steps,
            folded_request: plan.folded_request.clone(),
            ..ExecutionMeta::default()
        };

        let key = if opts.no_cache {
            None
        } else {
            ctx.cache.as_ref().and_then(|_| {
                let sig = source_signature(&plan.source, &ctx.adapters)?;
                cache_key(
                    query,
                    &sig,
                    &ctx.context_signature,
                    plan.folded_request.as_deref(),
                )
            })
        };

        let table = match (&ctx.cache, key) {
            (Some(cache), Some(key)) => {
                let (table, hit) = cache.get_or_build(&key, || {
                    self.run_pipeline(query, &plan, ctx, opts, visiting)
                })?;
                meta.cache_hit = hit;
                (*table).clone()
            }
            _ => self.run_pipeline(query, &plan, ctx, opts, visiting)?,
        };

        visiting.remove(&query.id);
        meta.row_count = table.row_count();
        meta.steps_run = plan.residual.len();
        Ok((table, meta))
    }

    fn run_pipeline(
        &self,
        query: &Query,
        plan: &FoldPlan,
        ctx: &ExecutionContext,
        opts: &ExecuteOptions<'_>,
        visiting: &mut FxHashSet<String>,
    ) -> Result<Table, FlowError> {
        let mut table = self.load(&plan.source, &plan.hints, ctx, opts, visiting)?;
        emit(opts, EnginePhase::Load, table.row_count(), None);

        let total = plan.residual.len();
        for (i, step) in plan.residual.iter().enumerate() {
            // Step boundary is a suspension point.
            opts.cancel.check()?;
            let mut resolver = ContextResolver {
                engine: self,
                ctx,
                opts,
                visiting,
            };
            table = apply_operation(table, &step.operation, &mut resolver).map_err(|e| {
                match step.name.as_deref() {
                    Some(name) if e.message.is_some() => {
                        let msg = format!("step '{name}': {}", e.message.clone().unwrap_or_default());
                        FlowError { message: Some(msg), ..e }
                    }
                    _ => e,
                }
            })?;
            emit(opts, EnginePhase::Step, i + 1, Some(total));
        }
        Ok(table)
    }

    fn load(
        &self,
        source: &SourceSpec,
        hints: &LoadHints,
        ctx: &ExecutionContext,
        opts: &ExecuteOptions<'_>,
        visiting: &mut FxHashSet<String>,
    ) -> Result<Table, FlowError> {
        if let SourceSpec::QueryRef { id } = source {
            let referenced = ctx.queries.get(id).ok_or_else(|| {
                FlowError::invalid_argument("source", format!("no query '{id}' in context"))
            })?;
            return self
                .execute_inner(referenced, ctx, opts, visiting)
                .map(|(t, _)| t);
        }
        load_source(source, &ctx.adapters, hints, &opts.cancel)
    }
}

/// Resolves `merge`/`append` references by executing the referenced
/// query through the same engine, sharing the abort token and the
/// visiting set.
struct ContextResolver<'a, 'b> {
    engine: &'a QueryEngine,
    ctx: &'a ExecutionContext,
    opts: &'a ExecuteOptions<'b>,
    visiting: &'a mut FxHashSet<String>,
}

impl RightTableResolver for ContextResolver<'_, '_> {
    fn resolve(&mut self, id: &str) -> Result<Table, FlowError> {
        let query = self.ctx.queries.get(id).ok_or_else(|| {
            FlowError::invalid_argument("query", format!("no query '{id}' in context"))
        })?;
        self.engine
            .execute_inner(query, self.ctx, self.opts, self.visiting)
            .map(|(t, _)| t)
    }
}

fn emit(opts: &ExecuteOptions<'_>, phase: EnginePhase, processed: usize, total: Option<usize>) {
    if let Some(progress) = opts.progress {
        progress(EngineProgress {
            phase,
            processed,
            total,
        });
    }
}

/// Execute a list of queries against one context (convenience used by
/// hosts that refresh a whole workbook).
pub fn execute_all(
    engine: &QueryEngine,
    ctx: &ExecutionContext,
    ids: &[String],
    opts: &ExecuteOptions<'_>,
) -> Result<FxHashMap<String, Table>, FlowError> {
    let mut out = FxHashMap::default();
    for id in ids {
        let query = ctx
            .queries
            .get(id)
            .ok_or_else(|| FlowError::invalid_argument("query", format!("no query '{id}'")))?;
        let table = engine.execute_query(query, ctx, opts)?;
        out.insert(id.clone(), table);
    }
    Ok(out)
}
