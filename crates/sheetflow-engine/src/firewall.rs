//! Privacy firewall.
//!
//! Every source gets a stable id derived from its kind and identity.
//! Before the engine fetches anything, the step graph's sources are
//! collected (transitively through query references, merges and
//! appends) and checked for level compatibility; a violation rejects
//! the whole query with `Formula.Firewall` before the first fetch.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use sheetflow_common::FlowError;
use sheetflow_parse::query::{Query, SourceSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivacyLevel {
    Public,
    Organizational,
    Private,
}

#[derive(Debug, Clone, Default)]
pub struct PrivacyConfig {
    pub levels_by_source_id: FxHashMap<String, PrivacyLevel>,
}

impl PrivacyConfig {
    pub fn with_level(mut self, source_id: impl Into<String>, level: PrivacyLevel) -> Self {
        self.levels_by_source_id.insert(source_id.into(), level);
        self
    }
}

/// Stable identity for a source: kind prefix plus the identity that
/// survives folding (a folded database query keeps the connection id;
/// a folded OData URL keeps origin+path).
pub fn source_id(spec: &SourceSpec) -> String {
    match spec {
        SourceSpec::Range { .. } => "range:inline".to_string(),
        SourceSpec::Table { name, .. } => format!("table:{name}"),
        SourceSpec::Csv { path, .. } => format!("file:{path}"),
        SourceSpec::Json { path } => format!("file:{path}"),
        SourceSpec::Parquet { path } => format!("file:{path}"),
        SourceSpec::Folder { path, .. } => format!("file:{path}"),
        SourceSpec::Database { connection, .. } => format!("db:{connection}"),
        SourceSpec::Api { url, .. } => format!("http:{}", strip_query(url)),
        SourceSpec::OData { url } => format!("http:{}", strip_query(url)),
        SourceSpec::QueryRef { id } => format!("query:{id}"),
    }
}

fn strip_query(url: &str) -> &str {
    url.split_once('?').map(|(base, _)| base).unwrap_or(url)
}

/// All concrete source ids a query touches, resolved transitively
/// through the context's query map. Unresolvable references keep their
/// `query:` id so the check stays conservative.
pub fn collect_source_ids(query: &Query, queries: &FxHashMap<String, Query>) -> Vec<String> {
    let mut out = Vec::new();
    let mut visiting = FxHashSet::default();
    collect_inner(query, queries, &mut visiting, &mut out);
    out
}

fn collect_inner(
    query: &Query,
    queries: &FxHashMap<String, Query>,
    visiting: &mut FxHashSet<String>,
    out: &mut Vec<String>,
) {
    if !visiting.insert(query.id.clone()) {
        return;
    }
    let mut note_source = |spec: &SourceSpec,
                           visiting: &mut FxHashSet<String>,
                           out: &mut Vec<String>| {
        if let SourceSpec::QueryRef { id } = spec {
            match queries.get(id) {
                Some(q) => collect_inner(q, queries, visiting, out),
                None => out.push(format!("query:{id}")),
            }
        } else {
            let id = source_id(spec);
            if !out.contains(&id) {
                out.push(id);
            }
        }
    };
    note_source(&query.source, visiting, out);
    for step in &query.steps {
        for id in step.operation.referenced_queries() {
            match queries.get(id) {
                Some(q) => collect_inner(q, queries, visiting, out),
                None => out.push(format!("query:{id}")),
            }
        }
    }
}

/// `Private` combines only with `Private`; `Organizational` combines
/// with `Organizational` and `Public`. Sources with no declared level
/// do not restrict.
pub fn check_compatibility(
    source_ids: &[String],
    config: &PrivacyConfig,
) -> Result<(), FlowError> {
    let leveled: Vec<(&String, PrivacyLevel)> = source_ids
        .iter()
        .filter_map(|id| config.levels_by_source_id.get(id).map(|l| (id, *l)))
        .collect();
    if leveled.len() < 2 {
        return Ok(());
    }
    let has_private = leveled.iter().any(|(_, l)| *l == PrivacyLevel::Private);
    let has_other = leveled.iter().any(|(_, l)| *l != PrivacyLevel::Private);
    if has_private && has_other {
        let offending: Vec<String> = leveled.iter().map(|(id, _)| (*id).clone()).collect();
        return Err(FlowError::firewall(offending));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheetflow_parse::query::Operation;

    #[test]
    fn source_ids_are_stable_and_query_free() {
        assert_eq!(
            source_id(&SourceSpec::OData {
                url: "https://h/feed?$top=5".into()
            }),
            "http:https://h/feed"
        );
        assert_eq!(
            source_id(&SourceSpec::Csv {
                path: "/data/a.csv".into(),
                has_headers: true
            }),
            "file:/data/a.csv"
        );
    }

    #[test]
    fn private_and_public_mix_is_rejected_before_fetch() {
        let mut queries = FxHashMap::default();
        queries.insert(
            "rates".to_string(),
            Query::new(
                "rates",
                "rates",
                SourceSpec::Api {
                    url: "https://api/rates".into(),
                    method: None,
                    headers: Vec::new(),
                },
            ),
        );
        let query = Query::new(
            "q",
            "q",
            SourceSpec::Csv {
                path: "/secret/payroll.csv".into(),
                has_headers: true,
            },
        )
        .with_step(Operation::Merge {
            left_keys: vec!["k".into()],
            right_query: "rates".into(),
            right_keys: vec!["k".into()],
            join_type: Default::default(),
            join_mode: Default::default(),
            new_column_name: None,
            comparers: None,
            join_algorithm: Default::default(),
        });

        let config = PrivacyConfig::default()
            .with_level("file:/secret/payroll.csv", PrivacyLevel::Private)
            .with_level("http:https://api/rates", PrivacyLevel::Public);

        let ids = collect_source_ids(&query, &queries);
        let err = check_compatibility(&ids, &config).unwrap_err();
        assert_eq!(err.kind.to_string(), "Formula.Firewall");
    }

    #[test]
    fn organizational_and_public_combine() {
        let ids = vec!["a".to_string(), "b".to_string()];
        let config = PrivacyConfig::default()
            .with_level("a", PrivacyLevel::Organizational)
            .with_level("b", PrivacyLevel::Public);
        assert!(check_compatibility(&ids, &config).is_ok());
    }
}
