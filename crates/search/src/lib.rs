//! crcwatch search: filter predicates over case run configurations.
//! One criterion per field; a record is visible when every criterion holds.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use crcwatch_core::{CaseRunConfiguration, CrcId, Snapshot};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub mod controller;

pub use controller::{CancelScope, FilterController};

/// How a criterion is compared against a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchMode {
    Equals,
    Includes,
    Config,
}

/// A field value as seen by the predicate engine. Missing fields are `Absent`
/// and compare like the empty string.
#[derive(Debug, Clone, Copy)]
pub enum FieldValue<'a> {
    Absent,
    Text(&'a str),
    List(&'a [String]),
    Map(&'a BTreeMap<String, String>),
}

impl<'a> From<&'a str> for FieldValue<'a> {
    fn from(s: &'a str) -> Self { FieldValue::Text(s) }
}

impl<'a> From<Option<&'a str>> for FieldValue<'a> {
    fn from(s: Option<&'a str>) -> Self { s.map(FieldValue::Text).unwrap_or(FieldValue::Absent) }
}

impl<'a> From<&'a [String]> for FieldValue<'a> {
    fn from(s: &'a [String]) -> Self { FieldValue::List(s) }
}

impl<'a> From<&'a BTreeMap<String, String>> for FieldValue<'a> {
    fn from(m: &'a BTreeMap<String, String>) -> Self { FieldValue::Map(m) }
}

/// Query values that disable a criterion.
pub fn is_placeholder(query: &str) -> bool {
    query.is_empty() || query == "-"
}

/// Evaluate one criterion against one field. Total: never fails.
pub fn matches(query: &str, field: FieldValue<'_>, mode: MatchMode) -> bool {
    if is_placeholder(query) {
        return true;
    }
    let query = if query == "None" { "" } else { query };
    match mode {
        MatchMode::Equals => equals(query, field),
        MatchMode::Includes => includes(query.trim(), field),
        MatchMode::Config => config(query, field),
    }
}

fn equals(query: &str, field: FieldValue<'_>) -> bool {
    match field {
        FieldValue::Absent => query.is_empty(),
        FieldValue::Text(s) => s == query,
        FieldValue::List(items) => items.join(",") == query,
        FieldValue::Map(m) => m.is_empty() && query.is_empty(),
    }
}

fn includes(needle: &str, field: FieldValue<'_>) -> bool {
    match field {
        FieldValue::Absent => needle.is_empty(),
        FieldValue::Text(s) => s.contains(needle),
        FieldValue::List(items) => items.iter().any(|s| s.contains(needle)),
        FieldValue::Map(m) => m.values().any(|v| v.contains(needle)),
    }
}

// `key:value` clauses pin one key, bare clauses match any value; all must hold.
// Only the first two `:`-separated parts of a clause are compared. Clauses are
// not trimmed.
fn config(query: &str, field: FieldValue<'_>) -> bool {
    match field {
        FieldValue::Map(m) => {
            if m.is_empty() || query.is_empty() {
                return m.is_empty() && query.is_empty();
            }
            query.split(';').all(|clause| {
                let mut parts = clause.split(':');
                let head = parts.next().unwrap_or_default();
                match parts.next() {
                    Some(value) => m.get(head).map(|v| v == value).unwrap_or(false),
                    None => m.values().any(|v| v == clause),
                }
            })
        }
        FieldValue::Absent => query.is_empty(),
        FieldValue::Text(s) => {
            if s.is_empty() || query.is_empty() {
                return s == query;
            }
            query.split(';').all(|clause| !clause.contains(':') && clause == s)
        }
        FieldValue::List(items) => {
            if items.is_empty() || query.is_empty() {
                return items.is_empty() && query.is_empty();
            }
            query.split(';').all(|clause| !clause.contains(':') && items.iter().any(|v| v == clause))
        }
    }
}

/// The six per-field criteria of the active filter. Empty or `-` disables a field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterCriteria {
    /// Substring of the test case name.
    pub testcase: String,
    /// Substring of any plan in `running_for`.
    pub testplan: String,
    /// Configuration expression, `key:value;bare`.
    pub configuration: String,
    pub state: String,
    pub result: String,
    pub workflow: String,
}

const STAGES: usize = 6;

impl FilterCriteria {
    /// True when no field constrains anything.
    pub fn is_trivial(&self) -> bool {
        [&self.testcase, &self.testplan, &self.configuration, &self.state, &self.result, &self.workflow]
            .iter()
            .all(|q| is_placeholder(q))
    }

    /// Parse a filter query.
    ///
    /// Typed tokens: `testcase:`, `plan:` (or `testplan:`), `config:`, `state:`,
    /// `result:`, `workflow:`. Values may be double-quoted to hold spaces
    /// (`state:"not started"`). Bare words are joined into the test case
    /// substring. A repeated typed token replaces the earlier one.
    pub fn parse(query: &str) -> Self {
        let mut c = FilterCriteria::default();
        let mut bare: Vec<String> = Vec::new();
        for tok in tokenize(query) {
            let Some((key, value)) = tok.split_once(':') else { bare.push(tok.clone()); continue; };
            let slot = match key {
                "testcase" | "name" => &mut c.testcase,
                "plan" | "testplan" => &mut c.testplan,
                "config" | "configuration" => &mut c.configuration,
                "state" => &mut c.state,
                "result" => &mut c.result,
                "workflow" => &mut c.workflow,
                _ => { bare.push(tok.clone()); continue; }
            };
            *slot = value.to_string();
        }
        if !bare.is_empty() {
            let words = bare.join(" ");
            if c.testcase.is_empty() { c.testcase = words; } else { c.testcase = format!("{} {}", c.testcase, words); }
        }
        c
    }

    /// Per-field checks in evaluation order.
    fn stage(&self, stage: usize, crc: &CaseRunConfiguration) -> bool {
        match stage {
            0 => matches(&self.testcase, FieldValue::Text(&crc.name), MatchMode::Includes),
            1 => matches(&self.testplan, FieldValue::List(crc.running_for.as_slice()), MatchMode::Includes),
            2 => matches(&self.configuration, FieldValue::Map(&crc.configuration), MatchMode::Config),
            3 => matches(&self.state, FieldValue::Text(&crc.state), MatchMode::Equals),
            4 => matches(&self.result, crc.result.as_deref().into(), MatchMode::Equals),
            _ => matches(&self.workflow, FieldValue::Text(&crc.workflow), MatchMode::Equals),
        }
    }

    /// True when `crc` passes every criterion.
    pub fn matches(&self, crc: &CaseRunConfiguration) -> bool {
        (0..STAGES).all(|s| self.stage(s, crc))
    }

    /// Evaluate against a whole snapshot, keeping per-stage survivor counts.
    pub fn evaluate(&self, snap: &Snapshot) -> (MatchedSet, FilterDebugInfo) {
        let started = std::time::Instant::now();
        let mut candidates: Vec<&CaseRunConfiguration> = snap.items.iter().collect();
        let mut after = [0usize; STAGES];
        for (stage, slot) in after.iter_mut().enumerate() {
            candidates.retain(|crc| self.stage(stage, crc));
            *slot = candidates.len();
        }
        let matched = MatchedSet::from_ids(candidates.into_iter().map(|c| c.id.clone()));
        let dbg = FilterDebugInfo {
            total: snap.len(),
            after_testcase: after[0],
            after_testplan: after[1],
            after_configuration: after[2],
            after_state: after[3],
            after_result: after[4],
            after_workflow: after[5],
        };
        let elapsed = started.elapsed();
        metrics::histogram!("filter_eval_ms", elapsed.as_secs_f64() * 1_000.0);
        debug!(total = dbg.total, matched = matched.len(), epoch = snap.epoch, "filter: evaluated");
        (matched, dbg)
    }
}

// Whitespace-separated tokens; double quotes group and are removed.
fn tokenize(query: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut quoted = false;
    let mut pending = false;
    for ch in query.chars() {
        match ch {
            '"' => { quoted = !quoted; pending = true; }
            c if c.is_whitespace() && !quoted => {
                if pending { out.push(std::mem::take(&mut cur)); pending = false; }
            }
            c => { cur.push(c); pending = true; }
        }
    }
    if pending { out.push(cur); }
    out
}

/// Survivor counts after each criterion, in evaluation order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilterDebugInfo {
    pub total: usize,
    pub after_testcase: usize,
    pub after_testplan: usize,
    pub after_configuration: usize,
    pub after_state: usize,
    pub after_result: usize,
    pub after_workflow: usize,
}

/// Ids passing the active filter, in snapshot order.
#[derive(Debug, Clone, Default)]
pub struct MatchedSet {
    order: Vec<CrcId>,
    set: FxHashSet<CrcId>,
}

impl MatchedSet {
    pub fn from_ids(ids: impl IntoIterator<Item = CrcId>) -> Self {
        let mut out = MatchedSet::default();
        for id in ids {
            if out.set.insert(id.clone()) { out.order.push(id); }
        }
        out
    }

    /// Every id of `snap`.
    pub fn everything(snap: &Snapshot) -> Self {
        Self::from_ids(snap.items.iter().map(|c| c.id.clone()))
    }

    pub fn contains(&self, id: &str) -> bool { self.set.contains(id) }
    pub fn len(&self) -> usize { self.order.len() }
    pub fn is_empty(&self) -> bool { self.order.is_empty() }
    pub fn ids(&self) -> &[CrcId] { &self.order }
    pub fn iter(&self) -> impl Iterator<Item = &CrcId> { self.order.iter() }
}

impl PartialEq for MatchedSet {
    fn eq(&self, other: &Self) -> bool { self.set == other.set }
}

impl Eq for MatchedSet {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn crc(v: serde_json::Value) -> CaseRunConfiguration { serde_json::from_value(v).unwrap() }

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn placeholders_match_everything() {
        let m = map(&[("a", "1")]);
        let list = vec!["x".to_string()];
        for q in ["", "-"] {
            for mode in [MatchMode::Equals, MatchMode::Includes, MatchMode::Config] {
                assert!(matches(q, FieldValue::Absent, mode));
                assert!(matches(q, FieldValue::Text("zzz"), mode));
                assert!(matches(q, FieldValue::List(&list), mode));
                assert!(matches(q, FieldValue::Map(&m), mode));
            }
        }
    }

    #[test]
    fn none_query_equals_missing_value() {
        assert!(matches("None", FieldValue::Absent, MatchMode::Equals));
        assert!(matches("None", FieldValue::Text(""), MatchMode::Equals));
        assert!(!matches("None", FieldValue::Text("PASS"), MatchMode::Equals));
        assert!(matches("PASS", FieldValue::Text("PASS"), MatchMode::Equals));
        assert!(!matches("PASS", FieldValue::Absent, MatchMode::Equals));
    }

    #[test]
    fn includes_trims_and_checks_any_element() {
        let plans = vec!["bar".to_string(), "foobar".to_string()];
        assert!(matches("foo", FieldValue::List(&plans), MatchMode::Includes));
        assert!(matches("  foo ", FieldValue::List(&plans), MatchMode::Includes));
        assert!(!matches("zzz", FieldValue::List(&plans), MatchMode::Includes));
        assert!(matches("case", FieldValue::Text("testcase-1"), MatchMode::Includes));
        assert!(!matches("case", FieldValue::Absent, MatchMode::Includes));
    }

    #[test]
    fn config_clauses_combine_with_and() {
        let m = map(&[("a", "1"), ("c", "b")]);
        assert!(matches("a:1;b", FieldValue::Map(&m), MatchMode::Config));
        assert!(matches("a:1", FieldValue::Map(&m), MatchMode::Config));
        assert!(matches("1", FieldValue::Map(&m), MatchMode::Config));
        assert!(!matches("a:2", FieldValue::Map(&map(&[("a", "1")])), MatchMode::Config));
        assert!(!matches("a:1;zzz", FieldValue::Map(&m), MatchMode::Config));
        assert!(!matches("x:1", FieldValue::Map(&m), MatchMode::Config));
        // extra colon parts are ignored
        assert!(matches("a:1:junk", FieldValue::Map(&m), MatchMode::Config));
        // clauses are not trimmed
        assert!(!matches("a:1; b", FieldValue::Map(&m), MatchMode::Config));
    }

    #[test]
    fn config_against_empty_mapping_is_direct_equality() {
        let empty = BTreeMap::new();
        assert!(matches("None", FieldValue::Map(&empty), MatchMode::Config));
        assert!(!matches("a:1", FieldValue::Map(&empty), MatchMode::Config));
        assert!(matches("None", FieldValue::Absent, MatchMode::Config));
        assert!(!matches("None", FieldValue::Map(&map(&[("a", "1")])), MatchMode::Config));
    }

    #[test]
    fn parse_typed_tokens_quotes_and_bare_words() {
        let c = FilterCriteria::parse(r#"plan:planA state:"not started" config:arch:x86_64;server login flow"#);
        assert_eq!(c.testplan, "planA");
        assert_eq!(c.state, "not started");
        assert_eq!(c.configuration, "arch:x86_64;server");
        assert_eq!(c.testcase, "login flow");
        assert!(c.result.is_empty());
        assert!(!c.is_trivial());

        let c = FilterCriteria::parse("testcase:boot extra unknown:thing result:None");
        assert_eq!(c.testcase, "boot extra unknown:thing");
        assert_eq!(c.result, "None");

        assert!(FilterCriteria::parse("").is_trivial());
        assert!(FilterCriteria::parse("state:-").is_trivial());
    }

    #[test]
    fn evaluate_reports_stage_counts() {
        let snap = Snapshot::new(1, vec![
            crc(json!({"id": "1", "name": "boot", "running_for": ["planA"], "state": "running", "configuration": {"arch": "x86_64"}})),
            crc(json!({"id": "2", "name": "boot", "running_for": ["planB"], "state": "running"})),
            crc(json!({"id": "3", "name": "login", "running_for": ["planA"], "state": "complete", "result": "PASS"})),
        ]);
        let c = FilterCriteria { testcase: "boot".into(), state: "running".into(), ..Default::default() };
        let (matched, dbg) = c.evaluate(&snap);
        assert_eq!(matched.ids(), &["1".to_string(), "2".to_string()]);
        assert_eq!(dbg.total, 3);
        assert_eq!(dbg.after_testcase, 2);
        assert_eq!(dbg.after_state, 2);
        assert_eq!(dbg.after_workflow, 2);

        let c = FilterCriteria { result: "None".into(), ..Default::default() };
        let (matched, _) = c.evaluate(&snap);
        assert!(matched.contains("1") && matched.contains("2") && !matched.contains("3"));

        let c = FilterCriteria { configuration: "arch:x86_64".into(), ..Default::default() };
        let (matched, dbg) = c.evaluate(&snap);
        assert_eq!(matched.ids(), &["1".to_string()]);
        assert_eq!(dbg.after_testplan, 3);
        assert_eq!(dbg.after_configuration, 1);
    }
}
