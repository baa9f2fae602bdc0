//! crcwatch core types: case run configurations, snapshots and the cancel wire form.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod columns;
pub mod markdown;

/// Opaque, stable identifier of a case run configuration.
pub type CrcId = String;

/// Lifecycle tags reported by the execution engine, in lifecycle order.
pub const KNOWN_STATES: &[&str] = &[
    "not started",
    "queued",
    "started",
    "running",
    "cleaning",
    "canceled",
    "complete",
    "DNF",
];

/// Outcome tags; `None` is the engine's spelling of "no result yet".
pub const KNOWN_RESULTS: &[&str] = &["None", "PASS", "FAIL", "ERROR"];

/// One schedulable unit of test execution.
///
/// Decoding is lenient: missing fields default, `null` strings become empty,
/// scalar configuration values are stringified. Equality is structural over
/// every field, which is what the render differ relies on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CaseRunConfiguration {
    #[serde(deserialize_with = "de::string")]
    pub id: CrcId,
    #[serde(deserialize_with = "de::string")]
    pub name: String,
    #[serde(deserialize_with = "de::string_map")]
    pub configuration: BTreeMap<String, String>,
    /// Test plans this configuration is scheduled under, in server order.
    #[serde(deserialize_with = "de::string_list")]
    pub running_for: SmallVec<[String; 2]>,
    #[serde(deserialize_with = "de::string")]
    pub workflow: String,
    #[serde(deserialize_with = "de::string")]
    pub state: String,
    #[serde(deserialize_with = "de::opt_string")]
    pub result: Option<String>,
    #[serde(deserialize_with = "de::string")]
    pub display_status: String,
    pub logs: Logs,
    /// Whether the configuration can still be canceled.
    #[serde(deserialize_with = "de::flag")]
    pub active: bool,
}

/// How log references are turned into links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LinkMode {
    /// Served by a live dashboard: links are built from the CRC id.
    #[default]
    Live,
    /// Saved dashboard directory: stored references are direct URLs.
    Static,
}

impl CaseRunConfiguration {
    /// Resolve every log of this configuration to `(name, url)`. `logs_root`
    /// is the live log endpoint, e.g. `http://host:5000/logs`.
    pub fn log_links(&self, mode: LinkMode, logs_root: &str) -> Vec<(String, String)> {
        let base = logs_root.trim_end_matches('/');
        self.logs
            .iter()
            .map(|entry| {
                let url = match (mode, entry.reference.as_deref()) {
                    (LinkMode::Live, _) => format!("{}/{}/{}", base, urlencoding::encode(&self.id), urlencoding::encode(&entry.name)),
                    (LinkMode::Static, Some(reference)) if !reference.is_empty() => reference.to_string(),
                    (LinkMode::Static, _) => format!("./logs/{}/{}.txt", urlencoding::encode(&self.id), urlencoding::encode(&entry.name)),
                };
                (entry.name.clone(), url)
            })
            .collect()
    }

    /// True when the configuration is scheduled under more than one plan.
    pub fn is_shared(&self) -> bool {
        self.running_for.len() > 1
    }
}

/// A named log attached to a configuration. `reference` is only known when the
/// server sends a name -> reference mapping (saved dashboards do).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub name: String,
    pub reference: Option<String>,
}

/// Logs arrive either as a list of names or as a name -> reference mapping.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Logs(pub Vec<LogEntry>);

impl Logs {
    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> { self.0.iter() }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn names(&self) -> impl Iterator<Item = &str> { self.0.iter().map(|e| e.name.as_str()) }
}

impl Serialize for Logs {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::{SerializeMap, SerializeSeq};
        if self.0.iter().any(|e| e.reference.is_some()) {
            let mut map = serializer.serialize_map(Some(self.0.len()))?;
            for e in &self.0 {
                map.serialize_entry(&e.name, e.reference.as_deref().unwrap_or(""))?;
            }
            map.end()
        } else {
            let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
            for e in &self.0 {
                seq.serialize_element(&e.name)?;
            }
            seq.end()
        }
    }
}

impl<'de> Deserialize<'de> for Logs {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = serde_json::Value::deserialize(deserializer)?;
        let entries = match v {
            serde_json::Value::Array(items) => items
                .iter()
                .map(|it| LogEntry { name: de::scalar_to_string(it), reference: None })
                .collect(),
            serde_json::Value::Object(map) => map
                .iter()
                .map(|(k, v)| LogEntry { name: k.clone(), reference: Some(de::scalar_to_string(v)) })
                .collect(),
            _ => Vec::new(),
        };
        Ok(Logs(entries))
    }
}

/// State Query body as served: a bare array or `{ "caseRuns": [...] }`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CaseRunsPayload {
    Bare(Vec<CaseRunConfiguration>),
    Wrapped {
        #[serde(rename = "caseRuns")]
        case_runs: Vec<CaseRunConfiguration>,
    },
}

impl CaseRunsPayload {
    pub fn into_items(self) -> Vec<CaseRunConfiguration> {
        match self {
            CaseRunsPayload::Bare(items) => items,
            CaseRunsPayload::Wrapped { case_runs } => case_runs,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("case runs payload is neither an array nor an object with `caseRuns`: {0}")]
    Shape(#[from] serde_json::Error),
}

/// Decode a State Query body into the one typed sequence the pipeline uses.
pub fn decode_case_runs(bytes: &[u8]) -> Result<Vec<CaseRunConfiguration>, DecodeError> {
    let payload: CaseRunsPayload = serde_json::from_slice(bytes)?;
    Ok(payload.into_items())
}

/// The full set of configurations as of one successful poll.
///
/// Items keep the order the server returned them in. If the server repeats an
/// id, lookups resolve to the last occurrence.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    pub epoch: u64,
    pub items: Vec<CaseRunConfiguration>,
    #[serde(skip)]
    index: FxHashMap<CrcId, usize>,
}

impl Snapshot {
    pub fn new(epoch: u64, items: Vec<CaseRunConfiguration>) -> Self {
        let mut index = FxHashMap::default();
        index.reserve(items.len());
        for (i, it) in items.iter().enumerate() {
            index.insert(it.id.clone(), i);
        }
        Self { epoch, items, index }
    }

    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    pub fn get(&self, id: &str) -> Option<&CaseRunConfiguration> {
        self.index.get(id).and_then(|i| self.items.get(*i))
    }

    pub fn contains(&self, id: &str) -> bool { self.index.contains_key(id) }

    /// Distinct plan names across all `running_for`, in first-seen order.
    pub fn plans(&self) -> Vec<String> {
        let mut seen = rustc_hash::FxHashSet::default();
        let mut out = Vec::new();
        for crc in &self.items {
            for plan in crc.running_for.iter() {
                if seen.insert(plan.as_str()) {
                    out.push(plan.clone());
                }
            }
        }
        out
    }

    /// Configurations scheduled under `plan`, in snapshot order.
    pub fn plan_members<'a>(&'a self, plan: &'a str) -> impl Iterator<Item = &'a CaseRunConfiguration> + 'a {
        self.items.iter().filter(move |c| c.running_for.iter().any(|p| p == plan))
    }

    /// Same ids with the same field values, irrespective of order.
    pub fn same_content(&self, other: &Snapshot) -> bool {
        self.index.len() == other.index.len()
            && self.index.iter().all(|(id, i)| other.get(id) == self.items.get(*i))
    }
}

/// Which cancel endpoint a request goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelEndpoint {
    Cancel,
    CancelFiltered,
}

/// Exactly one cancel scope, as accepted by the Cancel Command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelRequest {
    /// One configuration, in every plan it runs in.
    Crc { crc_id: CrcId },
    /// Every configuration of a plan.
    Plan { plan_name: String },
    /// Everything.
    All,
    /// A filtered batch; `plan_name` is bookkeeping context, not a filter.
    Filtered { crc_ids: Vec<CrcId>, plan_name: Option<String> },
}

impl CancelRequest {
    pub fn endpoint(&self) -> CancelEndpoint {
        match self {
            CancelRequest::Filtered { .. } => CancelEndpoint::CancelFiltered,
            _ => CancelEndpoint::Cancel,
        }
    }

    /// Query pairs in wire form; filtered ids are joined with `;`.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        match self {
            CancelRequest::Crc { crc_id } => vec![("crc_id", crc_id.clone())],
            CancelRequest::Plan { plan_name } => vec![("plan_name", plan_name.clone())],
            CancelRequest::All => vec![("all", "true".to_string())],
            CancelRequest::Filtered { crc_ids, plan_name } => {
                let mut pairs = vec![("crc_ids", crc_ids.join(";"))];
                if let Some(plan) = plan_name {
                    pairs.push(("plan_name", plan.clone()));
                }
                pairs
            }
        }
    }

    /// Short label for logs and metrics.
    pub fn scope(&self) -> &'static str {
        match self {
            CancelRequest::Crc { .. } => "crc",
            CancelRequest::Plan { .. } => "plan",
            CancelRequest::All => "all",
            CancelRequest::Filtered { .. } => "filtered",
        }
    }
}

pub mod prelude {
    pub use super::{CancelEndpoint, CancelRequest, CaseRunConfiguration, CrcId, LinkMode, Logs, Snapshot};
}

/// Lenient field decoders: malformed values degrade to empty-equivalents
/// instead of failing the whole payload.
mod de {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer};
    use serde_json::Value;
    use smallvec::SmallVec;

    pub(crate) fn scalar_to_string(v: &Value) -> String {
        match v {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            other => other.to_string(),
        }
    }

    pub(crate) fn string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        Ok(scalar_to_string(&Value::deserialize(d)?))
    }

    pub(crate) fn opt_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Null => None,
            v => Some(scalar_to_string(&v)),
        })
    }

    pub(crate) fn string_map<'de, D: Deserializer<'de>>(d: D) -> Result<BTreeMap<String, String>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), scalar_to_string(v))).collect(),
            _ => BTreeMap::new(),
        })
    }

    pub(crate) fn string_list<'de, D: Deserializer<'de>>(d: D) -> Result<SmallVec<[String; 2]>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Array(items) => items.iter().map(scalar_to_string).collect(),
            Value::String(s) if !s.is_empty() => std::iter::once(s).collect(),
            _ => SmallVec::new(),
        })
    }

    pub(crate) fn flag<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Bool(b) => b,
            Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
            Value::String(s) => s.eq_ignore_ascii_case("true"),
            _ => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn crc(id: &str, plans: &[&str]) -> CaseRunConfiguration {
        CaseRunConfiguration {
            id: id.to_string(),
            name: format!("case-{}", id),
            running_for: plans.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn decodes_bare_and_wrapped_payloads() {
        let bare = json!([{ "id": "a", "name": "x" }]).to_string();
        let wrapped = json!({ "caseRuns": [{ "id": "a", "name": "x" }] }).to_string();
        let a = decode_case_runs(bare.as_bytes()).unwrap();
        let b = decode_case_runs(wrapped.as_bytes()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].id, "a");
    }

    #[test]
    fn rejects_unrelated_shapes() {
        assert!(decode_case_runs(br#"{"items": []}"#).is_err());
        assert!(decode_case_runs(b"not json").is_err());
    }

    #[test]
    fn lenient_fields_normalize_to_empty() {
        let body = json!([{
            "id": 42,
            "name": null,
            "configuration": { "arch": "x86_64", "count": 3, "debug": false },
            "running_for": "planA",
            "result": null,
            "active": "True"
        }]).to_string();
        let items = decode_case_runs(body.as_bytes()).unwrap();
        let c = &items[0];
        assert_eq!(c.id, "42");
        assert_eq!(c.name, "");
        assert_eq!(c.configuration.get("count").map(String::as_str), Some("3"));
        assert_eq!(c.configuration.get("debug").map(String::as_str), Some("false"));
        assert_eq!(c.running_for.as_slice(), &["planA".to_string()]);
        assert_eq!(c.result, None);
        assert!(c.active);
        assert!(c.logs.is_empty());
        assert_eq!(c.state, "");
    }

    #[test]
    fn logs_accept_list_or_mapping() {
        let body = json!([
            { "id": "a", "logs": ["console", "journal"] },
            { "id": "b", "logs": { "console": "https://logs.example.com/b/console" } }
        ]).to_string();
        let items = decode_case_runs(body.as_bytes()).unwrap();
        assert_eq!(items[0].logs.names().collect::<Vec<_>>(), vec!["console", "journal"]);
        assert_eq!(items[1].logs.0[0].reference.as_deref(), Some("https://logs.example.com/b/console"));
    }

    #[test]
    fn log_links_follow_link_mode() {
        let body = json!([
            { "id": "a", "logs": ["console"] },
            { "id": "b", "logs": { "console": "https://logs.example.com/b/console" } }
        ]).to_string();
        let items = decode_case_runs(body.as_bytes()).unwrap();
        assert_eq!(
            items[0].log_links(LinkMode::Live, "http://host:5000/logs/"),
            vec![("console".to_string(), "http://host:5000/logs/a/console".to_string())]
        );
        assert_eq!(
            items[0].log_links(LinkMode::Static, ""),
            vec![("console".to_string(), "./logs/a/console.txt".to_string())]
        );
        assert_eq!(
            items[1].log_links(LinkMode::Static, "http://ignored"),
            vec![("console".to_string(), "https://logs.example.com/b/console".to_string())]
        );
    }

    #[test]
    fn log_link_segments_are_percent_encoded() {
        let body = json!([{ "id": "a b", "logs": ["test output?#1"] }]).to_string();
        let items = decode_case_runs(body.as_bytes()).unwrap();
        assert_eq!(
            items[0].log_links(LinkMode::Live, "http://host:5000/logs"),
            vec![("test output?#1".to_string(), "http://host:5000/logs/a%20b/test%20output%3F%231".to_string())]
        );
        assert_eq!(items[0].log_links(LinkMode::Static, "")[0].1, "./logs/a%20b/test%20output%3F%231.txt");
    }

    #[test]
    fn plans_are_distinct_in_first_seen_order() {
        let s = Snapshot::new(1, vec![crc("1", &["planB", "planA"]), crc("2", &["planA"]), crc("3", &["planC"])]);
        assert_eq!(s.plans(), vec!["planB", "planA", "planC"]);
        let members: Vec<_> = s.plan_members("planA").map(|c| c.id.as_str()).collect();
        assert_eq!(members, vec!["1", "2"]);
        assert!(s.get("1").unwrap().is_shared());
        assert!(!s.get("2").unwrap().is_shared());
    }

    #[test]
    fn same_content_ignores_order() {
        let a = Snapshot::new(1, vec![crc("1", &["p"]), crc("2", &["q"])]);
        let b = Snapshot::new(2, vec![crc("2", &["q"]), crc("1", &["p"])]);
        assert!(a.same_content(&b));
        let mut changed = crc("2", &["q"]);
        changed.active = true;
        let c = Snapshot::new(3, vec![crc("1", &["p"]), changed]);
        assert!(!a.same_content(&c));
    }

    #[test]
    fn cancel_requests_map_to_wire_form() {
        let r = CancelRequest::Crc { crc_id: "42".into() };
        assert_eq!(r.endpoint(), CancelEndpoint::Cancel);
        assert_eq!(r.query_pairs(), vec![("crc_id", "42".to_string())]);
        assert_eq!(CancelRequest::All.query_pairs(), vec![("all", "true".to_string())]);
        let f = CancelRequest::Filtered { crc_ids: vec!["1".into(), "2".into()], plan_name: Some("planA".into()) };
        assert_eq!(f.endpoint(), CancelEndpoint::CancelFiltered);
        assert_eq!(f.query_pairs(), vec![("crc_ids", "1;2".to_string()), ("plan_name", "planA".to_string())]);
        assert_eq!(f.scope(), "filtered");
    }
}
