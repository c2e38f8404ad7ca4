//! Workflow dependency-graph resolver.
//!
//! A ComfyUI workflow in "API format" is a JSON object keyed by node id:
//!
//! ```json
//! {
//!   "3": { "class_type": "KSampler", "inputs": { "seed": 42, "model": ["1", 0] } }
//! }
//! ```
//!
//! An input that is a two-element array `[source_node_id, output_index]`
//! is a link to another node's output. Everything else is a literal.
//!
//! All traversals here use explicit worklists, so stack depth does not
//! grow with graph size.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CoreError;
use crate::types::NodeId;

/// Class type of the node that writes images to the output directory.
pub const SAVE_IMAGE_CLASS: &str = "SaveImage";

/// A workflow graph: node id -> node. Ordered by id so iteration is
/// deterministic.
pub type TaskGraph = BTreeMap<NodeId, Node>;

/// A single typed unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub class_type: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputValue>,
    /// Fields we do not interpret (`_meta`, etc.), kept for submission.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Reference to output slot `output_index` of node `source`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputRef {
    pub source: NodeId,
    pub output_index: u64,
}

/// A node input: either a link to another node or a literal JSON value.
#[derive(Debug, Clone, PartialEq)]
pub enum InputValue {
    Link(InputRef),
    Literal(serde_json::Value),
}

impl InputValue {
    fn from_json(value: serde_json::Value) -> Self {
        if let Some([source, index]) = value.as_array().map(Vec::as_slice) {
            let source = match source {
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Number(n) if n.is_u64() => Some(n.to_string()),
                _ => None,
            };
            if let (Some(source), Some(output_index)) = (source, index.as_u64()) {
                return InputValue::Link(InputRef {
                    source,
                    output_index,
                });
            }
        }
        InputValue::Literal(value)
    }

    /// The literal value, if this input is not a link.
    pub fn as_literal(&self) -> Option<&serde_json::Value> {
        match self {
            InputValue::Literal(v) => Some(v),
            InputValue::Link(_) => None,
        }
    }
}

impl<'de> Deserialize<'de> for InputValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(InputValue::from_json)
    }
}

impl Serialize for InputValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            InputValue::Link(r) => (&r.source, r.output_index).serialize(serializer),
            InputValue::Literal(v) => v.serialize(serializer),
        }
    }
}

impl Node {
    /// Ids of the nodes this node reads from, one per link input.
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.inputs.values().filter_map(|input| match input {
            InputValue::Link(r) => Some(r.source.as_str()),
            InputValue::Literal(_) => None,
        })
    }

    /// A literal string input, e.g. `ckpt_name` or `filename_prefix`.
    pub fn literal_str(&self, name: &str) -> Option<&str> {
        self.inputs
            .get(name)
            .and_then(InputValue::as_literal)
            .and_then(|v| v.as_str())
    }
}

/// Parse workflow JSON into a [`TaskGraph`].
///
/// The value must be a non-empty object and every node must carry a
/// `class_type`.
pub fn parse_graph(json: &serde_json::Value) -> Result<TaskGraph, CoreError> {
    let obj = json
        .as_object()
        .ok_or_else(|| CoreError::validation("Workflow JSON must be an object"))?;

    if obj.is_empty() {
        return Err(CoreError::validation(
            "Workflow JSON must contain at least one node",
        ));
    }

    let mut graph = TaskGraph::new();
    for (node_id, node_value) in obj {
        if node_value.get("class_type").and_then(|v| v.as_str()).is_none() {
            return Err(CoreError::validation(format!(
                "Node '{node_id}' is missing required 'class_type' field"
            )));
        }
        let node: Node = serde_json::from_value(node_value.clone()).map_err(|e| {
            CoreError::validation(format!("Node '{node_id}' is malformed: {e}"))
        })?;
        graph.insert(node_id.clone(), node);
    }
    Ok(graph)
}

/// Every node the targets transitively depend on, targets included.
///
/// Targets and references that are not in the graph are ignored. Each
/// node is expanded at most once, so shared sub-dependencies cost
/// nothing extra and a cyclic graph still terminates.
pub fn ancestor_closure<I, S>(graph: &TaskGraph, targets: I) -> BTreeSet<NodeId>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut visited: BTreeSet<NodeId> = BTreeSet::new();
    let mut worklist: Vec<String> = targets
        .into_iter()
        .map(|t| t.as_ref().to_string())
        .collect();

    while let Some(id) = worklist.pop() {
        if visited.contains(&id) {
            continue;
        }
        let Some(node) = graph.get(&id) else {
            continue;
        };
        worklist.extend(
            node.dependencies()
                .filter(|dep| !visited.contains(*dep))
                .map(str::to_string),
        );
        visited.insert(id);
    }

    visited
}

/// The subgraph needed to produce `targets` ("run to selected node").
pub fn trim<I, S>(graph: &TaskGraph, targets: I) -> TaskGraph
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    ancestor_closure(graph, targets)
        .into_iter()
        .filter_map(|id| graph.get(&id).cloned().map(|node| (id, node)))
        .collect()
}

/// Longest-path depth of every node.
///
/// `depth(n) = 1 + max(depth(d))` over direct dependencies `d`, with an
/// empty max of 0, so source nodes have depth 1. Dependencies missing
/// from the graph count as 0. A cycle is reported as a validation error.
pub fn depths(graph: &TaskGraph) -> Result<BTreeMap<NodeId, u32>, CoreError> {
    let mut depths: BTreeMap<NodeId, u32> = BTreeMap::new();
    let mut on_path: HashSet<&str> = HashSet::new();

    for root in graph.keys() {
        if depths.contains_key(root) {
            continue;
        }

        // (node, dependencies already pushed)
        let mut stack: Vec<(&str, bool)> = vec![(root.as_str(), false)];

        while let Some((id, expanded)) = stack.pop() {
            let node = &graph[id];

            if expanded {
                on_path.remove(id);
                let deepest = node
                    .dependencies()
                    .filter_map(|dep| depths.get(dep))
                    .copied()
                    .max()
                    .unwrap_or(0);
                depths.insert(id.to_string(), deepest + 1);
                continue;
            }

            if depths.contains_key(id) {
                continue;
            }
            if !on_path.insert(id) {
                return Err(CoreError::validation(format!(
                    "Workflow graph contains a cycle through node '{id}'"
                )));
            }

            stack.push((id, true));
            for dep in node.dependencies() {
                if let Some((dep_id, _)) = graph.get_key_value(dep) {
                    if !depths.contains_key(dep) {
                        stack.push((dep_id.as_str(), false));
                    }
                }
            }
        }
    }

    Ok(depths)
}

/// Compare node ids numerically when both are integers, else as strings.
///
/// ComfyUI ids are usually decimal strings, where plain string order
/// would put "10" before "2".
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        _ => a.cmp(b),
    }
}

/// Nodes of `class_type` in execution order: by depth, then by
/// [`natural_cmp`] on the id.
pub fn output_order(graph: &TaskGraph, class_type: &str) -> Result<Vec<(NodeId, u32)>, CoreError> {
    let depths = depths(graph)?;
    let mut ordered: Vec<(NodeId, u32)> = graph
        .iter()
        .filter(|(_, node)| node.class_type == class_type)
        .map(|(id, _)| (id.clone(), depths.get(id).copied().unwrap_or(0)))
        .collect();
    ordered.sort_by(|(a_id, a_depth), (b_id, b_depth)| {
        a_depth.cmp(b_depth).then_with(|| natural_cmp(a_id, b_id))
    });
    Ok(ordered)
}

/// `filename_prefix -> depth` for every `SaveImage` node with a prefix.
///
/// Used to order results whose only link back to the graph is the file
/// name. When two save nodes share a prefix the shallower one wins.
pub fn output_prefix_depths(graph: &TaskGraph) -> Result<BTreeMap<String, u32>, CoreError> {
    let mut prefixes = BTreeMap::new();
    for (id, depth) in output_order(graph, SAVE_IMAGE_CLASS)? {
        let prefix = graph[&id].literal_str("filename_prefix").unwrap_or_default();
        if !prefix.is_empty() {
            prefixes.entry(prefix.to_string()).or_insert(depth);
        }
    }
    Ok(prefixes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn graph(json: serde_json::Value) -> TaskGraph {
        parse_graph(&json).unwrap()
    }

    fn ids(nodes: impl IntoIterator<Item = String>) -> BTreeSet<String> {
        nodes.into_iter().collect()
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    /// 1 -> 2 -> 3 -> 4 -> 5
    fn linear() -> TaskGraph {
        graph(json!({
            "1": { "class_type": "CheckpointLoader", "inputs": { "ckpt_name": "model.safetensors" } },
            "2": { "class_type": "CLIPTextEncode", "inputs": { "text": "test", "clip": ["1", 1] } },
            "3": { "class_type": "KSampler", "inputs": { "model": ["1", 0], "positive": ["2", 0] } },
            "4": { "class_type": "VAEDecode", "inputs": { "samples": ["3", 0], "vae": ["1", 2] } },
            "5": { "class_type": "SaveImage", "inputs": { "images": ["4", 0] } }
        }))
    }

    /// 1 -> 2 -> 3 and 1 -> 4 -> 5
    fn branching() -> TaskGraph {
        graph(json!({
            "1": { "class_type": "CheckpointLoader", "inputs": { "ckpt_name": "model.safetensors" } },
            "2": { "class_type": "CLIPTextEncode", "inputs": { "text": "branch A", "clip": ["1", 1] } },
            "3": { "class_type": "SaveImage", "inputs": { "images": ["2", 0], "filename_prefix": "a" } },
            "4": { "class_type": "CLIPTextEncode", "inputs": { "text": "branch B", "clip": ["1", 1] } },
            "5": { "class_type": "SaveImage", "inputs": { "images": ["4", 0], "filename_prefix": "b" } }
        }))
    }

    /// 1; 2 <- 1; 3 <- 1; 4 <- 2, 3; 5 <- 4
    fn diamond() -> TaskGraph {
        graph(json!({
            "1": { "class_type": "Source", "inputs": {} },
            "2": { "class_type": "Left", "inputs": { "x": ["1", 0] } },
            "3": { "class_type": "Right", "inputs": { "x": ["1", 0] } },
            "4": { "class_type": "Join", "inputs": { "a": ["2", 0], "b": ["3", 0] } },
            "5": { "class_type": "Sink", "inputs": { "x": ["4", 0] } }
        }))
    }

    // -- parsing --------------------------------------------------------------

    #[test]
    fn links_and_literals_are_distinguished() {
        let g = graph(json!({
            "1": { "class_type": "EmptyLatentImage", "inputs": { "width": 512, "size": [512, 512] } },
            "2": { "class_type": "KSampler", "inputs": { "latent_image": ["1", 0], "seed": 7 } },
            "3": { "class_type": "Preview", "inputs": { "src": [2, 0] } }
        }));
        assert_eq!(g["1"].dependencies().count(), 1, "[512, 512] reads as a link to node 512");
        assert_eq!(g["2"].dependencies().collect::<Vec<_>>(), vec!["1"]);
        assert_eq!(g["3"].dependencies().collect::<Vec<_>>(), vec!["2"]);
        assert_eq!(g["2"].inputs["seed"], InputValue::Literal(json!(7)));
    }

    #[test]
    fn serialization_preserves_links_and_extra_fields() {
        let source = json!({
            "1": { "class_type": "SaveImage", "inputs": { "images": ["2", 0] }, "_meta": { "title": "Save" } },
            "2": { "class_type": "VAEDecode", "inputs": {} }
        });
        let g = graph(source.clone());
        assert_eq!(serde_json::to_value(&g).unwrap(), source);
    }

    #[test]
    fn parse_rejects_non_object() {
        let err = parse_graph(&json!("nope")).unwrap_err();
        assert!(err.to_string().contains("must be an object"));
    }

    #[test]
    fn parse_rejects_empty_graph() {
        let err = parse_graph(&json!({})).unwrap_err();
        assert!(err.to_string().contains("at least one node"));
    }

    #[test]
    fn parse_rejects_missing_class_type() {
        let err = parse_graph(&json!({ "1": { "inputs": {} } })).unwrap_err();
        assert!(err.to_string().contains("class_type"));
    }

    #[test]
    fn missing_inputs_default_to_empty() {
        let g = graph(json!({ "1": { "class_type": "SaveImage" } }));
        assert!(g["1"].inputs.is_empty());
    }

    // -- closure and trim -----------------------------------------------------

    #[test]
    fn trim_linear_middle_node() {
        assert_eq!(ids(trim(&linear(), ["3"]).into_keys()), set(&["1", "2", "3"]));
    }

    #[test]
    fn trim_linear_first_and_last() {
        assert_eq!(ids(trim(&linear(), ["1"]).into_keys()), set(&["1"]));
        assert_eq!(
            ids(trim(&linear(), ["5"]).into_keys()),
            set(&["1", "2", "3", "4", "5"])
        );
    }

    #[test]
    fn trim_branching_single_branch() {
        assert_eq!(ids(trim(&branching(), ["3"]).into_keys()), set(&["1", "2", "3"]));
        assert_eq!(ids(trim(&branching(), ["5"]).into_keys()), set(&["1", "4", "5"]));
    }

    #[test]
    fn trim_branching_union() {
        assert_eq!(
            ids(trim(&branching(), ["3", "5"]).into_keys()),
            set(&["1", "2", "3", "4", "5"])
        );
    }

    #[test]
    fn closure_is_idempotent() {
        for (g, targets) in [
            (linear(), vec!["3"]),
            (branching(), vec!["3", "5"]),
            (diamond(), vec!["4"]),
            (diamond(), vec!["2", "3"]),
        ] {
            let once = ancestor_closure(&g, &targets);
            let twice = ancestor_closure(&g, &once);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn trim_is_idempotent_and_closed() {
        for (g, targets) in [(linear(), vec!["4"]), (branching(), vec!["5"]), (diamond(), vec!["5"])] {
            let once = trim(&g, &targets);
            assert_eq!(trim(&once, &targets), once);
            for node in once.values() {
                assert!(node.dependencies().all(|d| once.contains_key(d)));
            }
        }
    }

    #[test]
    fn dangling_references_and_unknown_targets_are_ignored() {
        let g = graph(json!({
            "1": { "class_type": "A", "inputs": { "x": ["99", 0] } },
            "2": { "class_type": "B", "inputs": { "x": ["1", 0] } }
        }));
        assert_eq!(ancestor_closure(&g, ["2", "missing"]), set(&["1", "2"]));
    }

    #[test]
    fn closure_terminates_on_cycle() {
        let g = graph(json!({
            "1": { "class_type": "A", "inputs": { "x": ["2", 0] } },
            "2": { "class_type": "B", "inputs": { "x": ["1", 0] } }
        }));
        assert_eq!(ancestor_closure(&g, ["1"]), set(&["1", "2"]));
    }

    // -- depth ------------------------------------------------------------------

    #[test]
    fn diamond_depths() {
        let d = depths(&diamond()).unwrap();
        let expected: BTreeMap<String, u32> = [("1", 1), ("2", 2), ("3", 2), ("4", 3), ("5", 4)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        assert_eq!(d, expected);
    }

    #[test]
    fn depth_exceeds_every_dependency() {
        for g in [linear(), branching(), diamond()] {
            let d = depths(&g).unwrap();
            for (id, node) in &g {
                assert!(d[id] >= 1);
                for dep in node.dependencies() {
                    assert!(d[id] > d[dep], "{id} must be deeper than {dep}");
                }
            }
        }
    }

    #[test]
    fn missing_dependency_counts_as_depth_zero() {
        let g = graph(json!({ "1": { "class_type": "A", "inputs": { "x": ["404", 0] } } }));
        assert_eq!(depths(&g).unwrap()["1"], 1);
    }

    #[test]
    fn cycle_is_reported() {
        let g = graph(json!({
            "1": { "class_type": "A", "inputs": {} },
            "2": { "class_type": "B", "inputs": { "x": ["1", 0], "y": ["3", 0] } },
            "3": { "class_type": "C", "inputs": { "x": ["2", 0] } }
        }));
        let err = depths(&g).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let g = graph(json!({ "7": { "class_type": "A", "inputs": { "x": ["7", 0] } } }));
        assert!(depths(&g).is_err());
    }

    #[test]
    fn long_chain_does_not_overflow_the_stack() {
        let mut value = serde_json::Map::new();
        value.insert("0".into(), json!({ "class_type": "A", "inputs": {} }));
        for i in 1..50_000 {
            value.insert(
                i.to_string(),
                json!({ "class_type": "A", "inputs": { "x": [(i - 1).to_string(), 0] } }),
            );
        }
        let g = parse_graph(&serde_json::Value::Object(value)).unwrap();
        assert_eq!(depths(&g).unwrap()["49999"], 50_000);
        assert_eq!(ancestor_closure(&g, ["49999"]).len(), 50_000);
    }

    // -- output ordering --------------------------------------------------------

    #[test]
    fn save_nodes_ordered_by_depth_then_natural_id() {
        let g = graph(json!({
            "1": { "class_type": "Source", "inputs": {} },
            "10": { "class_type": "SaveImage", "inputs": { "images": ["1", 0], "filename_prefix": "early_b" } },
            "2": { "class_type": "SaveImage", "inputs": { "images": ["1", 0], "filename_prefix": "early_a" } },
            "3": { "class_type": "Upscale", "inputs": { "image": ["1", 0] } },
            "4": { "class_type": "SaveImage", "inputs": { "images": ["3", 0], "filename_prefix": "late" } }
        }));
        let order = output_order(&g, SAVE_IMAGE_CLASS).unwrap();
        assert_eq!(
            order,
            vec![("2".to_string(), 2), ("10".to_string(), 2), ("4".to_string(), 3)]
        );

        let prefixes = output_prefix_depths(&g).unwrap();
        assert_eq!(prefixes["early_a"], 2);
        assert_eq!(prefixes["late"], 3);
    }

    #[test]
    fn natural_cmp_mixes_numeric_and_text_ids() {
        assert_eq!(natural_cmp("2", "10"), Ordering::Less);
        assert_eq!(natural_cmp("a", "b"), Ordering::Less);
        assert_eq!(natural_cmp("10", "10"), Ordering::Equal);
    }
}
