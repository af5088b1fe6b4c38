//! Accessibility snapshots rendered as a compact text tree.
//!
//! ```text
//! - document "Example Domain":
//!   - heading "Example Domain" [level=1]
//!   - link "More information..." [ref=@e1]:
//!     - /url: https://www.iana.org/domains/example
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::browser::{AxNode, BrowserEngine, ElementHandle};
use crate::error::Result;
use crate::page::Page;
use crate::refs::{Ref, RefMap};
use crate::resolver::Resolver;

/// Roles that get a ref when the node carries an element handle.
const INTERACTIVE_ROLES: &[&str] = &[
    "button",
    "link",
    "textbox",
    "checkbox",
    "radio",
    "combobox",
    "listbox",
    "menuitem",
    "menuitemcheckbox",
    "menuitemradio",
    "option",
    "searchbox",
    "slider",
    "spinbutton",
    "switch",
    "tab",
    "treeitem",
];

/// Named nodes of these roles survive interactive filtering as context.
const CONTENT_ROLES: &[&str] = &[
    "heading",
    "cell",
    "gridcell",
    "columnheader",
    "rowheader",
    "listitem",
    "article",
    "region",
    "main",
    "navigation",
    "banner",
    "contentinfo",
    "complementary",
    "form",
];

/// Unnamed wrappers of these roles are hoisted away in compact mode.
const STRUCTURAL_ROLES: &[&str] = &[
    "generic",
    "group",
    "list",
    "table",
    "row",
    "rowgroup",
    "grid",
    "treegrid",
    "menu",
    "menubar",
    "toolbar",
    "tablist",
    "tree",
    "directory",
    "document",
    "presentation",
    "none",
    "paragraph",
    "section",
    "div",
];

pub fn is_interactive(role: &str) -> bool {
    INTERACTIVE_ROLES.contains(&role)
}

fn is_content(role: &str) -> bool {
    CONTENT_ROLES.contains(&role)
}

fn is_structural(role: &str) -> bool {
    STRUCTURAL_ROLES.contains(&role)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotOptions {
    /// Keep only interactive nodes, their ancestors and named content nodes.
    pub interactive: bool,
    /// Root is depth 0; nodes whose children were cut are marked `[truncated]`.
    pub max_depth: Option<usize>,
    /// Hoist unnamed structural wrappers and omit default qualifiers.
    pub compact: bool,
    /// Scope to the subtree of the first match (selector or ref).
    pub selector: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    pub ref_id: Option<Ref>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checked: Option<bool>,
    pub disabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub depth: usize,
    pub truncated: bool,
    pub children: Vec<Node>,
    #[serde(skip)]
    handle: Option<ElementHandle>,
}

impl Node {
    fn from_ax(ax: &AxNode, name: Option<String>, children: Vec<Node>) -> Self {
        Self {
            role: ax.role.clone(),
            name,
            ref_id: None,
            level: ax.level,
            checked: ax.checked,
            disabled: ax.disabled,
            value: ax.value.clone(),
            url: ax.url.clone(),
            depth: 0,
            truncated: false,
            children,
            handle: ax.handle,
        }
    }

    /// Pre-order walk over this node and its descendants.
    pub fn walk(&self) -> Box<dyn Iterator<Item = &Node> + '_> {
        Box::new(std::iter::once(self).chain(self.children.iter().flat_map(|c| c.walk())))
    }
}

/// Immutable result of one `snapshot()` call.
#[derive(Debug)]
pub struct Snapshot {
    pub nodes: Vec<Node>,
    pub refs: Arc<RefMap>,
    pub compact: bool,
}

impl Snapshot {
    pub fn generation(&self) -> u64 {
        self.refs.generation()
    }

    pub fn ref_count(&self) -> usize {
        self.refs.len()
    }

    /// Ref-carrying nodes in ref order.
    pub fn ref_nodes(&self) -> Vec<&Node> {
        self.nodes
            .iter()
            .flat_map(|n| n.walk())
            .filter(|n| n.ref_id.is_some())
            .collect()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for node in &self.nodes {
            render_node(node, self.compact, &mut out);
        }
        out
    }

    pub fn view(&self) -> SnapshotView {
        SnapshotView {
            tree: self.render(),
            generation: self.generation(),
            ref_count: self.ref_count(),
        }
    }
}

/// What callers of `snapshot` get back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotView {
    pub tree: String,
    pub generation: u64,
    pub ref_count: usize,
}

pub struct SnapshotEngine<'a> {
    engine: &'a dyn BrowserEngine,
}

impl<'a> SnapshotEngine<'a> {
    pub fn new(engine: &'a dyn BrowserEngine) -> Self {
        Self { engine }
    }

    /// Take a snapshot and make it the page's active generation.
    pub async fn snapshot(&self, page: &Page, options: &SnapshotOptions) -> Result<Arc<Snapshot>> {
        let scope = match options.selector.as_deref() {
            Some(selector) => Some(Resolver::new(self.engine, page).resolve(selector).await?),
            None => None,
        };

        let ax = self.engine.accessibility_tree(page.target(), scope).await?;

        let mut nodes = shape(&ax, options);
        limit_depth(&mut nodes, 0, options.max_depth);

        let mut handles = Vec::new();
        for node in nodes.iter_mut() {
            collect_refs(node, &mut handles);
        }

        let refs = page.refs().install(handles);
        for node in nodes.iter_mut() {
            stamp_generation(node, refs.generation());
        }

        debug!(
            page = %page.id(),
            generation = refs.generation(),
            refs = refs.len(),
            "snapshot taken"
        );

        let snapshot = Arc::new(Snapshot {
            nodes,
            refs,
            compact: options.compact,
        });
        page.set_snapshot(snapshot.clone());
        Ok(snapshot)
    }
}

/// Filter and hoist one accessibility node. Returns zero nodes when pruned,
/// several when a compact wrapper is replaced by its children.
fn shape(ax: &AxNode, options: &SnapshotOptions) -> Vec<Node> {
    let children: Vec<Node> = ax.children.iter().flat_map(|c| shape(c, options)).collect();

    let role = ax.role.as_str();
    let name = ax
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string);

    if role == "text" {
        if name.is_none() || options.interactive {
            return Vec::new();
        }
        return vec![Node::from_ax(ax, name, Vec::new())];
    }

    if options.interactive
        && !is_interactive(role)
        && children.is_empty()
        && !(is_content(role) && name.is_some())
    {
        return Vec::new();
    }

    if options.compact && is_structural(role) && name.is_none() {
        return children;
    }

    vec![Node::from_ax(ax, name, children)]
}

fn limit_depth(nodes: &mut [Node], depth: usize, max_depth: Option<usize>) {
    for node in nodes.iter_mut() {
        node.depth = depth;
        if max_depth == Some(depth) {
            if !node.children.is_empty() {
                node.children.clear();
                node.truncated = true;
            }
        } else {
            limit_depth(&mut node.children, depth + 1, max_depth);
        }
    }
}

fn collect_refs(node: &mut Node, handles: &mut Vec<ElementHandle>) {
    if is_interactive(&node.role) {
        if let Some(handle) = node.handle {
            handles.push(handle);
            node.ref_id = Some(Ref {
                index: handles.len() as u32,
                generation: 0,
            });
        }
    }
    for child in node.children.iter_mut() {
        collect_refs(child, handles);
    }
}

fn stamp_generation(node: &mut Node, generation: u64) {
    if let Some(r) = node.ref_id.as_mut() {
        r.generation = generation;
    }
    for child in node.children.iter_mut() {
        stamp_generation(child, generation);
    }
}

fn render_node(node: &Node, compact: bool, out: &mut String) {
    let indent = "  ".repeat(node.depth);

    // Text nodes: - text: content
    if node.role == "text" {
        if let Some(content) = &node.name {
            out.push_str(&format!("{}- text: {}\n", indent, content));
        }
        return;
    }

    let mut line = format!("{}- {}", indent, node.role);

    if let Some(name) = &node.name {
        line.push_str(&format!(" \"{}\"", name));
    }
    if let Some(r) = &node.ref_id {
        line.push_str(&format!(" [ref={}]", r));
    }
    if let Some(level) = node.level {
        line.push_str(&format!(" [level={}]", level));
    }
    match node.checked {
        Some(true) => line.push_str(" [checked]"),
        Some(false) if !compact => line.push_str(" [checked=false]"),
        _ => {}
    }
    if node.disabled {
        line.push_str(" [disabled]");
    }
    if let Some(value) = node.value.as_deref().filter(|v| !v.is_empty()) {
        line.push_str(&format!(" [value=\"{}\"]", value));
    }
    if node.truncated {
        line.push_str(" [truncated]");
    }

    if !node.children.is_empty() || node.url.is_some() {
        line.push(':');
    }

    out.push_str(&line);
    out.push('\n');

    if let Some(url) = &node.url {
        out.push_str(&format!("{}  - /url: {}\n", indent, url));
    }

    for child in &node.children {
        render_node(child, compact, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(name: &str, id: i64, url: &str) -> AxNode {
        let mut node = AxNode::named("link", name).with_handle(ElementHandle(id));
        node.url = Some(url.to_string());
        node
    }

    fn sample_tree() -> AxNode {
        let mut heading = AxNode::named("heading", "Example Domain");
        heading.level = Some(1);

        AxNode::named("document", "Example Domain").with_children(vec![
            AxNode::new("generic").with_children(vec![
                heading,
                AxNode::new("paragraph")
                    .with_children(vec![AxNode::named("text", "This domain is for use.")]),
                AxNode::new("paragraph").with_children(vec![link(
                    "More information...",
                    5,
                    "https://www.iana.org/domains/example",
                )]),
            ]),
        ])
    }

    fn build(ax: &AxNode, options: &SnapshotOptions) -> Vec<Node> {
        let mut nodes = shape(ax, options);
        limit_depth(&mut nodes, 0, options.max_depth);
        let mut handles = Vec::new();
        for node in nodes.iter_mut() {
            collect_refs(node, &mut handles);
        }
        nodes
    }

    fn render(nodes: &[Node], compact: bool) -> String {
        let mut out = String::new();
        for node in nodes {
            render_node(node, compact, &mut out);
        }
        out
    }

    #[test]
    fn full_tree_keeps_text_and_structure() {
        let nodes = build(&sample_tree(), &SnapshotOptions::default());
        let text = render(&nodes, false);

        assert!(text.contains("- text: This domain is for use."));
        assert!(text.contains("  - generic:"));
        assert!(text.contains("- link \"More information...\" [ref=@e1]:"));
        assert!(text.contains("- /url: https://www.iana.org/domains/example"));
    }

    #[test]
    fn interactive_keeps_headings_as_context_without_refs() {
        let options = SnapshotOptions {
            interactive: true,
            ..Default::default()
        };
        let nodes = build(&sample_tree(), &options);
        let text = render(&nodes, false);

        assert!(text.contains("- heading \"Example Domain\" [level=1]\n"));
        assert!(!text.contains("text:"));
        // The text-only paragraph has nothing interactive under it.
        assert_eq!(text.matches("- paragraph").count(), 1);
    }

    #[test]
    fn compact_hoists_unnamed_wrappers() {
        let options = SnapshotOptions {
            compact: true,
            ..Default::default()
        };
        let nodes = build(&sample_tree(), &options);
        let text = render(&nodes, true);

        assert!(!text.contains("generic"));
        assert!(!text.contains("paragraph"));
        assert!(text.starts_with("- document \"Example Domain\":\n  - heading"));
        assert!(text.contains("  - link \"More information...\" [ref=@e1]:"));
    }

    #[test]
    fn max_depth_marks_truncated_nodes() {
        let options = SnapshotOptions {
            max_depth: Some(1),
            ..Default::default()
        };
        let nodes = build(&sample_tree(), &options);
        let text = render(&nodes, false);

        assert_eq!(text, "- document \"Example Domain\":\n  - generic [truncated]\n");
    }

    #[test]
    fn refs_follow_pre_order_and_skip_handleless_nodes() {
        let tree = AxNode::new("document").with_children(vec![
            AxNode::named("button", "A").with_handle(ElementHandle(1)),
            AxNode::named("button", "Ghost"),
            AxNode::new("list").with_children(vec![
                AxNode::named("checkbox", "B").with_handle(ElementHandle(2)),
            ]),
            AxNode::named("textbox", "C").with_handle(ElementHandle(3)),
        ]);
        let nodes = build(&tree, &SnapshotOptions::default());

        let refs: Vec<(String, u32)> = nodes
            .iter()
            .flat_map(|n| n.walk())
            .filter_map(|n| n.ref_id.map(|r| (n.name.clone().unwrap_or_default(), r.index)))
            .collect();

        assert_eq!(
            refs,
            vec![("A".to_string(), 1), ("B".to_string(), 2), ("C".to_string(), 3)]
        );
    }

    #[test]
    fn compact_omits_default_qualifiers() {
        let mut unchecked = AxNode::named("checkbox", "Remember me").with_handle(ElementHandle(9));
        unchecked.checked = Some(false);
        let tree = AxNode::new("document").with_children(vec![unchecked]);

        let full = render(&build(&tree, &SnapshotOptions::default()), false);
        assert!(full.contains("[checked=false]"));

        let options = SnapshotOptions {
            compact: true,
            ..Default::default()
        };
        let compact = render(&build(&tree, &options), true);
        assert_eq!(compact, "- checkbox \"Remember me\" [ref=@e1]\n");
    }
}
