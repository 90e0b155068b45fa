use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::selector::{self, Selector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomError {
    #[error("node {0} does not exist")]
    Unknown(NodeId),
    #[error("node {0} is not an element")]
    NotAnElement(NodeId),
    #[error("node {0} has no parent")]
    Detached(NodeId),
    #[error("appending {child} under {parent} would create a cycle")]
    Cycle { parent: NodeId, child: NodeId },
    #[error("node {0} does not accept new children")]
    Frozen(NodeId),
}

#[derive(Debug, Clone)]
struct StyleValue {
    value: String,
    important: bool,
}

#[derive(Debug, Clone)]
enum NodeData {
    Element {
        tag: String,
        attrs: IndexMap<String, String>,
        style: IndexMap<String, StyleValue>,
    },
    Text(String),
}

#[derive(Debug, Clone)]
struct Node {
    data: NodeData,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    frozen: bool,
}

/// One structural change under the document root, as an observer sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRecord {
    pub target: NodeId,
    pub added: Vec<NodeId>,
    pub removed: Vec<NodeId>,
}

/// Borrowed element view used for selector matching.
pub struct ElementRef<'a> {
    tag: &'a str,
    attrs: &'a IndexMap<String, String>,
}

impl selector::Element for ElementRef<'_> {
    fn tag(&self) -> &str {
        self.tag
    }

    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    #[serde(default = "default_tag")]
    pub tag: String,
    #[serde(default)]
    pub attrs: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeSnapshot>,
}

impl Default for NodeSnapshot {
    fn default() -> Self {
        Self {
            tag: default_tag(),
            attrs: IndexMap::new(),
            text: None,
            children: Vec::new(),
        }
    }
}

fn default_tag() -> String {
    "div".into()
}

/// A serialized page: its URL and the contents of `<body>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub url: String,
    #[serde(default)]
    pub body: NodeSnapshot,
}

impl PageSnapshot {
    pub fn parse(data: &str) -> Result<Self> {
        serde_yaml::from_str(data).context("dom: parse page snapshot")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("dom: read page snapshot {}", path.display()))?;
        Self::parse(&data).with_context(|| format!("dom: load {}", path.display()))
    }
}

/// In-memory page owned by the host. The engine only adds attributes, styles
/// and its own marker nodes to it.
#[derive(Debug, Clone)]
pub struct Document {
    url: String,
    nodes: Vec<Node>,
    root: NodeId,
    body: NodeId,
    mutations: Vec<MutationRecord>,
}

impl Document {
    pub fn new(url: impl Into<String>) -> Self {
        let mut doc = Self {
            url: url.into(),
            nodes: Vec::new(),
            root: NodeId(0),
            body: NodeId(0),
            mutations: Vec::new(),
        };
        doc.root = doc.create_element("html");
        doc.body = doc.create_element("body");
        doc.link(doc.root, doc.body);
        doc
    }

    pub fn from_snapshot(snapshot: &PageSnapshot) -> Self {
        let mut doc = Self::new(snapshot.url.clone());
        let body = doc.body;
        if let NodeData::Element { attrs, .. } = &mut doc.nodes[body.0].data {
            *attrs = snapshot.body.attrs.clone();
        }
        doc.build_children(body, &snapshot.body);
        doc
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// In-app navigation: the URL changes, the document stays.
    pub fn navigate(&mut self, url: impl Into<String>) {
        self.url = url.into();
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn body(&self) -> NodeId {
        self.body
    }

    pub fn take_mutations(&mut self) -> Vec<MutationRecord> {
        std::mem::take(&mut self.mutations)
    }

    pub fn create_element(&mut self, tag: &str) -> NodeId {
        self.push(NodeData::Element {
            tag: tag.to_ascii_lowercase(),
            attrs: IndexMap::new(),
            style: IndexMap::new(),
        })
    }

    pub fn create_text(&mut self, text: &str) -> NodeId {
        self.push(NodeData::Text(text.to_string()))
    }

    /// Renders `snapshot` as a new last child of `parent`, the way the host
    /// framework would insert a freshly rendered subtree.
    pub fn insert_snapshot(
        &mut self,
        parent: NodeId,
        snapshot: &NodeSnapshot,
    ) -> Result<NodeId, DomError> {
        let node = self.create_element(&snapshot.tag);
        if let NodeData::Element { attrs, .. } = &mut self.nodes[node.0].data {
            *attrs = snapshot.attrs.clone();
        }
        self.build_children(node, snapshot);
        self.append_child(parent, node)?;
        Ok(node)
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), DomError> {
        self.element(parent)?;
        self.node(child)?;
        if self.nodes[parent.0].frozen {
            return Err(DomError::Frozen(parent));
        }
        if self.ancestors_inclusive(parent).any(|n| n == child) {
            return Err(DomError::Cycle { parent, child });
        }
        if self.nodes[child.0].parent.is_some() {
            self.remove(child)?;
        }
        self.link(parent, child);
        if self.is_connected(parent) {
            self.mutations.push(MutationRecord {
                target: parent,
                added: vec![child],
                removed: Vec::new(),
            });
        }
        Ok(())
    }

    /// Host-owned subtree that rejects foreign children from now on. Its
    /// attributes and styles stay writable.
    pub fn freeze(&mut self, node: NodeId) -> Result<(), DomError> {
        self.element(node)?;
        self.nodes[node.0].frozen = true;
        Ok(())
    }

    /// Detaches `node` from its parent. The node stays addressable.
    pub fn remove(&mut self, node: NodeId) -> Result<(), DomError> {
        let parent = self.node(node)?.parent.ok_or(DomError::Detached(node))?;
        let connected = self.is_connected(parent);
        self.nodes[parent.0].children.retain(|c| *c != node);
        self.nodes[node.0].parent = None;
        if connected {
            self.mutations.push(MutationRecord {
                target: parent,
                added: Vec::new(),
                removed: vec![node],
            });
        }
        Ok(())
    }

    pub fn is_element(&self, node: NodeId) -> bool {
        self.element(node).is_ok()
    }

    pub fn tag(&self, node: NodeId) -> Option<&str> {
        self.element(node).ok().map(|el| el.tag)
    }

    pub fn attr(&self, node: NodeId, name: &str) -> Option<&str> {
        self.element(node).ok()?.attrs.get(name).map(String::as_str)
    }

    pub fn has_attr(&self, node: NodeId, name: &str) -> bool {
        self.attr(node, name).is_some()
    }

    pub fn set_attr(&mut self, node: NodeId, name: &str, value: &str) -> Result<(), DomError> {
        match self.data_mut(node)? {
            NodeData::Element { attrs, .. } => {
                attrs.insert(name.to_ascii_lowercase(), value.to_string());
                Ok(())
            }
            NodeData::Text(_) => Err(DomError::NotAnElement(node)),
        }
    }

    pub fn remove_attr(&mut self, node: NodeId, name: &str) -> Result<bool, DomError> {
        match self.data_mut(node)? {
            NodeData::Element { attrs, .. } => Ok(attrs.shift_remove(name).is_some()),
            NodeData::Text(_) => Err(DomError::NotAnElement(node)),
        }
    }

    pub fn style(&self, node: NodeId, property: &str) -> Option<&str> {
        match &self.nodes.get(node.0)?.data {
            NodeData::Element { style, .. } => style.get(property).map(|s| s.value.as_str()),
            NodeData::Text(_) => None,
        }
    }

    pub fn style_is_important(&self, node: NodeId, property: &str) -> bool {
        match self.nodes.get(node.0).map(|n| &n.data) {
            Some(NodeData::Element { style, .. }) => {
                style.get(property).is_some_and(|s| s.important)
            }
            _ => false,
        }
    }

    pub fn set_style(&mut self, node: NodeId, property: &str, value: &str) -> Result<(), DomError> {
        self.write_style(node, property, value, false)
    }

    pub fn set_style_important(
        &mut self,
        node: NodeId,
        property: &str,
        value: &str,
    ) -> Result<(), DomError> {
        self.write_style(node, property, value, true)
    }

    pub fn remove_style(&mut self, node: NodeId, property: &str) -> Result<(), DomError> {
        match self.data_mut(node)? {
            NodeData::Element { style, .. } => {
                style.shift_remove(property);
                Ok(())
            }
            NodeData::Text(_) => Err(DomError::NotAnElement(node)),
        }
    }

    /// No stylesheets exist in this model, so the inline value is the
    /// computed one.
    pub fn computed_position(&self, node: NodeId) -> &str {
        self.style(node, "position").unwrap_or("static")
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.get(node.0)?.parent
    }

    pub fn element_children(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .get(node.0)
            .map(|n| n.children.as_slice())
            .unwrap_or_default()
            .iter()
            .copied()
            .filter(|c| self.is_element(*c))
    }

    /// Position among the parent's element children.
    pub fn element_index(&self, node: NodeId) -> Option<usize> {
        let parent = self.parent(node)?;
        self.element_children(parent).position(|c| c == node)
    }

    pub fn text_content(&self, node: NodeId) -> String {
        self.text_content_excluding(node, |_| false)
    }

    /// Text of `node` with every child subtree `skip` selects left out.
    pub fn text_content_excluding(&self, node: NodeId, skip: impl Fn(NodeId) -> bool) -> String {
        let mut out = String::new();
        self.collect_text(node, &skip, &mut out);
        out
    }

    pub fn is_connected(&self, node: NodeId) -> bool {
        self.ancestors_inclusive(node).any(|n| n == self.root)
    }

    /// Element descendants of `node` in document order, `node` excluded.
    pub fn descendants(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = match self.nodes.get(node.0) {
            Some(n) => n.children.iter().rev().copied().collect(),
            None => return out,
        };
        while let Some(next) = stack.pop() {
            if !self.is_element(next) {
                continue;
            }
            out.push(next);
            stack.extend(self.nodes[next.0].children.iter().rev().copied());
        }
        out
    }

    pub fn matches(&self, node: NodeId, selector: &Selector) -> bool {
        self.element(node)
            .map(|el| selector.matches(&el))
            .unwrap_or(false)
    }

    pub fn closest(&self, node: NodeId, selector: &Selector) -> Option<NodeId> {
        self.ancestors_inclusive(node)
            .find(|n| self.matches(*n, selector))
    }

    /// Every connected element matching `selector`, in document order.
    pub fn query_all(&self, selector: &Selector) -> Vec<NodeId> {
        std::iter::once(self.root)
            .chain(self.descendants(self.root))
            .filter(|n| self.matches(*n, selector))
            .collect()
    }

    pub fn query_within(&self, node: NodeId, selector: &Selector) -> Vec<NodeId> {
        self.descendants(node)
            .into_iter()
            .filter(|n| self.matches(*n, selector))
            .collect()
    }

    pub fn find_descendant(
        &self,
        node: NodeId,
        mut predicate: impl FnMut(NodeId) -> bool,
    ) -> Option<NodeId> {
        self.descendants(node).into_iter().find(|n| predicate(*n))
    }

    /// The `href` attribute resolved against the page URL.
    pub fn href(&self, node: NodeId) -> Option<String> {
        let raw = self.attr(node, "href")?;
        let resolved = Url::parse(&self.url)
            .and_then(|base| base.join(raw))
            .or_else(|_| Url::parse(raw));
        Some(match resolved {
            Ok(url) => url.to_string(),
            Err(_) => raw.to_string(),
        })
    }

    fn push(&mut self, data: NodeData) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            data,
            parent: None,
            children: Vec::new(),
            frozen: false,
        });
        id
    }

    fn link(&mut self, parent: NodeId, child: NodeId) {
        self.nodes[child.0].parent = Some(parent);
        self.nodes[parent.0].children.push(child);
    }

    fn build_children(&mut self, parent: NodeId, snapshot: &NodeSnapshot) {
        if let Some(text) = snapshot.text.as_deref() {
            let text = self.create_text(text);
            self.link(parent, text);
        }
        for child in &snapshot.children {
            let node = self.create_element(&child.tag);
            if let NodeData::Element { attrs, .. } = &mut self.nodes[node.0].data {
                *attrs = child.attrs.clone();
            }
            self.link(parent, node);
            self.build_children(node, child);
        }
    }

    fn collect_text(&self, node: NodeId, skip: &dyn Fn(NodeId) -> bool, out: &mut String) {
        let Some(n) = self.nodes.get(node.0) else {
            return;
        };
        match &n.data {
            NodeData::Text(text) => out.push_str(text),
            NodeData::Element { .. } => {
                for child in n.children.iter().filter(|c| !skip(**c)) {
                    self.collect_text(*child, skip, out);
                }
            }
        }
    }

    fn ancestors_inclusive(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::successors(
            self.nodes.get(node.0).map(|_| node),
            move |n| self.nodes[n.0].parent,
        )
    }

    fn node(&self, node: NodeId) -> Result<&Node, DomError> {
        self.nodes.get(node.0).ok_or(DomError::Unknown(node))
    }

    fn data_mut(&mut self, node: NodeId) -> Result<&mut NodeData, DomError> {
        self.nodes
            .get_mut(node.0)
            .map(|n| &mut n.data)
            .ok_or(DomError::Unknown(node))
    }

    fn element(&self, node: NodeId) -> Result<ElementRef<'_>, DomError> {
        match &self.node(node)?.data {
            NodeData::Element { tag, attrs, .. } => Ok(ElementRef { tag, attrs }),
            NodeData::Text(_) => Err(DomError::NotAnElement(node)),
        }
    }

    fn write_style(
        &mut self,
        node: NodeId,
        property: &str,
        value: &str,
        important: bool,
    ) -> Result<(), DomError> {
        match self.data_mut(node)? {
            NodeData::Element { style, .. } => {
                style.insert(
                    property.to_string(),
                    StyleValue {
                        value: value.to_string(),
                        important,
                    },
                );
                Ok(())
            }
            NodeData::Text(_) => Err(DomError::NotAnElement(node)),
        }
    }
}

/// First `max` characters of `text`.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
