// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Immutable element descriptions and their props.
//!
//! An [`Element`] describes one component invocation: what to render, with
//! which props, under which key. Elements are plain data; the renderer turns
//! them into fibers. Children are carried on the element rather than in a
//! `children` prop, which keeps props purely value-typed.

use crate::context::ContextId;
use crate::error::Result;
use crate::hooks::Scope;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// A component render function. Receives the fiber's [`Scope`] (the hook
/// surface) and its props, and returns the child elements to render.
pub type ComponentFn = for<'a, 'b> fn(&'a mut Scope<'b>, &'a Props) -> Result<Vec<Element>>;

/// A named component function.
#[derive(Clone, Copy)]
pub struct ComponentDef {
    /// Display name; becomes the fiber's path segment name.
    pub name: &'static str,
    /// The render function.
    pub render: ComponentFn,
}

impl PartialEq for ComponentDef {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && std::ptr::eq(self.render as *const (), other.render as *const ())
    }
}

impl fmt::Debug for ComponentDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentDef")
            .field("name", &self.name)
            .finish()
    }
}

/// What an element renders as.
#[derive(Clone, Debug, PartialEq)]
pub enum ElementKind {
    /// A user component function.
    Component(ComponentDef),
    /// A transparent grouping: renders its children in place without
    /// contributing a path segment of its own per child type.
    Fragment,
    /// A named grouping that contributes a path segment but has no render
    /// function; its children render directly.
    Intrinsic(String),
    /// A context provider: pushes `value` for `context` while its children
    /// render.
    Provider {
        /// The context whose stack receives the value.
        context: ContextId,
        /// Context name, used for the path segment.
        name: &'static str,
        /// The provided value.
        value: Value,
    },
}

/// An immutable description of a component invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct Element {
    /// What to render.
    pub kind: ElementKind,
    /// Optional stable key distinguishing same-type siblings.
    pub key: Option<String>,
    /// The element's props.
    pub props: Props,
    /// Child elements (fragments, intrinsics and providers render these;
    /// components produce their own children).
    pub children: Vec<Element>,
}

impl Element {
    /// Element for a component function.
    pub fn component(name: &'static str, render: ComponentFn, props: Props) -> Self {
        Self {
            kind: ElementKind::Component(ComponentDef { name, render }),
            key: None,
            props,
            children: Vec::new(),
        }
    }

    /// Transparent fragment wrapping `children`.
    pub fn fragment(children: Vec<Element>) -> Self {
        Self {
            kind: ElementKind::Fragment,
            key: None,
            props: Props::new(),
            children,
        }
    }

    /// Named intrinsic grouping.
    pub fn intrinsic(name: impl Into<String>, children: Vec<Element>) -> Self {
        Self {
            kind: ElementKind::Intrinsic(name.into()),
            key: None,
            props: Props::new(),
            children,
        }
    }

    /// Attach a stable key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Replace the element's children.
    #[must_use]
    pub fn with_children(mut self, children: Vec<Element>) -> Self {
        self.children = children;
        self
    }

    /// The name this element contributes to path segments.
    pub(crate) fn type_name(&self) -> &str {
        match &self.kind {
            ElementKind::Component(def) => def.name,
            ElementKind::Fragment => "<>",
            ElementKind::Intrinsic(name) => name,
            ElementKind::Provider { name, .. } => name,
        }
    }
}

/// A prop value: either a defined JSON value or explicitly undefined.
///
/// Undefined is how not-yet-available resource outputs flow into props: an
/// [`OutputAccessors`](crate::node::OutputAccessors) read of an unfilled
/// output yields `None`, which converts to `Undefined` here. A node whose
/// props contain any undefined value is not registered; the declaring call
/// returns placeholder accessors instead.
#[derive(Clone, Debug, PartialEq)]
pub enum PropValue {
    /// A concrete value. `Value::Null` is a *defined* null.
    Defined(Value),
    /// Not available (yet).
    Undefined,
}

impl From<Value> for PropValue {
    fn from(value: Value) -> Self {
        Self::Defined(value)
    }
}

impl From<Option<Value>> for PropValue {
    fn from(value: Option<Value>) -> Self {
        match value {
            Some(v) => Self::Defined(v),
            None => Self::Undefined,
        }
    }
}

impl From<&str> for PropValue {
    fn from(value: &str) -> Self {
        Self::Defined(Value::String(value.to_string()))
    }
}

impl From<String> for PropValue {
    fn from(value: String) -> Self {
        Self::Defined(Value::String(value))
    }
}

impl From<i64> for PropValue {
    fn from(value: i64) -> Self {
        Self::Defined(Value::from(value))
    }
}

impl From<bool> for PropValue {
    fn from(value: bool) -> Self {
        Self::Defined(Value::Bool(value))
    }
}

/// Ordered prop map with explicit undefined tracking.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Props {
    entries: BTreeMap<String, PropValue>,
}

impl Props {
    /// Empty props.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<PropValue>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    /// Insert a prop.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<PropValue>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Defined value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self.entries.get(key) {
            Some(PropValue::Defined(v)) => Some(v),
            _ => None,
        }
    }

    /// String value for `key`, if defined and a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Whether no props are set.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cleaning pass: inside object-valued props ("env-style maps"), drop
    /// entries whose value is null. Top-level undefined markers survive;
    /// they are what forces placeholder behavior.
    #[must_use]
    pub fn cleaned(&self) -> Self {
        let entries = self
            .entries
            .iter()
            .map(|(k, v)| {
                let v = match v {
                    PropValue::Defined(Value::Object(map)) => {
                        let kept: serde_json::Map<String, Value> = map
                            .iter()
                            .filter(|(_, v)| !v.is_null())
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect();
                        PropValue::Defined(Value::Object(kept))
                    }
                    other => other.clone(),
                };
                (k.clone(), v)
            })
            .collect();
        Self { entries }
    }

    /// Keys whose values are undefined.
    pub fn undefined_keys(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(_, v)| matches!(v, PropValue::Undefined))
            .map(|(k, _)| k.as_str())
            .collect()
    }

    /// The defined entries as a plain JSON map, e.g. for persistence.
    pub fn defined_map(&self) -> serde_json::Map<String, Value> {
        self.entries
            .iter()
            .filter_map(|(k, v)| match v {
                PropValue::Defined(value) => Some((k.clone(), value.clone())),
                PropValue::Undefined => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn nil(_cx: &mut Scope<'_>, _props: &Props) -> Result<Vec<Element>> {
        Ok(Vec::new())
    }

    #[test]
    fn undefined_props_are_tracked() {
        let props = Props::new()
            .with("name", "db")
            .with("parent", Option::<Value>::None);
        assert_eq!(props.get_str("name"), Some("db"));
        assert_eq!(props.get("parent"), None);
        assert_eq!(props.undefined_keys(), vec!["parent"]);
    }

    #[test]
    fn cleaning_drops_null_entries_in_env_maps() {
        let props = Props::new().with(
            "env",
            json!({"REGION": "us-east-1", "OPTIONAL": null}),
        );
        let cleaned = props.cleaned();
        assert_eq!(cleaned.get("env"), Some(&json!({"REGION": "us-east-1"})));
        assert!(cleaned.undefined_keys().is_empty());
    }

    #[test]
    fn defined_map_skips_undefined() {
        let props = Props::new()
            .with("a", 1i64)
            .with("b", Option::<Value>::None);
        let map = props.defined_map();
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("a"), Some(&json!(1)));
    }

    #[test]
    fn component_elements_compare_by_function_and_props() {
        let a = Element::component("Nil", nil, Props::new().with("x", 1i64));
        let b = Element::component("Nil", nil, Props::new().with("x", 1i64));
        let c = Element::component("Nil", nil, Props::new().with("x", 2i64));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn keys_distinguish_elements() {
        let a = Element::fragment(Vec::new()).with_key("left");
        let b = Element::fragment(Vec::new()).with_key("right");
        assert_ne!(a, b);
    }
}
