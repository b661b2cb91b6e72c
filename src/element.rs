//! Declarative tree descriptions consumed by the diff engine.
//!
//! An [`Element`] is the immutable input shape: a tag discriminant, an
//! optional explicit list key, a props payload, and an ordered child list.
//! The reconciler places no constraint on how these trees are produced (a
//! template compiler, hand-written builders, anything), only on their shape.
//!
//! Composite behavior lives behind the [`Component`] trait: `render` produces
//! the subtree, the lifecycle hooks fire during the commit phase, and the
//! error-boundary hooks let a component absorb callback failures from its
//! descendants.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use indexmap::IndexMap;

use crate::error::{CallbackError, ReconcileError};
use crate::hash::KeyHashBuilder;
use crate::host::{HostHandle, PropChange};

/// A single prop value.
///
/// Props are plain data: the reconciler only ever compares them and forwards
/// changed ones to the host-mutation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum PropValue {
    /// Explicit null (distinct from an absent prop).
    Null,
    /// Boolean prop.
    Bool(bool),
    /// Integer prop.
    Int(i64),
    /// Floating-point prop.
    Float(f64),
    /// String prop.
    Str(String),
}

impl From<bool> for PropValue {
    fn from(v: bool) -> Self {
        PropValue::Bool(v)
    }
}

impl From<i64> for PropValue {
    fn from(v: i64) -> Self {
        PropValue::Int(v)
    }
}

impl From<f64> for PropValue {
    fn from(v: f64) -> Self {
        PropValue::Float(v)
    }
}

impl From<&str> for PropValue {
    fn from(v: &str) -> Self {
        PropValue::Str(v.to_owned())
    }
}

impl From<String> for PropValue {
    fn from(v: String) -> Self {
        PropValue::Str(v)
    }
}

/// Ordered prop payload of an element or node.
///
/// Backed by an [`IndexMap`] so iteration follows insertion order, while
/// equality and diffing are lookup-based: two props payloads with the same
/// entries in a different order produce an empty change set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Props {
    entries: IndexMap<String, PropValue, KeyHashBuilder>,
}

impl Props {
    /// Create an empty props payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a prop, returning `self` for chaining.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<PropValue>) -> Self {
        self.set(name, value);
        self
    }

    /// Insert or replace a prop.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<PropValue>) {
        self.entries.insert(name.into(), value.into());
    }

    /// Look up a prop by name.
    pub fn get(&self, name: &str) -> Option<&PropValue> {
        self.entries.get(name)
    }

    /// Number of props.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate props in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Compute the minimal change set that turns `self` into `next`.
    ///
    /// Added and changed props come first (in `next`'s order), removals last
    /// (as `PropChange` entries with a `None` value). An unchanged prop never
    /// appears in the output, so reconciling identical payloads yields an
    /// empty set regardless of construction order.
    pub fn diff(&self, next: &Props) -> Vec<PropChange> {
        let mut changes = Vec::new();
        for (name, value) in &next.entries {
            if self.entries.get(name) != Some(value) {
                changes.push(PropChange {
                    name: name.clone(),
                    value: Some(value.clone()),
                });
            }
        }
        for name in self.entries.keys() {
            if !next.entries.contains_key(name) {
                changes.push(PropChange {
                    name: name.clone(),
                    value: None,
                });
            }
        }
        changes
    }
}

/// Identity of a context channel connecting providers to consumers.
///
/// Allocate one with [`ContextId::new`] and share it between the provider and
/// consumer elements; values flow from the nearest ancestor provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u32);

static NEXT_CONTEXT_ID: AtomicU32 = AtomicU32::new(1);

impl ContextId {
    /// Allocate a fresh, process-unique context identity.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Composite component behavior.
///
/// Identity for same-type checks is the `Arc` allocation: clone the same
/// `Arc<dyn Component>` into every description that should reconcile in
/// place. A freshly boxed component is a different type and forces a remount.
pub trait Component: Send + Sync {
    /// Produce the subtree for the given props.
    ///
    /// Called during the diff phase with the render execute-mode active.
    /// Must be pure with respect to the reconciler: enqueueing updates is
    /// fine, touching the committed tree is not.
    fn render(&self, props: &Props) -> Element;

    /// Called after this component's subtree is first committed.
    fn did_mount(&self) -> Result<(), CallbackError> {
        Ok(())
    }

    /// Called after an update to this component's subtree is committed.
    fn did_update(&self) -> Result<(), CallbackError> {
        Ok(())
    }

    /// Called before this component's subtree is torn down.
    ///
    /// Children receive this before their parents, so a child never observes
    /// a torn-down parent.
    fn will_unmount(&self) -> Result<(), CallbackError> {
        Ok(())
    }

    /// Whether this component absorbs callback errors from descendants.
    fn catches_errors(&self) -> bool {
        false
    }

    /// Receives a descendant's callback error when [`catches_errors`] is
    /// true. The commit proceeds afterwards.
    ///
    /// [`catches_errors`]: Component::catches_errors
    fn did_catch(&self, _error: &CallbackError) {}
}

/// A lazily resolved component: `Pending` until its loader runs, `Resolved`
/// afterwards.
///
/// The placeholder keeps comparing equal to its eventual resolved type, so a
/// tree mounted before resolution does not remount once the loader settles.
pub struct LazyComponent {
    loader: Box<dyn Fn() -> Arc<dyn Component> + Send + Sync>,
    resolved: OnceLock<Arc<dyn Component>>,
}

impl LazyComponent {
    /// Create a lazy component from a loader closure.
    pub fn new<F>(loader: F) -> Arc<Self>
    where
        F: Fn() -> Arc<dyn Component> + Send + Sync + 'static,
    {
        Arc::new(Self {
            loader: Box::new(loader),
            resolved: OnceLock::new(),
        })
    }

    /// The resolved component, if the loader has already settled.
    pub fn resolved(&self) -> Option<&Arc<dyn Component>> {
        self.resolved.get()
    }

    /// Force resolution, running the loader at most once.
    pub fn resolve(&self) -> &Arc<dyn Component> {
        self.resolved.get_or_init(|| (self.loader)())
    }
}

impl fmt::Debug for LazyComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyComponent")
            .field("resolved", &self.resolved.get().is_some())
            .finish()
    }
}

/// Closure rendering a consumer's subtree from the nearest provided value.
pub type ConsumerRender = Arc<dyn Fn(Option<&PropValue>) -> Element + Send + Sync>;

/// Tag discriminant of an element.
#[derive(Clone)]
pub enum ElementKind {
    /// Host element addressed by tag name (the host layer decides what a tag
    /// means: a DOM element, a terminal cell, a native widget).
    Host {
        /// Host tag name; the type key for same-type checks.
        tag: String,
    },
    /// Host text leaf.
    Text {
        /// Text content.
        value: String,
    },
    /// Composite component; type key is the `Arc` allocation.
    Component {
        /// The component implementation.
        component: Arc<dyn Component>,
    },
    /// Lazily resolved composite component.
    Lazy {
        /// The two-state loader.
        lazy: Arc<LazyComponent>,
    },
    /// Groups children without a host instance of its own.
    Fragment,
    /// Commits its children under a different host container.
    Portal {
        /// Target container handle.
        container: HostHandle,
    },
    /// Provides a context value to descendants.
    Provider {
        /// Context channel.
        context: ContextId,
        /// Value visible to descendant consumers.
        value: PropValue,
    },
    /// Renders from the nearest ancestor-provided context value.
    Consumer {
        /// Context channel.
        context: ContextId,
        /// Subtree producer.
        render: ConsumerRender,
    },
    /// Occupies a child slot without producing a node.
    ///
    /// Diffs against nothing; if a previous node held the slot, it is
    /// deleted.
    Empty,
}

impl ElementKind {
    fn name(&self) -> &'static str {
        match self {
            ElementKind::Host { .. } => "Host",
            ElementKind::Text { .. } => "Text",
            ElementKind::Component { .. } => "Component",
            ElementKind::Lazy { .. } => "Lazy",
            ElementKind::Fragment => "Fragment",
            ElementKind::Portal { .. } => "Portal",
            ElementKind::Provider { .. } => "Provider",
            ElementKind::Consumer { .. } => "Consumer",
            ElementKind::Empty => "Empty",
        }
    }
}

impl fmt::Debug for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementKind::Host { tag } => write!(f, "Host({tag})"),
            ElementKind::Text { value } => write!(f, "Text({value:?})"),
            other => f.write_str(other.name()),
        }
    }
}

/// One position in a declarative tree description.
#[derive(Clone)]
pub struct Element {
    pub(crate) kind: ElementKind,
    pub(crate) key: Option<String>,
    pub(crate) props: Props,
    pub(crate) children: Vec<Element>,
}

impl Element {
    fn from_kind(kind: ElementKind) -> Self {
        Self {
            kind,
            key: None,
            props: Props::new(),
            children: Vec::new(),
        }
    }

    /// A host element with the given tag.
    pub fn host(tag: impl Into<String>) -> Self {
        Self::from_kind(ElementKind::Host { tag: tag.into() })
    }

    /// A host text leaf.
    pub fn text(value: impl Into<String>) -> Self {
        Self::from_kind(ElementKind::Text {
            value: value.into(),
        })
    }

    /// A composite component element.
    pub fn component(component: Arc<dyn Component>) -> Self {
        Self::from_kind(ElementKind::Component { component })
    }

    /// A lazily resolved component element.
    pub fn lazy(lazy: Arc<LazyComponent>) -> Self {
        Self::from_kind(ElementKind::Lazy { lazy })
    }

    /// A fragment grouping its children.
    pub fn fragment() -> Self {
        Self::from_kind(ElementKind::Fragment)
    }

    /// A portal committing its children under `container`.
    pub fn portal(container: HostHandle) -> Self {
        Self::from_kind(ElementKind::Portal { container })
    }

    /// A context provider.
    pub fn provider(context: ContextId, value: impl Into<PropValue>) -> Self {
        Self::from_kind(ElementKind::Provider {
            context,
            value: value.into(),
        })
    }

    /// A context consumer.
    pub fn consumer<F>(context: ContextId, render: F) -> Self
    where
        F: Fn(Option<&PropValue>) -> Element + Send + Sync + 'static,
    {
        Self::from_kind(ElementKind::Consumer {
            context,
            render: Arc::new(render),
        })
    }

    /// An empty slot producing no node.
    pub fn empty() -> Self {
        Self::from_kind(ElementKind::Empty)
    }

    /// Attach an explicit list key.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Attach a prop.
    pub fn with_prop(mut self, name: impl Into<String>, value: impl Into<PropValue>) -> Self {
        self.props.set(name, value);
        self
    }

    /// Replace the props payload wholesale.
    pub fn with_props(mut self, props: Props) -> Self {
        self.props = props;
        self
    }

    /// Append children.
    ///
    /// Accepts any iterator and drains it fully before diffing ever sees the
    /// children. Handing this an unbounded generator is the caller's bug,
    /// not the reconciler's.
    pub fn children<I>(mut self, children: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Element>,
    {
        self.children.extend(children.into_iter().map(Into::into));
        self
    }

    /// Append a single child.
    pub fn child(mut self, child: impl Into<Element>) -> Self {
        self.children.push(child.into());
        self
    }

    /// The explicit list key, if any.
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// The tag discriminant.
    pub fn kind(&self) -> &ElementKind {
        &self.kind
    }

    /// The props payload.
    pub fn props(&self) -> &Props {
        &self.props
    }

    /// Validate the description shape.
    ///
    /// Construction errors are fatal and synchronous: a bad description is
    /// rejected at the call that produced it and never reaches the queue.
    pub(crate) fn validate(&self) -> Result<(), ReconcileError> {
        match &self.kind {
            ElementKind::Host { tag } if tag.is_empty() => {
                return Err(ReconcileError::construction("host element with empty tag"));
            }
            ElementKind::Text { .. } if !self.children.is_empty() => {
                return Err(ReconcileError::construction("text node cannot have children"));
            }
            ElementKind::Empty if !self.children.is_empty() => {
                return Err(ReconcileError::construction("empty slot cannot have children"));
            }
            _ => {}
        }
        for child in &self.children {
            child.validate()?;
        }
        Ok(())
    }
}

impl fmt::Debug for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Element")
            .field("kind", &self.kind)
            .field("key", &self.key)
            .field("children", &self.children.len())
            .finish()
    }
}

/// Scalar children become host text nodes.
impl From<&str> for Element {
    fn from(value: &str) -> Self {
        Element::text(value)
    }
}

impl From<String> for Element {
    fn from(value: String) -> Self {
        Element::text(value)
    }
}

impl From<i64> for Element {
    fn from(value: i64) -> Self {
        Element::text(value.to_string())
    }
}

impl From<f64> for Element {
    fn from(value: f64) -> Self {
        Element::text(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn props_diff_is_order_insensitive() {
        let a = Props::new().with("width", 10i64).with("label", "x");
        let b = Props::new().with("label", "x").with("width", 10i64);

        assert!(a.diff(&b).is_empty());
    }

    #[test]
    fn props_diff_reports_removals_with_none() {
        let a = Props::new().with("width", 10i64).with("label", "x");
        let b = Props::new().with("width", 10i64);

        let changes = a.diff(&b);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].name, "label");
        assert!(changes[0].value.is_none());
    }

    #[test]
    fn empty_host_tag_is_a_construction_error() {
        let desc = Element::host("");
        assert!(matches!(
            desc.validate(),
            Err(ReconcileError::Construction(_))
        ));
    }

    #[test]
    fn text_with_children_is_a_construction_error() {
        let desc = Element::text("a").child(Element::text("b"));
        assert!(matches!(
            desc.validate(),
            Err(ReconcileError::Construction(_))
        ));
    }

    #[test]
    fn scalar_children_become_text_elements() {
        let desc = Element::host("row").children(["a", "b"]);
        assert_eq!(desc.children.len(), 2);
        assert!(matches!(desc.children[0].kind, ElementKind::Text { .. }));
    }

    #[test]
    fn iterator_children_are_fully_drained() {
        let desc = Element::host("list").children((0..5i64).map(|i| Element::text(i.to_string())));
        assert_eq!(desc.children.len(), 5);
    }

    #[test]
    fn lazy_component_resolves_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct Leaf;
        impl Component for Leaf {
            fn render(&self, _props: &Props) -> Element {
                Element::text("leaf")
            }
        }

        let loads = Arc::new(AtomicUsize::new(0));
        let loads_clone = loads.clone();
        let lazy = LazyComponent::new(move || {
            loads_clone.fetch_add(1, Ordering::Relaxed);
            Arc::new(Leaf) as Arc<dyn Component>
        });

        assert!(lazy.resolved().is_none());
        let first = Arc::clone(lazy.resolve());
        let second = Arc::clone(lazy.resolve());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(loads.load(Ordering::Relaxed), 1);
    }
}
