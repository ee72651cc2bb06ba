//! The context engine: a polymorphic, refcounted tree of typed nodes with
//! finalize-or-abort construction semantics.
//!
//! Ported from `src/disir.c` / `lib/disir.c` and the context state machine in
//! spec.md §4.1. A [`Context`] is a cheap handle (`Rc<RefCell<Node>>` clone)
//! around a tree node; cloning a handle is "acquiring a reference" and
//! dropping one is `putcontext` — Rust's own `Rc` refcounting gives us the
//! "refcounted handles in a single-threaded core" design note for free,
//! without hand-rolled atomics we don't need (see spec.md §9).

use std::cell::{Ref, RefCell, RefMut};
use std::rc::{Rc, Weak};

use tracing::{debug, warn};

use crate::default::DefaultList;
use crate::error::Error;
use crate::restriction::{self, RestrictionEntry, RestrictionKind, RestrictionPayload};
use crate::value::{Value, ValueType};
use crate::version::Version;
use crate::element_storage::ElementStorage;

/// Discriminant for the tagged-union [`Node`] payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Mold,
    Config,
    Section,
    Keyval,
    Default,
    Documentation,
    Restriction,
    FreeText,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Constructing,
    Finalized,
    Destroyed,
}

#[derive(Debug, Clone)]
pub struct Documentation {
    pub text: String,
    pub introduced: Version,
}

pub(crate) type NodeRef = Rc<RefCell<Node>>;
pub(crate) type WeakNodeRef = Weak<RefCell<Node>>;

#[derive(Default)]
pub struct MoldPayload {
    pub doc: Vec<Documentation>,
    pub elements: ElementStorage<NodeRef>,
    pub version: Version,
}

pub struct ConfigPayload {
    pub mold: NodeRef,
    pub version: Version,
    pub elements: ElementStorage<NodeRef>,
}

#[derive(Default)]
pub struct SectionPayload {
    pub doc: Vec<Documentation>,
    pub restrictions: Vec<RestrictionEntry>,
    pub elements: ElementStorage<NodeRef>,
    /// `Some` only when this section lives under a MOLD.
    pub introduced: Option<Version>,
    pub deprecated: Option<Version>,
    /// `Some` only when this section lives under a CONFIG.
    pub mold_equiv: Option<WeakNodeRef>,
}

#[derive(Default)]
pub struct KeyvalPayload {
    pub value_type: Option<ValueType>,
    pub doc: Vec<Documentation>,
    pub restrictions: Vec<RestrictionEntry>,
    /// `Some` only when this keyval lives under a MOLD.
    pub defaults: Option<DefaultList>,
    pub introduced: Option<Version>,
    /// `Some` only when this keyval lives under a CONFIG.
    pub value: Option<Value>,
    pub disabled: bool,
    pub mold_equiv: Option<WeakNodeRef>,
}

pub struct DefaultPayload {
    pub introduced: Version,
    pub value: Option<Value>,
}

pub struct RestrictionPayloadNode {
    pub entry: Option<RestrictionEntry>,
}

pub enum Payload {
    Mold(MoldPayload),
    Config(ConfigPayload),
    Section(SectionPayload),
    Keyval(KeyvalPayload),
    Default(DefaultPayload),
    Documentation(Documentation),
    Restriction(RestrictionPayloadNode),
    FreeText(String),
}

pub struct Node {
    pub tag: Tag,
    pub state: Lifecycle,
    /// Cleared to `false` the moment a deferred invariant fails; survives
    /// finalize so batch tooling can report every problem at once
    /// (spec.md §9, "Deferred errors").
    pub valid: bool,
    pub name: Option<String>,
    pub parent: Option<WeakNodeRef>,
    pub root: Option<WeakNodeRef>,
    pub payload: Payload,
    pub error: Option<String>,
}

impl Node {
    fn new(tag: Tag, payload: Payload) -> Self {
        Node {
            tag,
            state: Lifecycle::Constructing,
            valid: true,
            name: None,
            parent: None,
            root: None,
            payload,
            error: None,
        }
    }
}

/// A handle to a node in the context tree. Clone to acquire another
/// reference; drop (or call [`Context::putcontext`]) to release one.
#[derive(Clone)]
pub struct Context {
    pub(crate) inner: NodeRef,
}

impl Context {
    pub(crate) fn from_inner(inner: NodeRef) -> Self {
        Context { inner }
    }

    /// Crate-visible escape hatch for sibling modules (`mold`, `query`,
    /// `update`, `generate`) that need to assemble nodes `begin`/`finalize`
    /// alone can't express, such as binding a CONFIG to its MOLD at creation.
    pub(crate) fn from_inner_pub(inner: NodeRef) -> Self {
        Context { inner }
    }

    pub(crate) fn inner_ref(&self) -> &NodeRef {
        &self.inner
    }

    pub(crate) fn require_state_pub(&self, expected: Lifecycle) -> Result<(), Error> {
        self.require_state(expected)
    }

    pub(crate) fn set_state_pub(&self, state: Lifecycle) {
        self.borrow_mut().state = state;
    }

    /// The tag of this context's root (the toplevel MOLD or CONFIG).
    pub(crate) fn root_tag_pub(&self) -> Option<Tag> {
        let node = self.borrow();
        match &node.root {
            Some(root) => root.upgrade().map(|r| r.borrow().tag),
            None => Some(node.tag),
        }
    }

    pub(crate) fn borrow(&self) -> Ref<'_, Node> {
        self.inner.borrow()
    }

    pub(crate) fn borrow_mut(&self) -> RefMut<'_, Node> {
        self.inner.borrow_mut()
    }

    pub fn tag(&self) -> Tag {
        self.borrow().tag
    }

    pub fn state(&self) -> Lifecycle {
        self.borrow().state
    }

    pub fn is_valid(&self) -> bool {
        let node = self.borrow();
        node.state != Lifecycle::Destroyed && node.valid
    }

    pub fn name(&self) -> Option<String> {
        self.borrow().name.clone()
    }

    /// Releases this handle. Provided for API symmetry with the source
    /// design's `disir_putcontext`; Rust's `Drop` does the actual release,
    /// this simply makes the release explicit at the call site.
    pub fn putcontext(self) {
        drop(self)
    }

    /// Starts construction of a new child context of the given tag.
    /// `parent = None` is only legal for MOLD and CONFIG roots.
    pub fn begin(parent: Option<&Context>, tag: Tag) -> Result<Context, Error> {
        let payload = match tag {
            Tag::Mold => Payload::Mold(MoldPayload::default()),
            Tag::Config => {
                return Err(Error::InvalidArgument(
                    "CONFIG must be started with config_begin(mold), not begin()".into(),
                ));
            }
            Tag::Section => Payload::Section(SectionPayload::default()),
            Tag::Keyval => Payload::Keyval(KeyvalPayload::default()),
            Tag::Default => Payload::Default(DefaultPayload {
                introduced: Version::DEFAULT,
                value: None,
            }),
            Tag::Documentation => Payload::Documentation(Documentation {
                text: String::new(),
                introduced: Version::DEFAULT,
            }),
            Tag::Restriction => Payload::Restriction(RestrictionPayloadNode { entry: None }),
            Tag::FreeText => Payload::FreeText(String::new()),
        };

        if let Some(parent) = parent {
            if parent.state() == Lifecycle::Destroyed {
                return Err(Error::DestroyedContext(
                    "cannot begin a child under a destroyed context".into(),
                ));
            }
        } else if !matches!(tag, Tag::Mold) {
            return Err(Error::InvalidArgument(format!(
                "{tag:?} requires a parent context"
            )));
        }

        let mut node = Node::new(tag, payload);
        if let Some(parent) = parent {
            node.parent = Some(Rc::downgrade(&parent.inner));
            node.root = Some(parent.borrow().root.clone().unwrap_or_else(|| {
                // the parent IS the root (MOLD or CONFIG toplevel)
                Rc::downgrade(&parent.inner)
            }));
        }

        let inner = Rc::new(RefCell::new(node));
        if parent.is_none() && matches!(tag, Tag::Mold) {
            inner.borrow_mut().root = Some(Rc::downgrade(&inner));
        }

        debug!(?tag, "context begin");
        Ok(Context::from_inner(inner))
    }

    fn require_state(&self, expected: Lifecycle) -> Result<(), Error> {
        if self.borrow().state != expected {
            return Err(Error::ContextInWrongState(format!(
                "expected {:?}, found {:?}",
                expected,
                self.borrow().state
            )));
        }
        Ok(())
    }

    fn record_error(&self, msg: impl Into<String>) {
        let msg = msg.into();
        warn!(error = %msg, "context setter failed");
        self.borrow_mut().error = Some(msg);
    }

    pub fn context_error(&self) -> Option<String> {
        self.borrow().error.clone()
    }

    pub fn fatal_error(&self, msg: impl Into<String>) {
        self.record_error(msg);
        self.borrow_mut().valid = false;
    }

    // ---- setters -------------------------------------------------------

    pub fn set_name(&self, name: impl Into<String>) -> Result<(), Error> {
        self.ensure_settable_for_name()?;
        let name = name.into();
        if !crate::query::is_valid_name(&name) {
            self.fatal_error(format!("'{name}' is not a legal context name"));
        }
        {
            let mut node = self.borrow_mut();
            node.name = Some(name.clone());
        }
        self.try_resolve_mold_equiv(&name);
        Ok(())
    }

    fn ensure_settable_for_name(&self) -> Result<(), Error> {
        let tag = self.tag();
        if !matches!(tag, Tag::Section | Tag::Keyval) {
            return Err(Error::WrongContext(format!("{tag:?} has no name")));
        }
        self.require_state(Lifecycle::Constructing)
    }

    /// Resolves `mold_equiv` when this context's root is a CONFIG: finds the
    /// same-named node in the parent's own `mold_equiv` (or, at the config
    /// root, the config's mold). Failure is deferred — it's recorded but
    /// does not abort construction (spec.md §3: "it becomes INVALID
    /// (mold_missing)" only at finalize).
    fn try_resolve_mold_equiv(&self, name: &str) {
        let is_config_rooted = {
            let node = self.borrow();
            match &node.root {
                Some(root) => root
                    .upgrade()
                    .map(|r| r.borrow().tag == Tag::Config)
                    .unwrap_or(false),
                None => false,
            }
        };
        if !is_config_rooted {
            return;
        }

        let parent = match self.borrow().parent.clone().and_then(|p| p.upgrade()) {
            Some(p) => p,
            None => return,
        };

        let parent_mold_equiv_elements: Option<ElementStorage<NodeRef>> = {
            let parent_node = parent.borrow();
            match &parent_node.payload {
                Payload::Config(cfg) => Some(cfg.mold.borrow().payload.elements_clone_shallow()),
                Payload::Section(sec) => sec.mold_equiv.as_ref().and_then(|w| w.upgrade()).map(
                    |mold_section| mold_section.borrow().payload.elements_clone_shallow(),
                ),
                _ => None,
            }
        };

        let found = parent_mold_equiv_elements.and_then(|els| els.find_first(name).cloned());

        match found {
            Some(mold_node) => {
                let weak = Rc::downgrade(&mold_node);
                let mut node = self.borrow_mut();
                match &mut node.payload {
                    Payload::Section(sec) => sec.mold_equiv = Some(weak),
                    Payload::Keyval(kv) => kv.mold_equiv = Some(weak),
                    _ => {}
                }
            }
            None => {
                self.record_error(format!("'{name}' has no equivalent in the mold"));
            }
        }
    }

    pub fn set_value_type(&self, value_type: ValueType) -> Result<(), Error> {
        if self.tag() != Tag::Keyval {
            return Err(Error::WrongContext("only a KEYVAL has a value type".into()));
        }
        self.require_state(Lifecycle::Constructing)?;
        let mut node = self.borrow_mut();
        let is_mold_rooted = node
            .root
            .as_ref()
            .and_then(|r| r.upgrade())
            .map(|r| r.borrow().tag == Tag::Mold)
            .unwrap_or(false);
        if let Payload::Keyval(kv) = &mut node.payload {
            kv.value_type = Some(value_type);
            if is_mold_rooted && kv.defaults.is_none() {
                kv.defaults = Some(DefaultList::new());
            }
        }
        Ok(())
    }

    fn set_value(&self, value: Value) -> Result<(), Error> {
        if self.tag() == Tag::Default {
            self.require_state(Lifecycle::Constructing)?;
            let mut node = self.borrow_mut();
            if let Payload::Default(d) = &mut node.payload {
                d.value = Some(value);
            }
            return Ok(());
        }
        if self.tag() != Tag::Keyval {
            return Err(Error::WrongContext("only a KEYVAL or DEFAULT has a value".into()));
        }
        let state = self.state();
        match state {
            Lifecycle::Constructing => {
                let violation = self.check_value_restriction(&value);
                let mut node = self.borrow_mut();
                if let Payload::Keyval(kv) = &mut node.payload {
                    kv.value = Some(value);
                }
                if let Err(msg) = violation {
                    drop(node);
                    self.record_error(msg.clone());
                    self.borrow_mut().valid = false;
                    return Err(Error::RestrictionViolated(msg));
                }
                Ok(())
            }
            Lifecycle::Finalized => {
                // Permitted only for CONFIG-rooted keyvals (spec.md §4.1).
                let is_config_rooted = self
                    .borrow()
                    .root
                    .as_ref()
                    .and_then(|r| r.upgrade())
                    .map(|r| r.borrow().tag == Tag::Config)
                    .unwrap_or(false);
                if !is_config_rooted {
                    return Err(Error::ContextInWrongState(
                        "only a finalized CONFIG keyval accepts value updates".into(),
                    ));
                }
                if let Err(msg) = self.check_value_restriction(&value) {
                    return Err(Error::RestrictionViolated(msg));
                }
                let mut node = self.borrow_mut();
                if let Payload::Keyval(kv) = &mut node.payload {
                    kv.value = Some(value);
                }
                Ok(())
            }
            Lifecycle::Destroyed => Err(Error::DestroyedContext("keyval was destroyed".into())),
        }
    }

    fn check_value_restriction(&self, value: &Value) -> Result<(), String> {
        let node = self.borrow();
        if let Payload::Keyval(kv) = &node.payload {
            let target = self.version_for_restriction_check();
            // Mold-rooted: restrictions live directly on this node.
            if let Some(target) = target.0 {
                let resolved = restriction::resolve(&kv.restrictions, &target);
                return restriction::check_value(&resolved, value);
            }
            // Config-rooted: restrictions live on the mold_equiv node.
            if let Some(mold_equiv) = kv.mold_equiv.as_ref().and_then(|w| w.upgrade()) {
                if let (Some(version), Payload::Keyval(mold_kv)) =
                    (target.1, &mold_equiv.borrow().payload)
                {
                    let resolved = restriction::resolve(&mold_kv.restrictions, &version);
                    return restriction::check_value(&resolved, value);
                }
            }
        }
        Ok(())
    }

    /// Returns `(mold_side_version, config_side_version)` — exactly one is
    /// populated depending on whether this node lives under a MOLD or CONFIG.
    fn version_for_restriction_check(&self) -> (Option<Version>, Option<Version>) {
        let node = self.borrow();
        match node.root.as_ref().and_then(|r| r.upgrade()) {
            Some(root) => {
                let root_node = root.borrow();
                match &root_node.payload {
                    Payload::Mold(m) => (Some(m.version), None),
                    Payload::Config(c) => (None, Some(c.version)),
                    _ => (None, None),
                }
            }
            None => (None, None),
        }
    }

    pub fn set_value_string(&self, value: impl Into<String>) -> Result<(), Error> {
        self.expect_value_type(ValueType::String)?;
        self.set_value(Value::String(value.into()))
    }

    pub fn set_value_integer(&self, value: i64) -> Result<(), Error> {
        self.expect_value_type(ValueType::Integer)?;
        self.set_value(Value::Integer(value))
    }

    pub fn set_value_float(&self, value: f64) -> Result<(), Error> {
        self.expect_value_type(ValueType::Float)?;
        self.set_value(Value::Float(value))
    }

    pub fn set_value_boolean(&self, value: bool) -> Result<(), Error> {
        self.expect_value_type(ValueType::Boolean)?;
        self.set_value(Value::Boolean(value))
    }

    pub fn set_value_enum(&self, value: impl Into<String>) -> Result<(), Error> {
        self.expect_value_type(ValueType::Enum)?;
        self.set_value(Value::Enum(value.into()))
    }

    fn expect_value_type(&self, expected: ValueType) -> Result<(), Error> {
        let node = self.borrow();
        match &node.payload {
            Payload::Keyval(kv) => match kv.value_type {
                Some(t) if t == expected => Ok(()),
                Some(t) => Err(Error::WrongValueType(format!(
                    "keyval has type {t}, not {expected}"
                ))),
                None => Err(Error::WrongValueType(
                    "keyval has no declared value type yet".into(),
                )),
            },
            Payload::Default(_) => {
                // A DEFAULT's value type must equal its owning KEYVAL's
                // declared type (spec.md §3); the owning keyval is still
                // CONSTRUCTING (the DEFAULT hasn't attached yet), so look at
                // the parent directly rather than through `mold_equiv`.
                let parent_type = node
                    .parent
                    .clone()
                    .and_then(|p| p.upgrade())
                    .and_then(|p| match &p.borrow().payload {
                        Payload::Keyval(kv) => kv.value_type,
                        _ => None,
                    });
                match parent_type {
                    Some(t) if t == expected => Ok(()),
                    Some(t) => Err(Error::WrongValueType(format!(
                        "default has type {expected}, but its keyval declares {t}"
                    ))),
                    None => Ok(()), // keyval hasn't declared a type yet; deferred to finalize
                }
            }
            _ => Err(Error::WrongContext("only a KEYVAL or DEFAULT has a value".into())),
        }
    }

    pub fn add_documentation(&self, text: impl Into<String>, introduced: Version) -> Result<(), Error> {
        self.require_state(Lifecycle::Constructing)?;
        let doc = Documentation { text: text.into(), introduced };
        let mut node = self.borrow_mut();
        match &mut node.payload {
            Payload::Mold(m) => m.doc.push(doc),
            Payload::Section(s) => s.doc.push(doc),
            Payload::Keyval(k) => k.doc.push(doc),
            Payload::Restriction(r) => {
                if let Some(entry) = &mut r.entry {
                    entry.doc.push(crate::restriction::Documentation {
                        text: doc.text,
                        introduced: doc.introduced,
                    });
                }
            }
            _ => return Err(Error::WrongContext("this context has no documentation slot".into())),
        }
        Ok(())
    }

    pub fn add_introduced(&self, version: Version) -> Result<(), Error> {
        self.require_state(Lifecycle::Constructing)?;
        let mut node = self.borrow_mut();
        match &mut node.payload {
            Payload::Section(s) => s.introduced = Some(version),
            Payload::Keyval(k) => k.introduced = Some(version),
            Payload::Default(d) => d.introduced = version,
            Payload::Restriction(r) => {
                if let Some(entry) = &mut r.entry {
                    entry.introduced = version;
                }
            }
            _ => return Err(Error::WrongContext("this context has no introduced version".into())),
        }
        Ok(())
    }

    pub fn add_deprecated(&self, version: Version) -> Result<(), Error> {
        self.require_state(Lifecycle::Constructing)?;
        let mut node = self.borrow_mut();
        match &mut node.payload {
            Payload::Section(s) => s.deprecated = Some(version),
            Payload::Keyval(_) => {
                return Err(Error::NotSupported("keyvals have no deprecated version".into()));
            }
            Payload::Restriction(r) => {
                if let Some(entry) = &mut r.entry {
                    entry.deprecated = Some(version);
                }
            }
            _ => return Err(Error::WrongContext("this context has no deprecated version".into())),
        }
        Ok(())
    }

    pub fn set_restriction_type(&self, kind: RestrictionKind) -> Result<(), Error> {
        if self.tag() != Tag::Restriction {
            return Err(Error::WrongContext("not a RESTRICTION context".into()));
        }
        if self.state() != Lifecycle::Constructing {
            return Err(Error::ContextInWrongState(
                "restriction type can only be set while constructing".into(),
            ));
        }
        let mut node = self.borrow_mut();
        if let Payload::Restriction(r) = &mut node.payload {
            let payload = match kind {
                RestrictionKind::MinimumEntries | RestrictionKind::MaximumEntries => {
                    RestrictionPayload::Entries(0)
                }
                RestrictionKind::ValueEnum => RestrictionPayload::Enum(String::new()),
                RestrictionKind::ValueRange => RestrictionPayload::Range { lo: 0.0, hi: 0.0 },
                RestrictionKind::ValueNumeric => RestrictionPayload::Numeric(0.0),
            };
            r.entry = Some(RestrictionEntry {
                kind,
                introduced: Version::DEFAULT,
                deprecated: None,
                doc: Vec::new(),
                payload,
            });
        }
        Ok(())
    }

    pub fn set_restriction_entries(&self, count: u32) -> Result<(), Error> {
        self.require_state(Lifecycle::Constructing)?;
        let mut node = self.borrow_mut();
        if let Payload::Restriction(r) = &mut node.payload {
            if let Some(entry) = &mut r.entry {
                entry.payload = RestrictionPayload::Entries(count);
                return Ok(());
            }
        }
        Err(Error::ContextInWrongState("set_restriction_type must be called first".into()))
    }

    pub fn set_restriction_range(&self, lo: f64, hi: f64) -> Result<(), Error> {
        self.require_state(Lifecycle::Constructing)?;
        let mut node = self.borrow_mut();
        if let Payload::Restriction(r) = &mut node.payload {
            if let Some(entry) = &mut r.entry {
                entry.payload = RestrictionPayload::Range { lo, hi };
                return Ok(());
            }
        }
        Err(Error::ContextInWrongState("set_restriction_type must be called first".into()))
    }

    pub fn set_restriction_numeric(&self, value: f64) -> Result<(), Error> {
        self.require_state(Lifecycle::Constructing)?;
        let mut node = self.borrow_mut();
        if let Payload::Restriction(r) = &mut node.payload {
            if let Some(entry) = &mut r.entry {
                entry.payload = RestrictionPayload::Numeric(value);
                return Ok(());
            }
        }
        Err(Error::ContextInWrongState("set_restriction_type must be called first".into()))
    }

    pub fn set_restriction_enum(&self, member: impl Into<String>) -> Result<(), Error> {
        self.require_state(Lifecycle::Constructing)?;
        let mut node = self.borrow_mut();
        if let Payload::Restriction(r) = &mut node.payload {
            if let Some(entry) = &mut r.entry {
                entry.payload = RestrictionPayload::Enum(member.into());
                return Ok(());
            }
        }
        Err(Error::ContextInWrongState("set_restriction_type must be called first".into()))
    }

    // ---- lifecycle -------------------------------------------------------

    /// Transitions CONSTRUCTING -> FINALIZED, attaching to the parent's
    /// element storage. Returns `Ok(valid)` where `valid` reports whether the
    /// node is additionally flagged invalid (it is still attached either
    /// way — spec.md §4.1, "finalize dirty").
    pub fn finalize(&self) -> Result<bool, Error> {
        self.require_state(Lifecycle::Constructing)?;

        let tag = self.tag();
        let mut valid = self.borrow().error.is_none() && self.borrow().valid;

        match tag {
            Tag::Section => valid &= self.finalize_structural_name_check(),
            Tag::Keyval => {
                valid &= self.finalize_structural_name_check();
                valid &= self.finalize_keyval_invariants();
            }
            Tag::Default => {
                valid &= self.borrow_default_value_is_set();
            }
            _ => {}
        }

        // Cardinality enforcement happens only when attaching under a
        // CONFIG-rooted parent, and only for SECTION/KEYVAL children
        // (spec.md §4.1, "Race on finalize").
        if matches!(tag, Tag::Section | Tag::Keyval) {
            if let Some(violation) = self.check_cardinality_before_attach()? {
                return Err(violation);
            }
        }

        self.attach_to_parent()?;

        {
            let mut node = self.borrow_mut();
            node.state = Lifecycle::Finalized;
            node.valid = valid;
        }
        debug!(?tag, valid, "context finalize");
        Ok(valid)
    }

    fn borrow_default_value_is_set(&self) -> bool {
        matches!(&self.borrow().payload, Payload::Default(d) if d.value.is_some())
    }

    fn finalize_structural_name_check(&self) -> bool {
        match &self.borrow().name {
            Some(name) => crate::query::is_valid_name(name),
            None => false,
        }
    }

    fn finalize_keyval_invariants(&self) -> bool {
        let node = self.borrow();
        if let Payload::Keyval(kv) = &node.payload {
            let is_mold_rooted = node
                .root
                .as_ref()
                .and_then(|r| r.upgrade())
                .map(|r| r.borrow().tag == Tag::Mold)
                .unwrap_or(false);
            if is_mold_rooted {
                let has_defaults = kv.defaults.as_ref().map(|d| !d.is_empty()).unwrap_or(false);
                return kv.value_type.is_some() && has_defaults;
            }
            let is_config_rooted = node
                .root
                .as_ref()
                .and_then(|r| r.upgrade())
                .map(|r| r.borrow().tag == Tag::Config)
                .unwrap_or(false);
            if is_config_rooted {
                let mold_equiv_ok = kv.mold_equiv.as_ref().and_then(|w| w.upgrade()).is_some();
                let type_ok = mold_equiv_ok
                    && kv.mold_equiv.as_ref().and_then(|w| w.upgrade()).is_some_and(|m| {
                        matches!(&m.borrow().payload, Payload::Keyval(mkv) if mkv.value_type == kv.value_type)
                    });
                return mold_equiv_ok && type_ok;
            }
        }
        true
    }

    fn check_cardinality_before_attach(&self) -> Result<Option<Error>, Error> {
        let node = self.borrow();
        let is_config_rooted = node
            .root
            .as_ref()
            .and_then(|r| r.upgrade())
            .map(|r| r.borrow().tag == Tag::Config)
            .unwrap_or(false);
        if !is_config_rooted {
            return Ok(None);
        }
        let name = match &node.name {
            Some(n) => n.clone(),
            None => return Ok(None),
        };
        let mold_equiv = match &node.payload {
            Payload::Section(s) => s.mold_equiv.clone(),
            Payload::Keyval(k) => k.mold_equiv.clone(),
            _ => None,
        }
        .and_then(|w| w.upgrade());
        let config_version = match node.root.as_ref().and_then(|r| r.upgrade()) {
            Some(root) => match &root.borrow().payload {
                Payload::Config(c) => c.version,
                _ => return Ok(None),
            },
            None => return Ok(None),
        };
        let parent = match node.parent.clone().and_then(|p| p.upgrade()) {
            Some(p) => p,
            None => return Ok(None),
        };
        drop(node);

        let restrictions = match mold_equiv {
            Some(m) => match &m.borrow().payload {
                Payload::Section(s) => s.restrictions.clone(),
                Payload::Keyval(k) => k.restrictions.clone(),
                _ => return Ok(None),
            },
            None => return Ok(None),
        };
        let resolved = restriction::resolve(&restrictions, &config_version);
        let current_count = {
            let parent_node = parent.borrow();
            let elements = match &parent_node.payload {
                Payload::Config(c) => &c.elements,
                Payload::Section(s) => &s.elements,
                _ => return Ok(None),
            };
            elements.count_by_name(&name) as u32
        };
        if current_count >= resolved.max_entries {
            return Ok(Some(Error::RestrictionViolated(format!(
                "'{name}' already has {current_count} instances (max {})",
                resolved.max_entries
            ))));
        }
        Ok(None)
    }

    fn attach_to_parent(&self) -> Result<(), Error> {
        let parent = match self.borrow().parent.clone().and_then(|p| p.upgrade()) {
            Some(p) => p,
            None => return Ok(()), // toplevel MOLD/CONFIG: nothing to attach to
        };
        let name = self.borrow().name.clone().unwrap_or_default();
        let tag = self.tag();

        match tag {
            Tag::Section | Tag::Keyval => {
                let child = self.inner.clone();
                let mut parent_node = parent.borrow_mut();
                let elements = match &mut parent_node.payload {
                    Payload::Mold(m) => Some(&mut m.elements),
                    Payload::Config(c) => Some(&mut c.elements),
                    Payload::Section(s) => Some(&mut s.elements),
                    _ => None,
                };
                if let Some(elements) = elements {
                    elements.append(name, child);
                }
            }
            Tag::Default => {
                let (introduced, value) = {
                    let node = self.borrow();
                    match &node.payload {
                        Payload::Default(d) => (
                            d.introduced,
                            d.value.clone().ok_or_else(|| {
                                Error::InvalidArgument("DEFAULT has no value".into())
                            })?,
                        ),
                        _ => return Ok(()),
                    }
                };
                let mut parent_node = parent.borrow_mut();
                if let Payload::Keyval(kv) = &mut parent_node.payload {
                    let defaults = kv.defaults.get_or_insert_with(DefaultList::new);
                    defaults.insert(introduced, value)?;
                }
            }
            Tag::Restriction => {
                let entry = {
                    let node = self.borrow();
                    match &node.payload {
                        Payload::Restriction(r) => r.entry.clone(),
                        _ => None,
                    }
                };
                if let Some(entry) = entry {
                    let mut parent_node = parent.borrow_mut();
                    match &mut parent_node.payload {
                        Payload::Keyval(kv) => kv.restrictions.push(entry),
                        Payload::Section(s) => s.restrictions.push(entry),
                        _ => {}
                    }
                }
            }
            Tag::Documentation => {
                let doc = {
                    let node = self.borrow();
                    match &node.payload {
                        Payload::Documentation(d) => Some(d.clone()),
                        _ => None,
                    }
                };
                if let Some(doc) = doc {
                    let mut parent_node = parent.borrow_mut();
                    match &mut parent_node.payload {
                        Payload::Mold(m) => m.doc.push(doc),
                        Payload::Section(s) => s.doc.push(doc),
                        Payload::Keyval(k) => k.doc.push(doc),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Recursively destroys this subtree: unlinks from parent, marks every
    /// node DESTROYED. Remaining external handles become safe-to-drop stale
    /// references (spec.md §8, invariant 10).
    pub fn destroy(&self) -> Result<(), Error> {
        if self.state() == Lifecycle::Destroyed {
            return Err(Error::DestroyedContext("already destroyed".into()));
        }

        let children: Vec<NodeRef> = {
            let node = self.borrow();
            match &node.payload {
                Payload::Mold(m) => m.elements.iter().cloned().collect(),
                Payload::Config(c) => c.elements.iter().cloned().collect(),
                Payload::Section(s) => s.elements.iter().cloned().collect(),
                _ => Vec::new(),
            }
        };
        for child in children {
            Context::from_inner(child).destroy().ok();
        }

        if let Some(parent) = self.borrow().parent.clone().and_then(|p| p.upgrade()) {
            let name = self.borrow().name.clone().unwrap_or_default();
            let tag = self.tag();
            let mut parent_node = parent.borrow_mut();
            let elements = match &mut parent_node.payload {
                Payload::Mold(m) => Some(&mut m.elements),
                Payload::Config(c) => Some(&mut c.elements),
                Payload::Section(s) => Some(&mut s.elements),
                _ => None,
            };
            if let Some(elements) = elements {
                if matches!(tag, Tag::Section | Tag::Keyval) {
                    if let Some(index) = position_of(elements, &name, &self.inner) {
                        elements.remove_by_name_index(&name, index);
                    }
                }
            }
        }

        self.borrow_mut().state = Lifecycle::Destroyed;
        debug!(?self, "context destroyed");
        Ok(())
    }
}

impl From<NodeRef> for Context {
    fn from(inner: NodeRef) -> Self {
        Context { inner }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let node = self.borrow();
        f.debug_struct("Context")
            .field("tag", &node.tag)
            .field("name", &node.name)
            .field("state", &node.state)
            .finish()
    }
}

fn position_of(elements: &ElementStorage<NodeRef>, name: &str, target: &NodeRef) -> Option<usize> {
    elements
        .iter_by_name(name)
        .position(|candidate| Rc::ptr_eq(candidate, target))
}

impl Payload {
    /// Shallow clone of this node's child element storage — used to resolve
    /// `mold_equiv` without holding two overlapping borrows across the tree.
    fn elements_clone_shallow(&self) -> ElementStorage<NodeRef> {
        match self {
            Payload::Mold(m) => m.elements.clone(),
            Payload::Config(c) => c.elements.clone(),
            Payload::Section(s) => s.elements.clone(),
            _ => ElementStorage::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_finalize_destroy_roundtrip() {
        let mold = Context::begin(None, Tag::Mold).unwrap();
        let section = Context::begin(Some(&mold), Tag::Section).unwrap();
        section.set_name("worker").unwrap();
        assert!(section.finalize().unwrap());
        assert_eq!(section.state(), Lifecycle::Finalized);

        section.destroy().unwrap();
        assert_eq!(section.state(), Lifecycle::Destroyed);
        assert!(matches!(section.destroy(), Err(Error::DestroyedContext(_))));
    }

    #[test]
    fn double_finalize_rejected() {
        let mold = Context::begin(None, Tag::Mold).unwrap();
        let section = Context::begin(Some(&mold), Tag::Section).unwrap();
        section.set_name("a").unwrap();
        section.finalize().unwrap();
        assert!(matches!(section.finalize(), Err(Error::ContextInWrongState(_))));
    }

    #[test]
    fn keyval_without_default_is_invalid_at_finalize() {
        let mold = Context::begin(None, Tag::Mold).unwrap();
        let keyval = Context::begin(Some(&mold), Tag::Keyval).unwrap();
        keyval.set_name("threads").unwrap();
        keyval.set_value_type(ValueType::Integer).unwrap();
        let valid = keyval.finalize().unwrap();
        assert!(!valid);
    }

    #[test]
    fn section_without_name_is_invalid() {
        let mold = Context::begin(None, Tag::Mold).unwrap();
        let section = Context::begin(Some(&mold), Tag::Section).unwrap();
        let valid = section.finalize().unwrap();
        assert!(!valid);
    }
}
