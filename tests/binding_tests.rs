//! Binding layer tests: identity, lifetime, inheritance, hooks, finalizers.
//!
//! Native fixtures are declared before the `State` in each test so that
//! teardown finalizers never release an already-dropped object.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use scriptbind::{
    ClassSpec, RefCounted, RegistrationError, ScriptClass, ScriptError, ScriptResult, State,
    Value, WeakLife, WeakObserved,
};

// ============================================================================
// Fixtures
// ============================================================================

/// A fake reference-counted widget instrumented to observe acquire/release
/// pairing.
struct Widget {
    refs: Cell<i64>,
    acquires: Cell<u32>,
    releases: Cell<u32>,
    width: Cell<i64>,
}

impl Widget {
    fn new(width: i64) -> Self {
        Widget {
            refs: Cell::new(1),
            acquires: Cell::new(0),
            releases: Cell::new(0),
            width: Cell::new(width),
        }
    }
}

unsafe impl RefCounted for Widget {
    fn add_ref(&self) {
        self.refs.set(self.refs.get() + 1);
        self.acquires.set(self.acquires.get() + 1);
    }
    fn release(&self) {
        self.refs.set(self.refs.get() - 1);
        self.releases.set(self.releases.get() + 1);
    }
}

fn widget_populate(state: &mut State, idx: i32) -> ScriptResult<()> {
    state.push_function(|state| {
        let width = state.unwrap::<Widget>(1)?.width.get();
        state.push(width);
        Ok(1)
    });
    let getter = state.value(-1)?.clone();
    state.pop(1)?;
    state.raw_set(idx, "width", getter)
}

impl ScriptClass for Widget {
    const NAME: &'static str = "Widget";
    fn describe(spec: ClassSpec<Self>) -> ClassSpec<Self> {
        spec.ref_counted().with_metatable(widget_populate)
    }
}

/// A weakly observed panel whose true owner may destroy it at any time.
struct Panel {
    life: WeakLife,
    depth: i64,
}

impl Panel {
    fn new(depth: i64) -> Self {
        Panel {
            life: WeakLife::new(),
            depth,
        }
    }
}

unsafe impl WeakObserved for Panel {
    fn weak_flag(&self) -> scriptbind::WeakFlag {
        self.life.observe()
    }
}

impl ScriptClass for Panel {
    const NAME: &'static str = "Panel";
    fn describe(spec: ClassSpec<Self>) -> ClassSpec<Self> {
        spec.weak_observed()
    }
}

/// Single-inheritance pair: Button derives Control.
struct Control {
    refs: Cell<i64>,
    id: i64,
}

impl Control {
    fn new(id: i64) -> Self {
        Control {
            refs: Cell::new(1),
            id,
        }
    }
}

unsafe impl RefCounted for Control {
    fn add_ref(&self) {
        self.refs.set(self.refs.get() + 1);
    }
    fn release(&self) {
        self.refs.set(self.refs.get() - 1);
    }
}

impl ScriptClass for Control {
    const NAME: &'static str = "Control";
    fn describe(spec: ClassSpec<Self>) -> ClassSpec<Self> {
        spec.ref_counted().with_metatable(|state, idx| {
            state.raw_set(idx, "kind", "control")?;
            state.raw_set(idx, "focusable", true)
        })
    }
}

struct Button {
    control: Control,
    label: &'static str,
}

impl Button {
    fn new(id: i64, label: &'static str) -> Self {
        Button {
            control: Control::new(id),
            label,
        }
    }
}

unsafe impl RefCounted for Button {
    fn add_ref(&self) {
        self.control.add_ref();
    }
    fn release(&self) {
        self.control.release();
    }
}

impl ScriptClass for Button {
    const NAME: &'static str = "Button";
    fn describe(spec: ClassSpec<Self>) -> ClassSpec<Self> {
        spec.ref_counted()
            .base::<Control>(|button| &button.control)
            .with_metatable(|state, idx| state.raw_set(idx, "kind", "button"))
    }
}

// ============================================================================
// Identity
// ============================================================================

#[test]
fn wrapping_the_same_address_twice_yields_the_same_value() {
    let w = Widget::new(10);
    let mut state = State::new();
    state.register_class::<Widget>().unwrap();

    state.wrap(&w).unwrap();
    state.wrap(&w).unwrap();
    let first = state.value(-2).unwrap().clone();
    let second = state.value(-1).unwrap().clone();
    assert_eq!(first, second);

    // Only one wrapper means only one acquired reference.
    assert_eq!(w.acquires.get(), 1);
}

#[test]
fn distinct_objects_get_distinct_wrappers() {
    let a = Widget::new(1);
    let b = Widget::new(2);
    let mut state = State::new();
    state.register_class::<Widget>().unwrap();

    state.wrap(&a).unwrap();
    state.wrap(&b).unwrap();
    assert_ne!(
        state.value(-2).unwrap().clone(),
        state.value(-1).unwrap().clone()
    );
}

#[test]
fn collection_clears_the_identity_entry_for_rewrapping() {
    let w = Widget::new(7);
    let mut state = State::new();
    state.register_class::<Widget>().unwrap();

    state.wrap(&w).unwrap();
    state.pop(1).unwrap();
    state.collect_garbage();
    assert_eq!(w.refs.get(), 1);

    // A second wrap of the same address builds a fresh wrapper.
    state.wrap(&w).unwrap();
    assert_eq!(w.refs.get(), 2);
    assert_eq!(w.acquires.get(), 2);
    assert_eq!(w.releases.get(), 1);
    assert_eq!(state.unwrap::<Widget>(-1).unwrap().width.get(), 7);
}

// ============================================================================
// Reference counting and finalization
// ============================================================================

#[test]
fn owning_wrapper_lifecycle_end_to_end() {
    let w = Widget::new(10);
    let mut state = State::new();
    state.register_class::<Widget>().unwrap();
    assert_eq!(w.refs.get(), 1);

    state.wrap(&w).unwrap();
    assert_eq!(w.refs.get(), 2);

    // Drop all script references and force a collection pass.
    state.pop(1).unwrap();
    state.collect_garbage();
    assert_eq!(w.refs.get(), 1);
    assert_eq!(w.acquires.get(), 1);
    assert_eq!(w.releases.get(), 1);

    // A second pass must not release again.
    state.collect_garbage();
    assert_eq!(w.releases.get(), 1);
}

#[test]
fn reachable_wrappers_survive_collection() {
    let w = Widget::new(10);
    let mut state = State::new();
    state.register_class::<Widget>().unwrap();

    state.wrap(&w).unwrap();
    let wrapper = state.value(-1).unwrap().clone();
    state.set_global("w", wrapper).unwrap();
    state.pop(1).unwrap();

    state.collect_garbage();
    assert_eq!(w.refs.get(), 2);

    // Unrooting it lets the next pass finalize.
    state.set_global("w", Value::Nil).unwrap();
    state.collect_garbage();
    assert_eq!(w.refs.get(), 1);
}

#[test]
fn runtime_teardown_finalizes_remaining_wrappers_once() {
    let w = Widget::new(3);
    {
        let mut state = State::new();
        state.register_class::<Widget>().unwrap();
        state.wrap(&w).unwrap();
        assert_eq!(w.refs.get(), 2);
    }
    assert_eq!(w.refs.get(), 1);
    assert_eq!(w.acquires.get(), 1);
    assert_eq!(w.releases.get(), 1);
}

// ============================================================================
// Weak observation
// ============================================================================

#[test]
fn non_owning_wrapper_reports_expiry_after_owner_destroys() {
    let mut state = State::new();
    state.register_class::<Panel>().unwrap();
    let p = Box::new(Panel::new(4));

    state.wrap(&*p).unwrap();
    assert_eq!(state.unwrap::<Panel>(-1).unwrap().depth, 4);

    drop(p);
    assert!(matches!(
        state.unwrap::<Panel>(-1),
        Err(ScriptError::ExpiredObject { type_name: "Panel" })
    ));
}

#[test]
fn non_owning_finalization_leaves_native_lifetime_alone() {
    let p = Panel::new(4);
    let mut state = State::new();
    state.register_class::<Panel>().unwrap();

    state.wrap(&p).unwrap();
    state.pop(1).unwrap();
    state.collect_garbage();

    // The owner's object is untouched and can be wrapped again.
    state.wrap(&p).unwrap();
    assert_eq!(state.unwrap::<Panel>(-1).unwrap().depth, 4);
}

// ============================================================================
// Inheritance
// ============================================================================

#[test]
fn reads_fall_through_to_the_base_metatable() {
    let b = Button::new(1, "ok");
    let mut state = State::new();
    state.register_class::<Control>().unwrap();
    state.register_class::<Button>().unwrap();

    state.wrap(&b).unwrap();
    state.get_field(-1, "focusable").unwrap();
    assert_eq!(state.get::<bool>(-1).unwrap(), true);
    state.pop(1).unwrap();

    // The derived override wins over the base entry.
    state.get_field(-1, "kind").unwrap();
    assert_eq!(state.get::<String>(-1).unwrap(), "button");
}

#[test]
fn unwrap_walks_the_declared_base_chain() {
    let b = Button::new(17, "ok");
    let c = Control::new(5);
    let mut state = State::new();
    state.register_class::<Control>().unwrap();
    state.register_class::<Button>().unwrap();

    state.wrap(&b).unwrap();
    assert_eq!(state.unwrap::<Button>(-1).unwrap().label, "ok");
    assert_eq!(state.unwrap::<Control>(-1).unwrap().id, 17);

    // A base instance is not viewable as a derived class.
    state.wrap(&c).unwrap();
    assert!(matches!(
        state.unwrap::<Button>(-1),
        Err(ScriptError::NotWrapped {
            expected: "Button",
            actual: "Control",
        })
    ));
}

#[test]
fn base_must_be_registered_before_derived() {
    let mut state = State::new();
    assert_eq!(
        state.register_class::<Button>(),
        Err(RegistrationError::UnregisteredBase {
            name: "Button",
            base: "Control",
        })
    );
}

// ============================================================================
// Metatable memoization
// ============================================================================

static MEMO_POPULATES: AtomicUsize = AtomicUsize::new(0);

struct MemoWidget {
    refs: Cell<i64>,
}

unsafe impl RefCounted for MemoWidget {
    fn add_ref(&self) {
        self.refs.set(self.refs.get() + 1);
    }
    fn release(&self) {
        self.refs.set(self.refs.get() - 1);
    }
}

impl ScriptClass for MemoWidget {
    const NAME: &'static str = "MemoWidget";
    fn describe(spec: ClassSpec<Self>) -> ClassSpec<Self> {
        spec.ref_counted().with_metatable(|state, idx| {
            MEMO_POPULATES.fetch_add(1, Ordering::SeqCst);
            state.raw_set(idx, "marker", 1i64)
        })
    }
}

static FLAKY_FIRST_BUILD: AtomicBool = AtomicBool::new(true);

struct Flaky {
    refs: Cell<i64>,
}

unsafe impl RefCounted for Flaky {
    fn add_ref(&self) {
        self.refs.set(self.refs.get() + 1);
    }
    fn release(&self) {
        self.refs.set(self.refs.get() - 1);
    }
}

impl ScriptClass for Flaky {
    const NAME: &'static str = "Flaky";
    fn describe(spec: ClassSpec<Self>) -> ClassSpec<Self> {
        // Population fails on the first build attempt and succeeds after.
        spec.ref_counted().with_metatable(|state, idx| {
            if FLAKY_FIRST_BUILD.swap(false, Ordering::SeqCst) {
                return Err(ScriptError::runtime("resource not ready"));
            }
            state.raw_set(idx, "marker", 1i64)
        })
    }
}

#[test]
fn failed_metatable_build_is_not_memoized() {
    let f = Flaky { refs: Cell::new(1) };
    let mut state = State::new();
    state.register_class::<Flaky>().unwrap();

    assert_eq!(
        state.wrap(&f).unwrap_err(),
        ScriptError::runtime("resource not ready")
    );
    assert_eq!(f.refs.get(), 1);

    // The retry rebuilds the metatable from scratch, population included.
    state.wrap(&f).unwrap();
    state.get_field(-1, "marker").unwrap();
    assert_eq!(state.get::<i64>(-1).unwrap(), 1);
}

#[test]
fn metatable_is_built_once_and_memoized() {
    let w = MemoWidget { refs: Cell::new(1) };
    let mut state = State::new();
    state.register_class::<MemoWidget>().unwrap();

    let first = state.ensure_metatable::<MemoWidget>().unwrap();
    let second = state.ensure_metatable::<MemoWidget>().unwrap();
    assert_eq!(first, second);
    assert_eq!(MEMO_POPULATES.load(Ordering::SeqCst), 1);

    // Wrapping reuses the memoized table too.
    state.wrap(&w).unwrap();
    assert_eq!(MEMO_POPULATES.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Property dispatch hooks
// ============================================================================

struct Rigid {
    refs: Cell<i64>,
}

impl Rigid {
    fn new() -> Self {
        Rigid { refs: Cell::new(1) }
    }
}

unsafe impl RefCounted for Rigid {
    fn add_ref(&self) {
        self.refs.set(self.refs.get() + 1);
    }
    fn release(&self) {
        self.refs.set(self.refs.get() - 1);
    }
}

impl ScriptClass for Rigid {
    const NAME: &'static str = "Rigid";
    fn describe(spec: ClassSpec<Self>) -> ClassSpec<Self> {
        // A write hook that declines every assignment.
        spec.ref_counted().on_new_index(|_state| Ok(0))
    }
}

#[test]
fn declined_writes_raise_and_store_nothing() {
    let r = Rigid::new();
    let mut state = State::new();
    state.register_class::<Rigid>().unwrap();

    state.wrap(&r).unwrap();
    let before = state.top();
    assert_eq!(
        state.set_field(-1, "x", 1i64),
        Err(ScriptError::UnacceptedAssignment)
    );
    assert_eq!(state.top(), before);

    state.raw_get(-1, "x").unwrap();
    assert!(state.value(-1).unwrap().is_nil());
}

struct Oracle {
    refs: Cell<i64>,
}

unsafe impl RefCounted for Oracle {
    fn add_ref(&self) {
        self.refs.set(self.refs.get() + 1);
    }
    fn release(&self) {
        self.refs.set(self.refs.get() - 1);
    }
}

fn oracle_index(state: &mut State) -> ScriptResult<u32> {
    let Ok(key) = state.get::<String>(2) else {
        return Ok(0);
    };
    if key == "answer" {
        state.push(42i64);
        return Ok(1);
    }
    Ok(0)
}

impl ScriptClass for Oracle {
    const NAME: &'static str = "Oracle";
    fn describe(spec: ClassSpec<Self>) -> ClassSpec<Self> {
        spec.ref_counted()
            .on_index(oracle_index)
            .with_metatable(|state, idx| state.raw_set(idx, "fixed", "metatable"))
    }
}

#[test]
fn custom_read_hook_runs_before_default_lookup() {
    let o = Oracle { refs: Cell::new(1) };
    let mut state = State::new();
    state.register_class::<Oracle>().unwrap();
    state.wrap(&o).unwrap();

    // Handled by the hook.
    state.get_field(-1, "answer").unwrap();
    assert_eq!(state.get::<i64>(-1).unwrap(), 42);
    state.pop(1).unwrap();

    // Declined by the hook: falls back to the metatable chain.
    state.get_field(-1, "fixed").unwrap();
    assert_eq!(state.get::<String>(-1).unwrap(), "metatable");
    state.pop(1).unwrap();

    // Declined keys also see plain stored properties; a hook-handled key
    // shadows a stored entry.
    state.set_field(-1, "note", "stored").unwrap();
    state.raw_set(-1, "answer", 0i64).unwrap();
    state.get_field(-1, "note").unwrap();
    assert_eq!(state.get::<String>(-1).unwrap(), "stored");
    state.pop(1).unwrap();
    state.get_field(-1, "answer").unwrap();
    assert_eq!(state.get::<i64>(-1).unwrap(), 42);
}

// ============================================================================
// Registration validation
// ============================================================================

struct Both {
    refs: Cell<i64>,
    life: WeakLife,
}

unsafe impl RefCounted for Both {
    fn add_ref(&self) {
        self.refs.set(self.refs.get() + 1);
    }
    fn release(&self) {
        self.refs.set(self.refs.get() - 1);
    }
}

unsafe impl WeakObserved for Both {
    fn weak_flag(&self) -> scriptbind::WeakFlag {
        self.life.observe()
    }
}

impl ScriptClass for Both {
    const NAME: &'static str = "Both";
    fn describe(spec: ClassSpec<Self>) -> ClassSpec<Self> {
        spec.ref_counted().weak_observed()
    }
}

struct Neither;

impl ScriptClass for Neither {
    const NAME: &'static str = "Neither";
    fn describe(spec: ClassSpec<Self>) -> ClassSpec<Self> {
        spec
    }
}

#[test]
fn lifetime_declaration_must_be_exactly_one() {
    let mut state = State::new();
    assert_eq!(
        state.register_class::<Both>(),
        Err(RegistrationError::AmbiguousLifetime { name: "Both" })
    );
    assert_eq!(
        state.register_class::<Neither>(),
        Err(RegistrationError::MissingLifetime { name: "Neither" })
    );
}

#[test]
fn duplicate_registration_is_rejected() {
    let mut state = State::new();
    state.register_class::<Widget>().unwrap();
    assert_eq!(
        state.register_class::<Widget>(),
        Err(RegistrationError::Duplicate { name: "Widget" })
    );
}

#[test]
fn wrapping_an_unregistered_class_fails() {
    let w = Widget::new(1);
    let mut state = State::new();
    assert!(matches!(
        state.wrap(&w),
        Err(ScriptError::UnregisteredClass { name: "Widget" })
    ));
}

#[test]
fn unwrap_rejects_non_wrapper_values() {
    let mut state = State::new();
    state.register_class::<Widget>().unwrap();
    state.push(5i64);
    assert!(matches!(
        state.unwrap::<Widget>(-1),
        Err(ScriptError::NotWrapped {
            expected: "Widget",
            actual: "number",
        })
    ));
}

#[test]
fn wrapper_class_membership_checks() {
    let b = Button::new(9, "go");
    let p = Box::new(Panel::new(1));
    let mut state = State::new();
    state.register_class::<Control>().unwrap();
    state.register_class::<Button>().unwrap();
    state.register_class::<Panel>().unwrap();

    state.wrap(&b).unwrap();
    assert!(state.is_wrapper_of::<Button>(-1));
    assert!(state.is_wrapper_of::<Control>(-1));
    assert!(!state.is_wrapper_of::<Panel>(-1));

    state.wrap(&*p).unwrap();
    assert!(state.is_wrapper_of::<Panel>(-1));
    drop(p);
    // An expired observed wrapper no longer counts as a wrapper of
    // anything.
    assert!(!state.is_wrapper_of::<Panel>(-1));

    state.push(1i64);
    assert!(!state.is_wrapper_of::<Button>(-1));
}

// ============================================================================
// Methods and stack balance
// ============================================================================

#[test]
fn methods_dispatch_through_the_metatable() {
    let w = Widget::new(320);
    let mut state = State::new();
    state.register_class::<Widget>().unwrap();

    state.wrap(&w).unwrap();
    state.get_field(-1, "width").unwrap();
    let self_value = state.value(-2).unwrap().clone();
    state.push_value(self_value);
    state.call(1).unwrap();
    assert_eq!(state.get::<i64>(-1).unwrap(), 320);
}

#[test]
fn binding_operations_leave_the_stack_balanced() {
    let w = Widget::new(1);
    let r = Rigid::new();
    let mut state = State::new();
    state.register_class::<Widget>().unwrap();
    state.register_class::<Rigid>().unwrap();
    let before = state.top();

    state.wrap(&w).unwrap();
    state.get_field(-1, "width").unwrap();
    state.pop(2).unwrap();

    // Failing operations must not leak stack slots either.
    state.wrap(&r).unwrap();
    assert!(state.set_field(-1, "x", 1i64).is_err());
    state.pop(1).unwrap();

    state.push(3i64);
    assert!(state.get_field(-1, "anything").is_err());
    state.pop(1).unwrap();

    assert_eq!(state.top(), before);
}
