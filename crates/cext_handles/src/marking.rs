//! Marking scopes and user-defined mark functions.
//!
//! Native structs can hold handles the managed side knows nothing about. A
//! marker registered for the owning object re-declares those handles by
//! calling [`ExecutionContext::mark`]; the resulting mark list is attached to
//! the owner and keeps the marked values alive until the next pass.
//!
//! While a native function or marker runs, its context's scope stack is also
//! reachable from the C entry points through a per-thread active stack.

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::context::ExecutionContext;
use crate::error::{CextError, Result};
use crate::handle::registry::HandleManager;
use crate::handle::wrapper::WrapperRef;
use crate::value::{ManagedObject, ObjectRef, Value};

pub type MarkerAction = Arc<dyn Fn(&mut ExecutionContext, &ObjectRef) -> Result<()> + Send + Sync>;

/// State of one native call (or one marker run) on the marker stack.
#[derive(Debug, Default)]
pub struct MarkingScope {
    keywords_given: bool,
    frame_self: Option<Value>,
    block: Option<Value>,
    /// Values converted to native during this scope.
    preserved: Vec<Value>,
    /// Values declared live by `mark`.
    marks: Vec<Value>,
    /// Owners whose markers run when the scope ends.
    pending: Vec<ObjectRef>,
}

impl MarkingScope {
    pub fn new(keywords_given: bool, frame_self: Option<Value>, block: Option<Value>) -> Self {
        Self {
            keywords_given,
            frame_self,
            block,
            ..Self::default()
        }
    }

    pub fn keywords_given(&self) -> bool {
        self.keywords_given
    }

    pub fn frame_self(&self) -> Option<&Value> {
        self.frame_self.as_ref()
    }

    /// The block passed to the call, if any.
    pub fn block(&self) -> Option<&Value> {
        self.block.as_ref()
    }

    pub fn preserved(&self) -> &[Value] {
        &self.preserved
    }

    pub fn marks(&self) -> &[Value] {
        &self.marks
    }

    pub fn into_marks(self) -> Vec<Value> {
        self.marks
    }
}

/// Stack of marking scopes; empty outside native calls.
#[derive(Debug, Default)]
pub struct MarkerStack {
    scopes: Vec<MarkingScope>,
}

impl MarkerStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    pub fn current(&self) -> Option<&MarkingScope> {
        self.scopes.last()
    }

    pub(crate) fn current_mut(&mut self) -> Option<&mut MarkingScope> {
        self.scopes.last_mut()
    }

    pub(crate) fn push(&mut self, scope: MarkingScope) {
        self.scopes.push(scope);
    }

    pub(crate) fn pop(&mut self) -> Option<MarkingScope> {
        self.scopes.pop()
    }
}

thread_local! {
    /// Targets of the native calls and markers running on this thread,
    /// innermost last.
    static ACTIVE: RefCell<Vec<MarkingTarget>> = const { RefCell::new(Vec::new()) };
}

/// Where marks and guards from native code land: a runtime plus the scope
/// stack of the context currently running native code.
#[derive(Clone)]
pub(crate) struct MarkingTarget {
    manager: Arc<HandleManager>,
    markers: Arc<Mutex<MarkerStack>>,
}

impl MarkingTarget {
    pub(crate) fn new(manager: Arc<HandleManager>, markers: Arc<Mutex<MarkerStack>>) -> Self {
        Self { manager, markers }
    }

    /// The innermost target on this thread, if native code is running.
    pub(crate) fn active() -> Option<Self> {
        ACTIVE.with(|active| active.borrow().last().cloned())
    }

    /// Make this the innermost target until the guard drops.
    pub(crate) fn enter(&self) -> ActiveTarget {
        ACTIVE.with(|active| active.borrow_mut().push(self.clone()));
        ActiveTarget { _private: () }
    }

    fn push_mark(&self, wrapper: Option<WrapperRef>) {
        let Some(retained) = wrapper.and_then(|wrapper| wrapper.retain()) else {
            trace!("ignored mark of unresolvable value");
            return;
        };
        match self.markers.lock().current_mut() {
            Some(scope) => scope.marks.push(retained),
            None => trace!("ignored mark outside a marking scope"),
        }
    }

    pub(crate) fn mark(&self, value: &Value) -> Result<()> {
        self.push_mark(self.manager.to_wrapper(value)?);
        Ok(())
    }

    pub(crate) fn mark_handle(&self, handle: u64) {
        self.push_mark(self.manager.native_to_wrapper(handle));
    }

    /// Preserve `wrapper` in the current scope and the kept cache. Returns
    /// the evicted batch when the cache was full; all markers must run
    /// before it is dropped.
    fn preserve(&self, wrapper: &WrapperRef) -> Option<Vec<Value>> {
        let retained = wrapper.retain()?;
        if let Some(scope) = self.markers.lock().current_mut() {
            scope.preserved.push(retained.clone());
        }
        self.manager.marking().keep(retained)
    }

    /// Guard issued by native code. A full cache runs the markers on a
    /// fresh context, since the running one is still borrowed.
    pub(crate) fn guard_handle(&self, handle: u64) {
        let Some(wrapper) = self.manager.native_to_wrapper(handle) else {
            return;
        };
        if let Some(previous) = self.preserve(&wrapper) {
            debug!("kept cache full during native guard");
            self.manager.attach().run_all_markers();
            drop(previous);
        }
    }
}

/// Pops the innermost active target when dropped.
pub(crate) struct ActiveTarget {
    _private: (),
}

impl Drop for ActiveTarget {
    fn drop(&mut self) {
        let _ = ACTIVE.try_with(|active| active.borrow_mut().pop());
    }
}

struct Marker {
    owner: Weak<ManagedObject>,
    action: MarkerAction,
}

impl Marker {
    fn owned_by(&self, owner: &ObjectRef) -> bool {
        std::ptr::eq(self.owner.as_ptr(), Arc::as_ptr(owner))
    }
}

/// Registered markers plus the kept-objects cache that triggers them.
pub struct MarkingService {
    markers: Mutex<Vec<Marker>>,
    kept: Mutex<Vec<Value>>,
    capacity: usize,
    passes: AtomicU64,
}

impl MarkingService {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            markers: Mutex::new(Vec::new()),
            kept: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            passes: AtomicU64::new(0),
        }
    }

    /// Register `action` as the marker for `owner`, replacing any earlier
    /// one. The owner is held weakly; its marker is dropped once the owner
    /// is gone.
    pub fn add_marker(&self, owner: &ObjectRef, action: MarkerAction) {
        let mut markers = self.markers.lock();
        match markers.iter_mut().find(|marker| marker.owned_by(owner)) {
            Some(existing) => existing.action = action,
            None => markers.push(Marker {
                owner: Arc::downgrade(owner),
                action,
            }),
        }
    }

    /// Number of markers whose owner is still alive.
    pub fn marker_count(&self) -> usize {
        self.markers
            .lock()
            .iter()
            .filter(|marker| marker.owner.strong_count() > 0)
            .count()
    }

    /// Completed [`ExecutionContext::run_all_markers`] passes.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    pub fn kept_len(&self) -> usize {
        self.kept.lock().len()
    }

    /// Snapshot of live markers, pruning those whose owner died.
    fn live_markers(&self) -> Vec<(ObjectRef, MarkerAction)> {
        let mut markers = self.markers.lock();
        markers.retain(|marker| marker.owner.strong_count() > 0);
        markers
            .iter()
            .filter_map(|marker| Some((marker.owner.upgrade()?, marker.action.clone())))
            .collect()
    }

    fn marker_for(&self, owner: &ObjectRef) -> Option<MarkerAction> {
        self.markers
            .lock()
            .iter()
            .find(|marker| marker.owned_by(owner))
            .map(|marker| marker.action.clone())
    }

    /// Add `value` to the kept cache. When the cache was already full the old
    /// batch is returned; the caller runs all markers before dropping it.
    fn keep(&self, value: Value) -> Option<Vec<Value>> {
        let mut kept = self.kept.lock();
        let previous = if kept.len() >= self.capacity {
            Some(std::mem::replace(&mut *kept, Vec::with_capacity(self.capacity)))
        } else {
            None
        };
        kept.push(value);
        previous
    }
}

impl fmt::Debug for MarkingService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarkingService")
            .field("markers", &self.marker_count())
            .field("kept", &self.kept_len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl HandleManager {
    /// Register a mark function for a managed object. A second call for the
    /// same object replaces the first marker.
    pub fn define_marker<F>(&self, owner: &Value, action: F) -> Result<()>
    where
        F: Fn(&mut ExecutionContext, &ObjectRef) -> Result<()> + Send + Sync + 'static,
    {
        let object = owner.as_object().ok_or_else(|| CextError::WrongArgumentType {
            expected: "object",
            found: owner.type_name().to_string(),
        })?;
        self.marking().add_marker(object, Arc::new(action));
        Ok(())
    }
}

impl ExecutionContext {
    pub fn push_marking_scope(
        &mut self,
        keywords_given: bool,
        frame_self: Option<Value>,
        block: Option<Value>,
    ) {
        self.markers
            .lock()
            .push(MarkingScope::new(keywords_given, frame_self, block));
    }

    pub fn pop_marking_scope(&mut self) -> Option<MarkingScope> {
        self.markers.lock().pop()
    }

    /// The innermost scope. Release the guard before marking or calling
    /// native code.
    pub fn marking_scope(&self) -> Option<MappedMutexGuard<'_, MarkingScope>> {
        MutexGuard::try_map(self.markers.lock(), MarkerStack::current_mut).ok()
    }

    pub(crate) fn marking_target(&self) -> MarkingTarget {
        MarkingTarget::new(self.manager.clone(), self.markers.clone())
    }

    /// Open a fresh mark list for a marker run.
    pub fn create_mark_list(&mut self) {
        self.push_marking_scope(false, None, None);
    }

    /// Close the innermost mark list and attach it to `owner`.
    pub fn set_mark_list_on_object(&mut self, owner: &ObjectRef) {
        if let Some(scope) = self.pop_marking_scope() {
            owner.set_marked_objects(scope.into_marks());
        }
    }

    /// Declare `value` live for the mark list being built.
    ///
    /// A handle that no longer resolves is ignored: markers routinely report
    /// handles whose objects already died.
    pub fn mark(&mut self, value: &Value) -> Result<()> {
        self.marking_target().mark(value)
    }

    /// Like [`Self::mark`] but takes a raw handle.
    pub fn mark_handle(&mut self, handle: u64) {
        self.marking_target().mark_handle(handle);
    }

    /// Keep the value behind `value` alive across the current call. Anything
    /// that is not a wrapper or resolvable pointer is ignored.
    pub fn gc_guard(&mut self, value: &Value) {
        if let Ok(Some(wrapper)) = self.manager.to_wrapper(value) {
            self.keep_object(&wrapper);
        }
    }

    /// Preserve `wrapper` for the current call and add it to the kept cache,
    /// running every marker first when the cache is full.
    pub fn keep_object(&mut self, wrapper: &WrapperRef) {
        if let Some(previous) = self.marking_target().preserve(wrapper) {
            self.run_all_markers();
            drop(previous);
        }
    }

    /// Run `owner`'s marker when the current scope ends.
    pub fn queue_for_marking(&mut self, owner: &ObjectRef) {
        let queued = match self.markers.lock().current_mut() {
            Some(scope) => {
                scope.pending.push(owner.clone());
                true
            }
            None => false,
        };
        if !queued {
            self.run_marker_for(owner);
        }
    }

    /// Run every live marker. Returns how many ran.
    pub fn run_all_markers(&mut self) -> usize {
        let markers = self.manager.marking().live_markers();
        for (owner, action) in &markers {
            self.run_marker(owner, action);
        }
        self.manager.marking().passes.fetch_add(1, Ordering::Relaxed);
        trace!(markers = markers.len(), "marking pass complete");
        markers.len()
    }

    /// Run the markers queued on the current scope.
    pub(crate) fn run_pending_markers(&mut self) {
        let pending = match self.markers.lock().current_mut() {
            Some(scope) => std::mem::take(&mut scope.pending),
            None => return,
        };
        for owner in &pending {
            self.run_marker_for(owner);
        }
    }

    fn run_marker_for(&mut self, owner: &ObjectRef) {
        if let Some(action) = self.manager.marking().marker_for(owner) {
            self.run_marker(owner, &action);
        }
    }

    fn run_marker(&mut self, owner: &ObjectRef, action: &MarkerAction) {
        self.push_marking_scope(false, Some(Value::Object(owner.clone())), None);
        let outcome = {
            let _active = self.marking_target().enter();
            action(self, owner)
        };
        match outcome {
            Ok(()) => self.set_mark_list_on_object(owner),
            Err(err) => {
                self.pop_marking_scope();
                warn!(error = %err, owner = ?owner, "marker failed");
            }
        }
    }
}
