use std::sync::Arc;

use cext_handles::tagged::{
    ALLOCATION_BASE, FALSE_HANDLE, MAX_TAGGED_INTEGER, MIN_TAGGED_INTEGER, NIL_HANDLE,
    TRUE_HANDLE, UNDEF_HANDLE, encode_integer, is_tagged_object,
};
use cext_handles::{
    CextError, HandleConfig, HandleManager, HandleSpace, ManagedObject, ObjectKind, Value,
    ValueWrapper,
};

fn object(name: &str) -> Value {
    Value::object(ObjectKind::plain(name))
}

#[test]
fn immediates_use_fixed_handles() {
    let manager = HandleManager::standalone();
    let mut ctx = manager.attach();
    let cases = [
        (Value::Bool(false), FALSE_HANDLE),
        (Value::Bool(true), TRUE_HANDLE),
        (Value::Nil, NIL_HANDLE),
        (Value::NotProvided, UNDEF_HANDLE),
    ];
    for (value, expected) in cases {
        let handle = ctx.wrap_to_native(&value).unwrap();
        assert_eq!(handle, expected);
        assert_eq!(ctx.unwrap_native(handle).unwrap(), value);
    }
}

#[test]
fn tagged_integer_boundaries_round_trip() {
    let manager = HandleManager::standalone();
    let mut ctx = manager.attach();
    for value in [0, 1, -1, 42, MIN_TAGGED_INTEGER, MAX_TAGGED_INTEGER] {
        let handle = ctx.wrap_to_native(&Value::Integer(value)).unwrap();
        assert_eq!(Some(handle), encode_integer(value));
        assert_eq!(handle & 1, 1);
        assert_eq!(ctx.unwrap_native(handle).unwrap(), Value::Integer(value));
    }
    assert!(ctx.current_block().is_none());
}

#[test]
fn out_of_range_integers_get_object_handles() {
    let manager = HandleManager::standalone();
    let mut ctx = manager.attach();
    for value in [MAX_TAGGED_INTEGER + 1, MIN_TAGGED_INTEGER - 1, i64::MAX, i64::MIN] {
        let handle = ctx.wrap_to_native(&Value::Integer(value)).unwrap();
        assert!(is_tagged_object(handle));
        assert_eq!(ctx.unwrap_native(handle).unwrap(), Value::Integer(value));
    }
}

#[test]
fn floats_get_object_handles() {
    let manager = HandleManager::standalone();
    let mut ctx = manager.attach();
    let handle = ctx.wrap_to_native(&Value::Float(2.5)).unwrap();
    assert!(handle >= ALLOCATION_BASE);
    assert_eq!(ctx.unwrap_native(handle).unwrap(), Value::Float(2.5));
}

#[test]
fn object_handle_is_stable_and_unique() {
    let manager = HandleManager::standalone();
    let mut ctx = manager.attach();
    let a = object("A");
    let b = object("B");

    let ha = ctx.wrap_to_native(&a).unwrap();
    let hb = ctx.wrap_to_native(&b).unwrap();
    assert_ne!(ha, hb);
    assert_eq!(ctx.wrap_to_native(&a).unwrap(), ha);
    assert_eq!(ha, ALLOCATION_BASE);
    assert_eq!(hb, ALLOCATION_BASE + 8);

    assert_eq!(ctx.unwrap_native(ha).unwrap(), a);
    assert_eq!(ctx.unwrap_native(hb).unwrap(), b);
}

#[test]
fn unwrap_through_pointer_and_wrapper() {
    let manager = HandleManager::standalone();
    let mut ctx = manager.attach();
    let value = object("Point");
    let handle = ctx.wrap_to_native(&value).unwrap();

    assert_eq!(manager.unwrap(&Value::native_pointer(handle)).unwrap(), value);
    let wrapper = manager.wrap(&value).unwrap();
    assert_eq!(manager.unwrap(&Value::Wrapper(wrapper.clone())).unwrap(), value);
    let resolved = manager.to_wrapper(&Value::native_pointer(handle)).unwrap().unwrap();
    assert!(Arc::ptr_eq(&resolved, &wrapper));
}

#[test]
fn wrap_errors() {
    let manager = HandleManager::standalone();
    let wrapper = ValueWrapper::nil_wrapper();
    assert_eq!(
        manager.wrap(&Value::Wrapper(wrapper)).unwrap_err(),
        CextError::InvalidArgument("Wrapping wrapped object.".into())
    );
    assert_eq!(
        manager.wrap(&Value::native_pointer(0x40)).unwrap_err(),
        CextError::InvalidArgument("Attempt to wrap something that isn't a managed object".into())
    );
}

#[test]
fn unknown_handles_are_not_found() {
    let manager = HandleManager::standalone();
    let mut ctx = manager.attach();
    ctx.wrap_to_native(&object("Anchor")).unwrap();

    // Unused slot of a live block.
    let unused = ALLOCATION_BASE + 8 * 100;
    assert_eq!(ctx.unwrap_native(unused), Err(CextError::HandleNotFound(unused)));
    // Block that was never allocated.
    let far = ALLOCATION_BASE + (1 << 40);
    assert_eq!(ctx.unwrap_native(far), Err(CextError::HandleNotFound(far)));
    // Aligned value below the handle space.
    assert_eq!(ctx.unwrap_native(0x1000), Err(CextError::HandleNotFound(0x1000)));
}

#[test]
fn shared_handles_resolve_from_every_runtime() {
    let space = HandleSpace::new();
    let first = HandleManager::new(space.clone(), HandleConfig::default());
    let second = HandleManager::new(space, HandleConfig::default());
    let mut ctx = first.attach();

    let shared = Value::Object(ManagedObject::new_shareable(ObjectKind::string("frozen")));
    let local = object("Local");
    let shared_handle = ctx.wrap_to_native(&shared).unwrap();
    let local_handle = ctx.wrap_to_native(&local).unwrap();

    assert_eq!(second.unwrap_handle(shared_handle).unwrap(), shared);
    assert!(second.unwrap_handle(local_handle).unwrap_err().is_not_found());
    assert_eq!(first.unwrap_handle(local_handle).unwrap(), local);
}

#[test]
fn handle_statistics_count_mints() {
    let config = HandleConfig {
        handle_statistics: true,
        ..HandleConfig::default()
    };
    let manager = HandleManager::new(HandleSpace::new(), config);
    let mut ctx = manager.attach();
    let values = [object("A"), object("B"), Value::Float(1.0)];
    for value in &values {
        ctx.wrap_to_native(value).unwrap();
    }
    ctx.wrap_to_native(&values[0]).unwrap();
    ctx.wrap_to_native(&Value::Integer(3)).unwrap();

    assert_eq!(manager.total_handle_allocation_count(), 3);
    let stats = manager.stats();
    assert_eq!(stats.handles_minted, 3);
    assert_eq!(stats.blocks_allocated, 1);
    assert_eq!(stats.live_local_blocks, 1);

    let off = HandleManager::standalone();
    off.attach().wrap_to_native(&object("C")).unwrap();
    assert_eq!(off.total_handle_allocation_count(), 0);
}
