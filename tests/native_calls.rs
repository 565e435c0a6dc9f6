use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use cext_bridge::tagged::{NIL_HANDLE, encode_integer};
use cext_bridge::{
    CallOptions, CextError, ExecutionContext, HandleConfig, HandleManager, HandleSpace,
    ManagedObject, ObjectKind, Result, Value,
};

#[test]
fn arguments_resolve_inside_the_call() {
    let manager = HandleManager::standalone();
    let mut ctx = manager.attach();
    let point = Value::object(ObjectKind::plain("Point"));
    let block = Value::object(ObjectKind::plain("Proc"));
    let expected = point.clone();
    let expected_block = block.clone();

    let check = move |ctx: &mut ExecutionContext, args: &[u64]| -> Result<u64> {
        assert_eq!(args.len(), 3);
        assert_eq!(ctx.unwrap_native(args[0])?, expected);
        assert_eq!(args[1], NIL_HANDLE);
        assert_eq!(ctx.unwrap_native(args[2])?, Value::Float(0.5));
        let scope = ctx.marking_scope().expect("call scope");
        assert!(scope.keywords_given());
        assert_eq!(scope.block(), Some(&expected_block));
        assert_eq!(scope.preserved().len(), 3);
        Ok(args[0])
    };
    let options = CallOptions {
        keywords_given: true,
        frame_self: None,
        block: Some(block),
    };
    let result = ctx
        .call_native(&check, &[point.clone(), Value::Nil, Value::Float(0.5)], options)
        .unwrap();
    assert_eq!(result, point);
}

#[test]
fn result_handle_minted_inside_call_is_returned() {
    let manager = HandleManager::standalone();
    let mut ctx = manager.attach();
    let make = |ctx: &mut ExecutionContext, _: &[u64]| -> Result<u64> {
        ctx.wrap_to_native(&Value::object(ObjectKind::string("fresh")))
    };
    let result = ctx.call_native(&make, &[], CallOptions::default()).unwrap();
    assert_eq!(result.type_name(), "string");
}

#[test]
fn queued_marker_runs_when_call_ends() {
    let manager = HandleManager::standalone();
    let mut ctx = manager.attach();
    let holder = ManagedObject::new(ObjectKind::plain("Holder"));
    let child = Value::object(ObjectKind::plain("Child"));
    let child_handle = ctx.wrap_to_native(&child).unwrap();
    holder.hidden_variable_set("data_holder", Value::Integer(child_handle as i64));

    let runs = Arc::new(AtomicU64::new(0));
    let counter = runs.clone();
    manager
        .define_marker(&Value::Object(holder.clone()), move |ctx, owner| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(Value::Integer(raw)) = owner.hidden_variable_get("data_holder") {
                ctx.mark(&Value::native_pointer(raw as u64))?;
            }
            Ok(())
        })
        .unwrap();

    let target = holder.clone();
    let store = move |ctx: &mut ExecutionContext, _: &[u64]| -> Result<u64> {
        ctx.queue_for_marking(&target);
        Ok(NIL_HANDLE)
    };
    ctx.call_native(&store, &[], CallOptions::default()).unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(holder.marked_objects(), vec![child]);
}

#[test]
fn native_failure_is_propagated() {
    let manager = HandleManager::standalone();
    let mut ctx = manager.attach();
    let fail = |_: &mut ExecutionContext, _: &[u64]| -> Result<u64> {
        Err(CextError::NativeCall("bad struct".into()))
    };
    assert_eq!(
        ctx.call_native(&fail, &[Value::Integer(1)], CallOptions::default()),
        Err(CextError::NativeCall("bad struct".into()))
    );
    assert!(!manager.native_lock().is_locked());
}

#[test]
fn dangling_result_handle_is_an_error() {
    let manager = HandleManager::standalone();
    let mut ctx = manager.attach();
    let bogus = |_: &mut ExecutionContext, _: &[u64]| -> Result<u64> { Ok(0x40) };
    assert_eq!(
        ctx.call_native(&bogus, &[], CallOptions::default()),
        Err(CextError::HandleNotFound(0x40))
    );
}

#[test]
fn interrupt_stops_the_next_call() {
    let manager = HandleManager::standalone();
    let mut ctx = manager.attach();
    let noop = |_: &mut ExecutionContext, _: &[u64]| -> Result<u64> { Ok(NIL_HANDLE) };
    ctx.interrupter().interrupt();
    assert_eq!(
        ctx.call_native(&noop, &[], CallOptions::default()),
        Err(CextError::Interrupted)
    );
    assert_eq!(ctx.call_native(&noop, &[], CallOptions::default()), Ok(Value::Nil));
}

#[test]
fn lock_is_held_only_when_enabled() {
    let observe = |ctx: &mut ExecutionContext, _: &[u64]| -> Result<u64> {
        let held = ctx.manager().native_lock().is_held_by_current_thread();
        Ok(encode_integer(i64::from(held)).unwrap_or(NIL_HANDLE))
    };

    let locked = HandleManager::standalone();
    let result = locked
        .attach()
        .call_native(&observe, &[], CallOptions::default())
        .unwrap();
    assert_eq!(result, Value::Integer(1));

    let config = HandleConfig {
        native_call_lock: false,
        ..HandleConfig::default()
    };
    let unlocked = HandleManager::new(HandleSpace::new(), config);
    let result = unlocked
        .attach()
        .call_native(&observe, &[], CallOptions::default())
        .unwrap();
    assert_eq!(result, Value::Integer(0));
}

#[test]
fn symbols_through_native_ids() {
    let manager = HandleManager::standalone();
    let mut ctx = manager.attach();
    let symbols = manager.space().symbols();
    for name in ["a", "~", "initialize", "to_s"] {
        let symbol = Value::Object(symbols.intern(name));
        let id = ctx.symbol_to_id(&symbol).unwrap();
        assert_eq!(ctx.id_to_symbol(id).unwrap(), symbol, "{name}");
    }
}
