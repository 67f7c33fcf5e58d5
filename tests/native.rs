use dispatch_rs::{
    error::{DispatchError, MissingReason},
    resolve::ClassTable,
    types::{Arity, EntryPoint, MethodFlags},
    value::Value,
    vm::{bridge::selector_word, DispatchConfig, FfiBridge},
    CallSiteCache, CallStack, DispatchKind, Selector, SharedGlobalState,
};
use std::{
    ffi::c_void,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
};

static WIDTH: AtomicI64 = AtomicI64::new(0);

extern "C" fn set_width(_this: u64, _cmd: usize, width: i64) {
    WIDTH.store(width, Ordering::SeqCst);
}

extern "C" fn is_opaque(_this: u64, _cmd: usize) -> u8 {
    1
}

extern "C" fn itself(this: u64, _cmd: usize) -> u64 {
    this
}

extern "C" fn command(_this: u64, cmd: usize) -> i64 {
    cmd as i64
}

extern "C" fn add(a: i64, b: i64) -> i64 {
    a + b
}

extern "C" fn answer() -> i64 {
    42
}

fn entry(f: *const c_void) -> EntryPoint {
    unsafe { EntryPoint::new(f) }
}

fn setup(config: DispatchConfig) -> (Arc<ClassTable>, CallStack) {
    let table = Arc::new(ClassTable::new());
    let shared = SharedGlobalState::new(table.clone(), Arc::new(FfiBridge), config);
    (table, CallStack::new(Arc::new(shared)))
}

fn send(stack: &mut CallStack, cache: &CallSiteCache, receiver: &Value, selector: &str, args: &[Value]) -> dispatch_rs::DispatchResult<Value> {
    stack.dispatch(cache, receiver, selector.into(), None, DispatchKind::Normal, args)
}

#[test]
fn setter_rewrites_to_native_method() {
    let (table, mut stack) = setup(DispatchConfig::default());
    let view = table.define_class("View", None);
    table
        .define_native_method(view, "setWidth:", "v@:q", false, entry(set_width as *const c_void))
        .unwrap();
    table
        .define_native_method(view, "isOpaque", "B@:", false, entry(is_opaque as *const c_void))
        .unwrap();
    let obj = stack.instantiate(view, &[], None).unwrap();

    let site = CallSiteCache::new();
    assert!(send(&mut stack, &site, &obj, "width=:", &[Value::Fixnum(42)]).unwrap().is_nil());
    assert_eq!(WIDTH.load(Ordering::SeqCst), 42);
    send(&mut stack, &site, &obj, "width=:", &[Value::Fixnum(7)]).unwrap();
    assert_eq!(WIDTH.load(Ordering::SeqCst), 7);

    let opaque = send(&mut stack, &CallSiteCache::new(), &obj, "opaque?", &[]).unwrap();
    assert!(matches!(opaque, Value::Bool(true)));

    let stats = stack.shared.get_cache_stats();
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.stubs_generated, 2);
    assert!(stack.shared.handles.is_empty());
}

#[test]
fn accessor_rewrite_can_be_disabled() {
    let config = DispatchConfig {
        accessor_rewrite: false,
        ..DispatchConfig::default()
    };
    let (table, mut stack) = setup(config);
    let view = table.define_class("View", None);
    table
        .define_native_method(view, "setWidth:", "v@:q", false, entry(set_width as *const c_void))
        .unwrap();
    let obj = stack.instantiate(view, &[], None).unwrap();
    let err = send(&mut stack, &CallSiteCache::new(), &obj, "width=:", &[Value::Fixnum(1)]).unwrap_err();
    assert!(matches!(err, DispatchError::NoMethod { .. }));
}

#[test]
fn native_methods_receive_receiver_and_selector() {
    let (table, mut stack) = setup(DispatchConfig::default());
    let c = table.define_class("Native", None);
    table
        .define_native_method(c, "itself", "@@:", false, entry(itself as *const c_void))
        .unwrap();
    table
        .define_native_method(c, "command", "q@:", false, entry(command as *const c_void))
        .unwrap();
    let obj = stack.instantiate(c, &[], None).unwrap();

    let v = send(&mut stack, &CallSiteCache::new(), &obj, "itself", &[]).unwrap();
    assert!(v.eql(&obj));
    let v = send(&mut stack, &CallSiteCache::new(), &obj, "command", &[]).unwrap();
    assert_eq!(v.as_fixnum(), Some(selector_word(Selector::intern("command")) as i64));

    let err = send(&mut stack, &CallSiteCache::new(), &obj, "command", &[Value::Nil]).unwrap_err();
    assert!(err.is_argument_error());
}

#[test]
fn forwarding_entry_sees_original_selector() {
    let (table, mut stack) = setup(DispatchConfig::default());
    let proxy = table.define_class("Proxy", None);
    table
        .define_forwarding(proxy, "q@:", entry(command as *const c_void))
        .unwrap();
    let obj = stack.instantiate(proxy, &[], None).unwrap();

    let site = CallSiteCache::new();
    for selector in ["anything", "other:"] {
        let args = if selector.ends_with(':') { vec![Value::Fixnum(1)] } else { vec![] };
        let v = send(&mut stack, &site, &obj, selector, &args).unwrap();
        assert_eq!(v.as_fixnum(), Some(selector_word(Selector::intern(selector)) as i64));
    }
}

#[test]
fn bridged_functions_ignore_the_receiver() {
    let (table, mut stack) = setup(DispatchConfig::default());
    table
        .define_function("add", "qqq", false, entry(add as *const c_void))
        .unwrap();
    let site = CallSiteCache::new();

    let v = send(&mut stack, &site, &Value::Nil, "add:", &[Value::Fixnum(2), Value::Fixnum(3)]).unwrap();
    assert_eq!(v.as_fixnum(), Some(5));
    let v = send(&mut stack, &site, &Value::Fixnum(0), "add:", &[Value::Fixnum(4), Value::Fixnum(5)]).unwrap();
    assert_eq!(v.as_fixnum(), Some(9));
    assert_eq!(stack.shared.get_cache_stats().cache_hits, 1);

    let err = send(&mut stack, &CallSiteCache::new(), &Value::Nil, "add:", &[Value::Fixnum(1)]).unwrap_err();
    assert_eq!(err.to_string(), "wrong number of arguments (1 for 2)");
}

#[test]
fn bridged_entry_does_not_shadow_a_class_method() {
    let (table, mut stack) = setup(DispatchConfig::default());
    table
        .define_function("answer", "q", false, entry(answer as *const c_void))
        .unwrap();
    let plain = table.define_class("Plain", None);
    let owner = table.define_class("Owner", None);
    table.define_method(owner, "answer", Arity::fixed(0), MethodFlags::empty(), |_, _, _| {
        Ok(Value::string("own"))
    });
    let plain = stack.instantiate(plain, &[], None).unwrap();
    let owner = stack.instantiate(owner, &[], None).unwrap();

    let site = CallSiteCache::new();
    let v = send(&mut stack, &site, &plain, "answer", &[]).unwrap();
    assert_eq!(v.as_fixnum(), Some(42));
    let v = send(&mut stack, &site, &owner, "answer", &[]).unwrap();
    assert!(matches!(v, Value::Str(ref s) if &**s == "own"));
    let v = send(&mut stack, &site, &plain, "answer", &[]).unwrap();
    assert_eq!(v.as_fixnum(), Some(42));
    assert_eq!(stack.shared.get_cache_stats().cache_fills, 3);
}

#[test]
fn bridged_functions_can_be_disabled() {
    let config = DispatchConfig {
        bridged_functions: false,
        ..DispatchConfig::default()
    };
    let (table, mut stack) = setup(config);
    table
        .define_function("add", "qqq", false, entry(add as *const c_void))
        .unwrap();
    let err = send(&mut stack, &CallSiteCache::new(), &Value::Nil, "add:", &[Value::Fixnum(1), Value::Fixnum(2)])
        .unwrap_err();
    assert!(matches!(err, DispatchError::NoMethod { reason: MissingReason::Default, .. }));
}

#[test]
fn bad_signatures_are_rejected() {
    let (table, _) = setup(DispatchConfig::default());
    let c = table.define_class("Broken", None);
    assert!(table
        .define_native_method(c, "f", "vq", false, entry(add as *const c_void))
        .is_err());
    assert!(table
        .define_function("g", "v{point=dd}", false, entry(add as *const c_void))
        .is_err());
}
