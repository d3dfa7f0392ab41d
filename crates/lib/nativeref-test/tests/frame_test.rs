use nativeref::{
    arrays::element::{ElementType, Int, Short},
    frame::Dimension,
    host::{Host, memory::MonitorOp},
    linker::BuiltinClass,
    utils::error::NativeError,
};
use nativeref_test::*;

#[test]
fn dropping_a_frame_releases_what_was_left_bound() {
    let (mut host, mut rt) = setup_default();
    let a = new_array::<Int>(&mut host, &[1, 2]);
    let b = new_array::<Short>(&mut host, &[1, 2, 3]);
    let s = host.new_string("leaked");
    {
        let mut frame = rt.frame(&mut host);
        let x = bind(&mut frame, a);
        let y = bind(&mut frame, b);
        let z = bind(&mut frame, s);
        frame.array_ptr::<Int>(x).unwrap();
        frame.array_ptr::<Short>(y).unwrap();
        frame.utf8(z).unwrap();
        frame.utf16(z).unwrap();
        assert_eq!(frame.slots().in_use(), 3);
    }
    assert_eq!(rt.cache().live_records(), 0);
    assert_eq!(host.stats().pins, 2);
    assert_eq!(host.stats().unpins, 2);
    assert_released(&host);
}

#[test]
fn string_views_are_loaded_once() {
    let (mut host, mut rt) = setup_default();
    let s = host.new_string("h\u{e9}llo");
    rt.call(&mut host, |f| {
        let mut x = bind(f, s);
        let wide = f.utf16(x)?.to_vec();
        assert_eq!(wide, "h\u{e9}llo".encode_utf16().collect::<Vec<_>>());
        let narrow = f.utf8(x)?.to_str().map(str::to_owned);
        assert_eq!(narrow.as_deref(), Ok("h\u{e9}llo"));
        f.utf8(x)?;
        f.utf16(x)?;
        assert_eq!(f.host().stats().utf8_views, 1);
        assert_eq!(f.host().stats().utf16_views, 1);
        f.release(&mut x);
        Ok(())
    });
    assert_eq!(host.stats().utf8_releases, 1);
    assert_eq!(host.stats().utf16_releases, 1);
    assert_released(&host);
}

#[test]
fn null_string_raises() {
    let (mut host, mut rt) = setup_default();
    let r: i32 = rt.call(&mut host, |f| {
        f.utf16(None)?;
        Ok(1)
    });
    assert_eq!(r, 0);
    let (class, message) = take_exception(&mut host).unwrap();
    assert_eq!(class, BuiltinClass::NullPointerException.name());
    assert!(message.ends_with("null string reference"));
}

#[test]
fn bounds_checks() {
    let (mut host, mut rt) = setup_default();
    let a = new_array::<Int>(&mut host, &[0; 5]);
    let mut frame = rt.frame(&mut host);
    let x = bind(&mut frame, a);
    assert!(frame.check_bounds(x, 0).is_ok());
    assert!(frame.check_bounds(x, 4).is_ok());
    for index in [5, -1, i32::MAX] {
        let e = frame.check_bounds(x, index).unwrap_err().0;
        let (class, message) = describe(frame.host(), e);
        assert_eq!(class, BuiltinClass::ArrayIndexOutOfBoundsException.name());
        assert!(message.ends_with(&format!("Array index out of range: {index}")));
    }
    assert!(frame.check_handle_bounds(Some(a), 4).is_ok());
    assert!(frame.check_handle_bounds(Some(a), 5).is_err());
    let e = frame.check_bounds(None, 0).unwrap_err().0;
    let (class, _) = describe(frame.host(), e);
    assert_eq!(class, BuiltinClass::NullPointerException.name());
    // the length is asked for once per slot
    assert_eq!(frame.array_length(x).unwrap(), 5);
    assert!(frame.slots().slot(x.unwrap()).length().is_some());
}

#[test]
fn integer_arithmetic() {
    let (mut host, mut rt) = setup_default();
    let mut frame = rt.frame(&mut host);
    assert_eq!(frame.integer_division(7, 2).unwrap(), 3);
    assert_eq!(frame.integer_division(i32::MIN, -1).unwrap(), i32::MIN);
    assert_eq!(frame.integer_division(i64::MIN, -1).unwrap(), i64::MIN);
    assert_eq!(frame.integer_remainder(-7, 2).unwrap(), -1);
    assert_eq!(frame.integer_remainder(i32::MIN, -1).unwrap(), 0);
    assert!(frame.ensure_divisor_not_zero(0.5f64).is_ok());
    let e = frame.integer_division(1u16, 0).unwrap_err().0;
    let (class, message) = describe(frame.host(), e);
    assert_eq!(class, BuiltinClass::ArithmeticException.name());
    assert!(message.ends_with("division by zero"));
}

#[test]
fn nested_arrays() {
    let (mut host, mut rt) = setup_default();
    let r = rt.call(&mut host, |f| {
        let object = f.class(BuiltinClass::Object.index())?;
        let outer = f.new_array(
            &[
                Dimension {
                    length: 2,
                    element_class: Some(object),
                },
                Dimension {
                    length: 3,
                    element_class: None,
                },
            ],
            Some(ElementType::Int),
        )?;
        Ok(Some(outer))
    });
    let outer = r.unwrap();
    assert_eq!(host.array_length(outer), 2);
    for i in 0..2 {
        let inner = host.object_array_element(outer, i).unwrap();
        assert_eq!(host.element_type_of(inner), Some(ElementType::Int));
        assert_eq!(host.array_length(inner), 3);
    }
}

#[test]
fn negative_dimension_is_reported() {
    let (mut host, mut rt) = setup_default();
    let r = rt.call(&mut host, |f| {
        let object = f.class(BuiltinClass::Object.index())?;
        let dims = [
            Dimension {
                length: 2,
                element_class: Some(object),
            },
            Dimension {
                length: -3,
                element_class: None,
            },
        ];
        Ok(Some(f.new_array(&dims, Some(ElementType::Byte))?))
    });
    assert_eq!(r, None);
    let (class, message) = take_exception(&mut host).unwrap();
    assert_eq!(class, BuiltinClass::NegativeArraySizeException.name());
    assert!(message.ends_with("1: -3"));
}

#[test]
fn array_allocation_failure_keeps_host_cause() {
    let (mut host, mut rt) = setup_default();
    host.fail_allocations(true);
    let r = rt.call(&mut host, |f| {
        Ok(Some(f.new_array(
            &[Dimension {
                length: 4,
                element_class: None,
            }],
            Some(ElementType::Double),
        )?))
    });
    assert_eq!(r, None);
    let (class, message) = take_exception(&mut host).unwrap();
    assert_eq!(class, BuiltinClass::OutOfMemoryError.name());
    assert_eq!(message, "array");
}

#[test]
fn casts_and_instance_tests() {
    let (mut host, mut rt) = setup_default();
    let s = host.new_string("x");
    let string_class = builtin(&rt, BuiltinClass::String);
    let mut frame = rt.frame(&mut host);
    assert!(frame.cast_check(None, BuiltinClass::Throwable.index()).is_ok());
    assert!(frame.cast_check(Some(s), BuiltinClass::String.index()).is_ok());
    assert!(frame.cast_check(Some(s), BuiltinClass::Object.index()).is_ok());
    let e = frame
        .cast_check(Some(s), BuiltinClass::Throwable.index())
        .unwrap_err()
        .0;
    let (class, message) = describe(frame.host(), e);
    assert_eq!(class, BuiltinClass::ClassCastException.name());
    assert!(message.ends_with("Object is not of type lang/Throwable"));
    assert!(frame.is_instance_of(Some(s), string_class));
    assert!(!frame.is_instance_of(None, string_class));
}

#[test]
fn synchronized_block_exits_its_monitor() {
    let (mut host, mut rt) = setup_default();
    let lock = host.new_string("lock");
    let r: i32 = rt.call(&mut host, |f| {
        f.synchronized(lock, |f| {
            assert_eq!(f.host().monitor_depth(lock), 1);
            f.integer_division(1, 0)?;
            Ok(1)
        })
    });
    assert_eq!(r, 0);
    assert_eq!(host.monitor_depth(lock), 0);
    let (class, _) = take_exception(&mut host).unwrap();
    assert_eq!(class, BuiltinClass::ArithmeticException.name());
}

#[test]
fn failing_monitor_exit_wins() {
    let (mut host, mut rt) = setup_default();
    let lock = host.new_string("lock");
    let r: i32 = rt.call(&mut host, |f| {
        f.synchronized(lock, |f| {
            f.host().fail_monitor_exit(true);
            Ok(1)
        })
    });
    assert_eq!(r, 0);
    let (class, message) = take_exception(&mut host).unwrap();
    assert_eq!(class, "lang/IllegalMonitorStateException");
    assert_eq!(message, "monitor not held");
}

#[test]
fn held_monitors_are_exited_in_reverse() {
    let (mut host, mut rt) = setup_default();
    let a = host.new_string("a");
    let b = host.new_string("b");
    let (ka, kb) = (host.object_key(a).unwrap(), host.object_key(b).unwrap());
    let r: i32 = rt.call(&mut host, |f| {
        let _outer = f.monitor_enter(a)?;
        let _inner = f.monitor_enter(b)?;
        f.ensure_not_null(None, "escaping")?;
        Ok(1)
    });
    assert_eq!(r, 0);
    assert_eq!(
        host.monitor_log(),
        [
            (MonitorOp::Enter, ka),
            (MonitorOp::Enter, kb),
            (MonitorOp::Exit, kb),
            (MonitorOp::Exit, ka),
        ]
    );
    // the escaping exception survives the monitor sweep
    let (class, message) = take_exception(&mut host).unwrap();
    assert_eq!(class, BuiltinClass::NullPointerException.name());
    assert!(message.ends_with("escaping"));
}

#[test]
fn unconstructible_exception_falls_back_to_preallocated_error() {
    let (mut host, mut rt) = setup_default();
    host.fail_throw_new(true);
    let mut frame = rt.frame(&mut host);
    let e = frame.ensure_not_null(None, "x").unwrap_err().0;
    let (class, message) = describe(frame.host(), e);
    assert_eq!(class, BuiltinClass::OutOfMemoryError.name());
    assert_eq!(message, "unable to create exception object");
}

#[test]
fn raise_wraps_pending_host_exception() {
    let (mut host, mut rt) = setup_default();
    let mut frame = rt.frame(&mut host);
    let string_class = frame.class(BuiltinClass::String.index()).unwrap();
    assert_eq!(frame.host().new_object_array(-1, string_class), None);
    assert!(frame.host().exception_check());
    let e = frame.raise(NativeError::unknown("while building"));
    let (class, message) = describe(frame.host(), e.0);
    // no class of its own: the pending exception's class is kept
    assert_eq!(class, BuiltinClass::NegativeArraySizeException.name());
    assert!(message.contains("while building"));
    assert!(message.ends_with("\nOriginal message: -1"));
    assert!(!frame.host().exception_check());
}
