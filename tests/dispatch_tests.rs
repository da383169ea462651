//! Calls across the boundary: overload fallback, implicit conversions and
//! release of call temporaries.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use bindery::{
    Bridge, BridgeError, BridgeProperty, CallBuilder, FromHost, Handle, IntoHost, Param,
    TypeBuilder,
};

#[derive(Default)]
struct Counters {
    built: Cell<u32>,
    dropped: Cell<u32>,
}

struct Meters {
    value: f64,
    counters: Rc<Counters>,
}

impl Drop for Meters {
    fn drop(&mut self) {
        self.counters.dropped.set(self.counters.dropped.get() + 1);
    }
}

struct Feet(f64);

struct Label(String);

/// Bridge where ints convert to `Meters` through a predicate.
fn bridge(counters: &Rc<Counters>) -> Bridge {
    let mut bridge = Bridge::new();
    bridge.register(TypeBuilder::<Meters>::new("Meters").build());
    bridge.register(TypeBuilder::<Feet>::new("Feet").build());
    bridge.register(TypeBuilder::<Label>::new("Label").build());

    let counters = Rc::clone(counters);
    bridge
        .implicitly_convertible_if::<Meters, _, _>(
            |bridge, handle, _| i64::from_host(bridge.heap(), handle).is_ok(),
            move |bridge, handle| {
                let value = i64::from_host(bridge.heap(), handle)? as f64;
                counters.built.set(counters.built.get() + 1);
                Ok(Meters {
                    value,
                    counters: Rc::clone(&counters),
                })
            },
        )
        .unwrap();
    bridge
}

#[test]
fn test_overload_fallback_runs_only_matching_candidate() {
    let counters = Rc::new(Counters::default());
    let mut bridge = bridge(&counters);
    let ran = Rc::new(RefCell::new(Vec::new()));

    let int = Param::value::<i64>();
    let (r1, r2, r3) = (Rc::clone(&ran), Rc::clone(&ran), Rc::clone(&ran));
    let f = bridge
        .function("f")
        .overload("f(int, Label)", &[int, Param::native::<Label>()], move |frame| {
            let seen: i64 = frame.arg_value(0)?;
            r1.borrow_mut().push(format!("f1 saw {seen}"));
            let _ = frame.arg::<Label>(1)?;
            Ok(frame.none())
        })
        .overload("f(int, str)", &[int, Param::value::<String>()], move |frame| {
            let seen: i64 = frame.arg_value(0)?;
            r2.borrow_mut().push(format!("f2 saw {seen}"));
            let _: String = frame.arg_value(1)?;
            Ok(frame.none())
        })
        .overload("f(int, bool)", &[int, Param::value::<bool>()], move |frame| {
            let flag: bool = frame.arg_value(1)?;
            r3.borrow_mut().push("f3".to_string());
            Ok(frame.ret(!flag))
        })
        .build();

    let heap = bridge.heap_mut();
    let args = CallBuilder::new()
        .arg(5i64.into_host(heap))
        .arg(true.into_host(heap));
    let result = bridge.call(f, args).unwrap();

    assert_eq!(*ran.borrow(), vec!["f3".to_string()]);
    assert!(!bool::from_host(bridge.heap(), result).unwrap());
}

#[test]
fn test_no_matching_overload_names_arguments() {
    let counters = Rc::new(Counters::default());
    let mut bridge = bridge(&counters);
    let f = bridge
        .function("f")
        .overload("f(Label)", &[Param::native::<Label>()], |frame| {
            let _ = frame.arg::<Label>(0)?;
            Ok(frame.none())
        })
        .build();

    let arg = 1.5f64.into_host(bridge.heap_mut());
    let err = bridge.call(f, CallBuilder::new().arg(arg)).unwrap_err();
    assert_eq!(
        err,
        BridgeError::NoMatchingOverload {
            function: "f".to_string(),
            signatures: vec!["f(Label)".to_string()],
            arguments: vec!["float".to_string()],
        }
    );
    assert!(!bridge.heap().is_live(arg));
}

#[test]
fn test_failure_at_third_argument_releases_earlier_temporaries() {
    let counters = Rc::new(Counters::default());
    let mut bridge = bridge(&counters);
    let meters = Param::native::<Meters>();
    let total = bridge
        .function("total")
        .overload("total(Meters, Meters, Meters)", &[meters; 3], |frame| {
            let a = frame.arg::<Meters>(0)?.value;
            let b = frame.arg::<Meters>(1)?.value;
            let c = frame.arg::<Meters>(2)?.value;
            Ok(frame.ret(a + b + c))
        })
        .build();

    let heap = bridge.heap_mut();
    let args = CallBuilder::new()
        .arg(1i64.into_host(heap))
        .arg(2i64.into_host(heap))
        .arg("three".into_host(heap));
    let err = bridge.call(total, args).unwrap_err();

    assert!(matches!(err, BridgeError::NoMatchingOverload { .. }));
    assert_eq!(counters.built.get(), 2);
    assert_eq!(counters.dropped.get(), 2);
    assert_eq!(bridge.instance_count(), 0);
}

#[test]
fn test_converted_arguments_are_released_after_success() {
    let counters = Rc::new(Counters::default());
    let mut bridge = bridge(&counters);
    let meters = Param::native::<Meters>();
    let total = bridge
        .function("total")
        .overload("total(Meters, Meters)", &[meters, meters], |frame| {
            let a = frame.arg::<Meters>(0)?.value;
            let b = frame.arg::<Meters>(1)?.value;
            Ok(frame.ret(a + b))
        })
        .build();

    let heap = bridge.heap_mut();
    let args = CallBuilder::new()
        .arg(4i64.into_host(heap))
        .arg(5i64.into_host(heap));
    let result = bridge.call(total, args).unwrap();

    assert_eq!(f64::from_host(bridge.heap(), result).unwrap(), 9.0);
    assert_eq!(counters.built.get(), 2);
    assert_eq!(counters.dropped.get(), 2);
}

#[test]
fn test_exact_match_beats_conversion() {
    let counters = Rc::new(Counters::default());
    let mut bridge = bridge(&counters);
    let describe = bridge
        .function("describe")
        .overload("describe(Meters)", &[Param::native::<Meters>()], |frame| {
            let _ = frame.arg::<Meters>(0)?;
            Ok(frame.ret("meters"))
        })
        .overload("describe(int)", &[Param::value::<i64>()], |frame| {
            let _: i64 = frame.arg_value(0)?;
            Ok(frame.ret("int"))
        })
        .build();

    let arg = 3i64.into_host(bridge.heap_mut());
    let result = bridge.call(describe, CallBuilder::new().arg(arg)).unwrap();
    assert_eq!(String::from_host(bridge.heap(), result).unwrap(), "int");
    assert_eq!(counters.built.get(), 0);
}

impl From<&Feet> for Meters {
    fn from(feet: &Feet) -> Self {
        Meters {
            value: feet.0 * 0.3048,
            counters: Rc::default(),
        }
    }
}

#[test]
fn test_type_conversion_and_property_switch() {
    let counters = Rc::new(Counters::default());
    let mut bridge = bridge(&counters);
    bridge.implicitly_convertible::<Feet, Meters>().unwrap();

    let length = bridge
        .function("length")
        .overload("length(Meters)", &[Param::native::<Meters>()], |frame| {
            let value = frame.arg::<Meters>(0)?.value;
            Ok(frame.ret(value))
        })
        .build();

    let feet = bridge.publish_value(Feet(10.0)).unwrap();
    bridge.heap_mut().add_ref(feet);
    let result = bridge.call(length, CallBuilder::new().arg(feet)).unwrap();
    let meters = f64::from_host(bridge.heap(), result).unwrap();
    assert!((meters - 3.048).abs() < 1e-9);
    assert_eq!(bridge.instance_count(), 1);

    bridge.set_property(BridgeProperty::ImplicitConversions, 0);
    let err = bridge
        .call(length, CallBuilder::new().arg(feet))
        .unwrap_err();
    assert!(matches!(err, BridgeError::NoMatchingOverload { .. }));
    assert!(!bridge.heap().is_live(feet));
}

#[test]
fn test_method_call_receiver_is_first_argument() {
    let counters = Rc::new(Counters::default());
    let mut bridge = bridge(&counters);
    let rename = bridge
        .function("rename")
        .overload(
            "rename(Label, str)",
            &[Param::native::<Label>(), Param::value::<String>()],
            |frame| {
                let name: String = frame.arg_value(1)?;
                let receiver = frame.receiver();
                assert_eq!(receiver, Some(frame.arg_handle(0)?));
                frame.arg_mut::<Label>(0)?.0 = name;
                Ok(frame.none())
            },
        )
        .build();

    let label = bridge.publish_value(Label("old".to_string())).unwrap();
    let method = bridge.bind(label, rename).unwrap();
    let name = "new".into_host(bridge.heap_mut());
    bridge.call(method, CallBuilder::new().arg(name)).unwrap();

    assert_eq!(bridge.borrow::<Label>(label).unwrap().0, "new");
    bridge.heap_mut().release(method);
    assert_eq!(bridge.heap().ref_count(label), Some(1));
}

struct Celsius(f64);

#[test]
fn test_predicate_temporaries_are_released_with_the_call() {
    let counters = Rc::new(Counters::default());
    let mut bridge = bridge(&counters);
    bridge.register(TypeBuilder::<Celsius>::new("Celsius").build());

    // Strings qualify when they parse; the parsed number is parked as a temporary.
    let parked = Rc::new(RefCell::new(Vec::<Handle>::new()));
    let seen = Rc::clone(&parked);
    bridge
        .implicitly_convertible_if::<Celsius, _, _>(
            move |bridge, handle, cleanup| {
                let Ok(text) = String::from_host(bridge.heap(), handle) else {
                    return false;
                };
                let Ok(degrees) = text.trim_end_matches('C').parse::<f64>() else {
                    return false;
                };
                let temp = degrees.into_host(bridge.heap_mut());
                cleanup.append(temp);
                seen.borrow_mut().push(temp);
                true
            },
            |bridge, handle| {
                let text = String::from_host(bridge.heap(), handle)?;
                let degrees = text
                    .trim_end_matches('C')
                    .parse::<f64>()
                    .map_err(|err| BridgeError::raise(err.to_string()))?;
                Ok(Celsius(degrees))
            },
        )
        .unwrap();

    let to_fahrenheit = bridge
        .function("to_fahrenheit")
        .overload("to_fahrenheit(Celsius)", &[Param::native::<Celsius>()], |frame| {
            let c = frame.arg::<Celsius>(0)?.0;
            Ok(frame.ret(c * 9.0 / 5.0 + 32.0))
        })
        .build();

    let arg = "100C".into_host(bridge.heap_mut());
    let result = bridge
        .call(to_fahrenheit, CallBuilder::new().arg(arg))
        .unwrap();
    assert_eq!(f64::from_host(bridge.heap(), result).unwrap(), 212.0);

    let parked = parked.borrow();
    assert_eq!(parked.len(), 1);
    assert!(!bridge.heap().is_live(parked[0]));
    assert_eq!(bridge.instance_count(), 0);
}
