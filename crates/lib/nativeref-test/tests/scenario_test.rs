use nativeref::{
    Config,
    arrays::{CacheConfig, RADKE_PRIMES, element::{Double, Int, PinStrategy}},
    host::Host,
    linker::BuiltinClass,
};
use nativeref_test::*;

#[test]
fn two_references_one_pin() {
    let (mut host, mut rt) = setup(small_cache_config());
    let a = new_array::<Int>(&mut host, &[1, 2, 3, 4, 5]);
    let b = new_array::<Int>(&mut host, &[9]);
    {
        let mut frame = rt.frame(&mut host);
        let a2 = frame.host().new_local_ref(a).unwrap();
        let mut x = bind(&mut frame, a);
        let mut y = bind(&mut frame, a2);
        assert_ne!(x, y);

        assert_eq!(frame.array_length(x).unwrap(), 5);
        let p1 = frame.array_ptr::<Int>(x).unwrap();
        let p2 = frame.array_ptr::<Int>(y).unwrap();
        assert_eq!(p1, p2);
        assert_eq!(frame.runtime().cache().live_records(), 1);
        assert_eq!(frame.runtime().cache().generation_sizes(), vec![3]);

        // the initial generation has room for one record only
        let z = bind(&mut frame, b);
        frame.install_array(z).unwrap();
        assert_eq!(frame.runtime().cache().generation_sizes(), vec![3, 7]);
        assert_eq!(frame.runtime().cache().live_records(), 2);

        frame.release(&mut x);
        assert_eq!(frame.host().stats().unpins, 0);
        frame.release(&mut y);
        assert_eq!(frame.host().stats().unpins, 1);
        assert_eq!(frame.runtime().cache().live_records(), 1);
    }
    assert_eq!(host.stats().pins, 1);
    assert_eq!(host.stats().unpins, 1);
    assert_eq!(rt.cache().live_records(), 0);
    assert_released(&host);

    rt.finalize(&mut host);
    assert_eq!(rt.cache().generation_sizes(), vec![3]);
    assert_eq!(host.live_global_refs(), 0);
}

#[test]
fn identical_arrays_share_a_record() {
    let (mut host, mut rt) = setup_default();
    let a = new_array::<Double>(&mut host, &[0.5; 4]);
    let mut frame = rt.frame(&mut host);
    let bindings = (0..10)
        .map(|_| {
            let r = frame.host().new_local_ref(a).unwrap();
            bind(&mut frame, r)
        })
        .collect::<Vec<_>>();
    let ids = bindings
        .iter()
        .map(|&b| frame.install_array(b).unwrap())
        .collect::<Vec<_>>();
    assert!(ids.iter().all(|id| *id == ids[0]));
    let record = frame.runtime().cache().record(ids[0]).unwrap();
    assert_eq!(record.refcount(), 10);
    assert_eq!(frame.runtime().cache().live_records(), 1);
}

#[test]
fn generations_grow_along_the_prime_table() {
    let (mut host, mut rt) = setup_default();
    let arrays = (0..40)
        .map(|i| new_array::<Int>(&mut host, &[i]))
        .collect::<Vec<_>>();
    let mut frame = rt.frame(&mut host);
    for &a in &arrays {
        let b = bind(&mut frame, a);
        frame.install_array(b).unwrap();
    }
    let cache = frame.runtime().cache();
    assert_eq!(cache.live_records(), 40);
    let sizes = cache.generation_sizes();
    assert!(sizes.len() > 1);
    assert!(sizes.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(sizes[..], RADKE_PRIMES[..sizes.len()]);
    for generation in cache.generations() {
        assert!(generation.fill() <= generation.threshold());
    }
}

#[test]
fn refcounts_balance_after_many_rebinds() {
    let (mut host, mut rt) = setup_default();
    let arrays = (0..5)
        .map(|i| new_array::<Int>(&mut host, &[i, i + 1]))
        .collect::<Vec<_>>();
    {
        let mut frame = rt.frame(&mut host);
        let mut bindings = vec![None; 8];
        for round in 0..30 {
            let local = frame.host().new_local_ref(arrays[round % 5]);
            let target = &mut bindings[round % 8];
            frame.assign_simple(target, local).unwrap();
            frame.array_ptr::<Int>(*target).unwrap();
        }
        let mut alias = None;
        frame.assign_multi(&mut alias, bindings[0]);
        assert!(frame.multiref_compare(alias, bindings[0]));
        for b in bindings.iter_mut() {
            frame.release(b);
        }
        frame.release(&mut alias);
        assert_eq!(frame.slots().in_use(), 0);
        assert_eq!(frame.runtime().cache().live_records(), 0);
    }
    assert_eq!(host.stats().pins, host.stats().unpins);
    assert_released(&host);
}

#[test]
fn critical_pins_are_released_critically() {
    let config = Config {
        cache: CacheConfig {
            pin_strategy: PinStrategy::Critical,
            ..CacheConfig::default()
        },
        ..Config::default()
    };
    let (mut host, mut rt) = setup(config);
    let a = new_array::<Int>(&mut host, &[3, 1, 2]);
    rt.call(&mut host, |f| {
        let x = bind(f, a);
        f.elements::<Int>(x)?.sort_unstable();
        Ok(())
    });
    assert_eq!(host.array_elements::<Int>(a), vec![1, 2, 3]);
    assert_eq!(host.stats().critical_pins, 1);
    assert_eq!(host.stats().critical_unpins, 1);
    assert_eq!(host.stats().pins, 0);
    assert_released(&host);
}

#[test]
fn native_view_writes_through() {
    let (mut host, mut rt) = setup_default();
    let a = new_array::<Int>(&mut host, &[1, 2, 3]);
    rt.call(&mut host, |f| {
        let x = bind(f, a);
        let managed = f.array_ptr::<Int>(x)?;
        let native = f.converted_ptr::<Int>(x)?;
        assert_eq!(managed.cast::<u8>(), native.cast::<u8>());
        for v in f.native_elements::<Int>(x)? {
            *v *= 10;
        }
        Ok(())
    });
    assert_eq!(host.array_elements::<Int>(a), vec![10, 20, 30]);
    assert_released(&host);
}

#[test]
fn failed_pin_raises_out_of_memory() {
    let (mut host, mut rt) = setup_default();
    let a = new_array::<Int>(&mut host, &[1]);
    host.fail_next_pin();
    let r: i32 = rt.call(&mut host, |f| {
        let x = bind(f, a);
        let p = f.array_ptr::<Int>(x)?;
        // SAFETY: the array has one element
        Ok(unsafe { p.read() })
    });
    assert_eq!(r, 0);
    let (class, message) = take_exception(&mut host).unwrap();
    assert_eq!(class, BuiltinClass::OutOfMemoryError.name());
    assert!(message.contains("failed to get contents of an array"));
    assert!(message.ends_with("Original message: pin"));
    assert_eq!(rt.cache().live_records(), 0);
}

#[test]
fn full_cache_raises_out_of_memory() {
    let config = Config {
        cache: CacheConfig {
            max_size_index: 0,
            ..small_cache_config().cache
        },
        ..Config::default()
    };
    let (mut host, mut rt) = setup(config);
    let a = new_array::<Int>(&mut host, &[1]);
    let b = new_array::<Int>(&mut host, &[2]);
    let r: i32 = rt.call(&mut host, |f| {
        let x = bind(f, a);
        f.install_array(x)?;
        let y = bind(f, b);
        f.install_array(y)?;
        Ok(1)
    });
    assert_eq!(r, 0);
    let (class, message) = take_exception(&mut host).unwrap();
    assert_eq!(class, BuiltinClass::OutOfMemoryError.name());
    assert!(message.ends_with("array cache cannot grow any further"));
    assert_eq!(rt.cache().generation_sizes(), vec![3]);
    assert_released(&host);
}
