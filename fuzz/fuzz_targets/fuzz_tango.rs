#![no_main]
use libfuzzer_sys::fuzz_target;
use tango_tree::TangoTree;

fuzz_target!(|keys: Vec<u16>| {
    let mut tango = TangoTree::<1024>::default();
    tango.build(1023);
    for key in keys {
        let key = u64::from(key) % 1023 + 1;
        assert!(tango.search(key));
        assert!(tango.is_valid());
    }
});
