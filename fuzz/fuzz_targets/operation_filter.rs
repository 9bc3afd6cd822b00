#![no_main]

use hetrace::operation_filter::OperationFilter;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        // must not panic on any expression
        if let Ok(filter) = OperationFilter::from_expr(input) {
            let _ = filter.should_trace(input);
            let _ = filter.merge(OperationFilter::default_api_exclusions());
        }
    }
});
