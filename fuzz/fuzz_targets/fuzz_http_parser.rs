#![no_main]

use libfuzzer_sys::fuzz_target;
use reactorhttp::buffer::Buffer;
use reactorhttp::http::HttpParser;

fuzz_target!(|data: &[u8]| {
    let mut parser = HttpParser::new();
    let mut buf = Buffer::new();
    buf.append(data);
    let _ = parser.parse(&mut buf);
});
