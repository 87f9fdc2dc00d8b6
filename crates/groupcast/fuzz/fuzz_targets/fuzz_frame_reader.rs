// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![no_main]

use groupcast::codec::FrameReader;
use libfuzzer_sys::fuzz_target;
use std::io::Cursor;

fuzz_target!(|data: &[u8]| {
    let mut reader = FrameReader::new(1 << 20);
    let mut cursor = Cursor::new(data);
    loop {
        match reader.decode(&mut cursor) {
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => break,
        }
    }
});
