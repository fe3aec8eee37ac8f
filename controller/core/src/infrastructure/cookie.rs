// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Reconnection cookies: 256 bits from the OS CSPRNG, hex encoded.

use rand_core::{OsRng, RngCore};
use subtle::ConstantTimeEq;

use crate::domain::agent::Cookie;

const COOKIE_BYTES: usize = 32;

pub fn issue_cookie() -> Cookie {
    let mut bytes = [0u8; COOKIE_BYTES];
    OsRng.fill_bytes(&mut bytes);
    Cookie::new(hex::encode(bytes))
}

/// Exact-match comparison that does not leak the matching prefix length.
pub fn cookies_match(presented: &Cookie, issued: &Cookie) -> bool {
    let presented = presented.as_str().as_bytes();
    let issued = issued.as_str().as_bytes();
    presented.len() == issued.len() && bool::from(presented.ct_eq(issued))
}
