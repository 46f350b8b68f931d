// SPDX-License-Identifier: Apache-2.0
//! Deterministic value generators for `defaultfunc` fields.
//!
//! Generators never consult a random source. Each candidate is a pure
//! function of (writer, field, baseline, attempt); the caller supplies a
//! collision check and we bump the attempt counter until it passes. Two
//! writers making the same edit from the same baseline therefore generate
//! the same values, and their changesets fold.

use cairn_schema::{Csid, DefaultFunc, UserIdent};

use crate::content;

pub(crate) fn run(
    func: DefaultFunc,
    user: &UserIdent,
    field: &str,
    baseline: Option<&Csid>,
    taken: &dyn Fn(&str) -> bool,
) -> String {
    match func {
        DefaultFunc::GenRandomUnique => {
            let baseline_bytes: &[u8] = baseline.map_or(&[], |csid| &csid.0);
            let seed: [&[u8]; 3] = [field.as_bytes(), user.as_str().as_bytes(), baseline_bytes];
            let mut attempt = 0u64;
            loop {
                let token = content::generated_token(&seed, attempt);
                if !taken(&token) {
                    return token;
                }
                attempt = attempt.wrapping_add(1);
            }
        }
        DefaultFunc::GenUserPrefixUnique => user_numbered(user.as_str(), taken),
    }
}

/// `{user}-1`, `{user}-2`, ... until the collision check passes.
pub(crate) fn user_numbered(prefix: &str, taken: &dyn Fn(&str) -> bool) -> String {
    let mut n = 1u64;
    loop {
        let candidate = format!("{prefix}-{n}");
        if !taken(&candidate) {
            return candidate;
        }
        n = n.wrapping_add(1);
    }
}

/// Uniqueness repair for a kept value: `{base}~{user}`, then
/// `{base}~{user}-2`, `{base}~{user}-3`, ...
pub(crate) fn user_suffixed(base: &str, user: &UserIdent, taken: &dyn Fn(&str) -> bool) -> String {
    let first = format!("{base}~{}", user.as_str());
    if !taken(&first) {
        return first;
    }
    let mut n = 2u64;
    loop {
        let candidate = format!("{first}-{n}");
        if !taken(&candidate) {
            return candidate;
        }
        n = n.wrapping_add(1);
    }
}
