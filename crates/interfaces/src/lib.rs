#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! Strata interface bindings.

/// P2P traits.
pub mod p2p;

/// Traits that provide chain access.
pub mod chain;
