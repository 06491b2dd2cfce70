// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Buffer-oriented encoding and decoding primitives.
//!
//! Decoding follows a consuming-cursor style: every `decode` call takes the
//! buffer by value and returns the decoded value together with the remaining
//! buffer, so a successful parse can never read the same bytes twice.

#[macro_use]
pub mod decoder;
pub mod encoder;

pub use decoder::*;
pub use encoder::*;
