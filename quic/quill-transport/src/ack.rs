// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

pub mod pngap;
pub mod tracker;

pub use pngap::GapTracker;
pub use tracker::AckTracker;
