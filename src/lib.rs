// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
pub mod acme;
pub mod cache;
pub mod config;
pub mod constants;
pub mod controller;
pub mod converter;
pub mod error;
pub mod leader;
pub mod metrics;
pub mod proxy;
pub mod queue;
pub mod ssl;
pub mod util;

#[cfg(test)]
pub mod test_utils;
