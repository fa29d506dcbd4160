// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Certificate signing workflow.

pub mod server;
pub mod signer;

pub use server::{AcmeServer, AcmeTrigger, EXTERNAL_CALL};
pub use signer::{AcmeClient, SignedCertificate, Signer, SigningRequest, UnconfiguredAcmeClient};
