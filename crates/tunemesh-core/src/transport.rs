// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use async_trait::async_trait;

use crate::wire::Envelope;

/// Fire-and-forget unicast addressed by endpoint URI. The overlay never
/// blocks on delivery; correlation and timeouts live above this seam.
///
/// The reference binding (plain UDP) ships with the CLI; tests use an
/// in-memory loopback.
#[async_trait]
pub trait MessageTransport: Send + Sync + 'static {
    async fn send(&self, endpoint: &str, envelope: Envelope) -> anyhow::Result<()>;
}
