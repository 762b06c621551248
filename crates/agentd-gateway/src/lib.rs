// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod gateway;
mod protocol;

pub use gateway::Gateway;
pub use protocol::{GatewayEvent, GatewayRequest};
