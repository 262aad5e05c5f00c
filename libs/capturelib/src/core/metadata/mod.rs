// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Metadata records and the controller that fans changes out to nodes.

mod controller;
mod record;
mod tags;

pub use controller::{MetadataCallback, MetadataController, SubscriptionId};
pub use record::{MetadataEntry, MetadataRecord};
pub use tags::{MetadataTag, MetadataType, MetadataValue};
