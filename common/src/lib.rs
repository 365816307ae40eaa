// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types shared between Apiary control plane services.
//!
//! This crate deliberately carries no I/O: it is the vocabulary spoken
//! between the migration engine, the cluster API dispatcher, and remote
//! clusters.  Anything that appears on the wire (error codes, object
//! references, option-bag grammar) lives here so that both ends agree on
//! it.

pub mod api;
pub mod backoff;
