// Copyright 2024 All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! This library implements a "dynamic reverse proxy". Instead of
//! being configured with a list of backend addresses, the load
//! balancer lets backends dial in over mutually-authenticated TLS
//! and send a `BIND` request carrying `Upgrade: DynamicProxy`. If
//! the backend's client certificate authorizes the requested host
//! and path, the load balancer answers `200`, takes the underlying
//! connection away from the HTTP server and keeps it as a private
//! tunnel. Client requests whose path starts with the registered
//! prefix are then written onto that tunnel and the backend's
//! response is relayed back.
//!
//! On the backend side, [`bind_url`] turns the outbound connection
//! into a [`PassthroughListener`] which hands out that single
//! connection as if it had been accepted, so an ordinary HTTP
//! server can be run on top of it.
//!
//! This is useful for backends behind NAT or without a public
//! address: all they need is one outbound TLS connection.

#![deny(
    clippy::all,
    clippy::restriction,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo
)]
#![allow(
    clippy::implicit_return,
    clippy::question_mark_used,
    clippy::blanket_clippy_restriction_lints,
    clippy::missing_trait_methods,
    clippy::single_call_fn,
    clippy::std_instead_of_alloc,
    clippy::absolute_paths,
    clippy::pub_use,
    clippy::multiple_crate_versions,
    clippy::missing_docs_in_private_items,
    clippy::arbitrary_source_item_ordering,
    clippy::exhaustive_structs,
    clippy::exhaustive_enums,
    clippy::module_name_repetitions,
    clippy::error_impl_error,
    clippy::impl_trait_in_params,
    clippy::wildcard_enum_match_arm,
    clippy::pattern_type_mismatch,
    clippy::ref_patterns,
    clippy::shadow_reuse,
    clippy::shadow_unrelated,
    clippy::min_ident_chars,
    clippy::single_char_lifetime_names,
    clippy::unseparated_literal_suffix,
    clippy::pub_with_shorthand,
    clippy::multiple_inherent_impl,
    clippy::significant_drop_tightening,
    clippy::missing_const_for_fn,
    clippy::option_if_let_else,
    clippy::unused_trait_names,
    clippy::allow_attributes,
    clippy::allow_attributes_without_reason
)]
#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::indexing_slicing,
        clippy::arithmetic_side_effects,
        clippy::default_numeric_fallback,
        clippy::let_underscore_must_use,
        clippy::let_underscore_untyped,
        clippy::missing_panics_doc,
        clippy::tests_outside_test_module,
        clippy::too_many_lines
    )
)]

pub mod authorize;
pub mod bind;
pub mod dynamic_proxy;
pub mod error;
pub mod listener;
pub mod registry;
pub mod rewind;
pub mod server;
pub mod tls;


pub use bind::{bind_url, BindConfig, TunnelStream};
pub use dynamic_proxy::{DynamicProxy, RequestKind};
pub use error::{Error, Result};
pub use listener::PassthroughListener;
pub use server::{LoadBalancer, LoadBalancerConfig};

/// The value of the `upgrade` header that marks a request as a
/// backend registration rather than proxied traffic.
pub const UPGRADE_HEADER_VALUE: &str = "DynamicProxy";

/// The method reserved for registration requests.
pub const BIND_METHOD: &str = "BIND";
